//! Resolved benchmark parameters
//!
//! A [`BenchmarkRecord`] leaves most settings optional. The worker resolves
//! it against the task's descriptor into [`BenchmarkParams`], filling gaps
//! with the defaults below.

use crate::error::ParamError;
use crate::task::{Bindings, GroupInfo, TaskDescriptor, ThreadInfo};
use std::time::Duration;
use trialbench_ipc::{BenchmarkRecord, Phase};
use trialbench_stats::{Mode, TimeUnit};

/// Fallback values for unset record fields.
pub mod defaults {
    use std::time::Duration;

    /// Warmup iterations
    pub const WARMUP_ITERATIONS: u32 = 5;
    /// Warmup iteration duration
    pub const WARMUP_TIME: Duration = Duration::from_secs(1);
    /// Measurement iterations
    pub const MEASUREMENT_ITERATIONS: u32 = 5;
    /// Measurement iteration duration
    pub const MEASUREMENT_TIME: Duration = Duration::from_secs(1);
    /// Measured forks
    pub const FORKS: u32 = 1;
    /// Discarded forks
    pub const WARMUP_FORKS: u32 = 0;
    /// Threads of the implicit group
    pub const THREADS: u32 = 1;
    /// Longest wait for a worker response
    pub const TIMEOUT: Duration = Duration::from_secs(600);
    /// Group name used when a task declares no groups
    pub const IMPLICIT_GROUP: &str = "main";
}

/// How long one iteration lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationLength {
    /// Invoke until the duration elapses
    Time(Duration),
    /// Invoke exactly this many times per thread
    Invocations(u64),
}

/// Shape of the iterations of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationParams {
    /// Warmup or measurement
    pub phase: Phase,
    /// Number of iterations
    pub count: u32,
    /// Length of each iteration
    pub length: IterationLength,
}

/// One thread group with its resolved size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadGroup {
    /// Group name
    pub name: String,
    /// Thread count
    pub threads: u32,
}

/// Everything the controller needs to run one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkParams {
    /// Task id
    pub task: String,
    /// Concrete mode
    pub mode: Mode,
    /// Unit scores are expressed in
    pub time_unit: TimeUnit,
    /// Warmup phase
    pub warmup: IterationParams,
    /// Measurement phase
    pub measurement: IterationParams,
    /// Thread groups in declaration order
    pub groups: Vec<ThreadGroup>,
    /// Parameter values
    pub bindings: Bindings,
    /// Keep threads busy until all finished measuring
    pub sync_iterations: bool,
    /// Ramp the active threads of every group up across iterations
    pub scale: bool,
    /// Abort the run on a failed trial
    pub fail_on_error: bool,
    /// Measured forks
    pub forks: u32,
    /// Discarded forks
    pub warmup_forks: u32,
    /// Longest wait for a worker response
    pub timeout: Duration,
}

impl BenchmarkParams {
    /// Resolve a record against the task's descriptor.
    pub fn resolve(
        record: &BenchmarkRecord,
        descriptor: &TaskDescriptor,
    ) -> Result<Self, ParamError> {
        if record.mode == Mode::All {
            return Err(ParamError::UnexpandedMode(record.mode));
        }

        let groups = resolve_groups(record, descriptor)?;
        let single_shot = record.mode == Mode::SingleShot;
        let warmup = resolve_phase(
            Phase::Warmup,
            record.warmup_iterations.unwrap_or(defaults::WARMUP_ITERATIONS),
            record.warmup_time,
            record.warmup_batch_size,
            defaults::WARMUP_TIME,
            single_shot,
        )?;
        let measurement = resolve_phase(
            Phase::Measurement,
            record
                .measurement_iterations
                .unwrap_or(defaults::MEASUREMENT_ITERATIONS),
            record.measurement_time,
            record.measurement_batch_size,
            defaults::MEASUREMENT_TIME,
            single_shot,
        )?;
        if measurement.count == 0 {
            return Err(ParamError::NotPositive("measurement iterations"));
        }

        let timeout = record.timeout.unwrap_or(defaults::TIMEOUT);
        if timeout.is_zero() {
            return Err(ParamError::NotPositive("timeout"));
        }

        Ok(Self {
            task: record.name.clone(),
            mode: record.mode,
            time_unit: record
                .time_unit
                .unwrap_or_else(|| record.mode.default_time_unit()),
            warmup,
            measurement,
            groups,
            bindings: Bindings::from(record.bindings.clone()),
            sync_iterations: record.sync_iterations.unwrap_or(true),
            scale: record.scale.unwrap_or(false),
            fail_on_error: record.fail_on_error.unwrap_or(true),
            forks: record.forks.unwrap_or(defaults::FORKS),
            warmup_forks: record.warmup_forks.unwrap_or(defaults::WARMUP_FORKS),
            timeout,
        })
    }

    /// Parameters of one phase
    pub fn phase(&self, phase: Phase) -> &IterationParams {
        match phase {
            Phase::Warmup => &self.warmup,
            Phase::Measurement => &self.measurement,
        }
    }

    /// Total thread count
    pub fn total_threads(&self) -> usize {
        self.groups.iter().map(|g| g.threads as usize).sum()
    }

    /// Active threads per group in the `index`-th iteration of a phase.
    ///
    /// Without scaling every iteration runs the full layout. With scaling a
    /// group runs `index + 1` threads, capped at its size.
    pub fn active_threads(&self, index: u32) -> Vec<u32> {
        self.groups
            .iter()
            .map(|g| {
                if self.scale {
                    g.threads.min(index.saturating_add(1))
                } else {
                    g.threads
                }
            })
            .collect()
    }

    /// Total active threads of every iteration of `phase`
    pub fn thread_sequence(&self, phase: Phase) -> Vec<u32> {
        (0..self.phase(phase).count)
            .map(|index| self.active_threads(index).iter().sum())
            .collect()
    }

    /// Group positions in declaration order
    pub fn group_infos(&self) -> Vec<GroupInfo> {
        self.groups
            .iter()
            .enumerate()
            .map(|(index, g)| GroupInfo {
                index,
                name: g.name.clone(),
                threads: g.threads,
            })
            .collect()
    }

    /// Thread positions; threads of a group are numbered consecutively
    pub fn thread_infos(&self) -> Vec<ThreadInfo> {
        let total = self.total_threads();
        let mut infos = Vec::with_capacity(total);
        for (group_index, group) in self.groups.iter().enumerate() {
            for index_in_group in 0..group.threads as usize {
                infos.push(ThreadInfo {
                    index: infos.len(),
                    total,
                    group_index,
                    group_name: group.name.clone(),
                    index_in_group,
                    group_threads: group.threads,
                });
            }
        }
        infos
    }
}

fn resolve_groups(
    record: &BenchmarkRecord,
    descriptor: &TaskDescriptor,
) -> Result<Vec<ThreadGroup>, ParamError> {
    let groups: Vec<ThreadGroup> = if descriptor.groups.is_empty() {
        let threads = match record.thread_groups.as_slice() {
            [] => record.threads.unwrap_or(defaults::THREADS),
            [threads] => *threads,
            other => {
                return Err(ParamError::GroupCount {
                    expected: 1,
                    got: other.len(),
                });
            }
        };
        vec![ThreadGroup {
            name: defaults::IMPLICIT_GROUP.to_string(),
            threads,
        }]
    } else if record.thread_groups.is_empty() {
        descriptor
            .groups
            .iter()
            .map(|g| ThreadGroup {
                name: g.name.clone(),
                threads: g.threads,
            })
            .collect()
    } else if record.thread_groups.len() == descriptor.groups.len() {
        descriptor
            .groups
            .iter()
            .zip(&record.thread_groups)
            .map(|(g, &threads)| ThreadGroup {
                name: g.name.clone(),
                threads,
            })
            .collect()
    } else {
        return Err(ParamError::GroupCount {
            expected: descriptor.groups.len(),
            got: record.thread_groups.len(),
        });
    };

    if groups.iter().any(|g| g.threads == 0) {
        return Err(ParamError::NotPositive("thread count"));
    }
    Ok(groups)
}

fn resolve_phase(
    phase: Phase,
    count: u32,
    time: Option<Duration>,
    batch_size: Option<u64>,
    default_time: Duration,
    single_shot: bool,
) -> Result<IterationParams, ParamError> {
    let length = match (batch_size, time) {
        (Some(0), _) => return Err(ParamError::NotPositive("batch size")),
        (Some(n), _) => IterationLength::Invocations(n),
        (None, _) if single_shot => IterationLength::Invocations(1),
        (None, Some(t)) if t.is_zero() => return Err(ParamError::NotPositive("iteration time")),
        (None, Some(t)) => IterationLength::Time(t),
        (None, None) => IterationLength::Time(default_time),
    };
    Ok(IterationParams {
        phase,
        count,
        length,
    })
}
