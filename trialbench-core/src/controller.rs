//! Iteration Controller
//!
//! Drives one trial of one task through its lifecycle:
//!
//! ```text
//! Init ─▶ TrialSetup ─▶ Warmup* ─▶ Measurement* ─▶ TrialTeardown ─▶ Done
//!   └──────────┴────────────┴────────────┴───────────────┴──▶ Failed
//! ```
//!
//! Each iteration runs one OS thread per group member. Benchmark and group
//! scope iteration fixtures run on the controlling thread; thread scope
//! fixtures run on the owning thread before a start barrier. Every call into
//! task code is guarded by `catch_unwind`, so a panicking thread still
//! reaches the barrier and the iteration fails instead of deadlocking.
//!
//! In scale mode an iteration runs only the first threads of each group, as
//! given by [`BenchmarkParams::active_threads`]. Thread positions keep
//! describing the full layout.

use crate::error::{ProfilerError, TaskError};
use crate::measure::{BatchSizer, MAX_SAMPLES, Sampler, Timer};
use crate::params::{BenchmarkParams, IterationLength, IterationParams};
use crate::profiler::InternalProfiler;
use crate::sink::Blackhole;
use crate::task::{
    BenchmarkTask, FixtureState, Fixtures, GroupInfo, Outcome, Scope, Secondaries, State,
    ThreadInfo,
};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex, PoisonError};
use std::time::Duration;
use trialbench_ipc::{FailureReport, FailureSite, IterationReport, Level, Phase};
use trialbench_stats::{
    AggregationPolicy, BenchResult, IterationResult, Mode, ResultKind, ResultRole, SampleSet,
    ThreadResult,
};

/// Lifecycle position of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing has run yet
    Init,
    /// Trial fixtures are running
    TrialSetup,
    /// Warmup phase; the value counts finished iterations
    Warmup(u32),
    /// Measurement phase; the value counts finished iterations
    Measurement(u32),
    /// Trial teardown is running
    TrialTeardown,
    /// Trial finished
    Done,
    /// A fixture or invocation failed; terminal
    Failed,
}

/// Object-safe view of a controller, independent of the task type.
pub trait TrialDriver: Send {
    /// Resolved parameters
    fn params(&self) -> &BenchmarkParams;

    /// Current lifecycle state
    fn state(&self) -> ControllerState;

    /// Build all state and run trial setup fixtures
    fn setup_trial(&mut self) -> Result<(), FailureReport>;

    /// Run the next warmup or measurement iteration
    fn next_iteration(&mut self) -> Result<IterationReport, FailureReport>;

    /// Run trial teardown fixtures; returns the number of iterations run
    fn teardown_trial(&mut self) -> Result<u32, FailureReport>;

    /// Run the whole trial in the calling process
    fn run(&mut self) -> Result<Vec<IterationReport>, FailureReport> {
        self.setup_trial()?;
        let total = self.params().warmup.count + self.params().measurement.count;
        let mut reports = Vec::with_capacity(total as usize);
        for _ in 0..total {
            reports.push(self.next_iteration()?);
        }
        self.teardown_trial()?;
        Ok(reports)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Setup,
    Teardown,
}

impl Stage {
    fn scopes(self) -> [Scope; 3] {
        match self {
            Stage::Setup => [Scope::Benchmark, Scope::Group, Scope::Thread],
            Stage::Teardown => [Scope::Thread, Scope::Group, Scope::Benchmark],
        }
    }

    fn site(self, level: Level) -> FailureSite {
        match self {
            Stage::Setup => FailureSite::Setup(level),
            Stage::Teardown => FailureSite::Teardown(level),
        }
    }
}

fn guarded<R>(f: impl FnOnce() -> Result<R, TaskError>) -> Result<R, TaskError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(TaskError::from_panic(payload)))
}

fn fixture<T: BenchmarkTask>(
    task: &T,
    stage: Stage,
    level: Level,
    state: FixtureState<'_, T>,
) -> Result<(), TaskError> {
    guarded(|| match stage {
        Stage::Setup => task.setup(level, state),
        Stage::Teardown => task.teardown(level, state),
    })
}

fn failure(task: &str, site: FailureSite, thread: Option<usize>, error: TaskError) -> FailureReport {
    FailureReport {
        task: task.to_string(),
        site,
        thread,
        message: error.to_string(),
    }
}

struct ThreadSlot<T: BenchmarkTask> {
    info: ThreadInfo,
    state: T::Thread,
    sink: Blackhole,
}

/// Runs the lifecycle of one task instance.
pub struct Controller<T: BenchmarkTask> {
    task: T,
    params: BenchmarkParams,
    profilers: Vec<Box<dyn InternalProfiler>>,
    fixtures: Fixtures,
    state: ControllerState,
    group_infos: Vec<GroupInfo>,
    shared: Option<T::Shared>,
    groups: Vec<T::Group>,
    threads: Vec<ThreadSlot<T>>,
    shared_lock: Mutex<()>,
    group_locks: Vec<Mutex<()>>,
}

impl<T: BenchmarkTask> Controller<T> {
    /// Controller for `task`; nothing runs until [`TrialDriver::setup_trial`]
    pub fn new(
        task: T,
        params: BenchmarkParams,
        profilers: Vec<Box<dyn InternalProfiler>>,
    ) -> Self {
        let fixtures = task.fixtures();
        let group_infos = params.group_infos();
        let group_locks = group_infos.iter().map(|_| Mutex::new(())).collect();
        Self {
            task,
            params,
            profilers,
            fixtures,
            state: ControllerState::Init,
            group_infos,
            shared: None,
            groups: Vec::new(),
            threads: Vec::new(),
            shared_lock: Mutex::new(()),
            group_locks,
        }
    }

    fn fail(&mut self, report: FailureReport) -> FailureReport {
        tracing::debug!(%report, "trial failed");
        self.state = ControllerState::Failed;
        report
    }

    fn misuse(&mut self, action: &str) -> FailureReport {
        let message = format!("cannot {action} in state {:?}", self.state);
        self.fail(failure(
            &self.params.task,
            FailureSite::Configuration,
            None,
            TaskError::Message(message),
        ))
    }

    fn build_state(&mut self) -> Result<(), FailureReport> {
        let site = FailureSite::Setup(Level::Trial);
        let task = &self.task;
        let name = self.params.task.as_str();

        let shared =
            guarded(|| task.shared_state()).map_err(|e| failure(name, site, None, e))?;
        let groups = self
            .group_infos
            .iter()
            .map(|info| guarded(|| task.group_state(info)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| failure(name, site, None, e))?;
        let mut threads = Vec::new();
        for info in self.params.thread_infos() {
            let state = guarded(|| task.thread_state(&info))
                .map_err(|e| failure(name, site, Some(info.index), e))?;
            threads.push(ThreadSlot {
                info,
                state,
                sink: Blackhole::new(),
            });
        }

        self.shared = Some(shared);
        self.groups = groups;
        self.threads = threads;
        Ok(())
    }

    /// Run fixtures of `level` on the controlling thread. Thread-scope
    /// fixtures are included only for trial level.
    fn controller_fixtures(&mut self, level: Level, stage: Stage) -> Result<(), FailureReport> {
        let name = self.params.task.as_str();
        let site = stage.site(level);
        for scope in stage.scopes() {
            if !self.fixtures.has(level, scope) {
                continue;
            }
            match scope {
                Scope::Benchmark => {
                    if let Some(shared) = self.shared.as_ref() {
                        fixture(&self.task, stage, level, FixtureState::Benchmark(shared))
                            .map_err(|e| failure(name, site, None, e))?;
                    }
                }
                Scope::Group => {
                    for (group, info) in self.groups.iter().zip(&self.group_infos) {
                        fixture(&self.task, stage, level, FixtureState::Group(group, info))
                            .map_err(|e| failure(name, site, None, e))?;
                    }
                }
                Scope::Thread if level == Level::Trial => {
                    for slot in &mut self.threads {
                        fixture(
                            &self.task,
                            stage,
                            level,
                            FixtureState::Thread(&mut slot.state, &slot.info),
                        )
                        .map_err(|e| failure(name, site, Some(slot.info.index), e))?;
                    }
                }
                Scope::Thread => {}
            }
        }
        Ok(())
    }

    fn next_position(&mut self) -> Option<(Phase, u32)> {
        if let ControllerState::Warmup(done) = self.state {
            if done >= self.params.warmup.count {
                self.state = ControllerState::Measurement(0);
            }
        }
        match self.state {
            ControllerState::Warmup(done) => Some((Phase::Warmup, done)),
            ControllerState::Measurement(done) if done < self.params.measurement.count => {
                Some((Phase::Measurement, done))
            }
            _ => None,
        }
    }

    fn run_iteration(
        &mut self,
        iteration: IterationParams,
        index: u32,
    ) -> Result<IterationResult, FailureReport> {
        self.controller_fixtures(Level::Iteration, Stage::Setup)?;

        let Some(shared) = self.shared.as_ref() else {
            return Err(failure(
                &self.params.task,
                FailureSite::Configuration,
                None,
                TaskError::msg("benchmark state missing"),
            ));
        };
        let active = self.params.active_threads(index);
        let is_active =
            |info: &ThreadInfo| info.index_in_group < active[info.group_index] as usize;
        let total = self.threads.iter().filter(|slot| is_active(&slot.info)).count();
        let run = IterationRun {
            task: &self.task,
            params: &self.params,
            fixtures: self.fixtures,
            shared,
            groups: &self.groups,
            group_infos: &self.group_infos,
            shared_lock: &self.shared_lock,
            group_locks: &self.group_locks,
            length: iteration.length,
            per_invocation: self.params.mode == Mode::SampleTime
                || self.fixtures.any_at(Level::Invocation),
            total,
            barrier: Barrier::new(total),
            failed: AtomicBool::new(false),
            finished: AtomicUsize::new(0),
        };

        let outcomes: Vec<Result<ThreadMeasurement, FailureReport>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .threads
                .iter_mut()
                .filter(|slot| is_active(&slot.info))
                .map(|slot| {
                    let run = &run;
                    scope.spawn(move || run.thread(slot))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|payload| {
                        Err(failure(
                            &run.params.task,
                            FailureSite::Invocation,
                            None,
                            TaskError::from_panic(payload),
                        ))
                    })
                })
                .collect()
        });

        let mut measurements = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            measurements.push(outcome?);
        }

        self.controller_fixtures(Level::Iteration, Stage::Teardown)?;

        let threads: Vec<ThreadResult> = measurements.iter().map(|m| m.results.clone()).collect();
        let mut result = IterationResult::from_threads(&threads);
        result.operations = measurements.iter().map(|m| m.ops).sum();
        Ok(result)
    }
}

fn guard_profiler<R>(f: impl FnOnce() -> Result<R, ProfilerError>) -> Result<R, ProfilerError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(ProfilerError::Panicked(TaskError::from_panic(payload).to_string()))
    })
}

impl<T: BenchmarkTask> TrialDriver for Controller<T> {
    fn params(&self) -> &BenchmarkParams {
        &self.params
    }

    fn state(&self) -> ControllerState {
        self.state
    }

    fn setup_trial(&mut self) -> Result<(), FailureReport> {
        if self.state != ControllerState::Init {
            return Err(self.misuse("set up trial"));
        }
        self.state = ControllerState::TrialSetup;
        if let Err(report) = self
            .build_state()
            .and_then(|()| self.controller_fixtures(Level::Trial, Stage::Setup))
        {
            return Err(self.fail(report));
        }
        self.state = ControllerState::Warmup(0);
        tracing::debug!(task = %self.params.task, threads = self.threads.len(), "trial set up");
        Ok(())
    }

    fn next_iteration(&mut self) -> Result<IterationReport, FailureReport> {
        let Some((phase, index)) = self.next_position() else {
            return Err(self.misuse("run an iteration"));
        };
        let iteration = *self.params.phase(phase);

        let mut warnings = Vec::new();
        for profiler in &mut self.profilers {
            if let Err(e) = guard_profiler(|| profiler.before_iteration(&self.params, &iteration)) {
                warnings.push(format!("{}: before iteration: {e}", profiler.name()));
            }
        }

        let mut result = match self.run_iteration(iteration, index) {
            Ok(result) => result,
            Err(report) => return Err(self.fail(report)),
        };

        for profiler in &mut self.profilers {
            match guard_profiler(|| profiler.after_iteration(&self.params, &iteration, &result)) {
                Ok(extra) => extra.into_iter().for_each(|r| result.add_secondary(r)),
                Err(e) => warnings.push(format!("{}: after iteration: {e}", profiler.name())),
            }
        }

        self.state = match phase {
            Phase::Warmup => ControllerState::Warmup(index + 1),
            Phase::Measurement => ControllerState::Measurement(index + 1),
        };
        tracing::debug!(task = %self.params.task, %phase, index, ops = result.operations, "iteration done");
        Ok(IterationReport {
            phase,
            index,
            result,
            warnings,
        })
    }

    fn teardown_trial(&mut self) -> Result<u32, FailureReport> {
        let iterations = match self.state {
            ControllerState::Warmup(done) => done,
            ControllerState::Measurement(done) => self.params.warmup.count + done,
            _ => return Err(self.misuse("tear down trial")),
        };
        self.state = ControllerState::TrialTeardown;
        if let Err(report) = self.controller_fixtures(Level::Trial, Stage::Teardown) {
            return Err(self.fail(report));
        }
        self.state = ControllerState::Done;
        Ok(iterations)
    }
}

// ─── Per-iteration thread work ───────────────────────────────────────────────

struct ThreadMeasurement {
    results: ThreadResult,
    ops: u64,
}

struct IterationRun<'a, T: BenchmarkTask> {
    task: &'a T,
    params: &'a BenchmarkParams,
    fixtures: Fixtures,
    shared: &'a T::Shared,
    groups: &'a [T::Group],
    group_infos: &'a [GroupInfo],
    shared_lock: &'a Mutex<()>,
    group_locks: &'a [Mutex<()>],
    length: IterationLength,
    per_invocation: bool,
    total: usize,
    barrier: Barrier,
    failed: AtomicBool,
    finished: AtomicUsize,
}

struct ThreadCx<'a, T: BenchmarkTask> {
    info: &'a ThreadInfo,
    group: &'a T::Group,
    group_info: &'a GroupInfo,
    group_lock: &'a Mutex<()>,
    thread: &'a mut T::Thread,
    sink: &'a mut Blackhole,
    secondary: Secondaries,
}

impl<'a, T: BenchmarkTask> ThreadCx<'a, T> {
    fn state<'s>(&'s mut self, shared: &'s T::Shared) -> State<'s, T> {
        State {
            shared,
            group: self.group,
            thread: &mut *self.thread,
            info: self.info,
            sink: &mut *self.sink,
            secondary: &mut self.secondary,
        }
    }
}

/// Samples collected by one thread during its measured portion.
struct Meter {
    ops: u64,
    elapsed: Duration,
    reported: Vec<f64>,
    sampler: Option<Sampler>,
}

impl Meter {
    fn new(mode: Mode) -> Self {
        Self {
            ops: 0,
            elapsed: Duration::ZERO,
            reported: Vec::new(),
            sampler: (mode == Mode::SampleTime).then(|| Sampler::new(MAX_SAMPLES)),
        }
    }

    #[inline]
    fn take(&mut self, outcome: Outcome) -> Result<(), TaskError> {
        if let Outcome::Reported(value) = outcome {
            if !value.is_finite() {
                return Err(TaskError::NonFinite(value));
            }
            self.reported.push(value);
        }
        Ok(())
    }

    fn primary(&self, params: &BenchmarkParams) -> Option<BenchResult> {
        let unit = params.time_unit;
        let samples: SampleSet = if !self.reported.is_empty() {
            self.reported.iter().copied().collect()
        } else if self.ops == 0 {
            return None;
        } else {
            match params.mode {
                Mode::Throughput => {
                    let elapsed = self.elapsed.max(Duration::from_nanos(1));
                    SampleSet::singleton(self.ops as f64 / unit.convert(elapsed))
                }
                Mode::SampleTime => self
                    .sampler
                    .iter()
                    .flat_map(|s| s.samples())
                    .map(|d| unit.convert(*d))
                    .collect(),
                Mode::SingleShot => SampleSet::singleton(unit.convert(self.elapsed)),
                Mode::AverageTime | Mode::All => {
                    SampleSet::singleton(unit.convert(self.elapsed) / self.ops as f64)
                }
            }
        };
        if samples.is_empty() {
            return None;
        }
        Some(BenchResult::new(
            ResultKind::for_mode(params.mode),
            ResultRole::Primary,
            params.task.as_str(),
            unit.score_unit(params.mode),
            AggregationPolicy::Average,
            samples,
        ))
    }
}

impl<T: BenchmarkTask> IterationRun<'_, T> {
    fn fail(&self, site: FailureSite, thread: usize, error: TaskError) -> FailureReport {
        self.failed.store(true, Ordering::SeqCst);
        failure(&self.params.task, site, Some(thread), error)
    }

    fn thread(&self, slot: &mut ThreadSlot<T>) -> Result<ThreadMeasurement, FailureReport> {
        let ThreadSlot { info, state, sink } = slot;
        let mut cx = ThreadCx {
            info,
            group: &self.groups[info.group_index],
            group_info: &self.group_infos[info.group_index],
            group_lock: &self.group_locks[info.group_index],
            thread: state,
            sink,
            secondary: Secondaries::new(),
        };
        let index = cx.info.index;
        let thread_fixtures = self.fixtures.has(Level::Iteration, Scope::Thread);

        let setup = if thread_fixtures {
            fixture(
                self.task,
                Stage::Setup,
                Level::Iteration,
                FixtureState::Thread(&mut *cx.thread, cx.info),
            )
        } else {
            Ok(())
        };
        if setup.is_err() {
            self.failed.store(true, Ordering::SeqCst);
        }
        self.barrier.wait();
        if let Err(e) = setup {
            self.finished.fetch_add(1, Ordering::SeqCst);
            return Err(self.fail(FailureSite::Setup(Level::Iteration), index, e));
        }

        let mut meter = Meter::new(self.params.mode);
        let measured = if self.failed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.measure(&mut cx, &mut meter)
        };
        self.finished.fetch_add(1, Ordering::SeqCst);
        measured?;

        let secondary = std::mem::take(&mut cx.secondary);
        if self.params.sync_iterations {
            let mut idle = Meter::new(Mode::AverageTime);
            while self.finished.load(Ordering::SeqCst) < self.total
                && !self.failed.load(Ordering::SeqCst)
            {
                self.batch(&mut cx, &mut idle, 1)?;
            }
        }

        if thread_fixtures {
            fixture(
                self.task,
                Stage::Teardown,
                Level::Iteration,
                FixtureState::Thread(&mut *cx.thread, cx.info),
            )
            .map_err(|e| self.fail(FailureSite::Teardown(Level::Iteration), index, e))?;
        }

        let mut results: ThreadResult = meter.primary(self.params).into_iter().collect();
        results.extend(secondary.into_iter().map(|(label, s)| {
            BenchResult::new(
                ResultKind::ScalarDerived,
                ResultRole::Secondary,
                label,
                s.unit,
                s.policy,
                s.samples,
            )
        }));
        Ok(ThreadMeasurement {
            results,
            ops: meter.ops,
        })
    }

    fn measure(&self, cx: &mut ThreadCx<'_, T>, meter: &mut Meter) -> Result<(), FailureReport> {
        match self.length {
            IterationLength::Invocations(n) => self.batch(cx, meter, n),
            IterationLength::Time(target) => {
                let wall = Timer::start();
                let mut sizer = BatchSizer::new(target);
                while let Some(batch) = sizer.next(meter.ops, wall.elapsed()) {
                    if self.failed.load(Ordering::Relaxed) {
                        break;
                    }
                    self.batch(cx, meter, batch)?;
                }
                Ok(())
            }
        }
    }

    fn batch(&self, cx: &mut ThreadCx<'_, T>, meter: &mut Meter, n: u64) -> Result<(), FailureReport> {
        let index = cx.info.index;
        if self.per_invocation {
            for _ in 0..n {
                let timed = meter.sampler.as_mut().is_none_or(Sampler::should_time);
                let (outcome, elapsed) = self.invocation(cx, timed)?;
                meter.ops += 1;
                if let Some(elapsed) = elapsed {
                    meter.elapsed += elapsed;
                    if let Some(sampler) = meter.sampler.as_mut() {
                        sampler.push(elapsed);
                    }
                }
                meter
                    .take(outcome)
                    .map_err(|e| self.fail(FailureSite::Invocation, index, e))?;
            }
            return Ok(());
        }

        let shared = self.shared;
        let timer = Timer::start();
        let result = guarded(|| {
            for _ in 0..n {
                let outcome = self.task.invoke(&mut cx.state(shared))?;
                meter.take(outcome)?;
            }
            Ok(())
        });
        meter.elapsed += timer.elapsed();
        meter.ops += n;
        result.map_err(|e| self.fail(FailureSite::Invocation, index, e))
    }

    fn invocation(
        &self,
        cx: &mut ThreadCx<'_, T>,
        timed: bool,
    ) -> Result<(Outcome, Option<Duration>), FailureReport> {
        self.invocation_fixtures(cx, Stage::Setup)?;
        let shared = self.shared;
        let timer = timed.then(Timer::start);
        let outcome = guarded(|| self.task.invoke(&mut cx.state(shared)));
        let elapsed = timer.map(|t| t.elapsed());
        let outcome = outcome.map_err(|e| self.fail(FailureSite::Invocation, cx.info.index, e))?;
        self.invocation_fixtures(cx, Stage::Teardown)?;
        Ok((outcome, elapsed))
    }

    fn invocation_fixtures(&self, cx: &mut ThreadCx<'_, T>, stage: Stage) -> Result<(), FailureReport> {
        let level = Level::Invocation;
        for scope in stage.scopes() {
            if !self.fixtures.has(level, scope) {
                continue;
            }
            let result = match scope {
                Scope::Benchmark => {
                    let _guard = self.shared_lock.lock().unwrap_or_else(PoisonError::into_inner);
                    fixture(self.task, stage, level, FixtureState::Benchmark(self.shared))
                }
                Scope::Group => {
                    let _guard = cx.group_lock.lock().unwrap_or_else(PoisonError::into_inner);
                    fixture(
                        self.task,
                        stage,
                        level,
                        FixtureState::Group(cx.group, cx.group_info),
                    )
                }
                Scope::Thread => fixture(
                    self.task,
                    stage,
                    level,
                    FixtureState::Thread(&mut *cx.thread, cx.info),
                ),
            };
            result.map_err(|e| self.fail(stage.site(level), cx.info.index, e))?;
        }
        Ok(())
    }
}
