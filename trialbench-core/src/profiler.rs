//! Internal profilers
//!
//! Internal profilers live inside the worker and bracket every iteration.
//! Their results travel back with the iteration report as secondary
//! results. Errors never fail the trial; the controller turns them into
//! warnings.

use crate::error::{ParamError, ProfilerError};
use crate::params::{BenchmarkParams, IterationParams};
use trialbench_stats::{AggregationPolicy, BenchResult, IterationResult};

/// Common profiler identity.
pub trait Profiler: Send {
    /// Name used to select the profiler
    fn name(&self) -> &str;

    /// One-line description
    fn description(&self) -> &str;
}

/// Profiler hooked around iterations inside the worker.
pub trait InternalProfiler: Profiler {
    /// Called before the iteration's fixtures run
    fn before_iteration(
        &mut self,
        params: &BenchmarkParams,
        iteration: &IterationParams,
    ) -> Result<(), ProfilerError>;

    /// Called after the iteration; returned results become secondaries
    fn after_iteration(
        &mut self,
        params: &BenchmarkParams,
        iteration: &IterationParams,
        result: &IterationResult,
    ) -> Result<Vec<BenchResult>, ProfilerError>;
}

/// Names and descriptions of the built-in internal profilers
pub const INTERNAL_PROFILERS: &[(&str, &str)] = &[(
    RusageProfiler::NAME,
    "CPU time, context switches and page faults from getrusage(2)",
)];

/// Instantiate a built-in internal profiler by name
pub fn internal_profiler(name: &str) -> Result<Box<dyn InternalProfiler>, ParamError> {
    match name {
        RusageProfiler::NAME => Ok(Box::new(RusageProfiler::default())),
        other => Err(ParamError::UnknownProfiler(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    user_ms: f64,
    system_ms: f64,
    voluntary_switches: i64,
    involuntary_switches: i64,
    minor_faults: i64,
    major_faults: i64,
}

impl Usage {
    fn current() -> Result<Self, ProfilerError> {
        // SAFETY: getrusage only writes into the zeroed struct we own.
        let usage = unsafe {
            let mut usage: libc::rusage = std::mem::zeroed();
            if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            usage
        };
        let millis = |tv: libc::timeval| tv.tv_sec as f64 * 1e3 + tv.tv_usec as f64 / 1e3;
        Ok(Self {
            user_ms: millis(usage.ru_utime),
            system_ms: millis(usage.ru_stime),
            voluntary_switches: usage.ru_nvcsw as i64,
            involuntary_switches: usage.ru_nivcsw as i64,
            minor_faults: usage.ru_minflt as i64,
            major_faults: usage.ru_majflt as i64,
        })
    }
}

/// Per-iteration resource usage of the worker process.
#[derive(Debug, Default)]
pub struct RusageProfiler {
    start: Option<Usage>,
}

impl RusageProfiler {
    /// Selection name
    pub const NAME: &'static str = "rusage";
}

impl Profiler for RusageProfiler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        INTERNAL_PROFILERS[0].1
    }
}

impl InternalProfiler for RusageProfiler {
    fn before_iteration(
        &mut self,
        _params: &BenchmarkParams,
        _iteration: &IterationParams,
    ) -> Result<(), ProfilerError> {
        self.start = Some(Usage::current()?);
        Ok(())
    }

    fn after_iteration(
        &mut self,
        _params: &BenchmarkParams,
        _iteration: &IterationParams,
        _result: &IterationResult,
    ) -> Result<Vec<BenchResult>, ProfilerError> {
        let start = self
            .start
            .take()
            .ok_or_else(|| ProfilerError::Failed("no usage captured before iteration".into()))?;
        let end = Usage::current()?;

        let avg = AggregationPolicy::Average;
        Ok(vec![
            BenchResult::scalar("·cpu.user", end.user_ms - start.user_ms, "ms", avg),
            BenchResult::scalar("·cpu.system", end.system_ms - start.system_ms, "ms", avg),
            BenchResult::scalar(
                "·ctxsw.voluntary",
                (end.voluntary_switches - start.voluntary_switches) as f64,
                "#",
                avg,
            ),
            BenchResult::scalar(
                "·ctxsw.involuntary",
                (end.involuntary_switches - start.involuntary_switches) as f64,
                "#",
                avg,
            ),
            BenchResult::scalar(
                "·faults.minor",
                (end.minor_faults - start.minor_faults) as f64,
                "#",
                avg,
            ),
            BenchResult::scalar(
                "·faults.major",
                (end.major_faults - start.major_faults) as f64,
                "#",
                avg,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDescriptor;
    use trialbench_ipc::BenchmarkRecord;
    use trialbench_stats::Mode;

    fn params() -> BenchmarkParams {
        let descriptor = TaskDescriptor {
            id: "bench".to_string(),
            mode: Mode::AverageTime,
            groups: Vec::new(),
            params: Vec::new(),
        };
        BenchmarkParams::resolve(&BenchmarkRecord::new("bench", Mode::AverageTime), &descriptor)
            .unwrap()
    }

    #[test]
    fn test_rusage_reports_cpu_time() {
        let params = params();
        let mut profiler = internal_profiler("rusage").unwrap();
        profiler
            .before_iteration(&params, &params.measurement)
            .unwrap();
        let mut x = 0u64;
        for i in 0..1_000_000u64 {
            x = std::hint::black_box(x.wrapping_add(i));
        }
        let results = profiler
            .after_iteration(&params, &params.measurement, &IterationResult::default())
            .unwrap();

        let user = results.iter().find(|r| r.label() == "·cpu.user").unwrap();
        assert!(user.score() >= 0.0);
        assert_eq!(results.len(), 6);
    }

    #[test]
    fn test_after_without_before_fails() {
        let params = params();
        let mut profiler = RusageProfiler::default();
        assert!(
            profiler
                .after_iteration(&params, &params.measurement, &IterationResult::default())
                .is_err()
        );
    }

    #[test]
    fn test_unknown_profiler() {
        assert!(matches!(
            internal_profiler("nope"),
            Err(ParamError::UnknownProfiler(_))
        ));
    }
}
