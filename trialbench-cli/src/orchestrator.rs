//! Trial Orchestrator
//!
//! Runs one [`BenchmarkRecord`] to a [`TrialResult`]:
//!
//! 1. warmup forks, results discarded
//! 2. measured forks, each in a fresh worker process
//! 3. measurement iterations of all forks pooled into one result
//!
//! With `forks = 0` the trial runs in the controller's own process.
//!
//! Failures come in three kinds: configuration (nothing launched), worker
//! (the benchmarked code failed) and process (the worker or its channel
//! failed). None of them is retried.

use crate::profilers::{ExternalProfiler, ProfilerSelection};
use crate::supervisor::{LaunchSpec, ProcessFailure, WorkerHandle, current_binary, describe};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use thiserror::Error;
use trialbench_core::{BenchmarkParams, ProfilerError, TaskDef, TaskRegistry, defaults};
use trialbench_ipc::{
    BenchmarkRecord, FailureReport, FailureSite, IterationReport, Phase, SupervisorCommand,
    WORKER_ARG, WorkerMessage,
};
use trialbench_stats::{AggregatedResults, Aggregator, BenchResult, IterationResult, format_number};

/// Why a trial produced no result
#[derive(Debug, Error)]
pub enum TrialError {
    /// Record rejected before any worker launched
    #[error("{record}: configuration error: {message}")]
    Configuration {
        /// Trial label
        record: String,
        /// What was wrong
        message: String,
    },

    /// Benchmarked code or one of its fixtures failed
    #[error("{0}")]
    Worker(FailureReport),

    /// The worker process or its channel failed
    #[error("{record}, fork {fork}: {source}")]
    Process {
        /// Trial label
        record: String,
        /// Fork index
        fork: u32,
        /// Underlying failure
        #[source]
        source: ProcessFailure,
    },

    /// Concurrent trials could not be scheduled
    #[error("failed to build trial pool: {0}")]
    Pool(String),
}

impl TrialError {
    /// Process-level failure, as opposed to a failure of the benchmarked code
    pub fn is_process_failure(&self) -> bool {
        matches!(self, TrialError::Process { .. })
    }

    /// Classify a failure the task reported. A worker that could not set
    /// the task up is a configuration error, not a failure of the code.
    fn reported(label: &str, report: FailureReport) -> Self {
        match report.site {
            FailureSite::Configuration => TrialError::Configuration {
                record: label.to_string(),
                message: report.message,
            },
            _ => TrialError::Worker(report),
        }
    }
}

/// One measured fork
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForkResult {
    /// Zero-based fork index
    pub index: u32,
    /// Pid of the worker; the controller's own pid in-process
    pub pid: u32,
    /// Measurement iterations
    pub iterations: Vec<IterationResult>,
    /// Internal profiler warnings
    pub warnings: Vec<String>,
}

/// Outcome of one trial
#[derive(Debug, Clone, PartialEq)]
pub struct TrialResult {
    /// The record that was run
    pub record: BenchmarkRecord,
    /// Measured forks in order
    pub forks: Vec<ForkResult>,
    /// Measurement iterations of all forks folded together
    pub aggregated: AggregatedResults,
    /// Results contributed by external profilers, by label
    pub profiler_results: BTreeMap<String, BenchResult>,
    /// Profiler failures
    pub warnings: Vec<String>,
    /// Set when the trial failed and the run continued anyway
    pub failure: Option<String>,
}

impl TrialResult {
    fn pooled(
        record: BenchmarkRecord,
        forks: Vec<ForkResult>,
        contributed: Vec<BenchResult>,
        mut warnings: Vec<String>,
    ) -> Self {
        let aggregated =
            AggregatedResults::from_iterations(forks.iter().flat_map(|f| f.iterations.iter()));

        let mut by_label: BTreeMap<String, Vec<BenchResult>> = BTreeMap::new();
        for result in contributed {
            by_label
                .entry(result.label().to_string())
                .or_default()
                .push(result);
        }
        let profiler_results = by_label
            .into_iter()
            .filter_map(|(label, results)| Some((label, Aggregator::Iteration.fold(&results)?)))
            .collect();

        for fork in &forks {
            warnings.extend(fork.warnings.iter().cloned());
        }

        Self {
            record,
            forks,
            aggregated,
            profiler_results,
            warnings,
            failure: None,
        }
    }

    /// A failed trial with no results
    pub fn failed(record: BenchmarkRecord, error: &TrialError) -> Self {
        Self {
            record,
            forks: Vec::new(),
            aggregated: AggregatedResults::default(),
            profiler_results: BTreeMap::new(),
            warnings: Vec::new(),
            failure: Some(error.to_string()),
        }
    }

    /// Primary result
    pub fn primary(&self) -> Option<&BenchResult> {
        self.aggregated.primary.as_ref()
    }

    /// Secondary results, task-reported first, then profiler-contributed
    pub fn secondaries(&self) -> impl Iterator<Item = &BenchResult> {
        self.aggregated
            .secondary
            .values()
            .chain(self.profiler_results.values())
    }

    /// Whether the trial failed
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Fork and iteration counts of a record
#[derive(Debug, Clone, Copy)]
struct TrialShape {
    forks: u32,
    warmup_forks: u32,
    warmup_iterations: u32,
    measurement_iterations: u32,
    timeout: Duration,
}

impl TrialShape {
    fn of(record: &BenchmarkRecord) -> Self {
        Self {
            forks: record.forks.unwrap_or(defaults::FORKS),
            warmup_forks: record.warmup_forks.unwrap_or(defaults::WARMUP_FORKS),
            warmup_iterations: record
                .warmup_iterations
                .unwrap_or(defaults::WARMUP_ITERATIONS),
            measurement_iterations: record
                .measurement_iterations
                .unwrap_or(defaults::MEASUREMENT_ITERATIONS),
            timeout: record.timeout.unwrap_or(defaults::TIMEOUT),
        }
    }

    fn iterations(&self) -> u32 {
        self.warmup_iterations + self.measurement_iterations
    }

    /// Phase and in-phase index of the n-th iteration
    fn position(&self, n: u32) -> (Phase, u32) {
        if n < self.warmup_iterations {
            (Phase::Warmup, n)
        } else {
            (Phase::Measurement, n - self.warmup_iterations)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a profiler hook; errors and panics become `Err` with the profiler's
/// name attached.
fn guard_hook<R>(
    profiler: &mut dyn ExternalProfiler,
    hook: &str,
    f: impl FnOnce(&mut dyn ExternalProfiler) -> Result<R, ProfilerError>,
) -> Result<R, String> {
    let name = profiler.name().to_string();
    let outcome = catch_unwind(AssertUnwindSafe(|| f(profiler)))
        .unwrap_or_else(|payload| Err(ProfilerError::Panicked(panic_message(payload))));
    outcome.map_err(|e| {
        let warning = format!("{name}: {hook} failed: {e}");
        tracing::warn!("{warning}");
        warning
    })
}

/// Runs trials against worker processes.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    worker_command: Vec<String>,
    registry: TaskRegistry,
    profilers: ProfilerSelection,
}

impl Orchestrator {
    /// Orchestrator launching workers from the current executable
    pub fn new(registry: TaskRegistry, profilers: ProfilerSelection) -> Result<Self, ProcessFailure> {
        let binary = current_binary()?;
        Ok(Self {
            worker_command: vec![binary.display().to_string(), WORKER_ARG.to_string()],
            registry,
            profilers,
        })
    }

    /// Launch workers with an explicit command line instead
    pub fn with_worker_command(mut self, command: Vec<String>) -> Self {
        self.worker_command = command;
        self
    }

    /// Run every record.
    ///
    /// A failed trial stops the run when its record asks to fail on error;
    /// otherwise it is recorded as failed and the run continues. `jobs > 1`
    /// runs that many trials concurrently.
    pub fn run_all(
        &self,
        records: &[BenchmarkRecord],
        jobs: usize,
        on_trial: &(dyn Fn(&TrialResult) + Sync),
    ) -> Result<Vec<TrialResult>, TrialError> {
        if jobs <= 1 || records.len() <= 1 {
            let mut results = Vec::with_capacity(records.len());
            for record in records {
                let result = self.settle(record, self.run_trial(record))?;
                on_trial(&result);
                results.push(result);
            }
            return Ok(results);
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(jobs.min(records.len()))
            .build()
            .map_err(|e| TrialError::Pool(e.to_string()))?;
        let outcomes: Vec<Result<TrialResult, TrialError>> = pool.install(|| {
            records
                .par_iter()
                .map(|record| {
                    let outcome = self.run_trial(record);
                    if let Ok(result) = &outcome {
                        on_trial(result);
                    }
                    outcome
                })
                .collect()
        });

        let mut results = Vec::with_capacity(outcomes.len());
        for (record, outcome) in records.iter().zip(outcomes) {
            let failed = outcome.is_err();
            let result = self.settle(record, outcome)?;
            if failed {
                on_trial(&result);
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Apply the record's fail-on-error policy to a trial outcome
    fn settle(
        &self,
        record: &BenchmarkRecord,
        outcome: Result<TrialResult, TrialError>,
    ) -> Result<TrialResult, TrialError> {
        match outcome {
            Ok(result) => Ok(result),
            Err(e) if record.fail_on_error.unwrap_or(true) => Err(e),
            Err(e) => {
                tracing::warn!(trial = %record.label(), error = %e, "trial failed, continuing");
                Ok(TrialResult::failed(record.clone(), &e))
            }
        }
    }

    /// Look the task up and resolve the record against it
    fn validate(&self, record: &BenchmarkRecord) -> Result<&TaskDef, TrialError> {
        let configuration = |message: String| TrialError::Configuration {
            record: record.label(),
            message,
        };
        let def = self
            .registry
            .get(&record.name)
            .ok_or_else(|| configuration(format!("unknown benchmark task: {}", record.name)))?;
        BenchmarkParams::resolve(record, &def.descriptor())
            .map_err(|e| configuration(e.to_string()))?;
        Ok(def)
    }

    /// Run one trial
    pub fn run_trial(&self, record: &BenchmarkRecord) -> Result<TrialResult, TrialError> {
        let label = record.label();
        let def = self.validate(record)?;

        let shape = TrialShape::of(record);
        tracing::info!(trial = %label, forks = shape.forks, "starting trial");

        if shape.forks == 0 {
            return self.run_in_process(def, record);
        }

        for index in 0..shape.warmup_forks {
            tracing::debug!(trial = %label, fork = index, "warmup fork");
            self.run_fork(record, &shape, index, &mut [], &mut Vec::new())?;
        }

        let mut forks = Vec::with_capacity(shape.forks as usize);
        let mut contributed = Vec::new();
        let mut warnings = Vec::new();
        for index in 0..shape.forks {
            let mut profilers = self.profilers.instantiate_external();
            let (fork, results) =
                self.run_fork(record, &shape, index, &mut profilers, &mut warnings)?;
            forks.push(fork);
            contributed.extend(results);
        }

        Ok(TrialResult::pooled(
            record.clone(),
            forks,
            contributed,
            warnings,
        ))
    }

    /// One worker process. Profilers bracket it in attachment order.
    fn run_fork(
        &self,
        record: &BenchmarkRecord,
        shape: &TrialShape,
        index: u32,
        profilers: &mut [Box<dyn ExternalProfiler>],
        warnings: &mut Vec<String>,
    ) -> Result<(ForkResult, Vec<BenchResult>), TrialError> {
        let label = record.label();
        let process = |source: ProcessFailure| TrialError::Process {
            record: label.clone(),
            fork: index,
            source,
        };

        let mut started = vec![false; profilers.len()];
        for (profiler, started) in profilers.iter_mut().zip(started.iter_mut()) {
            match guard_hook(profiler.as_mut(), "before_trial", |p| p.before_trial(record)) {
                Ok(()) => *started = true,
                Err(warning) => warnings.push(warning),
            }
        }

        let spec = self.launch_spec(record, shape, profilers, &started);
        let mut on_log = |line: &str| tracing::info!(fork = index, "{line}");
        let mut handle = WorkerHandle::spawn(&spec, record, &mut on_log).map_err(&process)?;
        let pid = handle.worker_pid();

        let mut fork = ForkResult {
            index,
            pid,
            ..ForkResult::default()
        };
        for n in 0..shape.iterations() {
            handle
                .send(SupervisorCommand::Iterate)
                .map_err(&process)?;
            match handle.next_message(&mut on_log).map_err(&process)? {
                WorkerMessage::Iteration(report) => {
                    let expected = shape.position(n);
                    if (report.phase, report.index) != expected {
                        return Err(process(ProcessFailure::Desync {
                            expected: "the next iteration",
                            got: format!("{} {}", report.phase, report.index),
                        }));
                    }
                    fork.warnings.extend(report.warnings.iter().cloned());
                    if report.phase == Phase::Measurement {
                        fork.iterations.push(report.result);
                    }
                }
                WorkerMessage::Failure(report) => {
                    handle.reap();
                    return Err(TrialError::reported(&label, report));
                }
                other => {
                    return Err(process(ProcessFailure::Desync {
                        expected: "Iteration",
                        got: describe(&other),
                    }));
                }
            }
        }

        handle
            .send(SupervisorCommand::Terminate)
            .map_err(&process)?;
        match handle.next_message(&mut on_log).map_err(&process)? {
            WorkerMessage::Complete { iterations } if iterations == shape.iterations() => {}
            WorkerMessage::Failure(report) => {
                handle.reap();
                return Err(TrialError::reported(&label, report));
            }
            other => {
                return Err(process(ProcessFailure::Desync {
                    expected: "Complete",
                    got: describe(&other),
                }));
            }
        }
        let output = handle.finish().map_err(&process)?;

        let mut contributed = Vec::new();
        for (profiler, _) in profilers.iter_mut().zip(&started).filter(|(_, s)| **s) {
            match guard_hook(profiler.as_mut(), "after_trial", |p| {
                p.after_trial(&fork, pid, output.stdout(), output.stderr())
            }) {
                Ok(results) => contributed.extend(results),
                Err(warning) => warnings.push(warning),
            }
        }

        Ok((fork, contributed))
    }

    /// `[prepend] [profiler prefixes] worker [args] [profiler args] [append]`
    fn launch_spec(
        &self,
        record: &BenchmarkRecord,
        shape: &TrialShape,
        profilers: &[Box<dyn ExternalProfiler>],
        started: &[bool],
    ) -> LaunchSpec {
        let active = || profilers.iter().zip(started).filter(|(_, s)| **s).map(|(p, _)| p);

        let mut command: Vec<String> = record.launch_args_prepend.clone().unwrap_or_default();
        for profiler in active() {
            command.extend(profiler.launch_prefix(record));
        }
        command.extend(self.worker_command.iter().cloned());
        command.extend(record.launch_args.iter().flatten().cloned());
        for profiler in active() {
            command.extend(profiler.additional_launch_arguments(record));
        }
        command.extend(record.launch_args_append.iter().flatten().cloned());

        LaunchSpec {
            command,
            profilers: self.profilers.internal().to_vec(),
            timeout: shape.timeout,
        }
    }

    /// `forks = 0`: drive the controller directly in this process
    fn run_in_process(
        &self,
        def: &TaskDef,
        record: &BenchmarkRecord,
    ) -> Result<TrialResult, TrialError> {
        let label = record.label();
        if self.profilers.has_external() {
            tracing::warn!(trial = %label, "external profilers need forks > 0; skipped");
        }

        let mut driver = def
            .prepare(record, self.profilers.internal())
            .map_err(|report| TrialError::Configuration {
                record: label.clone(),
                message: report.message,
            })?;

        let mut fork = ForkResult {
            index: 0,
            pid: std::process::id(),
            ..ForkResult::default()
        };
        let reports = driver
            .run()
            .map_err(|report| TrialError::reported(&label, report))?;
        for report in reports {
            tracing::info!(fork = "in-process", "{}", progress(&label, &report));
            fork.warnings.extend(report.warnings);
            if report.phase == Phase::Measurement {
                fork.iterations.push(report.result);
            }
        }

        Ok(TrialResult::pooled(
            record.clone(),
            vec![fork],
            Vec::new(),
            Vec::new(),
        ))
    }
}

fn progress(label: &str, report: &IterationReport) -> String {
    let score = match &report.result.primary {
        Some(primary) => format!("{} {}", format_number(primary.score()), primary.unit()),
        None => "no samples".to_string(),
    };
    format!("# {label} {} iteration {}: {score}", report.phase, report.index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use trialbench_core::{
        BenchmarkTask, Bindings, GroupInfo, Outcome, Profiler, State, TaskError, ThreadInfo,
    };
    use trialbench_ipc::{FrameWriter, WorkerHello};
    use trialbench_stats::{AggregationPolicy, Mode, ResultKind, ResultRole, SampleSet};

    fn frame(message: &WorkerMessage) -> Vec<u8> {
        let mut buffer = Vec::new();
        FrameWriter::new(&mut buffer).write(message).unwrap();
        buffer
    }

    fn iteration(phase: Phase, index: u32, value: f64) -> WorkerMessage {
        let primary = BenchResult::new(
            ResultKind::AverageTime,
            ResultRole::Primary,
            "scripted",
            "ns/op",
            AggregationPolicy::Average,
            SampleSet::singleton(value),
        );
        WorkerMessage::Iteration(IterationReport {
            phase,
            index,
            result: IterationResult {
                primary: Some(primary),
                threads: 1,
                ..IterationResult::default()
            },
            warnings: Vec::new(),
        })
    }

    /// A shell worker answering `iterate` with the given frames in order
    struct ScriptedWorker {
        dir: TempDir,
    }

    impl ScriptedWorker {
        fn new(iterations: &[WorkerMessage], last: &WorkerMessage) -> Self {
            let dir = tempfile::tempdir().unwrap();
            for (i, message) in iterations.iter().enumerate() {
                std::fs::write(dir.path().join(format!("iter{i}")), frame(message)).unwrap();
            }
            std::fs::write(dir.path().join("last"), frame(last)).unwrap();

            let hello = String::from_utf8(frame(&WorkerMessage::Hello(WorkerHello {
                protocol_version: 1,
                pid: 0,
                task: "scripted".to_string(),
            })))
            .unwrap()
            .replace("\"pid\":0", "\"pid\":$$")
            .replace('"', "\\\"");
            let script = format!(
                "read rec <&3\n\
                 echo \"{hello}\" >&4\n\
                 i=0\n\
                 while read cmd <&3; do\n\
                 \x20 if [ \"$cmd\" = terminate ]; then cat {dir}/last >&4; exit 0; fi\n\
                 \x20 echo \"worker log $i\" >&4\n\
                 \x20 cat {dir}/iter$i >&4 || exit 7\n\
                 \x20 i=$((i+1))\n\
                 done\n",
                hello = hello.trim_end(),
                dir = dir.path().display(),
            );
            std::fs::write(dir.path().join("worker.sh"), script).unwrap();
            Self { dir }
        }

        fn command(&self) -> Vec<String> {
            vec![
                "/bin/sh".to_string(),
                self.dir.path().join("worker.sh").display().to_string(),
            ]
        }
    }

    fn record(forks: u32) -> BenchmarkRecord {
        let mut record = BenchmarkRecord::new("scripted", Mode::AverageTime);
        record.forks = Some(forks);
        record.warmup_iterations = Some(1);
        record.measurement_iterations = Some(2);
        record.timeout = Some(Duration::from_secs(10));
        record
    }

    fn healthy_worker() -> ScriptedWorker {
        ScriptedWorker::new(
            &[
                iteration(Phase::Warmup, 0, 100.0),
                iteration(Phase::Measurement, 0, 10.0),
                iteration(Phase::Measurement, 1, 20.0),
            ],
            &WorkerMessage::Complete { iterations: 3 },
        )
    }

    /// Registry entry for the records the scripted workers serve
    struct Scripted;

    impl BenchmarkTask for Scripted {
        const ID: &'static str = "scripted";
        type Shared = ();
        type Group = ();
        type Thread = ();

        fn create(_: &Bindings) -> Result<Self, TaskError> {
            Ok(Scripted)
        }
        fn shared_state(&self) -> Result<(), TaskError> {
            Ok(())
        }
        fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
            Ok(())
        }
        fn thread_state(&self, _: &ThreadInfo) -> Result<(), TaskError> {
            Ok(())
        }
        fn invoke(&self, _: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
            Ok(Outcome::Timed)
        }
    }

    fn orchestrator(worker: &ScriptedWorker, profilers: ProfilerSelection) -> Orchestrator {
        Orchestrator::new(TaskRegistry::new().with::<Scripted>(), profilers)
            .unwrap()
            .with_worker_command(worker.command())
    }

    struct Broken;

    impl Profiler for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "fails to start"
        }
    }

    impl ExternalProfiler for Broken {
        fn before_trial(&mut self, _: &BenchmarkRecord) -> Result<(), ProfilerError> {
            Err(ProfilerError::Unavailable("no such tool".to_string()))
        }
        fn after_trial(
            &mut self,
            _: &ForkResult,
            _: u32,
            _: &Path,
            _: &Path,
        ) -> Result<Vec<BenchResult>, ProfilerError> {
            panic!("after_trial of a profiler that never started");
        }
    }

    struct Counting {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Profiler for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn description(&self) -> &str {
            "counts forks"
        }
    }

    impl ExternalProfiler for Counting {
        fn launch_prefix(&self, _: &BenchmarkRecord) -> Vec<String> {
            vec!["nice".to_string()]
        }
        fn before_trial(&mut self, _: &BenchmarkRecord) -> Result<(), ProfilerError> {
            self.log.lock().unwrap().push("before".to_string());
            Ok(())
        }
        fn after_trial(
            &mut self,
            fork: &ForkResult,
            pid: u32,
            stdout: &Path,
            _: &Path,
        ) -> Result<Vec<BenchResult>, ProfilerError> {
            assert_eq!(pid, fork.pid);
            assert!(stdout.exists());
            self.log.lock().unwrap().push(format!("after {}", fork.index));
            Ok(vec![BenchResult::scalar(
                "·counting.forks",
                1.0,
                "#",
                AggregationPolicy::Sum,
            )])
        }
    }

    #[test]
    fn test_forks_are_pooled() {
        let worker = healthy_worker();
        let result = orchestrator(&worker, ProfilerSelection::default())
            .run_trial(&record(2))
            .unwrap();

        assert_eq!(result.forks.len(), 2);
        assert!(result.forks.iter().all(|f| f.iterations.len() == 2));
        assert!(result.forks.iter().all(|f| f.pid != 0));
        let primary = result.primary().unwrap();
        assert_eq!(primary.sample_count(), 4);
        assert!((primary.score() - 15.0).abs() < 1e-9);
        assert!(!result.is_failed());
    }

    #[test]
    fn test_profiler_failure_becomes_warning() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut profilers = ProfilerSelection::default();
        profilers.attach("broken", || -> Box<dyn ExternalProfiler> { Box::new(Broken) });
        let shared = Arc::clone(&log);
        profilers.attach("counting", move || -> Box<dyn ExternalProfiler> {
            Box::new(Counting {
                log: Arc::clone(&shared),
            })
        });

        let worker = healthy_worker();
        let result = orchestrator(&worker, profilers).run_trial(&record(2)).unwrap();

        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].starts_with("broken: before_trial failed"));
        assert_eq!(result.profiler_results["·counting.forks"].score(), 2.0);
        assert_eq!(
            *log.lock().unwrap(),
            ["before", "after 0", "before", "after 1"]
        );
    }

    #[test]
    fn test_launch_command_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let profilers: Vec<Box<dyn ExternalProfiler>> =
            vec![Box::new(Broken), Box::new(Counting { log })];
        let mut record = record(1);
        record.launch_args_prepend = Some(vec!["taskset".into(), "-c".into(), "2".into()]);
        record.launch_args = Some(vec!["--quiet".into()]);
        record.launch_args_append = Some(vec!["--tail".into()]);

        let orchestrator = Orchestrator::new(TaskRegistry::new(), ProfilerSelection::default())
            .unwrap()
            .with_worker_command(vec!["/bin/bench".into(), WORKER_ARG.into()]);
        let spec =
            orchestrator.launch_spec(&record, &TrialShape::of(&record), &profilers, &[false, true]);
        assert_eq!(
            spec.command,
            ["taskset", "-c", "2", "nice", "/bin/bench", WORKER_ARG, "--quiet", "--tail"]
        );
        assert_eq!(spec.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_worker_failure_is_reported() {
        let failure = FailureReport {
            task: "scripted".to_string(),
            site: FailureSite::Invocation,
            thread: Some(0),
            message: "queue overflow".to_string(),
        };
        let worker = ScriptedWorker::new(
            &[WorkerMessage::Failure(failure.clone())],
            &WorkerMessage::Complete { iterations: 0 },
        );
        let err = orchestrator(&worker, ProfilerSelection::default())
            .run_trial(&record(1))
            .unwrap_err();
        match err {
            TrialError::Worker(report) => assert_eq!(report, failure),
            other => panic!("expected worker failure, got {other}"),
        }
    }

    #[test]
    fn test_worker_configuration_failure() {
        let worker = ScriptedWorker::new(
            &[WorkerMessage::Failure(FailureReport {
                task: "scripted".to_string(),
                site: FailureSite::Configuration,
                thread: None,
                message: "unknown benchmark task: scripted".to_string(),
            })],
            &WorkerMessage::Complete { iterations: 0 },
        );
        let err = orchestrator(&worker, ProfilerSelection::default())
            .run_trial(&record(1))
            .unwrap_err();
        match err {
            TrialError::Configuration { record, message } => {
                assert!(record.contains("scripted"));
                assert!(message.contains("unknown benchmark task"));
            }
            other => panic!("expected configuration error, got {other}"),
        }
    }

    #[test]
    fn test_unknown_task_is_rejected_before_launch() {
        // A launch would fail with a spawn error instead
        let orchestrator = Orchestrator::new(TaskRegistry::new(), ProfilerSelection::default())
            .unwrap()
            .with_worker_command(vec!["/nonexistent/worker".to_string()]);
        let mut missing = record(1);
        missing.name = "missing".to_string();

        let err = orchestrator.run_trial(&missing).unwrap_err();
        match err {
            TrialError::Configuration { message, .. } => {
                assert_eq!(message, "unknown benchmark task: missing")
            }
            other => panic!("expected configuration error, got {other}"),
        }
    }

    #[test]
    fn test_invalid_record_is_rejected_before_launch() {
        let worker = healthy_worker();
        let mut invalid = record(1);
        invalid.threads = Some(0);
        let err = orchestrator(&worker, ProfilerSelection::default())
            .run_trial(&invalid)
            .unwrap_err();
        assert!(matches!(err, TrialError::Configuration { .. }), "{err}");
    }

    #[test]
    fn test_crashed_worker_is_process_failure() {
        // Only one iteration frame for three iterations: the script exits 7
        let worker = ScriptedWorker::new(
            &[iteration(Phase::Warmup, 0, 1.0)],
            &WorkerMessage::Complete { iterations: 3 },
        );
        let err = orchestrator(&worker, ProfilerSelection::default())
            .run_trial(&record(1))
            .unwrap_err();
        assert!(err.is_process_failure(), "{err}");
    }

    #[test]
    fn test_out_of_order_iteration_is_desync() {
        let worker = ScriptedWorker::new(
            &[iteration(Phase::Measurement, 0, 1.0)],
            &WorkerMessage::Complete { iterations: 3 },
        );
        let err = orchestrator(&worker, ProfilerSelection::default())
            .run_trial(&record(1))
            .unwrap_err();
        assert!(matches!(
            err,
            TrialError::Process {
                source: ProcessFailure::Desync { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_continue_on_error() {
        let worker = ScriptedWorker::new(&[], &WorkerMessage::Complete { iterations: 0 });
        let orchestrator = orchestrator(&worker, ProfilerSelection::default());

        let strict = record(1);
        assert!(orchestrator.run_all(&[strict], 1, &|_| {}).is_err());

        let mut lenient = record(1);
        lenient.fail_on_error = Some(false);
        let second = lenient.with_binding("n", "2");
        let seen = Mutex::new(0);
        let results = orchestrator
            .run_all(&[lenient, second], 2, &|_| *seen.lock().unwrap() += 1)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(TrialResult::is_failed));
        assert!(results[0].primary().is_none());
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    struct Spin;

    impl BenchmarkTask for Spin {
        const ID: &'static str = "spin";
        type Shared = ();
        type Group = ();
        type Thread = u64;

        fn create(_: &Bindings) -> Result<Self, TaskError> {
            Ok(Spin)
        }
        fn shared_state(&self) -> Result<(), TaskError> {
            Ok(())
        }
        fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
            Ok(())
        }
        fn thread_state(&self, _: &ThreadInfo) -> Result<u64, TaskError> {
            Ok(0)
        }
        fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
            *state.thread += 1;
            Ok(Outcome::Timed)
        }
    }

    fn in_process(name: &str) -> BenchmarkRecord {
        let mut record = BenchmarkRecord::new(name, Mode::AverageTime);
        record.forks = Some(0);
        record.warmup_iterations = Some(1);
        record.warmup_batch_size = Some(10);
        record.measurement_iterations = Some(2);
        record.measurement_batch_size = Some(10);
        record
    }

    #[test]
    fn test_in_process_trial() {
        let orchestrator = Orchestrator::new(
            TaskRegistry::new().with::<Spin>(),
            ProfilerSelection::default(),
        )
        .unwrap()
        .with_worker_command(vec!["/nonexistent".to_string()]);

        let result = orchestrator.run_trial(&in_process("spin")).unwrap();
        assert_eq!(result.forks.len(), 1);
        assert_eq!(result.forks[0].pid, std::process::id());
        assert_eq!(result.forks[0].iterations.len(), 2);
        assert!(result.primary().is_some());

        let err = orchestrator.run_trial(&in_process("missing")).unwrap_err();
        assert!(matches!(err, TrialError::Configuration { .. }));
    }
}
