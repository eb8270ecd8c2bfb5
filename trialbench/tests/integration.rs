//! Integration tests for Trialbench
//!
//! These tests drive whole trials through the public API: planning,
//! in-process execution, fixtures, thread groups and failure handling.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use trialbench::prelude::*;
use trialbench::{
    BenchmarkRecord, FailureSite, Orchestrator, PlanOptions, ProfilerSelection, TaskRegistry,
    TrialError, build_plan,
};

/// Records how often each fixture ran
struct Counted;

static TRIAL_SETUPS: AtomicUsize = AtomicUsize::new(0);
static TRIAL_TEARDOWNS: AtomicUsize = AtomicUsize::new(0);
static ITERATION_SETUPS: AtomicUsize = AtomicUsize::new(0);

impl BenchmarkTask for Counted {
    const ID: &'static str = "counted";
    type Shared = ();
    type Group = ();
    type Thread = u64;

    fn create(_: &Bindings) -> Result<Self, TaskError> {
        Ok(Counted)
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
    fn fixtures(&self) -> Fixtures {
        Fixtures::TRIAL_BENCHMARK | Fixtures::ITERATION_THREAD
    }
    fn setup(&self, level: Level, _: FixtureState<'_, Self>) -> Result<(), TaskError> {
        match level {
            Level::Trial => TRIAL_SETUPS.fetch_add(1, Ordering::SeqCst),
            _ => ITERATION_SETUPS.fetch_add(1, Ordering::SeqCst),
        };
        Ok(())
    }
    fn teardown(&self, level: Level, _: FixtureState<'_, Self>) -> Result<(), TaskError> {
        if level == Level::Trial {
            TRIAL_TEARDOWNS.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
    fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
        *state.thread += 1;
        state.consume(*state.thread);
        Ok(Outcome::Timed)
    }
}

/// Producer/consumer pair sharing a stack
struct Handoff;

impl BenchmarkTask for Handoff {
    const ID: &'static str = "handoff";
    const MODE: Mode = Mode::Throughput;
    type Shared = Mutex<Vec<u32>>;
    type Group = ();
    type Thread = ();

    fn groups() -> Vec<GroupSpec> {
        vec![GroupSpec::new("producer", 1), GroupSpec::new("consumer", 2)]
    }
    fn create(_: &Bindings) -> Result<Self, TaskError> {
        Ok(Handoff)
    }
    fn shared_state(&self) -> Result<Mutex<Vec<u32>>, TaskError> {
        Ok(Mutex::new(Vec::new()))
    }
    fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
        Ok(())
    }
    fn thread_state(&self, _: &ThreadInfo) -> Result<(), TaskError> {
        Ok(())
    }
    fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
        let mut items = state
            .shared
            .lock()
            .map_err(|_| TaskError::msg("poisoned"))?;
        if state.info().group_name == "producer" {
            items.push(1);
        } else {
            items.pop();
        }
        Ok(Outcome::Timed)
    }
}

/// With `depth=1`, fails on the third invocation of every thread
struct Flaky {
    depth: u32,
}

impl BenchmarkTask for Flaky {
    const ID: &'static str = "flaky";
    type Shared = ();
    type Group = ();
    type Thread = u32;

    fn params() -> Vec<ParamSpec> {
        vec![ParamSpec::new("depth", ["1", "2"])]
    }
    fn create(bindings: &Bindings) -> Result<Self, TaskError> {
        Ok(Flaky {
            depth: bindings.parse("depth")?,
        })
    }
    fn shared_state(&self) -> Result<(), TaskError> {
        Ok(())
    }
    fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
        Ok(())
    }
    fn thread_state(&self, _: &ThreadInfo) -> Result<u32, TaskError> {
        Ok(0)
    }
    fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
        *state.thread += 1;
        if self.depth == 1 && *state.thread == 3 {
            return Err(TaskError::msg("disk full"));
        }
        Ok(Outcome::Timed)
    }
}

fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .with::<Counted>()
        .with::<Handoff>()
        .with::<Flaky>()
}

fn orchestrator() -> Orchestrator {
    Orchestrator::new(registry(), ProfilerSelection::default()).unwrap()
}

fn in_process(name: &str, mode: Mode) -> BenchmarkRecord {
    let mut record = BenchmarkRecord::new(name, mode);
    record.forks = Some(0);
    record.warmup_iterations = Some(1);
    record.warmup_batch_size = Some(50);
    record.measurement_iterations = Some(3);
    record.measurement_batch_size = Some(50);
    record
}

/// Fixtures run at their declared levels across a whole trial
#[test]
fn test_fixture_lifecycle() {
    let mut record = in_process("counted", Mode::AverageTime);
    record.threads = Some(2);

    let result = orchestrator().run_trial(&record).unwrap();

    assert_eq!(TRIAL_SETUPS.load(Ordering::SeqCst), 1);
    assert_eq!(TRIAL_TEARDOWNS.load(Ordering::SeqCst), 1);
    // 2 threads x (1 warmup + 3 measurement) iterations
    assert_eq!(ITERATION_SETUPS.load(Ordering::SeqCst), 8);

    assert_eq!(result.forks[0].iterations.len(), 3);
    let primary = result.primary().unwrap();
    assert_eq!(primary.unit(), "ns/op");
    assert!(primary.score() > 0.0);
}

/// Thread groups run their declared thread counts
#[test]
fn test_thread_groups() {
    let mut record = in_process("handoff", Mode::Throughput);
    record.thread_groups = vec![2, 1];

    let result = orchestrator().run_trial(&record).unwrap();
    assert!(result.forks[0].iterations.iter().all(|i| i.threads == 3));
    assert!(result.primary().unwrap().score() > 0.0);
}

/// Scale mode ramps every group up one thread per iteration
#[test]
fn test_scale_mode() {
    let mut record = in_process("handoff", Mode::Throughput);
    record.scale = Some(true);

    let result = orchestrator().run_trial(&record).unwrap();
    let threads: Vec<usize> = result.forks[0].iterations.iter().map(|i| i.threads).collect();
    assert_eq!(threads, vec![2, 3, 3]);
    assert!(result.primary().unwrap().score() > 0.0);
}

/// A thread group layout that does not match the declaration is rejected
/// before anything runs
#[test]
fn test_group_mismatch_is_configuration_error() {
    let mut record = in_process("handoff", Mode::Throughput);
    record.thread_groups = vec![1];

    let err = orchestrator().run_trial(&record).unwrap_err();
    assert!(matches!(err, TrialError::Configuration { .. }), "{err}");
}

/// Planning expands modes and parameters, sorted deterministically
#[test]
fn test_plan_expansion() {
    let options = PlanOptions {
        mode: Some(Mode::All),
        ..PlanOptions::default()
    };
    let filter = regex::Regex::new("^flaky$").unwrap();
    let plan = build_plan(&registry(), Some(&filter), &options).unwrap();

    // 4 concrete modes x 2 depth values
    assert_eq!(plan.len(), 8);
    let mut sorted = plan.records.clone();
    sorted.sort();
    assert_eq!(sorted, plan.records);
    assert!(plan.records.iter().all(|r| r.mode != Mode::All));
}

/// Records survive the line codec whatever their strings contain
#[test]
fn test_record_codec_is_lossless() {
    let mut record = BenchmarkRecord::new("odd===,===name", Mode::SampleTime)
        .with_binding("path", "a\\q=b\nc")
        .with_binding("empty", "");
    record.launch_args = Some(vec!["-Dx===SEP===y".to_string(), String::new()]);
    record.timeout = Some(Duration::from_millis(1500));
    record.fail_on_error = Some(false);

    let line = record.encode();
    assert!(!line.contains('\n'));
    assert_eq!(BenchmarkRecord::decode(&line).unwrap(), record);
}

/// A failing invocation stops the run unless the record continues on error
#[test]
fn test_worker_failure_and_continue_on_error() {
    let mut strict = in_process("flaky", Mode::AverageTime).with_binding("depth", "1");
    strict.warmup_iterations = Some(0);
    strict.measurement_batch_size = Some(1);
    strict.measurement_iterations = Some(5);

    let err = orchestrator().run_trial(&strict).unwrap_err();
    match err {
        TrialError::Worker(report) => {
            assert_eq!(report.task, "flaky");
            assert_eq!(report.site, FailureSite::Invocation);
            assert!(report.message.contains("disk full"));
        }
        other => panic!("expected worker failure, got {other}"),
    }
    assert!(orchestrator().run_all(&[strict.clone()], 1, &|_| {}).is_err());

    let mut lenient = strict;
    lenient.fail_on_error = Some(false);
    let healthy = lenient.with_binding("depth", "2");
    let results = orchestrator()
        .run_all(&[lenient, healthy], 1, &|_| {})
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_failed());
    assert!(results[0].failure.as_deref().unwrap().contains("disk full"));
    assert!(!results[1].is_failed());
    assert!(results[1].primary().is_some());
}

/// A worker that dies mid-trial is a process failure, not a worker failure
#[test]
fn test_crashing_worker() {
    let script = "read rec <&3; \
        echo '@@trialbench {\"Hello\":{\"protocol_version\":1,\"pid\":1,\"task\":\"counted\"}}' >&4; \
        read cmd <&3; echo 'about to crash' >&4; kill -9 $$";
    let orchestrator = Orchestrator::new(registry(), ProfilerSelection::default())
        .unwrap()
        .with_worker_command(vec!["/bin/sh".into(), "-c".into(), script.into()]);

    let mut record = BenchmarkRecord::new("counted", Mode::AverageTime);
    record.forks = Some(1);
    record.timeout = Some(Duration::from_secs(10));

    let err = orchestrator.run_trial(&record).unwrap_err();
    assert!(err.is_process_failure(), "{err}");
    assert!(err.to_string().contains("fork 0"));
}

/// A silent worker trips the liveness timeout
#[test]
fn test_hung_worker_times_out() {
    let orchestrator = Orchestrator::new(registry(), ProfilerSelection::default())
        .unwrap()
        .with_worker_command(vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()]);

    let mut record = BenchmarkRecord::new("counted", Mode::AverageTime);
    record.forks = Some(1);
    record.timeout = Some(Duration::from_millis(300));

    let started = std::time::Instant::now();
    let err = orchestrator.run_trial(&record).unwrap_err();
    assert!(err.is_process_failure());
    assert!(started.elapsed() < Duration::from_secs(10));
}
