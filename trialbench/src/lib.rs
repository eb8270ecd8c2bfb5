#![warn(missing_docs)]
//! # Trialbench
//!
//! Microbenchmark harness that runs every trial in forked worker processes.
//!
//! - **Fork isolation**: each trial runs in fresh workers; a crash, hang or
//!   protocol desync fails the trial instead of the run
//! - **Fixtures**: setup and teardown at trial, iteration and invocation
//!   level on benchmark, group and thread scoped state
//! - **Thread groups**: asymmetric workloads (producer/consumer) with
//!   barrier-synchronised iterations
//! - **Modes**: throughput, average time, sampled time and single shot
//! - **Statistics**: Student-t confidence intervals, percentiles, pooled
//!   results across forks
//! - **Profilers**: `rusage` inside the worker, `perf` around it
//!
//! ## Quick Start
//!
//! ```ignore
//! use trialbench::prelude::*;
//!
//! struct Sum;
//!
//! impl BenchmarkTask for Sum {
//!     const ID: &'static str = "sum";
//!     type Shared = Vec<u64>;
//!     type Group = ();
//!     type Thread = ();
//!
//!     fn create(_: &Bindings) -> Result<Self, TaskError> { Ok(Sum) }
//!     fn shared_state(&self) -> Result<Vec<u64>, TaskError> { Ok((0..1024).collect()) }
//!     fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> { Ok(()) }
//!     fn thread_state(&self, _: &ThreadInfo) -> Result<(), TaskError> { Ok(()) }
//!
//!     fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
//!         let total: u64 = state.shared.iter().sum();
//!         state.consume(total);
//!         Ok(Outcome::Timed)
//!     }
//! }
//!
//! trialbench::register!(Sum);
//!
//! fn main() -> anyhow::Result<()> {
//!     trialbench::run()
//! }
//! ```

// Re-export core types
pub use trialbench_core::{
    BenchmarkParams, BenchmarkTask, Bindings, Blackhole, FixtureState, Fixtures, GroupInfo,
    GroupSpec, InternalProfiler, Level, Outcome, ParamSpec, Profiler, ProfilerError, Scope, State,
    TaskDef, TaskError, TaskRegistry, TaskDescriptor, ThreadInfo, WorkerMain,
};

// Re-export stats
pub use trialbench_stats::{
    AggregatedResults, AggregationPolicy, BenchResult, IterationResult, Mode, ResultKind,
    ResultRole, SampleSet, Statistics, TimeUnit,
};

// Re-export protocol types
pub use trialbench_ipc::{BenchmarkRecord, FailureReport, FailureSite, Phase};

// Re-export controller
pub use trialbench_cli::{
    Cli, ExecutionPlan, ExternalProfiler, ForkResult, Orchestrator, PlanOptions,
    ProfilerSelection, TrialError, TrialResult, TrialbenchConfig, build_plan, format_summary,
};

/// Internal re-exports for macro use
#[doc(hidden)]
pub mod internal {
    pub use inventory;
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AggregationPolicy, BenchmarkTask, Bindings, Blackhole, FixtureState, Fixtures, GroupInfo,
        GroupSpec, Level, Mode, Outcome, ParamSpec, Scope, State, TaskDef, TaskError, ThreadInfo,
    };
}

/// Register task types with the harness.
///
/// ```ignore
/// trialbench::register!(QueueOffer, MapLookup);
/// ```
#[macro_export]
macro_rules! register {
    ($($task:ty),+ $(,)?) => {
        $(
            $crate::internal::inventory::submit!($crate::TaskDef::of::<$task>());
        )+
    };
}

/// Run the Trialbench CLI harness.
///
/// Call this from your benchmark binary's `main()`:
/// ```ignore
/// fn main() -> anyhow::Result<()> {
///     trialbench::run()
/// }
/// ```
pub use trialbench_cli::run;
