#![warn(missing_docs)]
//! Trialbench Core - Worker Runtime
//!
//! This crate provides the execution environment for benchmarks:
//! - [`BenchmarkTask`] with benchmark, group and thread scoped state
//! - The iteration [`Controller`] state machine with fixtures and barriers
//! - A [`Blackhole`] sink against dead-code elimination
//! - Internal profilers hooked around iterations
//! - The worker side of the controller/worker channel

mod controller;
mod error;
mod measure;
mod params;
mod profiler;
mod registry;
mod sink;
mod task;
mod worker;

pub use controller::{Controller, ControllerState, TrialDriver};
pub use error::{ParamError, ProfilerError, TaskError, WorkerError};
pub use measure::{BatchSizer, MAX_BATCH, MAX_SAMPLES, Sampler, Timer};
pub use params::{
    BenchmarkParams, IterationLength, IterationParams, ThreadGroup, defaults,
};
pub use profiler::{
    INTERNAL_PROFILERS, InternalProfiler, Profiler, RusageProfiler, internal_profiler,
};
pub use registry::{TaskDef, TaskRegistry};
pub use sink::Blackhole;
pub use task::{
    BenchmarkTask, Bindings, FixtureState, Fixtures, GroupInfo, GroupSpec, Outcome, ParamSpec,
    Scope, State, TaskDescriptor, ThreadInfo,
};
pub use trialbench_ipc::Level;
pub use worker::{WorkerMain, shutdown_requested};

/// Anchor to prevent LTO from stripping inventory entries
#[used]
#[doc(hidden)]
pub static REGISTRY_ANCHOR: fn() = || for _ in inventory::iter::<TaskDef> {};
