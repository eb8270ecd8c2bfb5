//! External profilers and profiler selection
//!
//! External profilers live in the controller. They may wrap or extend the
//! worker command line, start before the worker launches and collect after
//! it exits. Internal profilers are only named here; the worker
//! instantiates them.

mod events;
mod perf;

pub use events::{KERNEL_SYMBOL, PerfEvents, Symbol, SymbolMap, UNKNOWN_SYMBOL};
pub use perf::{PerfProfiler, PerfSettings};

use crate::config::{ConfigError, ProfilersConfig};
use crate::orchestrator::ForkResult;
use std::path::Path;
use std::sync::Arc;
use trialbench_core::{INTERNAL_PROFILERS, ParamError, Profiler, ProfilerError};
use trialbench_ipc::BenchmarkRecord;
use trialbench_stats::BenchResult;

/// Profiler running in the controller around each worker process.
pub trait ExternalProfiler: Profiler {
    /// Command prefix wrapping the worker
    fn launch_prefix(&self, _record: &BenchmarkRecord) -> Vec<String> {
        Vec::new()
    }

    /// Extra worker arguments
    fn additional_launch_arguments(&self, _record: &BenchmarkRecord) -> Vec<String> {
        Vec::new()
    }

    /// Called before the worker launches
    fn before_trial(&mut self, record: &BenchmarkRecord) -> Result<(), ProfilerError>;

    /// Called after the worker exited. `pid` is the worker's own pid.
    fn after_trial(
        &mut self,
        fork: &ForkResult,
        pid: u32,
        stdout: &Path,
        stderr: &Path,
    ) -> Result<Vec<BenchResult>, ProfilerError>;
}

/// Builds a fresh profiler instance for every fork.
pub type ExternalFactory = Arc<dyn Fn() -> Box<dyn ExternalProfiler> + Send + Sync>;

/// Names and descriptions of the built-in external profilers
pub const EXTERNAL_PROFILERS: &[(&str, &str)] = &[(
    PerfProfiler::NAME,
    "Hottest symbols of the worker from system-wide perf sampling",
)];

/// Profilers attached to a run, in attachment order.
#[derive(Clone, Default)]
pub struct ProfilerSelection {
    internal: Vec<String>,
    external: Vec<(String, ExternalFactory)>,
}

impl std::fmt::Debug for ProfilerSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilerSelection")
            .field("internal", &self.internal)
            .field(
                "external",
                &self.external.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Profiler names that cannot be attached
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error(transparent)]
    Unknown(#[from] ParamError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProfilerSelection {
    /// Resolve names against the built-in profilers
    pub fn resolve(names: &[String], config: &ProfilersConfig) -> Result<Self, SelectionError> {
        let mut selection = Self::default();
        for name in names {
            if INTERNAL_PROFILERS.iter().any(|(n, _)| n == name) {
                selection.internal.push(name.clone());
            } else if name == PerfProfiler::NAME {
                let settings = PerfSettings::try_from(&config.perf)?;
                selection.attach(name.as_str(), move || -> Box<dyn ExternalProfiler> {
                    Box::new(PerfProfiler::new(settings.clone()))
                });
            } else {
                return Err(ParamError::UnknownProfiler(name.clone()).into());
            }
        }
        Ok(selection)
    }

    /// Attach an external profiler after the ones already selected
    pub fn attach<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ExternalProfiler> + Send + Sync + 'static,
    {
        self.external.push((name.into(), Arc::new(factory)));
    }

    /// Internal profiler names passed to the worker
    pub fn internal(&self) -> &[String] {
        &self.internal
    }

    /// Fresh external profiler instances
    pub fn instantiate_external(&self) -> Vec<Box<dyn ExternalProfiler>> {
        self.external.iter().map(|(_, factory)| factory()).collect()
    }

    /// Whether any external profiler is attached
    pub fn has_external(&self) -> bool {
        !self.external.is_empty()
    }
}

/// All built-in profilers as (name, kind, description)
pub fn available_profilers() -> Vec<(&'static str, &'static str, &'static str)> {
    INTERNAL_PROFILERS
        .iter()
        .map(|(n, d)| (*n, "internal", *d))
        .chain(EXTERNAL_PROFILERS.iter().map(|(n, d)| (*n, "external", *d)))
        .collect()
}
