//! Task registry
//!
//! Tasks register themselves at link time:
//!
//! ```ignore
//! inventory::submit!(TaskDef::of::<QueueOffer>());
//! ```
//!
//! The worker resolves the record's task id through the registry and gets
//! back a type-erased [`TrialDriver`].

use crate::controller::{Controller, TrialDriver};
use crate::error::TaskError;
use crate::params::BenchmarkParams;
use crate::profiler::{InternalProfiler, internal_profiler};
use crate::task::{BenchmarkTask, TaskDescriptor};
use std::collections::BTreeMap;
use std::fmt;
use trialbench_ipc::{BenchmarkRecord, FailureReport, FailureSite};

type Instantiate =
    fn(BenchmarkParams, Vec<Box<dyn InternalProfiler>>) -> Result<Box<dyn TrialDriver>, TaskError>;

/// A registered task type.
#[derive(Clone, Copy)]
pub struct TaskDef {
    /// Task id
    pub id: &'static str,
    descriptor: fn() -> TaskDescriptor,
    instantiate: Instantiate,
}

fn instantiate<T: BenchmarkTask>(
    params: BenchmarkParams,
    profilers: Vec<Box<dyn InternalProfiler>>,
) -> Result<Box<dyn TrialDriver>, TaskError> {
    let task = T::create(&params.bindings)?;
    Ok(Box::new(Controller::new(task, params, profilers)))
}

impl TaskDef {
    /// Definition of a task type
    pub const fn of<T: BenchmarkTask>() -> Self {
        Self {
            id: T::ID,
            descriptor: TaskDescriptor::of::<T>,
            instantiate: instantiate::<T>,
        }
    }

    /// Static description
    pub fn descriptor(&self) -> TaskDescriptor {
        (self.descriptor)()
    }

    /// Resolve a record and build a driver with the named internal
    /// profilers attached. Any problem is a configuration failure.
    pub fn prepare(
        &self,
        record: &BenchmarkRecord,
        profilers: &[String],
    ) -> Result<Box<dyn TrialDriver>, FailureReport> {
        let configuration = |message: String| FailureReport {
            task: record.name.clone(),
            site: FailureSite::Configuration,
            thread: None,
            message,
        };

        let params = BenchmarkParams::resolve(record, &self.descriptor())
            .map_err(|e| configuration(e.to_string()))?;
        let profilers = profilers
            .iter()
            .map(|name| internal_profiler(name))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| configuration(e.to_string()))?;
        (self.instantiate)(params, profilers).map_err(|e| configuration(e.to_string()))
    }
}

impl fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef").field("id", &self.id).finish()
    }
}

inventory::collect!(TaskDef);

/// Tasks available to a run, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, TaskDef>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of every task submitted with `inventory::submit!`.
    ///
    /// On duplicate ids the first submission wins.
    pub fn discover() -> Self {
        let mut registry = Self::new();
        for def in inventory::iter::<TaskDef> {
            if registry.tasks.contains_key(def.id) {
                tracing::warn!(id = def.id, "duplicate task id ignored");
                continue;
            }
            registry.tasks.insert(def.id, *def);
        }
        registry
    }

    /// Add a task type
    pub fn with<T: BenchmarkTask>(mut self) -> Self {
        self.register(TaskDef::of::<T>());
        self
    }

    /// Add a definition, replacing any previous one with the same id
    pub fn register(&mut self, def: TaskDef) {
        self.tasks.insert(def.id, def);
    }

    /// Look up a task
    pub fn get(&self, id: &str) -> Option<&TaskDef> {
        self.tasks.get(id)
    }

    /// All tasks in id order
    pub fn iter(&self) -> impl Iterator<Item = &TaskDef> {
        self.tasks.values()
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is registered
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
