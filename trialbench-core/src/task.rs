//! Benchmark Task API
//!
//! A task owns its configuration; the controller owns its state. State lives
//! in three scopes:
//!
//! | Scope       | Type              | Shared by                 |
//! |-------------|-------------------|---------------------------|
//! | `Benchmark` | [`BenchmarkTask::Shared`] | every thread      |
//! | `Group`     | [`BenchmarkTask::Group`]  | threads of one group |
//! | `Thread`    | [`BenchmarkTask::Thread`] | one thread        |
//!
//! Fixtures run at trial, iteration or invocation [`Level`] for any scope the
//! task declares in [`BenchmarkTask::fixtures`].

use crate::error::TaskError;
use crate::sink::Blackhole;
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use trialbench_ipc::Level;
use trialbench_stats::{AggregationPolicy, Mode, SampleSet};

/// Lifetime a piece of state is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One instance for the whole benchmark
    Benchmark,
    /// One instance per thread group
    Group,
    /// One instance per thread
    Thread,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Benchmark => "benchmark",
            Scope::Group => "group",
            Scope::Thread => "thread",
        })
    }
}

bitflags! {
    /// Declared fixture slots, one bit per (level, scope) pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Fixtures: u16 {
        /// Trial fixture on benchmark state
        const TRIAL_BENCHMARK = 1 << 0;
        /// Trial fixture on group state
        const TRIAL_GROUP = 1 << 1;
        /// Trial fixture on thread state
        const TRIAL_THREAD = 1 << 2;
        /// Iteration fixture on benchmark state
        const ITERATION_BENCHMARK = 1 << 3;
        /// Iteration fixture on group state
        const ITERATION_GROUP = 1 << 4;
        /// Iteration fixture on thread state
        const ITERATION_THREAD = 1 << 5;
        /// Invocation fixture on benchmark state
        const INVOCATION_BENCHMARK = 1 << 6;
        /// Invocation fixture on group state
        const INVOCATION_GROUP = 1 << 7;
        /// Invocation fixture on thread state
        const INVOCATION_THREAD = 1 << 8;
    }
}

impl Fixtures {
    /// The flag for one (level, scope) pair
    pub fn at(level: Level, scope: Scope) -> Self {
        let row = match level {
            Level::Trial => 0,
            Level::Iteration => 3,
            Level::Invocation => 6,
        };
        let column = match scope {
            Scope::Benchmark => 0,
            Scope::Group => 1,
            Scope::Thread => 2,
        };
        Self::from_bits_retain(1 << (row + column))
    }

    /// Whether the fixture for this pair is declared
    pub fn has(self, level: Level, scope: Scope) -> bool {
        self.contains(Self::at(level, scope))
    }

    /// Whether any scope declares a fixture at this level
    pub fn any_at(self, level: Level) -> bool {
        [Scope::Benchmark, Scope::Group, Scope::Thread]
            .into_iter()
            .any(|scope| self.has(level, scope))
    }
}

/// What a single invocation produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// The controller's clock supplies the sample
    Timed,
    /// The task measured itself; the value is used verbatim
    Reported(f64),
}

/// Position of a thread group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Index in declaration order
    pub index: usize,
    /// Declared name
    pub name: String,
    /// Threads in this group
    pub threads: u32,
}

/// Position of a worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Global thread index
    pub index: usize,
    /// Total threads across all groups
    pub total: usize,
    /// Index of the owning group
    pub group_index: usize,
    /// Name of the owning group
    pub group_name: String,
    /// Index within the group
    pub index_in_group: usize,
    /// Threads in the owning group
    pub group_threads: u32,
}

/// Declared thread group with its default size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Group name
    pub name: String,
    /// Default thread count
    pub threads: u32,
}

impl GroupSpec {
    /// Group `name` with `threads` threads
    pub fn new(name: impl Into<String>, threads: u32) -> Self {
        Self {
            name: name.into(),
            threads,
        }
    }
}

/// Declared parameter with its candidate values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,
    /// Values tried when none are given on the command line
    pub values: Vec<String>,
}

impl ParamSpec {
    /// Parameter `name` over `values`
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Static description of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Unique id
    pub id: String,
    /// Mode used when the run does not pick one
    pub mode: Mode,
    /// Thread groups; empty means one implicit group
    pub groups: Vec<GroupSpec>,
    /// Parameters
    pub params: Vec<ParamSpec>,
}

impl TaskDescriptor {
    /// Descriptor of a task type
    pub fn of<T: BenchmarkTask>() -> Self {
        Self {
            id: T::ID.to_string(),
            mode: T::MODE,
            groups: T::groups(),
            params: T::params(),
        }
    }
}

/// Parameter values a task instance runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(BTreeMap<String, String>);

impl Bindings {
    /// Raw value of a parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Parse a parameter; missing or malformed values are task errors
    pub fn parse<T>(&self, name: &str) -> Result<T, TaskError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self
            .get(name)
            .ok_or_else(|| TaskError::msg(format!("parameter {name} is not bound")))?;
        raw.parse()
            .map_err(|e| TaskError::msg(format!("parameter {name}={raw:?}: {e}")))
    }

    /// All bindings
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<BTreeMap<String, String>> for Bindings {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// A benchmarked unit of work.
///
/// # Example
///
/// ```ignore
/// struct Counter;
///
/// impl BenchmarkTask for Counter {
///     const ID: &'static str = "counter";
///     type Shared = AtomicU64;
///     type Group = ();
///     type Thread = ();
///
///     fn create(_: &Bindings) -> Result<Self, TaskError> { Ok(Counter) }
///     fn shared_state(&self) -> Result<AtomicU64, TaskError> { Ok(AtomicU64::new(0)) }
///     fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> { Ok(()) }
///     fn thread_state(&self, _: &ThreadInfo) -> Result<(), TaskError> { Ok(()) }
///
///     fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
///         let v = state.shared.fetch_add(1, Ordering::Relaxed);
///         state.consume(v);
///         Ok(Outcome::Timed)
///     }
/// }
/// ```
pub trait BenchmarkTask: Send + Sync + Sized + 'static {
    /// Unique id used for registration and filtering
    const ID: &'static str;
    /// Default mode
    const MODE: Mode = Mode::AverageTime;

    /// Benchmark-scope state; shared between threads without implicit locking
    type Shared: Send + Sync;
    /// Group-scope state
    type Group: Send + Sync;
    /// Thread-scope state
    type Thread: Send;

    /// Declared thread groups
    fn groups() -> Vec<GroupSpec> {
        Vec::new()
    }

    /// Declared parameters
    fn params() -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Build an instance for one trial
    fn create(bindings: &Bindings) -> Result<Self, TaskError>;

    /// Build benchmark-scope state
    fn shared_state(&self) -> Result<Self::Shared, TaskError>;

    /// Build the state of one group
    fn group_state(&self, group: &GroupInfo) -> Result<Self::Group, TaskError>;

    /// Build the state of one thread
    fn thread_state(&self, thread: &ThreadInfo) -> Result<Self::Thread, TaskError>;

    /// Fixture slots this task implements
    fn fixtures(&self) -> Fixtures {
        Fixtures::empty()
    }

    /// Setup fixture, called for each declared slot
    fn setup(&self, _level: Level, _state: FixtureState<'_, Self>) -> Result<(), TaskError> {
        Ok(())
    }

    /// Teardown fixture, called for each declared slot
    fn teardown(&self, _level: Level, _state: FixtureState<'_, Self>) -> Result<(), TaskError> {
        Ok(())
    }

    /// One invocation of the benchmarked work
    fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError>;
}

/// State handed to a fixture.
pub enum FixtureState<'a, T: BenchmarkTask> {
    /// Benchmark scope
    Benchmark(&'a T::Shared),
    /// Group scope
    Group(&'a T::Group, &'a GroupInfo),
    /// Thread scope
    Thread(&'a mut T::Thread, &'a ThreadInfo),
}

impl<T: BenchmarkTask> FixtureState<'_, T> {
    /// Scope of the state
    pub fn scope(&self) -> Scope {
        match self {
            FixtureState::Benchmark(_) => Scope::Benchmark,
            FixtureState::Group(..) => Scope::Group,
            FixtureState::Thread(..) => Scope::Thread,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Secondary {
    pub(crate) unit: String,
    pub(crate) policy: AggregationPolicy,
    pub(crate) samples: SampleSet,
}

/// Secondary samples recorded by one thread in one iteration.
pub(crate) type Secondaries = BTreeMap<String, Secondary>;

/// Everything an invocation can reach.
pub struct State<'a, T: BenchmarkTask> {
    /// Benchmark-scope state
    pub shared: &'a T::Shared,
    /// State of the invoking thread's group
    pub group: &'a T::Group,
    /// State of the invoking thread
    pub thread: &'a mut T::Thread,
    pub(crate) info: &'a ThreadInfo,
    pub(crate) sink: &'a mut Blackhole,
    pub(crate) secondary: &'a mut Secondaries,
}

impl<T: BenchmarkTask> State<'_, T> {
    /// Position of the invoking thread
    pub fn info(&self) -> &ThreadInfo {
        self.info
    }

    /// The thread's sink
    pub fn sink(&mut self) -> &mut Blackhole {
        self.sink
    }

    /// Hand a value to the sink
    #[inline]
    pub fn consume<V>(&mut self, value: V) {
        self.sink.consume(value);
    }

    /// Record a secondary sample, averaged across threads and iterations
    pub fn record(&mut self, label: &str, value: f64) {
        self.record_with(label, value, "#", AggregationPolicy::Average);
    }

    /// Record a secondary sample with an explicit unit and policy.
    ///
    /// Non-finite values are dropped.
    pub fn record_with(&mut self, label: &str, value: f64, unit: &str, policy: AggregationPolicy) {
        if !value.is_finite() {
            tracing::debug!(label, value, "dropping non-finite secondary sample");
            return;
        }
        self.secondary
            .entry(label.to_string())
            .or_insert_with(|| Secondary {
                unit: unit.to_string(),
                policy,
                samples: SampleSet::new(),
            })
            .samples
            .add(value);
    }
}
