//! IPC Message Types
//!
//! Commands travel controller → worker as bare lines (`iterate`, `terminate`).
//! Worker responses are JSON frames (see [`crate::FrameWriter::write`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use trialbench_stats::IterationResult;

/// Command sent from controller to worker.
///
/// A trial is cancelled only by terminating the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Run the next iteration (warmup first, then measurement)
    Iterate,
    /// Run trial teardown and exit
    Terminate,
}

impl SupervisorCommand {
    /// Wire form of the command
    pub fn as_line(self) -> &'static str {
        match self {
            SupervisorCommand::Iterate => "iterate",
            SupervisorCommand::Terminate => "terminate",
        }
    }
}

impl fmt::Display for SupervisorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_line())
    }
}

impl FromStr for SupervisorCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "iterate" => Ok(SupervisorCommand::Iterate),
            "terminate" => Ok(SupervisorCommand::Terminate),
            other => Err(format!("unknown command: {other:?}")),
        }
    }
}

/// Fixture lifecycle level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// Once per trial
    Trial,
    /// Once per iteration
    Iteration,
    /// Around every invocation
    Invocation,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Trial => "trial",
            Level::Iteration => "iteration",
            Level::Invocation => "invocation",
        })
    }
}

/// Iteration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Results are discarded
    Warmup,
    /// Results feed the trial result
    Measurement,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Warmup => "warmup",
            Phase::Measurement => "measurement",
        })
    }
}

/// Where in the task lifecycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureSite {
    /// Task could not be resolved or configured in the worker
    Configuration,
    /// A setup fixture failed
    Setup(Level),
    /// The benchmarked call failed
    Invocation,
    /// A teardown fixture failed
    Teardown(Level),
}

impl fmt::Display for FailureSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureSite::Configuration => f.write_str("configuration"),
            FailureSite::Setup(level) => write!(f, "{level} setup"),
            FailureSite::Invocation => f.write_str("invocation"),
            FailureSite::Teardown(level) => write!(f, "{level} teardown"),
        }
    }
}

/// A failure raised by benchmarked code or its fixtures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Task name
    pub task: String,
    /// Lifecycle location
    pub site: FailureSite,
    /// Worker thread index, when the failure is thread-bound
    pub thread: Option<usize>,
    /// Error or panic message
    pub message: String,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed during {}", self.task, self.site)?;
        if let Some(thread) = self.thread {
            write!(f, " on thread {thread}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Handshake sent by the worker once the record has been accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHello {
    /// Protocol version for compatibility
    pub protocol_version: u32,
    /// Process id of the worker itself (not of any launch wrapper)
    pub pid: u32,
    /// Resolved task id
    pub task: String,
}

impl WorkerHello {
    /// Hello for the current process
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            pid: std::process::id(),
            task: task.into(),
        }
    }
}

/// One completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    /// Warmup or measurement
    pub phase: Phase,
    /// Zero-based index within the phase
    pub index: u32,
    /// Folded thread results plus internal profiler results
    pub result: IterationResult,
    /// Internal profiler hooks that failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Messages sent from worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// Handshake
    Hello(WorkerHello),
    /// Result of one iteration
    Iteration(IterationReport),
    /// The task failed; the worker exits after sending this
    Failure(FailureReport),
    /// Trial teardown finished
    Complete {
        /// Iterations executed across both phases
        iterations: u32,
    },
}
