#![warn(missing_docs)]
//! Trialbench IPC Protocol
//!
//! Line-oriented protocol between the trial controller and a forked worker.
//! The controller sends the encoded [`BenchmarkRecord`] first, then one
//! [`SupervisorCommand`] per line. The worker answers with JSON-framed
//! [`WorkerMessage`]s interleaved with free-form log lines.

mod framing;
mod messages;
mod record;

pub use framing::{FrameError, FrameReader, FrameWriter, Frame, MAX_FRAME_SIZE, PROTOCOL_PREFIX, read_line, write_line};
pub use messages::{
    FailureReport, FailureSite, IterationReport, Level, Phase, SupervisorCommand, WorkerHello,
    WorkerMessage,
};
pub use record::{
    BenchmarkRecord, EMPTY_MARKER, FIELD_SEPARATOR, KEY_SEPARATOR, LIST_SEPARATOR, NONE_MARKER,
    PAIR_SEPARATOR, RecordError, format_time_value, parse_time_value,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the worker's channel descriptors as `read,write`
pub const IPC_FD_ENV: &str = "TRIALBENCH_IPC_FD";

/// Environment variable carrying the comma-separated internal profiler names
pub const PROFILERS_ENV: &str = "TRIALBENCH_PROFILERS";

/// Hidden argument switching a binary into worker mode
pub const WORKER_ARG: &str = "--trialbench-worker";
