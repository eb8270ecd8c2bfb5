//! Benchmark modes and time units.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What a benchmark measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Operations per unit of time
    Throughput,
    /// Average time per operation
    AverageTime,
    /// Distribution of individual invocation times
    SampleTime,
    /// Time of a single cold invocation batch
    SingleShot,
    /// Every concrete mode in turn
    All,
}

impl Mode {
    /// Concrete modes that `All` expands into
    pub const CONCRETE: [Mode; 4] = [
        Mode::Throughput,
        Mode::AverageTime,
        Mode::SampleTime,
        Mode::SingleShot,
    ];

    /// Short label used on the command line and in records
    pub fn short_label(self) -> &'static str {
        match self {
            Mode::Throughput => "thrpt",
            Mode::AverageTime => "avgt",
            Mode::SampleTime => "sample",
            Mode::SingleShot => "ss",
            Mode::All => "all",
        }
    }

    /// Unit a fresh record gets when none is configured
    pub fn default_time_unit(self) -> TimeUnit {
        match self {
            Mode::Throughput => TimeUnit::Seconds,
            Mode::SingleShot => TimeUnit::Microseconds,
            _ => TimeUnit::Nanoseconds,
        }
    }

    /// Expand `All` into the concrete modes; other modes map to themselves
    pub fn expand(self) -> Vec<Mode> {
        match self {
            Mode::All => Self::CONCRETE.to_vec(),
            other => vec![other],
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_label())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thrpt" | "throughput" => Ok(Mode::Throughput),
            "avgt" | "averagetime" | "average-time" => Ok(Mode::AverageTime),
            "sample" | "sampletime" | "sample-time" => Ok(Mode::SampleTime),
            "ss" | "singleshot" | "single-shot" => Ok(Mode::SingleShot),
            "all" => Ok(Mode::All),
            other => Err(format!("unknown benchmark mode: {other}")),
        }
    }
}

/// Unit scores are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    /// ns
    Nanoseconds,
    /// us
    Microseconds,
    /// ms
    Milliseconds,
    /// s
    Seconds,
    /// min
    Minutes,
}

impl TimeUnit {
    /// Suffix used in units and on the command line
    pub fn suffix(self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "ns",
            TimeUnit::Microseconds => "us",
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "min",
        }
    }

    /// Nanoseconds in one unit
    pub fn nanos(self) -> f64 {
        match self {
            TimeUnit::Nanoseconds => 1.0,
            TimeUnit::Microseconds => 1e3,
            TimeUnit::Milliseconds => 1e6,
            TimeUnit::Seconds => 1e9,
            TimeUnit::Minutes => 60e9,
        }
    }

    /// Express a duration in this unit
    pub fn convert(self, duration: Duration) -> f64 {
        duration.as_nanos() as f64 / self.nanos()
    }

    /// Score unit for a mode, e.g. `ns/op` or `ops/s`
    pub fn score_unit(self, mode: Mode) -> String {
        match mode {
            Mode::Throughput => format!("ops/{}", self.suffix()),
            _ => format!("{}/op", self.suffix()),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ns" => Ok(TimeUnit::Nanoseconds),
            "us" | "µs" => Ok(TimeUnit::Microseconds),
            "ms" => Ok(TimeUnit::Milliseconds),
            "s" => Ok(TimeUnit::Seconds),
            "m" | "min" => Ok(TimeUnit::Minutes),
            other => Err(format!("unknown time unit: {other}")),
        }
    }
}
