//! Configuration loading from trialbench.toml
//!
//! Run defaults can be kept in a `trialbench.toml` file in the project root.
//! The file is discovered by walking up from the current directory. Command
//! line flags override whatever the file says, and anything left unset falls
//! through to the worker's own defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use trialbench_ipc::BenchmarkRecord;
use trialbench_stats::TimeUnit;

/// File name looked up by [`TrialbenchConfig::discover`]
pub const CONFIG_FILE: &str = "trialbench.toml";

/// Errors raised while loading or applying configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Trialbench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TrialbenchConfig {
    /// Trial defaults
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Profiler selection and settings
    #[serde(default)]
    pub profilers: ProfilersConfig,
}

/// Per-trial settings. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunnerConfig {
    /// Measured forks per trial; 0 runs in-process
    #[serde(default)]
    pub forks: Option<u32>,
    /// Forks run before the measured ones, results discarded
    #[serde(default)]
    pub warmup_forks: Option<u32>,
    /// Warmup iterations per fork
    #[serde(default)]
    pub warmup_iterations: Option<u32>,
    /// Warmup iteration duration (e.g. "500ms")
    #[serde(default)]
    pub warmup_time: Option<String>,
    /// Invocations per warmup iteration; overrides `warmup_time`
    #[serde(default)]
    pub warmup_batch_size: Option<u64>,
    /// Measurement iterations per fork
    #[serde(default)]
    pub measurement_iterations: Option<u32>,
    /// Measurement iteration duration (e.g. "1s")
    #[serde(default)]
    pub measurement_time: Option<String>,
    /// Invocations per measurement iteration; overrides `measurement_time`
    #[serde(default)]
    pub measurement_batch_size: Option<u64>,
    /// Worker threads of the implicit group
    #[serde(default)]
    pub threads: Option<u32>,
    /// Liveness timeout on each channel read (e.g. "10m")
    #[serde(default)]
    pub timeout: Option<String>,
    /// Abort the run on the first failed trial
    #[serde(default)]
    pub fail_on_error: Option<bool>,
    /// Keep finished threads busy until every thread is done
    #[serde(default)]
    pub sync_iterations: Option<bool>,
    /// Ramp active threads up by one per iteration
    #[serde(default)]
    pub scale: Option<bool>,
    /// Output time unit: ns, us, ms, s or min
    #[serde(default)]
    pub time_unit: Option<String>,
    /// Trials run concurrently
    #[serde(default)]
    pub jobs: Option<usize>,
}

impl RunnerConfig {
    /// Overlay: fields set in `other` win.
    pub fn merged(&self, other: &RunnerConfig) -> RunnerConfig {
        RunnerConfig {
            forks: other.forks.or(self.forks),
            warmup_forks: other.warmup_forks.or(self.warmup_forks),
            warmup_iterations: other.warmup_iterations.or(self.warmup_iterations),
            warmup_time: other.warmup_time.clone().or_else(|| self.warmup_time.clone()),
            warmup_batch_size: other.warmup_batch_size.or(self.warmup_batch_size),
            measurement_iterations: other.measurement_iterations.or(self.measurement_iterations),
            measurement_time: other
                .measurement_time
                .clone()
                .or_else(|| self.measurement_time.clone()),
            measurement_batch_size: other.measurement_batch_size.or(self.measurement_batch_size),
            threads: other.threads.or(self.threads),
            timeout: other.timeout.clone().or_else(|| self.timeout.clone()),
            fail_on_error: other.fail_on_error.or(self.fail_on_error),
            sync_iterations: other.sync_iterations.or(self.sync_iterations),
            scale: other.scale.or(self.scale),
            time_unit: other.time_unit.clone().or_else(|| self.time_unit.clone()),
            jobs: other.jobs.or(self.jobs),
        }
    }

    /// Write the configured values into a record, leaving the others alone
    pub fn apply(&self, record: &mut BenchmarkRecord) -> Result<(), ConfigError> {
        let duration = |value: &Option<String>| -> Result<Option<Duration>, ConfigError> {
            value.as_deref().map(parse_duration).transpose()
        };

        if let Some(forks) = self.forks {
            record.forks = Some(forks);
        }
        if let Some(forks) = self.warmup_forks {
            record.warmup_forks = Some(forks);
        }
        if let Some(count) = self.warmup_iterations {
            record.warmup_iterations = Some(count);
        }
        if let Some(time) = duration(&self.warmup_time)? {
            record.warmup_time = Some(time);
        }
        if let Some(size) = self.warmup_batch_size {
            record.warmup_batch_size = Some(size);
        }
        if let Some(count) = self.measurement_iterations {
            record.measurement_iterations = Some(count);
        }
        if let Some(time) = duration(&self.measurement_time)? {
            record.measurement_time = Some(time);
        }
        if let Some(size) = self.measurement_batch_size {
            record.measurement_batch_size = Some(size);
        }
        if let Some(threads) = self.threads {
            record.threads = Some(threads);
        }
        if let Some(timeout) = duration(&self.timeout)? {
            record.timeout = Some(timeout);
        }
        if let Some(flag) = self.fail_on_error {
            record.fail_on_error = Some(flag);
        }
        if let Some(flag) = self.sync_iterations {
            record.sync_iterations = Some(flag);
        }
        if let Some(flag) = self.scale {
            record.scale = Some(flag);
        }
        if let Some(unit) = &self.time_unit {
            let unit: TimeUnit = unit.parse().map_err(|reason| ConfigError::Invalid {
                field: "time_unit",
                reason,
            })?;
            record.time_unit = Some(unit);
        }
        Ok(())
    }
}

/// Profiler selection
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProfilersConfig {
    /// Profilers attached to every trial, in attachment order
    #[serde(default)]
    pub enabled: Vec<String>,
    /// `perf` settings
    #[serde(default)]
    pub perf: PerfConfig,
}

/// Settings of the `perf` profiler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerfConfig {
    /// Events to sample
    #[serde(default = "default_perf_events")]
    pub events: Vec<String>,
    /// Samples earlier than this after the first one are ignored (e.g. "2s")
    #[serde(default = "default_perf_skip")]
    pub skip: String,
    /// Hottest symbols reported per event
    #[serde(default = "default_perf_top")]
    pub top: usize,
    /// perf binary
    #[serde(default = "default_perf_binary")]
    pub binary: String,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            events: default_perf_events(),
            skip: default_perf_skip(),
            top: default_perf_top(),
            binary: default_perf_binary(),
        }
    }
}

fn default_perf_events() -> Vec<String> {
    vec!["cycles".to_string()]
}
fn default_perf_skip() -> String {
    "0s".to_string()
}
fn default_perf_top() -> usize {
    20
}
fn default_perf_binary() -> String {
    "perf".to_string()
}

impl TrialbenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Find `trialbench.toml` walking up from `start`
    pub fn find(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Discover and load configuration from the current directory upwards.
    ///
    /// No file means defaults; a file that does not parse is an error.
    pub fn discover() -> Result<Self, ConfigError> {
        let Ok(cwd) = std::env::current_dir() else {
            return Ok(Self::default());
        };
        match Self::find(&cwd) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading configuration");
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# Trialbench Configuration

[runner]
# Measured forks per trial (0 runs in the controller process)
forks = 1
# Forks run first and discarded
warmup_forks = 0
# Warmup iterations and their length
warmup_iterations = 5
warmup_time = "1s"
# Measurement iterations and their length
measurement_iterations = 5
measurement_time = "1s"
# Fixed invocation counts instead of time (uncomment to enable)
# warmup_batch_size = 1000
# measurement_batch_size = 1000
# Threads of the implicit group
threads = 1
# Maximum silence from a worker before it is killed
timeout = "10m"
# Stop the run on the first failed trial
fail_on_error = true
# Keep finished threads busy until all threads are done
sync_iterations = true
# Start every group with one thread and add one per iteration
scale = false
# Output time unit (uncomment to override the mode's default)
# time_unit = "ns"
# Trials run concurrently
jobs = 1

[profilers]
# Attached to every trial in this order, e.g. ["rusage", "perf"]
enabled = []

[profilers.perf]
events = ["cycles"]
# Ignore samples recorded during the first part of the trial
skip = "0s"
# Hottest symbols reported per event
top = 20
binary = "perf"
"#
        .to_string()
    }
}

/// Parse a duration string ("3s", "500ms", "1.5s", "2m", "100us").
///
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Duration(s.to_string()));
    }

    let (number, unit) = trimmed
        .char_indices()
        .find(|(_, c)| c.is_alphabetic() || *c == 'µ')
        .map(|(i, _)| trimmed.split_at(i))
        .unwrap_or((trimmed, "s"));

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| ConfigError::Duration(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Duration(s.to_string()));
    }

    let nanos_per_unit: f64 = match unit.to_lowercase().as_str() {
        "ns" => 1.0,
        "us" | "µs" => 1e3,
        "ms" => 1e6,
        "s" | "" => 1e9,
        "m" | "min" => 60e9,
        "h" => 3600e9,
        _ => return Err(ConfigError::Duration(s.to_string())),
    };

    Ok(Duration::from_nanos((value * nanos_per_unit) as u64))
}
