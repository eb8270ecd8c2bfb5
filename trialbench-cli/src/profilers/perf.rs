//! `perf` sampling profiler
//!
//! Records the whole system with `perf record -a` for the lifetime of the
//! worker, then keeps only the worker's samples and reports the hottest
//! symbols per event.

use super::ExternalProfiler;
use crate::config::{PerfConfig, parse_duration};
use crate::orchestrator::ForkResult;
use crate::profilers::events::PerfEvents;
use crate::supervisor::send_signal;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use trialbench_core::{Profiler, ProfilerError};
use trialbench_ipc::BenchmarkRecord;
use trialbench_stats::BenchResult;

/// How long `perf record` gets to write its data after SIGINT
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved `perf` settings
#[derive(Debug, Clone, PartialEq)]
pub struct PerfSettings {
    /// Events to sample
    pub events: Vec<String>,
    /// Leading part of the trial to ignore
    pub skip: Duration,
    /// Hottest symbols reported per event
    pub top: usize,
    /// perf binary
    pub binary: PathBuf,
}

impl TryFrom<&PerfConfig> for PerfSettings {
    type Error = crate::config::ConfigError;

    fn try_from(config: &PerfConfig) -> Result<Self, Self::Error> {
        if config.events.is_empty() {
            return Err(crate::config::ConfigError::Invalid {
                field: "profilers.perf.events",
                reason: "at least one event is required".to_string(),
            });
        }
        Ok(Self {
            events: config.events.clone(),
            skip: parse_duration(&config.skip)?,
            top: config.top,
            binary: PathBuf::from(&config.binary),
        })
    }
}

struct Recording {
    child: Child,
    dir: TempDir,
}

impl Recording {
    fn data(&self) -> PathBuf {
        self.dir.path().join("perf.data")
    }
}

/// System-wide `perf record` around each fork.
pub struct PerfProfiler {
    settings: PerfSettings,
    recording: Option<Recording>,
}

impl PerfProfiler {
    /// Selection name
    pub const NAME: &'static str = "perf";

    /// Profiler with the given settings
    pub fn new(settings: PerfSettings) -> Self {
        Self {
            settings,
            recording: None,
        }
    }

    fn stop(&self, recording: &mut Recording) -> Result<(), ProfilerError> {
        send_signal(recording.child.id(), libc::SIGINT)?;
        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            if recording.child.try_wait()?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let _ = recording.child.kill();
                let _ = recording.child.wait();
                return Err(ProfilerError::Failed(
                    "perf record did not stop after SIGINT".to_string(),
                ));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Convert the recording to text. Any failure yields `None`.
    fn script(&self, data: &Path, out: &Path) -> Option<PathBuf> {
        let target = out.join("perf.script");
        let file = std::fs::File::create(&target).ok()?;
        let status = Command::new(&self.settings.binary)
            .arg("script")
            .arg("-i")
            .arg(data)
            .args(["-F", "pid,time,event,ip,sym,dso"])
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => Some(target),
            Ok(status) => {
                tracing::debug!(%status, "perf script failed");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "perf script could not run");
                None
            }
        }
    }
}

impl Profiler for PerfProfiler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        super::EXTERNAL_PROFILERS[0].1
    }
}

impl ExternalProfiler for PerfProfiler {
    fn before_trial(&mut self, _record: &BenchmarkRecord) -> Result<(), ProfilerError> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("perf.data");
        let child = Command::new(&self.settings.binary)
            .arg("record")
            .arg("-a")
            .arg("-q")
            .arg("-e")
            .arg(self.settings.events.join(","))
            .arg("-o")
            .arg(&data)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                ProfilerError::Unavailable(format!(
                    "{}: {e}",
                    self.settings.binary.display()
                ))
            })?;
        tracing::debug!(pid = child.id(), "perf record started");
        self.recording = Some(Recording { child, dir });
        Ok(())
    }

    fn after_trial(
        &mut self,
        _fork: &ForkResult,
        pid: u32,
        _stdout: &Path,
        _stderr: &Path,
    ) -> Result<Vec<BenchResult>, ProfilerError> {
        let mut recording = self
            .recording
            .take()
            .ok_or_else(|| ProfilerError::Failed("perf record was not started".to_string()))?;
        self.stop(&mut recording)?;

        let events = match self
            .script(&recording.data(), recording.dir.path())
            .and_then(|path| std::fs::File::open(path).ok())
        {
            Some(file) => PerfEvents::parse(
                BufReader::new(file),
                pid,
                self.settings.skip,
                &self.settings.events,
            ),
            None => PerfEvents::default(),
        };
        Ok(events.results(self.settings.top))
    }
}

impl Drop for PerfProfiler {
    fn drop(&mut self) {
        if let Some(mut recording) = self.recording.take() {
            let _ = recording.child.kill();
            let _ = recording.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(binary: &str) -> PerfSettings {
        PerfSettings {
            events: vec!["cycles".to_string()],
            skip: Duration::ZERO,
            top: 5,
            binary: PathBuf::from(binary),
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config = PerfConfig {
            skip: "1500ms".to_string(),
            ..PerfConfig::default()
        };
        let settings = PerfSettings::try_from(&config).unwrap();
        assert_eq!(settings.skip, Duration::from_millis(1500));
        assert_eq!(settings.events, vec!["cycles"]);

        let empty = PerfConfig {
            events: Vec::new(),
            ..PerfConfig::default()
        };
        assert!(PerfSettings::try_from(&empty).is_err());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let mut profiler = PerfProfiler::new(settings("/nonexistent/perf"));
        let record = BenchmarkRecord::new("x", trialbench_stats::Mode::AverageTime);
        assert!(matches!(
            profiler.before_trial(&record),
            Err(ProfilerError::Unavailable(_))
        ));
    }

    #[test]
    fn test_after_without_before_fails() {
        let mut profiler = PerfProfiler::new(settings("perf"));
        let fork = ForkResult::default();
        let path = Path::new("/dev/null");
        assert!(profiler.after_trial(&fork, 1, path, path).is_err());
    }

    #[test]
    fn test_unreadable_recording_degrades_to_empty() {
        // `sleep` stands in for perf record; `perf script` then fails, so the
        // event set is empty rather than an error
        let mut profiler = PerfProfiler::new(settings("/bin/false"));
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        profiler.recording = Some(Recording {
            child,
            dir: tempfile::tempdir().unwrap(),
        });
        let fork = ForkResult::default();
        let path = Path::new("/dev/null");
        let results = profiler.after_trial(&fork, 1, path, path).unwrap();
        assert!(results.is_empty());
    }
}
