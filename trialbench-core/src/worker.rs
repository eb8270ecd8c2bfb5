//! Worker Process Entry Point
//!
//! Handles the worker side of the controller/worker architecture.
//!
//! On Unix the channel is the fd pair named by `TRIALBENCH_IPC_FD`
//! (normally `3,4`), leaving stdout and stderr to the benchmark. Without it
//! the worker falls back to stdin/stdout.
//!
//! Session:
//!
//! 1. read one encoded [`BenchmarkRecord`] line
//! 2. answer `Hello`, resolve the task, run trial setup
//! 3. answer every `iterate` with one `Iteration` frame
//! 4. on `terminate`, run trial teardown and answer `Complete`
//!
//! A failure at any step is reported once as `Failure`, after which the
//! worker exits.

use crate::controller::TrialDriver;
use crate::error::WorkerError;
use crate::registry::TaskRegistry;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use trialbench_ipc::{
    BenchmarkRecord, FailureReport, FailureSite, FrameReader, FrameWriter, IPC_FD_ENV,
    IterationReport, PROFILERS_ENV, SupervisorCommand, WorkerHello, WorkerMessage,
};
use trialbench_stats::format_number;

#[cfg(unix)]
use std::os::unix::io::FromRawFd;

/// Global flag set by SIGTERM handler to request graceful shutdown.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check if a graceful shutdown has been requested via SIGTERM.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Install a SIGTERM handler that sets the `SHUTDOWN_REQUESTED` flag.
/// The handler is async-signal-safe (only sets an atomic).
#[cfg(unix)]
fn install_sigterm_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigterm_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(not(unix))]
fn install_sigterm_handler() {}

/// IPC transport: either inherited fd pair or stdin/stdout fallback.
enum IpcTransport {
    #[cfg(unix)]
    Fds { read_fd: i32, write_fd: i32 },
    Stdio,
}

fn detect_transport() -> Result<IpcTransport, WorkerError> {
    let Ok(value) = std::env::var(IPC_FD_ENV) else {
        return Ok(IpcTransport::Stdio);
    };
    #[cfg(unix)]
    if let Some((r, w)) = value.split_once(',') {
        if let (Ok(read_fd), Ok(write_fd)) = (r.trim().parse(), w.trim().parse()) {
            return Ok(IpcTransport::Fds { read_fd, write_fd });
        }
    }
    Err(WorkerError::Transport(value))
}

/// Internal profiler names requested by the controller
fn requested_profilers() -> Vec<String> {
    std::env::var(PROFILERS_ENV)
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Worker main loop
pub struct WorkerMain {
    reader: FrameReader<Box<dyn Read>>,
    writer: FrameWriter<Box<dyn Write>>,
    profilers: Vec<String>,
}

impl WorkerMain {
    /// Worker on the channel named by the environment
    pub fn from_env() -> Result<Self, WorkerError> {
        let (reader, writer): (Box<dyn Read>, Box<dyn Write>) = match detect_transport()? {
            #[cfg(unix)]
            IpcTransport::Fds { read_fd, write_fd } => {
                // SAFETY: the controller passes these descriptors to this
                // process only; nothing else owns them.
                let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
                let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
                (Box::new(read_file), Box::new(write_file))
            }
            IpcTransport::Stdio => (Box::new(std::io::stdin()), Box::new(std::io::stdout())),
        };
        Ok(Self::new(reader, writer, requested_profilers()))
    }

    /// Worker on an explicit channel
    pub fn new(reader: Box<dyn Read>, writer: Box<dyn Write>, profilers: Vec<String>) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            profilers,
        }
    }

    /// Serve one trial
    pub fn run(&mut self, registry: &TaskRegistry) -> Result<(), WorkerError> {
        install_sigterm_handler();

        let line = self.reader.read_line()?;
        let record = BenchmarkRecord::decode(&line)?;
        self.writer
            .write(&WorkerMessage::Hello(WorkerHello::new(record.name.as_str())))?;

        let prepared = match registry.get(&record.name) {
            Some(def) => def.prepare(&record, &self.profilers),
            None => Err(FailureReport {
                task: record.name.clone(),
                site: FailureSite::Configuration,
                thread: None,
                message: format!("unknown benchmark task: {}", record.name),
            }),
        };
        let mut driver = match prepared.and_then(|mut d| d.setup_trial().map(|()| d)) {
            Ok(driver) => driver,
            Err(report) => return self.report_failure(report),
        };

        loop {
            if shutdown_requested() {
                return Err(WorkerError::Protocol("terminated by signal".to_string()));
            }
            let line = self.reader.read_line()?;
            let command: SupervisorCommand = line.parse().map_err(WorkerError::Protocol)?;
            match command {
                SupervisorCommand::Iterate => match driver.next_iteration() {
                    Ok(report) => {
                        self.writer.write_line(&progress_line(&*driver, &report))?;
                        self.writer.write(&WorkerMessage::Iteration(report))?;
                    }
                    Err(report) => return self.report_failure(report),
                },
                SupervisorCommand::Terminate => {
                    return match driver.teardown_trial() {
                        Ok(iterations) => {
                            self.writer.write(&WorkerMessage::Complete { iterations })?;
                            Ok(())
                        }
                        Err(report) => self.report_failure(report),
                    };
                }
            }
        }
    }

    fn report_failure(&mut self, report: FailureReport) -> Result<(), WorkerError> {
        tracing::debug!(%report, "reporting failure");
        self.writer.write(&WorkerMessage::Failure(report))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Human-readable line echoed by the controller, e.g.
/// `# Measurement iteration 3: 12.3456 ns/op`
fn progress_line(driver: &dyn TrialDriver, report: &IterationReport) -> String {
    let phase = match report.phase {
        trialbench_ipc::Phase::Warmup => "Warmup",
        trialbench_ipc::Phase::Measurement => "Measurement",
    };
    let score = match &report.result.primary {
        Some(primary) => format!("{} {}", format_number(primary.score()), primary.unit()),
        None => "no samples".to_string(),
    };
    format!(
        "# {} {phase} iteration {}: {score}",
        driver.params().task,
        report.index + 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::{BenchmarkTask, Bindings, GroupInfo, Outcome, State, ThreadInfo};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use trialbench_ipc::{Frame, Phase};
    use trialbench_stats::Mode;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Answer;

    impl BenchmarkTask for Answer {
        const ID: &'static str = "answer";
        type Shared = ();
        type Group = ();
        type Thread = ();

        fn create(bindings: &Bindings) -> Result<Self, TaskError> {
            if bindings.get("broken").is_some() {
                return Err(TaskError::msg("broken on purpose"));
            }
            Ok(Answer)
        }
        fn shared_state(&self) -> Result<(), TaskError> {
            Ok(())
        }
        fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
            Ok(())
        }
        fn thread_state(&self, _: &ThreadInfo) -> Result<(), TaskError> {
            Ok(())
        }
        fn invoke(&self, _: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
            Ok(Outcome::Reported(42.0))
        }
    }

    fn session(record: &BenchmarkRecord, commands: &[&str]) -> Vec<Frame<WorkerMessage>> {
        let mut input = record.encode();
        input.push('\n');
        for command in commands {
            input.push_str(command);
            input.push('\n');
        }
        let output = SharedBuf::default();
        let mut worker = WorkerMain::new(
            Box::new(Cursor::new(input.into_bytes())),
            Box::new(output.clone()),
            Vec::new(),
        );
        let registry = TaskRegistry::new().with::<Answer>();
        worker.run(&registry).unwrap();
        drop(worker);

        let bytes = output.0.lock().unwrap().clone();
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let mut frames = Vec::new();
        while let Ok(frame) = reader.read::<WorkerMessage>() {
            frames.push(frame);
        }
        frames
    }

    fn messages(frames: &[Frame<WorkerMessage>]) -> Vec<&WorkerMessage> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Message(m) => Some(m),
                Frame::Log(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_full_session() {
        let mut record = BenchmarkRecord::new("answer", Mode::AverageTime);
        record.warmup_iterations = Some(1);
        record.warmup_batch_size = Some(1);
        record.measurement_iterations = Some(2);
        record.measurement_batch_size = Some(3);
        let frames = session(&record, &["iterate", "iterate", "iterate", "terminate"]);
        let msgs = messages(&frames);

        assert!(matches!(msgs[0], WorkerMessage::Hello(h) if h.task == "answer"));
        let iterations: Vec<&IterationReport> = msgs
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Iteration(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[0].phase, Phase::Warmup);
        assert_eq!(iterations[2].result.primary.as_ref().unwrap().sample_count(), 3);
        assert!(matches!(
            msgs.last(),
            Some(WorkerMessage::Complete { iterations: 3 })
        ));
        assert!(frames.iter().any(|f| matches!(f, Frame::Log(l) if l.contains("Measurement iteration 2"))));
    }

    #[test]
    fn test_unknown_task_reports_configuration_failure() {
        let record = BenchmarkRecord::new("missing", Mode::AverageTime);
        let frames = session(&record, &[]);
        let msgs = messages(&frames);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(
            msgs[1],
            WorkerMessage::Failure(FailureReport { site: FailureSite::Configuration, .. })
        ));
    }

    #[test]
    fn test_create_failure_reported() {
        let record = BenchmarkRecord::new("answer", Mode::AverageTime).with_binding("broken", "1");
        let frames = session(&record, &["iterate"]);
        let msgs = messages(&frames);
        assert!(matches!(
            msgs.last(),
            Some(WorkerMessage::Failure(f)) if f.message.contains("broken on purpose")
        ));
    }
}
