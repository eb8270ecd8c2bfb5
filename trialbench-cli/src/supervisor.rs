//! Supervisor Process
//!
//! Owns one worker process for the duration of a fork.
//!
//! The worker gets two pipes as fds 3 (commands in) and 4 (responses out);
//! its stdout and stderr go to temporary files that external profilers
//! inspect after the trial. Every read on the response pipe is bounded by
//! the trial's liveness timeout.

use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;
use trialbench_ipc::{
    BenchmarkRecord, Frame, FrameError, FrameReader, FrameWriter, IPC_FD_ENV, PROFILERS_ENV,
    PROTOCOL_VERSION, SupervisorCommand, WorkerHello, WorkerMessage,
};

/// Poll slice between liveness checks
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Grace period for a worker to flush after SIGTERM
const TERM_DRAIN: Duration = Duration::from_millis(500);

/// Failures of the worker process or its channel, as opposed to failures of
/// the benchmarked code.
#[derive(Debug, Error)]
pub enum ProcessFailure {
    #[error("failed to launch worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up worker channel: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("failed to capture worker output: {0}")]
    Output(#[source] std::io::Error),

    #[error("empty worker command line")]
    EmptyCommand,

    #[error("worker channel error: {0}")]
    Frame(#[from] FrameError),

    #[error("worker exited unexpectedly ({status})")]
    Exited { status: String },

    #[error("worker closed the channel")]
    ChannelClosed,

    #[error("channel desync: expected {expected}, got {got}")]
    Desync { expected: &'static str, got: String },

    #[error("worker speaks protocol version {got}, expected {expected}")]
    Protocol { expected: u32, got: u32 },

    #[error("no response from worker within {0:?}")]
    Timeout(Duration),
}

/// Result of polling for data
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(std::io::Error),
}

/// Wait for data to be available on a file descriptor with timeout
fn wait_for_data(fd: RawFd, timeout: Duration) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    // SAFETY: one valid pollfd, count 1.
    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            PollResult::Timeout
        } else {
            PollResult::Error(err)
        }
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // data first: a closing pipe may still hold the last lines
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

/// Create a pipe pair with close-on-exec set, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    for &fd in &fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Send a signal to a process. Returns `Err` if it could not be delivered.
pub(crate) fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Command line and environment of a worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Internal profilers the worker attaches
    pub profilers: Vec<String>,
    /// Liveness timeout for every response
    pub timeout: Duration,
}

/// Captured stdout and stderr of a worker.
#[derive(Debug)]
pub struct CapturedOutput {
    stdout: NamedTempFile,
    stderr: NamedTempFile,
}

impl CapturedOutput {
    fn new() -> Result<Self, ProcessFailure> {
        Ok(Self {
            stdout: NamedTempFile::new().map_err(ProcessFailure::Output)?,
            stderr: NamedTempFile::new().map_err(ProcessFailure::Output)?,
        })
    }

    /// File holding the worker's stdout
    pub fn stdout(&self) -> &Path {
        self.stdout.path()
    }

    /// File holding the worker's stderr
    pub fn stderr(&self) -> &Path {
        self.stderr.path()
    }
}

/// Worker process handle
pub struct WorkerHandle {
    child: Child,
    reader: FrameReader<std::fs::File>,
    // None once the command pipe is closed
    writer: Option<FrameWriter<std::fs::File>>,
    hello: Option<WorkerHello>,
    timeout: Duration,
    msg_read_fd: RawFd,
    output: Option<CapturedOutput>,
}

impl WorkerHandle {
    /// Launch a worker, send it `record` and wait for its handshake.
    ///
    /// Log lines the worker prints before the handshake go to `on_log`.
    pub fn spawn(
        spec: &LaunchSpec,
        record: &BenchmarkRecord,
        on_log: &mut dyn FnMut(&str),
    ) -> Result<Self, ProcessFailure> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or(ProcessFailure::EmptyCommand)?;
        let output = CapturedOutput::new()?;
        let stdout = output.stdout.reopen().map_err(ProcessFailure::Output)?;
        let stderr = output.stderr.reopen().map_err(ProcessFailure::Output)?;

        // cmd pipe: controller writes, worker reads fd 3
        let (cmd_read, cmd_write) = create_pipe().map_err(ProcessFailure::Pipe)?;
        // msg pipe: worker writes fd 4, controller reads
        let (msg_read, msg_write) = match create_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                return Err(ProcessFailure::Pipe(e));
            }
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env(IPC_FD_ENV, "3,4")
            .env(PROFILERS_ENV, spec.profilers.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // In the child: move both ends above the target slots first, since
        // either may currently sit on fd 3 or 4, then dup2 into place. dup2
        // clears close-on-exec on the copies.
        unsafe {
            command.pre_exec(move || {
                let read_high = libc::fcntl(cmd_read, libc::F_DUPFD, 10);
                let write_high = libc::fcntl(msg_write, libc::F_DUPFD, 10);
                if read_high < 0 || write_high < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(read_high, 3) < 0 || libc::dup2(write_high, 4) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(read_high);
                libc::close(write_high);
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(source) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                close_fd(msg_read);
                close_fd(msg_write);
                return Err(ProcessFailure::Spawn {
                    program: program.clone(),
                    source,
                });
            }
        };

        // Close the child-side ends in the parent
        close_fd(cmd_read);
        close_fd(msg_write);

        let writer_file = unsafe { std::fs::File::from_raw_fd(cmd_write) };
        let reader_file = unsafe { std::fs::File::from_raw_fd(msg_read) };

        let mut handle = Self {
            child,
            reader: FrameReader::new(reader_file),
            writer: Some(FrameWriter::new(writer_file)),
            hello: None,
            timeout: spec.timeout,
            msg_read_fd: msg_read,
            output: Some(output),
        };
        tracing::debug!(pid = handle.child.id(), %program, "worker launched");

        handle.send_line(&record.encode())?;
        handle.wait_for_hello(on_log)?;
        Ok(handle)
    }

    /// Wait for Hello message from worker and validate protocol version
    fn wait_for_hello(&mut self, on_log: &mut dyn FnMut(&str)) -> Result<(), ProcessFailure> {
        match self.next_message(on_log)? {
            WorkerMessage::Hello(hello) => {
                if hello.protocol_version != PROTOCOL_VERSION {
                    return Err(ProcessFailure::Protocol {
                        expected: PROTOCOL_VERSION,
                        got: hello.protocol_version,
                    });
                }
                self.hello = Some(hello);
                Ok(())
            }
            other => Err(ProcessFailure::Desync {
                expected: "Hello",
                got: describe(&other),
            }),
        }
    }

    /// Process id of the worker itself, as reported in its handshake.
    ///
    /// Differs from the child pid when the worker runs under a launch prefix.
    pub fn worker_pid(&self) -> u32 {
        self.hello
            .as_ref()
            .map(|h| h.pid)
            .unwrap_or_else(|| self.child.id())
    }

    /// Send one command
    pub fn send(&mut self, command: SupervisorCommand) -> Result<(), ProcessFailure> {
        self.send_line(command.as_line())
    }

    fn send_line(&mut self, line: &str) -> Result<(), ProcessFailure> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(ProcessFailure::ChannelClosed);
        };
        match writer.write_line(line) {
            Ok(()) => Ok(()),
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(self.exit_failure())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Next protocol message; log lines in between go to `on_log`
    pub fn next_message(
        &mut self,
        on_log: &mut dyn FnMut(&str),
    ) -> Result<WorkerMessage, ProcessFailure> {
        loop {
            match self.recv()? {
                Frame::Message(message) => return Ok(message),
                Frame::Log(line) => on_log(&line),
            }
        }
    }

    /// Next line from the worker, bounded by the liveness timeout
    pub fn recv(&mut self) -> Result<Frame<WorkerMessage>, ProcessFailure> {
        let start = Instant::now();

        loop {
            if self.reader.has_buffered_line() {
                break;
            }

            let remaining = self.timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                // Graceful timeout: SIGTERM → drain → SIGKILL
                return Err(self.handle_timeout());
            }

            match wait_for_data(self.msg_read_fd, remaining.min(POLL_SLICE)) {
                PollResult::DataAvailable => break,
                PollResult::Timeout => {
                    if !self.is_alive() {
                        // the pipe may outlive the worker when a launch
                        // prefix keeps it open
                        if let PollResult::DataAvailable =
                            wait_for_data(self.msg_read_fd, Duration::ZERO)
                        {
                            break;
                        }
                        return Err(self.exit_failure());
                    }
                }
                PollResult::PipeClosed => return Err(self.exit_failure()),
                PollResult::Error(e) => return Err(ProcessFailure::Pipe(e)),
            }
        }

        match self.reader.read::<WorkerMessage>() {
            Ok(frame) => Ok(frame),
            Err(FrameError::EndOfStream) => Err(self.exit_failure()),
            Err(e) => Err(e.into()),
        }
    }

    /// Failure describing why the channel ended
    fn exit_failure(&mut self) -> ProcessFailure {
        match self.wait_exit(TERM_DRAIN) {
            Some(status) if !status.success() => ProcessFailure::Exited {
                status: status.to_string(),
            },
            _ => ProcessFailure::ChannelClosed,
        }
    }

    /// Handle timeout: send SIGTERM, drain for a moment, then SIGKILL.
    fn handle_timeout(&mut self) -> ProcessFailure {
        tracing::warn!(pid = self.child.id(), timeout = ?self.timeout, "worker timed out");
        let _ = send_signal(self.child.id(), libc::SIGTERM);

        let drain_deadline = Instant::now() + TERM_DRAIN;
        loop {
            let remaining = drain_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match wait_for_data(self.msg_read_fd, remaining) {
                PollResult::DataAvailable => {
                    if self.reader.read::<WorkerMessage>().is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }

        if self.is_alive() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        ProcessFailure::Timeout(self.timeout)
    }

    /// Wait for the worker to exit after a completed session and hand back
    /// its captured output.
    pub fn finish(mut self) -> Result<CapturedOutput, ProcessFailure> {
        let status = match self.wait_exit(self.timeout) {
            Some(status) => status,
            None => return Err(self.handle_timeout()),
        };
        if !status.success() {
            return Err(ProcessFailure::Exited {
                status: status.to_string(),
            });
        }
        self.output.take().ok_or(ProcessFailure::ChannelClosed)
    }

    /// Reap the worker after it reported a failure. Its exit status carries
    /// no further information.
    ///
    /// Closes the command pipe first, so a worker blocked on its next
    /// command sees end of stream. One that lingers past the drain window is
    /// terminated.
    pub fn reap(mut self) -> Option<CapturedOutput> {
        self.writer = None;
        if self.wait_exit(TERM_DRAIN).is_none() {
            self.handle_timeout();
        }
        self.output.take()
    }

    fn wait_exit(&mut self, limit: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + limit;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                _ => return None,
            }
        }
    }

    /// Check if worker process is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the worker process forcefully
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            // Graceful: SIGTERM first, brief wait, then SIGKILL
            let _ = send_signal(self.child.id(), libc::SIGTERM);
            std::thread::sleep(Duration::from_millis(50));
            if self.is_alive() {
                let _ = self.child.kill();
            }
            let _ = self.child.wait();
        }
    }
}

/// Short description of an unexpected message
pub(crate) fn describe(message: &WorkerMessage) -> String {
    match message {
        WorkerMessage::Hello(h) => format!("Hello({})", h.task),
        WorkerMessage::Iteration(r) => format!("Iteration({} {})", r.phase, r.index),
        WorkerMessage::Failure(f) => format!("Failure({f})"),
        WorkerMessage::Complete { iterations } => format!("Complete({iterations})"),
    }
}

/// Path of the binary workers are launched from
pub fn current_binary() -> Result<PathBuf, ProcessFailure> {
    std::env::current_exe().map_err(|source| ProcessFailure::Spawn {
        program: "current executable".to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialbench_stats::Mode;

    fn sh(script: &str, timeout: Duration) -> LaunchSpec {
        LaunchSpec {
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            profilers: Vec::new(),
            timeout,
        }
    }

    fn record() -> BenchmarkRecord {
        BenchmarkRecord::new("scripted", Mode::AverageTime)
    }

    const HELLO: &str = r#"echo "@@trialbench {\"Hello\":{\"protocol_version\":1,\"pid\":$$,\"task\":\"scripted\"}}" >&4"#;

    #[test]
    fn test_nonzero_exit_is_process_failure() {
        let spec = sh("read rec <&3; exit 3", Duration::from_secs(10));
        let err = WorkerHandle::spawn(&spec, &record(), &mut |_| {}).err().unwrap();
        match err {
            ProcessFailure::Exited { status } => assert!(status.contains('3'), "{status}"),
            other => panic!("unexpected failure: {other}"),
        }
    }

    #[test]
    fn test_silent_worker_times_out() {
        let spec = sh("read rec <&3; sleep 30", Duration::from_millis(300));
        let start = Instant::now();
        let err = WorkerHandle::spawn(&spec, &record(), &mut |_| {}).err().unwrap();
        assert!(matches!(err, ProcessFailure::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_handshake_and_log_forwarding() {
        let script = format!(
            "read rec <&3; echo \"got $rec\" >&4; {HELLO}; read cmd <&3; echo \"cmd $cmd\" >&4; \
             echo '@@trialbench {{\"Complete\":{{\"iterations\":0}}}}' >&4"
        );
        let spec = sh(&script, Duration::from_secs(10));
        let mut logs = Vec::new();
        let mut handle =
            WorkerHandle::spawn(&spec, &record(), &mut |l| logs.push(l.to_string())).unwrap();
        assert!(logs[0].starts_with("got scripted"));
        assert_eq!(handle.worker_pid(), handle.child.id());

        handle.send(SupervisorCommand::Terminate).unwrap();
        let msg = handle.next_message(&mut |l| logs.push(l.to_string())).unwrap();
        assert_eq!(msg, WorkerMessage::Complete { iterations: 0 });
        assert_eq!(logs[1], "cmd terminate");
        assert!(handle.finish().is_ok());
    }

    #[test]
    fn test_protocol_mismatch() {
        let script = r#"read rec <&3; echo '@@trialbench {"Hello":{"protocol_version":99,"pid":1,"task":"x"}}' >&4; sleep 5"#;
        let spec = sh(script, Duration::from_secs(10));
        let err = WorkerHandle::spawn(&spec, &record(), &mut |_| {}).err().unwrap();
        assert!(matches!(err, ProcessFailure::Protocol { got: 99, .. }));
    }

    #[test]
    fn test_missing_program() {
        let spec = LaunchSpec {
            command: vec!["/nonexistent/trialbench-worker".into()],
            profilers: Vec::new(),
            timeout: Duration::from_secs(1),
        };
        let err = WorkerHandle::spawn(&spec, &record(), &mut |_| {}).err().unwrap();
        assert!(matches!(err, ProcessFailure::Spawn { .. }));
    }

    #[test]
    fn test_reap_does_not_wait_for_timeout() {
        // Reports a failure, then keeps reading commands until the pipe closes
        let script = format!(
            "read rec <&3; {HELLO}; \
             echo '@@trialbench {{\"Failure\":{{\"task\":\"scripted\",\"site\":\"Invocation\",\"thread\":null,\"message\":\"boom\"}}}}' >&4; \
             while read cmd <&3; do :; done"
        );
        let spec = sh(&script, Duration::from_secs(60));
        let mut handle = WorkerHandle::spawn(&spec, &record(), &mut |_| {}).unwrap();
        let msg = handle.next_message(&mut |_| {}).unwrap();
        assert!(matches!(msg, WorkerMessage::Failure(_)));

        let start = Instant::now();
        assert!(handle.reap().is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_reap_terminates_lingering_worker() {
        let script = format!("read rec <&3; {HELLO}; exec sleep 60");
        let spec = sh(&script, Duration::from_secs(60));
        let handle = WorkerHandle::spawn(&spec, &record(), &mut |_| {}).unwrap();

        let start = Instant::now();
        assert!(handle.reap().is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_output_is_captured() {
        let script = format!("read rec <&3; echo to-stdout; echo to-stderr >&2; {HELLO}; exit 0");
        let spec = sh(&script, Duration::from_secs(10));
        let handle = WorkerHandle::spawn(&spec, &record(), &mut |_| {}).unwrap();
        let output = handle.finish().unwrap();
        assert_eq!(std::fs::read_to_string(output.stdout()).unwrap(), "to-stdout\n");
        assert_eq!(std::fs::read_to_string(output.stderr()).unwrap(), "to-stderr\n");
    }
}
