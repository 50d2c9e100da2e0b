//! Lifetime of one test tool process
//!
//! A [`ProcessSession`] owns the child handle and its output pipe. Every path
//! out of the running state goes through [`ProcessSession::terminate`] or
//! [`ProcessSession::finish`], both of which reap the child, and dropping the
//! session terminates whatever is still running.

use std::fmt;
use std::io::{self, PipeReader, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CommandSpec, ReadError, SpawnError};

/// Default number of bytes pulled out of the pipe per read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Default wait between SIGTERM and SIGKILL
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_millis(500);

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Identifies one run of the test tool in logs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    /// The child exited on its own
    Exited(ExitStatus),
    /// The child was stopped on request
    Stopped,
    /// The exit status could not be collected
    Unknown,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        matches!(self, ExitInfo::Exited(status) if status.success())
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitInfo::Exited(status) => status.code(),
            ExitInfo::Stopped | ExitInfo::Unknown => None,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitInfo::Exited(status) => match (status.code(), status.signal()) {
                (Some(code), _) => write!(f, "exited with code {}", code),
                (None, Some(signal)) => write!(f, "killed by signal {}", signal),
                (None, None) => write!(f, "exited"),
            },
            ExitInfo::Stopped => write!(f, "stopped"),
            ExitInfo::Unknown => write!(f, "exit status unknown"),
        }
    }
}

/// A live child and its non-blocking output pipe
#[derive(Debug)]
pub struct RunningChild {
    id: SessionId,
    child: Child,
    output: PipeReader,
    started_at: Instant,
}

impl RunningChild {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug)]
pub enum SessionState {
    NotStarted,
    Running(RunningChild),
    Terminated(ExitInfo),
}

/// Owns the test tool process across start/read/terminate
#[derive(Debug)]
pub struct ProcessSession {
    spec: CommandSpec,
    state: SessionState,
    scratch: Vec<u8>,
    terminate_grace: Duration,
}

impl ProcessSession {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            state: SessionState::NotStarted,
            scratch: vec![0; DEFAULT_READ_CHUNK_SIZE],
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.scratch = vec![0; size.max(1)];
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Running(_))
    }

    /// Id of the running session
    pub fn session_id(&self) -> Option<&SessionId> {
        match &self.state {
            SessionState::Running(running) => Some(running.id()),
            _ => None,
        }
    }

    /// Outcome of the last session, once terminated
    pub fn exit_info(&self) -> Option<&ExitInfo> {
        match &self.state {
            SessionState::Terminated(info) => Some(info),
            _ => None,
        }
    }

    /// Spawn the test tool. A session that is still running is terminated first.
    ///
    /// Fails with [`SpawnError::Spawn`] when the program is missing or not
    /// executable.
    pub fn start(&mut self) -> Result<(), SpawnError> {
        if self.is_running() {
            info!("Restarting: terminating the running session first");
            self.terminate();
        }

        let (mut command, output) = self.spec.to_command()?;
        let spawned = command.spawn();
        // release our copy of the write end
        drop(command);
        let mut child = spawned.map_err(|source| SpawnError::Spawn {
            command: self.spec.command.clone(),
            source,
        })?;

        if let Err(err) = set_nonblocking(&output) {
            discard_child(&mut child);
            return Err(SpawnError::NonBlocking(err));
        }

        let running = RunningChild {
            id: SessionId::new(),
            child,
            output,
            started_at: Instant::now(),
        };
        info!(
            "Session {} started (pid {}): {}",
            running.id,
            running.pid(),
            self.spec.command
        );
        self.state = SessionState::Running(running);
        Ok(())
    }

    /// Read whatever output is available right now.
    ///
    /// Returns an empty chunk when the pipe is empty; never blocks.
    pub fn try_read_chunk(&mut self) -> Result<Vec<u8>, ReadError> {
        let SessionState::Running(running) = &mut self.state else {
            return Err(ReadError::NotRunning);
        };
        loop {
            match running.output.read(&mut self.scratch) {
                Ok(0) => return Err(ReadError::Closed),
                Ok(n) => return Ok(self.scratch[..n].to_vec()),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Vec::new()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ReadError::Io(err)),
            }
        }
    }

    /// True while the child has not exited
    pub fn is_alive(&mut self) -> bool {
        match &mut self.state {
            SessionState::Running(running) => matches!(running.child.try_wait(), Ok(None)),
            _ => false,
        }
    }

    /// Stop the child (SIGTERM, then SIGKILL after the grace period) and reap it.
    ///
    /// No-op unless a session is running. Blocks the caller for at most the
    /// grace period plus the final reap.
    pub fn terminate(&mut self) {
        if let Some(running) = self.take_running() {
            let id = running.id.clone();
            let elapsed = running.elapsed();
            let info = stop_child(running, self.terminate_grace);
            info!("Session {} terminated after {:?}: {}", id, elapsed, info);
            self.state = SessionState::Terminated(info);
        }
    }

    /// Reap a child whose output has closed.
    ///
    /// Gives the child the grace period to exit on its own before stopping it,
    /// so the caller may block for up to twice the grace period when the child
    /// keeps running after closing its output.
    pub fn finish(&mut self) -> Option<&ExitInfo> {
        if let Some(mut running) = self.take_running() {
            let info = match wait_with_grace(&mut running.child, self.terminate_grace) {
                Some(status) => {
                    info!(
                        "Session {} finished after {:?}",
                        running.id,
                        running.elapsed()
                    );
                    ExitInfo::Exited(status)
                }
                None => {
                    warn!(
                        "Session {} closed its output but is still running",
                        running.id
                    );
                    stop_child(running, self.terminate_grace)
                }
            };
            self.state = SessionState::Terminated(info);
        }
        self.exit_info()
    }

    /// Descriptor the output is read from
    #[cfg(test)]
    pub(crate) fn output_fd(&self) -> Option<std::os::unix::io::RawFd> {
        match &self.state {
            SessionState::Running(running) => Some(running.output.as_raw_fd()),
            _ => None,
        }
    }

    fn take_running(&mut self) -> Option<RunningChild> {
        match std::mem::replace(&mut self.state, SessionState::NotStarted) {
            SessionState::Running(running) => Some(running),
            other => {
                self.state = other;
                None
            }
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn set_nonblocking(output: &PipeReader) -> io::Result<()> {
    let fd = output.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn wait_with_grace(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(err) => {
                warn!("Failed to poll child {}: {}", child.id(), err);
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(REAP_POLL_INTERVAL);
    }
}

fn signal_group(child: &Child, signal: Signal) {
    // the child leads its own process group
    let group = Pid::from_raw(child.id() as i32);
    if let Err(err) = killpg(group, signal) {
        debug!("{:?} to process group {} failed: {}", signal, group, err);
    }
}

fn stop_child(mut running: RunningChild, grace: Duration) -> ExitInfo {
    match running.child.try_wait() {
        Ok(Some(status)) => return ExitInfo::Exited(status),
        Ok(None) => {}
        Err(err) => warn!("Failed to poll child {}: {}", running.pid(), err),
    }

    signal_group(&running.child, Signal::SIGTERM);
    if wait_with_grace(&mut running.child, grace).is_none() {
        warn!(
            "Child {} ignored SIGTERM for {:?}, killing",
            running.pid(),
            grace
        );
        signal_group(&running.child, Signal::SIGKILL);
    }

    match running.child.wait() {
        Ok(_) => ExitInfo::Stopped,
        Err(err) => {
            warn!("Failed to reap child {}: {}", running.pid(), err);
            ExitInfo::Unknown
        }
    }
}

/// Kill and reap a child that never became a session
fn discard_child(child: &mut Child) {
    signal_group(child, Signal::SIGKILL);
    if let Err(err) = child.wait() {
        warn!("Failed to reap child {}: {}", child.id(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn session(command: &str) -> ProcessSession {
        ProcessSession::new(CommandSpec::new(command))
    }

    /// Run `script` through `sh -c`
    fn script(script: &str) -> ProcessSession {
        session(&shell_words::join(["sh", "-c", script]))
    }

    fn read_to_close(session: &mut ProcessSession) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        loop {
            match session.try_read_chunk() {
                Ok(chunk) if chunk.is_empty() => {
                    assert!(Instant::now() < deadline, "timed out waiting for output");
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(chunk) => out.extend(chunk),
                Err(ReadError::Closed) => return out,
                Err(err) => panic!("unexpected read error: {err}"),
            }
        }
    }

    #[test]
    fn test_session_id() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_reads_output_until_closed() {
        let mut session = session("printf '*1/2!\\nhello world\\n'");
        session.start().unwrap();
        assert!(session.session_id().is_some());

        let out = read_to_close(&mut session);
        assert_eq!(out, b"*1/2!\nhello world\n");

        let info = *session.finish().unwrap();
        assert!(info.success());
        assert_eq!(info.code(), Some(0));
        assert!(!session.is_running());
    }

    #[test]
    fn test_small_chunks() {
        let mut session = session("printf 'abcdefgh\\n'").with_read_chunk_size(3);
        session.start().unwrap();
        assert_eq!(read_to_close(&mut session), b"abcdefgh\n");
    }

    #[test]
    fn test_read_does_not_block() {
        let mut session = session("sleep 5");
        session.start().unwrap();

        let started = Instant::now();
        for _ in 0..10 {
            assert!(session.try_read_chunk().unwrap().is_empty());
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(session.is_alive());

        session.terminate();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(session.exit_info(), Some(&ExitInfo::Stopped));
        assert!(!session.is_alive());
    }

    #[test]
    fn test_exit_code_is_reported() {
        let mut session = script("echo failing; exit 3");
        session.start().unwrap();
        assert_eq!(read_to_close(&mut session), b"failing\n");

        let info = *session.finish().unwrap();
        assert!(!info.success());
        assert_eq!(info.code(), Some(3));
        assert_eq!(info.to_string(), "exited with code 3");
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let mut session = session("/nonexistent/tpm2_algtest -s perf");
        let err = session.start().unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
        assert!(err.is_missing_program());
        assert!(matches!(session.state(), SessionState::NotStarted));
        assert!(matches!(session.try_read_chunk(), Err(ReadError::NotRunning)));
    }

    #[test]
    fn test_non_executable_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tpm2_algtest");
        std::fs::write(&tool, "#!/bin/sh\necho never\n").unwrap();

        let mut session = session(&shell_words::join([tool.to_string_lossy(), "-s".into()]));
        let err = session.start().unwrap_err();
        assert!(err.is_missing_program());
        assert!(!session.is_running());
    }

    #[test]
    fn test_unparsable_command() {
        let mut session = session("tpm2_algtest 'oops");
        let err = session.start().unwrap_err();
        assert!(matches!(err, SpawnError::InvalidCommand { .. }));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut session = session("sleep 5");
        session.terminate();
        assert!(matches!(session.state(), SessionState::NotStarted));

        session.start().unwrap();
        session.terminate();
        session.terminate();
        assert_eq!(session.exit_info(), Some(&ExitInfo::Stopped));
        assert!(matches!(session.try_read_chunk(), Err(ReadError::NotRunning)));
    }

    #[test]
    fn test_terminate_after_exit_keeps_status() {
        let mut session = session("true");
        session.start().unwrap();
        read_to_close(&mut session);
        thread::sleep(Duration::from_millis(100));

        session.terminate();
        assert!(session.exit_info().unwrap().success());
    }

    #[test]
    fn test_sigterm_ignored_falls_back_to_kill() {
        let mut session =
            script("trap '' TERM; sleep 30").with_terminate_grace(Duration::from_millis(100));
        session.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        session.terminate();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_secs(3));
        assert_eq!(session.exit_info(), Some(&ExitInfo::Stopped));
    }

    #[test]
    fn test_finish_waits_at_most_two_grace_periods() {
        let mut session = script("exec >/dev/null 2>&1; trap '' TERM; sleep 30")
            .with_terminate_grace(Duration::from_millis(100));
        session.start().unwrap();
        assert!(read_to_close(&mut session).is_empty());

        let started = Instant::now();
        assert_eq!(session.finish(), Some(&ExitInfo::Stopped));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_secs(3));
        assert!(!session.is_running());
    }

    #[test]
    fn test_restart_replaces_running_session() {
        let mut session = session("sleep 5");
        session.start().unwrap();
        let first = session.session_id().cloned().unwrap();

        session.start().unwrap();
        let second = session.session_id().cloned().unwrap();
        assert_ne!(first, second);
        assert!(session.is_alive());
    }

    #[test]
    fn test_stderr_merged_by_default() {
        let mut session = script("echo to-stderr 1>&2");
        session.start().unwrap();
        assert_eq!(read_to_close(&mut session), b"to-stderr\n");
    }

    #[test]
    fn test_stderr_dropped_when_not_merged() {
        let spec = CommandSpec::new(shell_words::join([
            "sh",
            "-c",
            "echo to-stderr 1>&2; echo to-stdout",
        ]))
        .with_merged_stderr(false);
        let mut session = ProcessSession::new(spec);
        session.start().unwrap();
        assert_eq!(read_to_close(&mut session), b"to-stdout\n");
    }

    #[test]
    fn test_drop_terminates_child() {
        let mut session = session("sleep 30");
        session.start().unwrap();
        let pid = match session.state() {
            SessionState::Running(running) => running.pid(),
            _ => panic!("expected a running session"),
        };
        drop(session);
        // reaped: nothing left to signal
        assert!(nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[test]
    fn test_exit_info_display() {
        assert_eq!(ExitInfo::Stopped.to_string(), "stopped");
        assert_eq!(ExitInfo::Unknown.to_string(), "exit status unknown");
        assert_eq!(
            ExitInfo::Exited(ExitStatus::from_raw(9)).to_string(),
            "killed by signal 9"
        );
    }
}
