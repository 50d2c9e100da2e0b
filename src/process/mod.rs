//! Child process management for the test tool
//!
//! The command line is split into an argument vector and the program is
//! executed directly, so a missing or non-executable tool fails at spawn time.
//! Its output pipe is switched to non-blocking mode so the control loop can
//! poll it on every tick without ever stalling.

pub mod session;

pub use session::{ExitInfo, ProcessSession, RunningChild, SessionId, SessionState};

use std::io::{self, PipeReader};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// The process could not be created
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse command `{command}`: {source}")]
    InvalidCommand {
        command: String,
        #[source]
        source: shell_words::ParseError,
    },
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to create the output pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("failed to make child output non-blocking: {0}")]
    NonBlocking(#[source] io::Error),
}

impl SpawnError {
    /// The tool itself is missing or not executable
    pub fn is_missing_program(&self) -> bool {
        matches!(
            self,
            SpawnError::Spawn { source, .. }
                if matches!(
                    source.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                )
        )
    }
}

/// Reading from the child output failed or ended
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// End of stream; the child closed its output
    #[error("child output closed")]
    Closed,
    #[error("no process is running")]
    NotRunning,
    #[error("failed to read child output: {0}")]
    Io(#[from] io::Error),
}

/// How to launch the test tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Fixed command line, split with shell quoting rules (no shell is involved)
    pub command: String,
    /// Route stderr into the monitored stream
    pub merge_stderr: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            merge_stderr: true,
        }
    }

    pub fn with_merged_stderr(mut self, merge_stderr: bool) -> Self {
        self.merge_stderr = merge_stderr;
        self
    }

    /// Program and arguments
    pub fn argv(&self) -> Result<Vec<String>, SpawnError> {
        let argv = shell_words::split(&self.command).map_err(|source| {
            SpawnError::InvalidCommand {
                command: self.command.clone(),
                source,
            }
        })?;
        if argv.is_empty() {
            return Err(SpawnError::EmptyCommand);
        }
        Ok(argv)
    }

    /// Build the command writing into a fresh pipe.
    ///
    /// The returned [`Command`] holds the write end; drop it after spawning so
    /// the reader sees end of stream once the child exits. The child gets its
    /// own process group so that a stop request reaches everything it started.
    pub(crate) fn to_command(&self) -> Result<(Command, PipeReader), SpawnError> {
        let argv = self.argv()?;
        let (reader, writer) = io::pipe().map_err(SpawnError::Pipe)?;

        let stderr = if self.merge_stderr {
            Stdio::from(writer.try_clone().map_err(SpawnError::Pipe)?)
        } else {
            Stdio::null()
        };

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(stderr)
            .process_group(0);
        Ok((command, reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv() {
        let spec = CommandSpec::new("../tpm2-algtest/build/tpm2_algtest -s perf");
        assert_eq!(
            spec.argv().unwrap(),
            vec!["../tpm2-algtest/build/tpm2_algtest", "-s", "perf"]
        );
        assert!(spec.merge_stderr);
    }

    #[test]
    fn test_argv_quoting() {
        let spec = CommandSpec::new(r#"sh -c 'echo "a b"; exit 3'"#);
        assert_eq!(spec.argv().unwrap(), vec!["sh", "-c", r#"echo "a b"; exit 3"#]);
    }

    #[test]
    fn test_invalid_commands() {
        let err = CommandSpec::new("tpm2_algtest 'unterminated").argv().unwrap_err();
        assert!(matches!(err, SpawnError::InvalidCommand { .. }));

        let err = CommandSpec::new("   ").argv().unwrap_err();
        assert!(matches!(err, SpawnError::EmptyCommand));
    }

    #[test]
    fn test_missing_program_detection() {
        let missing = SpawnError::Spawn {
            command: "missing".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(missing.is_missing_program());
        assert!(missing.to_string().starts_with("failed to spawn `missing`"));
        assert!(!SpawnError::EmptyCommand.is_missing_program());
        assert_eq!(ReadError::Closed.to_string(), "child output closed");
    }
}
