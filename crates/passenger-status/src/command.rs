//! Running the status command with a timeout.

use tokio::{
    io::AsyncReadExt as _,
    process::{Child, ChildStdout, Command},
};

use std::{
    fmt, io,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use crate::info::{DecodeError, Info};

/// Error constructing a [`StatusCommand`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CommandError {
    /// The command line contains no program.
    #[error("status command is empty")]
    Empty,
}

/// Error fetching status output from the command.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The command did not exit within the configured timeout.
    #[error("passenger-status command timed out after {0:?}")]
    Timeout(Duration),
    /// The command could not be started.
    #[error("failed starting `{program}`: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The command exited unsuccessfully or was killed by a signal.
    #[error("`{program}` exited unsuccessfully: {status}")]
    Exit {
        /// Program that failed.
        program: String,
        /// Exit status of the program.
        status: ExitStatus,
    },
    /// I/O error reading command output.
    #[error("failed reading output of `{program}`: {source}")]
    Io {
        /// Program whose output could not be read.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Checks whether this error is caused by the command timing out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Command producing Passenger status XML, e.g. `passenger-status --show=xml`.
#[derive(Clone)]
pub struct StatusCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl fmt::Debug for StatusCommand {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StatusCommand")
            .field("command_line", &self.command_line())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StatusCommand {
    /// Default command line.
    pub const DEFAULT_COMMAND: &'static str = "passenger-status --show=xml";
    /// Default timeout for the command.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

    /// Creates a command from a whitespace-separated command line.
    ///
    /// # Errors
    ///
    /// Returns an error if the command line is empty.
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self, CommandError> {
        let mut parts = command_line.split_whitespace().map(str::to_owned);
        let program = parts.next().ok_or(CommandError::Empty)?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    /// Returns the full command line.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Returns the timeout for the command.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the command and returns its entire standard output. Standard error is discarded.
    ///
    /// If the command doesn't exit in time, [`FetchError::Timeout`] is returned immediately; the child
    /// is then killed and reaped in the background. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be started, times out or exits unsuccessfully.
    pub async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| FetchError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stdout = child.stdout.take();

        let output = tokio::time::timeout(self.timeout, collect_output(&mut child, stdout)).await;
        let Ok(output) = output else {
            tracing::debug!(
                command = %self.command_line(),
                timeout = ?self.timeout,
                "Status command timed out; killing it"
            );
            abandon(child);
            return Err(FetchError::Timeout(self.timeout));
        };

        let (buffer, status) = output.map_err(|source| FetchError::Io {
            program: self.program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(FetchError::Exit {
                program: self.program.clone(),
                status,
            });
        }
        Ok(buffer)
    }

    /// Fetches and decodes a status snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if either fetching or decoding fails.
    pub async fn status(&self) -> Result<Info, StatusError> {
        let raw = self.fetch().await?;
        Ok(Info::decode(&raw)?)
    }
}

/// Error returned by [`StatusCommand::status()`].
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// Error fetching command output.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Error decoding command output.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

async fn collect_output(
    child: &mut Child,
    stdout: Option<ChildStdout>,
) -> io::Result<(Vec<u8>, ExitStatus)> {
    let mut buffer = Vec::with_capacity(16 * 1_024);
    if let Some(mut stdout) = stdout {
        stdout.read_to_end(&mut buffer).await?;
    }
    let status = child.wait().await?;
    Ok((buffer, status))
}

/// Kills a timed-out child and reaps it on a background task so that hung commands don't accumulate.
fn abandon(mut child: Child) {
    if let Err(err) = child.start_kill() {
        tracing::warn!(%err, "Failed killing timed-out status command");
    }
    tokio::spawn(async move {
        if let Err(err) = child.wait().await {
            tracing::warn!(%err, "Failed reaping timed-out status command");
        }
    });
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use std::time::Instant;

    use super::*;

    #[test]
    fn parsing_command_line() {
        let command = StatusCommand::new("  passenger-status   --show=xml ", Duration::ZERO).unwrap();
        assert_eq!(command.program, "passenger-status");
        assert_eq!(command.args, ["--show=xml"]);
        assert_eq!(command.command_line(), StatusCommand::DEFAULT_COMMAND);

        let err = StatusCommand::new(" \t", Duration::ZERO).unwrap_err();
        assert_matches!(err, CommandError::Empty);
    }

    #[tokio::test]
    async fn fetching_stdout() {
        let command = StatusCommand::new("echo <info/>", Duration::from_secs(5)).unwrap();
        let output = command.fetch().await.unwrap();
        assert_eq!(output, b"<info/>\n");
    }

    #[tokio::test]
    async fn fetching_and_decoding_fixture() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/passenger_xml_output.xml");
        let command = StatusCommand::new(&format!("cat {path}"), Duration::from_secs(5)).unwrap();
        let info = command.status().await.unwrap();
        assert_eq!(info.supergroups[0].group.options.app_root, "/src/app/my_app");
        assert!(info
            .processes()
            .all(|process| process.process_group_id == "2254"));
    }

    #[tokio::test]
    async fn command_timeout() {
        let command = StatusCommand::new("sleep 1", Duration::from_millis(1)).unwrap();
        let started_at = Instant::now();
        let err = command.fetch().await.unwrap_err();

        assert!(err.is_timeout(), "{err}");
        assert_matches!(err, FetchError::Timeout(timeout) if timeout == Duration::from_millis(1));
        assert!(started_at.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn nonzero_exit() {
        let command = StatusCommand::new("false", Duration::from_secs(5)).unwrap();
        let err = command.fetch().await.unwrap_err();
        assert_matches!(err, FetchError::Exit { status, .. } if !status.success());
    }

    #[tokio::test]
    async fn missing_program() {
        let command =
            StatusCommand::new("/nonexistent/passenger-status", Duration::from_secs(5)).unwrap();
        let err = command.fetch().await.unwrap_err();
        assert_matches!(
            err,
            FetchError::Spawn { program, source }
                if program == "/nonexistent/passenger-status"
                    && source.kind() == io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn malformed_output() {
        let command = StatusCommand::new("echo <info>", Duration::from_secs(5)).unwrap();
        let err = command.status().await.unwrap_err();
        assert_matches!(err, StatusError::Decode(DecodeError::Xml(_)));
    }
}
