use std::io;

use thiserror::Error;

/// How a runtime pty error affects the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyErrorKind {
    /// The stream to the process is gone. The session ends.
    BrokenPipe,
    /// Anything else. Logged, the operation has no effect.
    Transient,
}

/// Errors from operations on a running pty process.
///
/// Backends classify every failure before it reaches the session, so the
/// session never has to inspect error messages.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("PTY stream closed: {0}")]
    BrokenPipe(#[source] io::Error),
    #[error("PTY I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
    #[error("PTY kill failed: {0}")]
    KillFailed(String),
}

impl PtyError {
    pub fn kind(&self) -> PtyErrorKind {
        match self {
            PtyError::BrokenPipe(_) => PtyErrorKind::BrokenPipe,
            _ => PtyErrorKind::Transient,
        }
    }
}

impl From<io::Error> for PtyError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero => PtyError::BrokenPipe(err),
            _ => PtyError::Io(err),
        }
    }
}

/// Errors from starting a process on a pty backend.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The pty subsystem itself could not be used.
    #[error("PTY backend unavailable: {0}")]
    Unavailable(String),
    /// The pty was fine but the command could not be started.
    #[error("failed to spawn command: {0}")]
    Failed(String),
}

/// Errors returned when constructing a terminal session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(
        "the PTY backend failed to load ({0}). This usually means it was built \
         incorrectly for this platform; check the build environment."
    )]
    BackendUnavailable(String),
    #[error("failed to start shell `{shell}`: {reason}")]
    Spawn { shell: String, reason: String },
}

impl SessionError {
    pub(crate) fn from_spawn(shell: &str, err: SpawnError) -> Self {
        match err {
            SpawnError::Unavailable(msg) => SessionError::BackendUnavailable(msg),
            SpawnError::Failed(reason) => SessionError::Spawn {
                shell: shell.to_string(),
                reason,
            },
        }
    }
}
