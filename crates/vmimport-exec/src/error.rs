//! Error types for vmimport-exec

use std::fmt;
use std::io;

use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use thiserror::Error;

use crate::cancel::CancelReason;
use crate::keys::KeyError;
use crate::result::CapturedOutput;

/// Stage of connection establishment that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    /// TCP dial or SSH handshake
    Transport,
    /// Public key authentication
    Authentication,
    /// SFTP subsystem on top of the authenticated transport
    Session,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => f.write_str("dial transport"),
            Self::Authentication => f.write_str("authenticate"),
            Self::Session => f.write_str("establish SFTP session"),
        }
    }
}

/// Errors reported by a [`RemoteSession`](crate::session::RemoteSession) provider
#[derive(Error, Debug)]
pub enum SessionError {
    /// Path does not exist
    #[error("no such file or directory")]
    NotFound,

    /// The session is no longer usable and must be rebuilt
    #[error("session lost: {0}")]
    Lost(String),

    /// Remote side refused the request
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// SFTP protocol error
    #[error("SFTP error: {0}")]
    Sftp(#[from] SftpError),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Private key could not be loaded or parsed
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

impl SessionError {
    /// Whether the error means the session must be discarded and rebuilt
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        match self {
            Self::Lost(_) => true,
            Self::Ssh(e) => matches!(
                e,
                russh::Error::Disconnect
                    | russh::Error::HUP
                    | russh::Error::SendError
                    | russh::Error::ConnectionTimeout
                    | russh::Error::KeepaliveTimeout
                    | russh::Error::InactivityTimeout
            ),
            Self::Sftp(SftpError::Status(status)) => matches!(
                status.status_code,
                StatusCode::ConnectionLost | StatusCode::NoConnection
            ),
            // russh-sftp reports a closed channel as a bare I/O string
            Self::Sftp(SftpError::IO(_)) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether the error means the path does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Sftp(SftpError::Status(status)) => status.status_code == StatusCode::NoSuchFile,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Errors that can occur during remote execution, transfers and local processes
#[derive(Error, Debug)]
pub enum ExecError {
    /// Initial connect or reconnect failed
    #[error("connect to {target}: {stage}: {source}")]
    Connect {
        /// `host:port` being connected to
        target: String,
        /// Which step of the handshake failed
        stage: ConnectStage,
        /// Underlying cause
        #[source]
        source: SessionError,
    },

    /// Session was lost while running an operation
    #[error("{op} {target}: session lost: {source}")]
    SessionLost {
        /// Operation name
        op: &'static str,
        /// Path or command line
        target: String,
        /// Underlying cause
        #[source]
        source: SessionError,
    },

    /// Path exists but is not a directory
    #[error("{op} {path:?}: not a directory")]
    NotADirectory {
        /// Operation name
        op: &'static str,
        /// Offending path
        path: String,
    },

    /// Path exists but is not a regular file
    #[error("{op} {path:?}: not a regular file")]
    NotAFile {
        /// Operation name
        op: &'static str,
        /// Offending path
        path: String,
    },

    /// Path does not exist
    #[error("{op} {path:?}: no such file or directory")]
    NotFound {
        /// Operation name
        op: &'static str,
        /// Missing path
        path: String,
    },

    /// Operation was interrupted by its cancellation scope
    #[error("{op} {target}: {reason}")]
    Cancelled {
        /// Operation name
        op: &'static str,
        /// Path or command line
        target: String,
        /// Explicit cancellation or deadline
        reason: CancelReason,
        /// OS-level cause observed when the interruption landed, if any
        #[source]
        source: Option<io::Error>,
    },

    /// Process or remote command exited with a code that is not allowed
    #[error("failed to execute {command}: exit code {code}, output: [{output}]")]
    ProcessExit {
        /// Command line
        command: String,
        /// Exit code (-1 when terminated by a signal)
        code: i32,
        /// Combined captured output
        output: CapturedOutput,
    },

    /// Local process could not be started
    #[error("failed to start {command}: {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Session operation failed
    #[error("{op} {target}: {source}")]
    Session {
        /// Operation name
        op: &'static str,
        /// Path or command line
        target: String,
        /// Underlying cause
        #[source]
        source: SessionError,
    },

    /// Local I/O failed
    #[error("{op} {target}: {source}")]
    Io {
        /// Operation name
        op: &'static str,
        /// Path or command line
        target: String,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Invalid configuration or unusable connection state
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// Classify a session error for `op` on `target`
    ///
    /// Not-found and session-lost causes get their own variants so callers
    /// never see them as generic failures.
    #[must_use]
    pub fn session(op: &'static str, target: impl Into<String>, source: SessionError) -> Self {
        let target = target.into();
        if source.is_not_found() {
            Self::NotFound { op, path: target }
        } else if source.is_session_lost() {
            Self::SessionLost { op, target, source }
        } else {
            Self::Session { op, target, source }
        }
    }

    /// Classify an I/O error, recognising cancellation carried inside it
    #[must_use]
    pub fn from_io(op: &'static str, target: impl Into<String>, source: io::Error) -> Self {
        let target = target.into();
        match CancelReason::from_io(&source) {
            Some(reason) => Self::Cancelled {
                op,
                target,
                reason,
                source: Some(source),
            },
            None => Self::Io { op, target, source },
        }
    }

    /// Build a cancellation error without an OS-level cause
    #[must_use]
    pub fn cancelled(op: &'static str, target: impl Into<String>, reason: CancelReason) -> Self {
        Self::Cancelled {
            op,
            target: target.into(),
            reason,
            source: None,
        }
    }

    /// Check if the operation was cancelled or hit its deadline
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if the operation hit its deadline
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self,
            Self::Cancelled {
                reason: CancelReason::DeadlineExceeded,
                ..
            }
        )
    }

    /// Check if the session was lost
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        match self {
            Self::SessionLost { .. } => true,
            Self::Connect { source, .. } => source.is_session_lost(),
            _ => false,
        }
    }

    /// Check if error is retryable by the caller
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::SessionLost { .. })
    }
}
