//! Remote session provider traits

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ExecError, SessionError};
use crate::result::{CommandOutput, Credentials};

/// Writable remote file
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable remote file
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Kind of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file
    File,
    /// Directory
    Dir,
    /// Symlink, device, socket or anything else
    Other,
}

/// Metadata for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Entry kind
    pub kind: FileKind,
    /// Size in bytes, if reported
    pub size: Option<u64>,
}

impl FileStat {
    /// Check if the entry is a directory
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    /// Check if the entry is a regular file
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name without the parent path
    pub name: String,
    /// Entry metadata
    pub stat: FileStat,
}

/// An authenticated channel to one host, used for both commands and files
///
/// Paths are remote, `/`-separated strings.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Cheap metadata round trip proving the session still works
    async fn probe(&self) -> Result<(), SessionError>;

    /// Run a command to completion and collect its output
    async fn exec(&self, cmd: &str) -> Result<CommandOutput, SessionError>;

    /// Stat a path, following symlinks
    async fn stat(&self, path: &str) -> Result<FileStat, SessionError>;

    /// Stat a path without following a final symlink
    async fn lstat(&self, path: &str) -> Result<FileStat, SessionError>;

    /// Create a directory and any missing parents
    async fn mkdir_all(&self, path: &str) -> Result<(), SessionError>;

    /// List a directory, excluding `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SessionError>;

    /// Create or truncate a file for writing
    async fn create(&self, path: &str) -> Result<RemoteWriter, SessionError>;

    /// Open a file for reading
    async fn open(&self, path: &str) -> Result<RemoteReader, SessionError>;

    /// Remove a file
    async fn remove_file(&self, path: &str) -> Result<(), SessionError>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &str) -> Result<(), SessionError>;

    /// Tear the session down
    async fn close(&self) -> Result<(), SessionError>;

    /// Provider name for logs
    fn session_type(&self) -> &'static str;
}

/// Builds fresh sessions from credentials
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish transport, authenticate and open a session
    ///
    /// Failures are reported as [`ExecError::Connect`] naming the stage.
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, ExecError>;
}

/// Join a remote directory and a child name
#[must_use]
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
