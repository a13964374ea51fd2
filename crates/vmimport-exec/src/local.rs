//! Session over the local filesystem using `tokio::fs` and `tokio::process`

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, instrument};

use crate::error::{ExecError, SessionError};
use crate::result::{CommandOutput, Credentials};
use crate::session::{
    Connector, DirEntry, FileKind, FileStat, RemoteReader, RemoteSession, RemoteWriter,
};

/// Local "remote" session
///
/// Executes commands on the local machine and maps file operations onto the
/// local filesystem. Used when the target host is this machine.
#[derive(Debug, Default)]
pub struct LocalSession {
    closed: AtomicBool,
}

impl LocalSession {
    /// Create a new local session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Lost("local session closed".to_string()));
        }
        Ok(())
    }
}

fn file_stat(metadata: &std::fs::Metadata) -> FileStat {
    let kind = if metadata.is_dir() {
        FileKind::Dir
    } else if metadata.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    };
    FileStat {
        kind,
        size: Some(metadata.len()),
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn probe(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        std::env::current_dir()?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn exec(&self, cmd: &str) -> Result<CommandOutput, SessionError> {
        self.ensure_open()?;
        let start = Instant::now();

        // Use shell to support pipes, redirections, etc.
        // stderr is folded into stdout so both arrive in one ordered buffer.
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("exec 2>&1\n{cmd}"))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let status = output.status.code().unwrap_or(-1);

        debug!(
            command = %cmd,
            status = status,
            duration = ?start.elapsed(),
            "command completed"
        );

        if !output.status.success() {
            error!(command = %cmd, status = status, "command failed");
        }

        Ok(CommandOutput {
            status,
            output: output.stdout,
        })
    }

    async fn stat(&self, path: &str) -> Result<FileStat, SessionError> {
        self.ensure_open()?;
        let metadata = tokio::fs::metadata(path).await?;
        Ok(file_stat(&metadata))
    }

    async fn lstat(&self, path: &str) -> Result<FileStat, SessionError> {
        self.ensure_open()?;
        let metadata = tokio::fs::symlink_metadata(path).await?;
        Ok(file_stat(&metadata))
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SessionError> {
        self.ensure_open()?;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            // symlinks are reported as-is, not followed
            let metadata = tokio::fs::symlink_metadata(entry.path()).await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                stat: file_stat(&metadata),
            });
        }
        Ok(entries)
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SessionError> {
        self.ensure_open()?;
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn open(&self, path: &str) -> Result<RemoteReader, SessionError> {
        self.ensure_open()?;
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        tokio::fs::remove_dir(path).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "local session already closed",
            )));
        }
        Ok(())
    }

    fn session_type(&self) -> &'static str {
        "local"
    }
}

/// Connector handing out [`LocalSession`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, ExecError> {
        debug!(host = %credentials.host, "using local session");
        Ok(Arc::new(LocalSession::new()))
    }
}
