//! Agent workflow against one node: push the agent binary, run it, pull
//! back its result

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::cancel::CancelScope;
use crate::connection::Connection;
use crate::error::{ConnectStage, ExecError, SessionError};
use crate::readahead::ReadAhead;
use crate::result::Credentials;
use crate::session::Connector;

/// Where the agent binary lives on the node
pub const AGENT_REMOTE_PATH: &str = "/tmp/import-agent";

/// Deadline for pushing the agent binary
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Deadline for fetching a result file
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection to one node plus the agent lifecycle on top of it
#[derive(Debug)]
pub struct NodeConnection {
    connection: Connection,
    agent_path: String,
    upload_timeout: Duration,
    download_timeout: Duration,
}

impl NodeConnection {
    /// Wrap a connector; nothing is dialed until the first operation
    pub fn new(credentials: Credentials, connector: Arc<dyn Connector>) -> Self {
        Self::from_connection(Connection::new(credentials, connector))
    }

    /// Wrap an existing connection
    #[must_use]
    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection,
            agent_path: AGENT_REMOTE_PATH.to_string(),
            upload_timeout: UPLOAD_TIMEOUT,
            download_timeout: DOWNLOAD_TIMEOUT,
        }
    }

    /// Read the private key from `key_path` and connect eagerly over SSH
    ///
    /// # Errors
    /// Returns `ExecError::Connect` if the key cannot be loaded or the
    /// handshake fails, `ExecError::Cancelled` if `scope` fires first
    #[instrument(skip(key_path, scope), fields(key = %key_path.display()))]
    pub async fn connect_with_key_file(
        host: &str,
        port: u16,
        login: &str,
        key_path: &Path,
        scope: &CancelScope,
    ) -> Result<Self, ExecError> {
        let credentials =
            Credentials::from_key_file(host, port, login, key_path).map_err(|e| {
                ExecError::Connect {
                    target: format!("{host}:{port}"),
                    stage: ConnectStage::Authentication,
                    source: SessionError::Key(e),
                }
            })?;

        let connection = Connection::for_host(credentials);
        connection.manager().connect(scope).await?;
        Ok(Self::from_connection(connection))
    }

    /// Override where the agent is placed on the node
    #[must_use]
    pub fn with_agent_path(mut self, path: impl Into<String>) -> Self {
        self.agent_path = path.into();
        self
    }

    /// Override the upload and download deadlines
    #[must_use]
    pub fn with_timeouts(mut self, upload: Duration, download: Duration) -> Self {
        self.upload_timeout = upload;
        self.download_timeout = download;
        self
    }

    /// Set the upload read-ahead window
    #[must_use]
    pub fn with_read_ahead(mut self, read_ahead: ReadAhead) -> Self {
        self.connection = self.connection.with_read_ahead(read_ahead);
        self
    }

    /// Node host name
    #[must_use]
    pub fn host(&self) -> &str {
        self.connection.host()
    }

    /// Remote agent path
    #[must_use]
    pub fn agent_path(&self) -> &str {
        &self.agent_path
    }

    /// Underlying connection
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Run a command on the node and return its combined output
    ///
    /// # Errors
    /// See [`Connection::exec`]
    pub async fn exec(&self, cmd: &str, scope: &CancelScope) -> Result<Vec<u8>, ExecError> {
        info!(host = %self.host(), command = %cmd, "start executing command");
        let result = self.connection.exec(cmd, scope).await;
        info!(host = %self.host(), command = %cmd, ok = result.is_ok(), "command executed");
        result
    }

    /// Run the previously uploaded agent with `args`
    ///
    /// # Errors
    /// See [`Connection::exec`]
    pub async fn exec_agent(&self, args: &str, scope: &CancelScope) -> Result<Vec<u8>, ExecError> {
        let cmd = if args.is_empty() {
            self.agent_path.clone()
        } else {
            format!("{} {args}", self.agent_path)
        };
        self.exec(&cmd, scope).await
    }

    /// Push `binary` to the agent path and make it executable
    ///
    /// The binary is first copied to a private temporary directory so the
    /// upload reads a stable file even if `binary` is replaced meanwhile.
    /// Any agent still running from an earlier attempt is killed first.
    ///
    /// # Errors
    /// Returns `ExecError` if the local copy, the upload or `chmod` fails
    #[instrument(skip(self, scope), fields(host = %self.host()))]
    pub async fn upload_agent(&self, binary: &Path, scope: &CancelScope) -> Result<(), ExecError> {
        info!(host = %self.host(), "start upload agent");
        let (dest_dir, name) = split_remote_path(&self.agent_path)?;

        let staging = tempfile::Builder::new()
            .prefix("import-agent")
            .tempdir()
            .map_err(|source| ExecError::Io {
                op: "create staging directory",
                target: binary.display().to_string(),
                source,
            })?;
        let staged = staging.path().join(name);
        tokio::fs::copy(binary, &staged)
            .await
            .map_err(|source| ExecError::Io {
                op: "copy agent",
                target: binary.display().to_string(),
                source,
            })?;

        if let Err(e) = self.kill_stale_agent(scope).await {
            debug!(host = %self.host(), error = %e, "no stale agent killed");
        }

        let file = tokio::fs::File::open(&staged)
            .await
            .map_err(|source| ExecError::Io {
                op: "open agent",
                target: staged.display().to_string(),
                source,
            })?;

        let upload_scope = scope.timeout(self.upload_timeout);
        let stats = self
            .connection
            .upload(file, dest_dir, name, &upload_scope)
            .await?;

        self.exec(&format!("chmod +x {}", self.agent_path), scope)
            .await?;

        info!(host = %self.host(), bytes = stats.bytes, path = %self.agent_path, "agent uploaded");
        Ok(())
    }

    /// Kill any process running from the agent path
    ///
    /// # Errors
    /// Returns `ExecError::ProcessExit` with code 1 when nothing matched
    pub async fn kill_stale_agent(&self, scope: &CancelScope) -> Result<(), ExecError> {
        let cmd = format!("pkill -9 -f '{}'", stale_agent_pattern(&self.agent_path));
        self.exec(&cmd, scope).await.map(drop)
    }

    /// Stream `remote_path` into `local_path`
    ///
    /// # Errors
    /// Returns `ExecError` if the remote file cannot be read, the local file
    /// cannot be written, or the download deadline passes
    #[instrument(skip(self, scope), fields(host = %self.host()))]
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        scope: &CancelScope,
    ) -> Result<u64, ExecError> {
        let scope = scope.timeout(self.download_timeout);
        let mut reader = self.connection.download(remote_path, &scope).await?;

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|source| ExecError::Io {
                op: "create",
                target: local_path.display().to_string(),
                source,
            })?;

        let bytes = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|source| ExecError::from_io("download", remote_path, source))?;
        file.flush()
            .await
            .map_err(|source| ExecError::from_io("write", local_path.display().to_string(), source))?;

        info!(host = %self.host(), remote = %remote_path, local = %local_path.display(), bytes, "file downloaded");
        Ok(bytes)
    }

    /// Upload the agent, run it and fetch its result file
    ///
    /// Returns the agent's output.
    ///
    /// # Errors
    /// Returns the first failing step's error
    pub async fn run_agent(
        &self,
        binary: &Path,
        args: &str,
        remote_result: &str,
        local_result: &Path,
        scope: &CancelScope,
    ) -> Result<Vec<u8>, ExecError> {
        self.upload_agent(binary, scope).await?;
        let output = self.exec_agent(args, scope).await?;
        self.download_file(remote_result, local_result, scope).await?;
        Ok(output)
    }

    /// Close the underlying connection
    ///
    /// # Errors
    /// See [`Connection::close`]
    pub async fn close(&self) -> Result<(), ExecError> {
        self.connection.close().await
    }
}

/// Split `/dir/name` into its directory and file name
fn split_remote_path(path: &str) -> Result<(&str, &str), ExecError> {
    match path.rsplit_once('/') {
        Some((_, "")) | None => Err(ExecError::ConfigError(format!(
            "agent path {path:?} must be an absolute file path"
        ))),
        Some(("", name)) => Ok(("/", name)),
        Some((dir, name)) => Ok((dir, name)),
    }
}

/// `pkill -f` pattern for `path` that does not match its own command line
///
/// Bracketing the first character keeps the regex equal to `path` while the
/// literal pattern text no longer contains it.
fn stale_agent_pattern(path: &str) -> String {
    let mut chars = path.chars();
    match chars.next() {
        Some(first) => format!("[{first}]{}", chars.as_str()),
        None => String::new(),
    }
}

/// Path of the executable currently running
///
/// # Errors
/// Returns `ExecError::Io` if the platform cannot report it
pub fn current_executable() -> Result<PathBuf, ExecError> {
    std::env::current_exe().map_err(|source| ExecError::Io {
        op: "locate executable",
        target: "self".to_string(),
        source,
    })
}
