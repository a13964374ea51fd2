//! Connection to one remote host that survives a dropped session
//!
//! `ConnectionManager` owns the session and its state machine. `Connection`
//! is the public surface: every operation first goes through
//! [`ConnectionManager::ensure_connected`] and then runs against the live
//! session.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelScope;
use crate::error::{ExecError, SessionError};
use crate::readahead::ReadAhead;
use crate::remote::RemoteExecutor;
use crate::result::{Credentials, TransferStats};
use crate::session::{Connector, DirEntry, RemoteSession};
use crate::ssh::SshConnector;
use crate::transfer::{DownloadReader, RemoteFileTransfer};

/// State of the managed session
#[derive(Clone)]
pub enum ConnectionState {
    /// No session yet, or the last one was lost and discarded
    Disconnected,
    /// Session established; still probed before each use
    Connected(Arc<dyn RemoteSession>),
    /// Closed explicitly; no further operations are allowed
    Closed,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Connected(session) => write!(f, "Connected({})", session.session_type()),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

/// Owns one authenticated session and rebuilds it once when it is lost
///
/// The state lock is only held to read or swap the state, never across a
/// network call. Two callers noticing the same loss may both reconnect; the
/// loser's session simply replaces the winner's.
pub struct ConnectionManager {
    credentials: Credentials,
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.credentials.target())
            .field("state", &self.state.try_lock().map(|s| s.clone()).ok())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager; nothing is dialed until first use
    pub fn new(credentials: Credentials, connector: Arc<dyn Connector>) -> Self {
        Self {
            credentials,
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Credentials this manager connects with
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Current state
    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.clone()
    }

    /// Establish a fresh session, replacing whatever was there
    ///
    /// # Errors
    /// Returns `ExecError::Connect` naming the failed stage, or
    /// `ExecError::Cancelled` if `scope` fires first
    #[instrument(skip(self, scope), fields(host = %self.credentials.host))]
    pub async fn connect(&self, scope: &CancelScope) -> Result<Arc<dyn RemoteSession>, ExecError> {
        if matches!(*self.state.lock().await, ConnectionState::Closed) {
            return Err(closed_error());
        }

        let session = match scope.run(self.connector.connect(&self.credentials)).await {
            Err(reason) => {
                return Err(ExecError::cancelled("connect", self.credentials.target(), reason));
            }
            Ok(result) => result?,
        };

        let mut state = self.state.lock().await;
        if matches!(*state, ConnectionState::Closed) {
            drop(state);
            close_quietly(session.as_ref(), &self.credentials.host).await;
            return Err(closed_error());
        }
        *state = ConnectionState::Connected(Arc::clone(&session));
        Ok(session)
    }

    /// Return a session that passed a liveness probe
    ///
    /// `Disconnected` connects. `Connected` is probed; a probe failure
    /// classified as session loss discards the session and reconnects
    /// exactly once, any other probe failure is returned as is.
    ///
    /// Both the probe and any reconnect are bounded by `scope`.
    ///
    /// # Errors
    /// Returns `ExecError::Connect` if (re)connecting fails,
    /// `ExecError::ConfigError` after `close`, `ExecError::Cancelled` when
    /// `scope` fires, or the probe error
    pub async fn ensure_connected(
        &self,
        scope: &CancelScope,
    ) -> Result<Arc<dyn RemoteSession>, ExecError> {
        let current = self.state.lock().await.clone();

        let session = match current {
            ConnectionState::Closed => return Err(closed_error()),
            ConnectionState::Disconnected => return self.connect(scope).await,
            ConnectionState::Connected(session) => session,
        };

        let probe = match scope.run(session.probe()).await {
            Err(reason) => {
                return Err(ExecError::cancelled("probe", self.credentials.target(), reason));
            }
            Ok(probe) => probe,
        };

        match probe {
            Ok(()) => Ok(session),
            Err(e) if e.is_session_lost() => {
                warn!(
                    host = %self.credentials.host,
                    error = %e,
                    "session lost, reconnecting"
                );
                self.discard(&session).await;
                self.connect(scope).await
            }
            Err(e) => Err(ExecError::session("probe", self.credentials.target(), e)),
        }
    }

    /// Drop `stale` if it is still the current session
    async fn discard(&self, stale: &Arc<dyn RemoteSession>) {
        {
            let mut state = self.state.lock().await;
            if let ConnectionState::Connected(current) = &*state
                && Arc::ptr_eq(current, stale)
            {
                *state = ConnectionState::Disconnected;
            }
        }
        close_quietly(stale.as_ref(), &self.credentials.host).await;
    }

    /// Close the session; calling it again is a no-op
    ///
    /// # Errors
    /// Returns the close failure unless it only says the session was
    /// already gone
    pub async fn close(&self) -> Result<(), ExecError> {
        let previous = std::mem::replace(&mut *self.state.lock().await, ConnectionState::Closed);
        let ConnectionState::Connected(session) = previous else {
            return Ok(());
        };

        match session.close().await {
            Ok(()) => Ok(()),
            Err(e) if is_already_closed(&e) => {
                debug!(host = %self.credentials.host, error = %e, "session already closed");
                Ok(())
            }
            Err(e) => Err(ExecError::session("close", self.credentials.target(), e)),
        }
    }
}

fn closed_error() -> ExecError {
    ExecError::ConfigError("connection is closed".to_string())
}

/// End-of-stream and already-closed failures are expected on close
fn is_already_closed(e: &SessionError) -> bool {
    e.is_session_lost()
}

async fn close_quietly(session: &dyn RemoteSession, host: &str) {
    if let Err(e) = session.close().await
        && !is_already_closed(&e)
    {
        warn!(host = %host, error = %e, "failed to close stale session");
    }
}

/// Connection-level API for one remote host
#[derive(Debug)]
pub struct Connection {
    manager: ConnectionManager,
    read_ahead: ReadAhead,
}

impl Connection {
    /// Wrap a connector; the first operation dials
    pub fn new(credentials: Credentials, connector: Arc<dyn Connector>) -> Self {
        Self {
            manager: ConnectionManager::new(credentials, connector),
            read_ahead: ReadAhead::default(),
        }
    }

    /// Connection over SSH, whatever the host resolves to
    #[must_use]
    pub fn for_host(credentials: Credentials) -> Self {
        Self::new(credentials, Arc::new(SshConnector::new()))
    }

    /// Connect eagerly and fail fast
    ///
    /// # Errors
    /// Returns `ExecError::Connect` naming the failed stage, or
    /// `ExecError::Cancelled` if `scope` fires first
    pub async fn open(
        credentials: Credentials,
        connector: Arc<dyn Connector>,
        scope: &CancelScope,
    ) -> Result<Self, ExecError> {
        let connection = Self::new(credentials, connector);
        connection.manager.connect(scope).await?;
        Ok(connection)
    }

    /// Set the upload read-ahead window
    #[must_use]
    pub fn with_read_ahead(mut self, read_ahead: ReadAhead) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    /// Underlying manager
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Host this connection targets
    #[must_use]
    pub fn host(&self) -> &str {
        &self.manager.credentials().host
    }

    async fn transfer(&self, scope: &CancelScope) -> Result<RemoteFileTransfer, ExecError> {
        let session = self.manager.ensure_connected(scope).await?;
        Ok(RemoteFileTransfer::new(session, self.read_ahead))
    }

    /// Run a short command remotely
    ///
    /// # Errors
    /// See [`RemoteExecutor::exec`]
    pub async fn exec(&self, cmd: &str, scope: &CancelScope) -> Result<Vec<u8>, ExecError> {
        let session = self.manager.ensure_connected(scope).await?;
        RemoteExecutor::new(session).exec(cmd, scope).await
    }

    /// List a remote directory
    ///
    /// # Errors
    /// See [`RemoteFileTransfer::list`]
    pub async fn list(&self, path: &str, scope: &CancelScope) -> Result<Vec<DirEntry>, ExecError> {
        self.transfer(scope).await?.list(path, scope).await
    }

    /// Stream `reader` into `dest_dir/name`
    ///
    /// # Errors
    /// See [`RemoteFileTransfer::upload`]
    pub async fn upload<R>(
        &self,
        reader: R,
        dest_dir: &str,
        name: &str,
        scope: &CancelScope,
    ) -> Result<TransferStats, ExecError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.transfer(scope)
            .await?
            .upload(reader, dest_dir, name, scope)
            .await
    }

    /// Open a streaming reader over a remote file
    ///
    /// # Errors
    /// See [`RemoteFileTransfer::download`]
    pub async fn download(&self, src_path: &str, scope: &CancelScope) -> Result<DownloadReader, ExecError> {
        self.transfer(scope).await?.download(src_path, scope).await
    }

    /// Remove a remote file or directory tree
    ///
    /// # Errors
    /// See [`RemoteFileTransfer::remove`]
    pub async fn remove(&self, path: &str, scope: &CancelScope) -> Result<(), ExecError> {
        self.transfer(scope).await?.remove(path, scope).await
    }

    /// Check whether a remote path exists
    ///
    /// # Errors
    /// See [`RemoteFileTransfer::is_exists`]
    pub async fn is_exists(&self, path: &str, scope: &CancelScope) -> Result<bool, ExecError> {
        self.transfer(scope).await?.is_exists(path, scope).await
    }

    /// Close the session
    ///
    /// # Errors
    /// See [`ConnectionManager::close`]
    pub async fn close(&self) -> Result<(), ExecError> {
        info!(host = %self.host(), "closing connection");
        self.manager.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectStage;
    use crate::keys::SecretKey;

    #[tokio::test]
    async fn test_loopback_host_still_goes_over_ssh() {
        // a forwarded port on loopback is a remote node, never this machine
        let credentials = Credentials::new("127.0.0.1", SecretKey::new("not a key"))
            .with_port(2222)
            .with_login("nobody");
        let conn = Connection::for_host(credentials);

        let err = conn
            .exec("echo ran-locally", &CancelScope::new())
            .await
            .unwrap_err();

        match err {
            ExecError::Connect { stage, target, .. } => {
                assert_eq!(stage, ConnectStage::Authentication);
                assert_eq!(target, "127.0.0.1:2222");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
