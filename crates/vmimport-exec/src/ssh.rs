//! SSH sessions using the russh and russh-sftp crates

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key::{self, Algorithm, HashAlg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConnectStage, ExecError, SessionError};
use crate::keys::KeyError;
use crate::result::{CommandOutput, Credentials};
use crate::session::{
    Connector, DirEntry, FileKind, FileStat, RemoteReader, RemoteSession, RemoteWriter, join_path,
};

/// Time allowed for TCP dial plus SSH handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host identity is NOT verified (like StrictHostKeyChecking=no).
        // Only acceptable on a controlled operational network.
        Ok(true)
    }
}

/// Opens SSH sessions with an SFTP channel
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl SshConnector {
    /// Create a connector with default timeouts
    #[must_use]
    pub fn new() -> Self {
        let config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..client::Config::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the dial and handshake timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn authenticate(
        handle: &mut client::Handle<SshClientHandler>,
        credentials: &Credentials,
        key: PrivateKey,
    ) -> Result<(), SessionError> {
        let key = Arc::new(key);

        for hash_alg in signature_candidates(&key) {
            debug!(
                host = %credentials.host,
                algorithm = ?hash_alg,
                "offering public key"
            );
            let auth_res = handle
                .authenticate_publickey(
                    &credentials.login,
                    PrivateKeyWithHashAlg::new(Arc::clone(&key), hash_alg),
                )
                .await?;

            if auth_res.success() {
                return Ok(());
            }
        }

        Err(SessionError::Rejected(
            "public key authentication failed".to_string(),
        ))
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Signature variants to offer, strongest first
///
/// RSA keys are offered as rsa-sha2-512, rsa-sha2-256 and then legacy
/// ssh-rsa so servers that disabled SHA-1 still accept them. Other key
/// families have a single signature scheme.
fn signature_candidates(key: &PrivateKey) -> Vec<Option<HashAlg>> {
    if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
        vec![Some(HashAlg::Sha512), Some(HashAlg::Sha256), None]
    } else {
        vec![None]
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip(self, credentials), fields(host = %credentials.host))]
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, ExecError> {
        let target = credentials.target();
        let fail = |stage, source| ExecError::Connect {
            target: target.clone(),
            stage,
            source,
        };

        let key = decode_secret_key(credentials.key.expose(), None).map_err(|e| {
            fail(
                ConnectStage::Authentication,
                SessionError::Key(KeyError::Parse(e.to_string())),
            )
        })?;

        info!(
            host = %credentials.host,
            port = credentials.port,
            login = %credentials.login,
            "connecting to SSH"
        );
        warn!(host = %credentials.host, "host key verification is disabled");

        let dial = client::connect(
            Arc::clone(&self.config),
            (credentials.host.as_str(), credentials.port),
            SshClientHandler,
        );
        let mut handle = match timeout(self.connect_timeout, dial).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(fail(ConnectStage::Transport, SessionError::Ssh(e))),
            Err(_) => {
                return Err(fail(
                    ConnectStage::Transport,
                    SessionError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no handshake within {:?}", self.connect_timeout),
                    )),
                ));
            }
        };

        Self::authenticate(&mut handle, credentials, key)
            .await
            .map_err(|e| fail(ConnectStage::Authentication, e))?;

        let sftp = open_sftp(&handle)
            .await
            .map_err(|e| fail(ConnectStage::Session, e))?;

        info!(host = %credentials.host, "SSH connected and authenticated");

        Ok(Arc::new(SshSession {
            host: credentials.host.clone(),
            handle,
            sftp,
        }))
    }
}

async fn open_sftp(handle: &client::Handle<SshClientHandler>) -> Result<SftpSession, SessionError> {
    let channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    Ok(SftpSession::new(channel.into_stream()).await?)
}

/// One SSH transport plus its SFTP channel
pub struct SshSession {
    host: String,
    handle: client::Handle<SshClientHandler>,
    sftp: SftpSession,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.host)
            .field("closed", &self.handle.is_closed())
            .finish_non_exhaustive()
    }
}

fn file_stat(attrs: &FileAttributes) -> FileStat {
    let kind = if attrs.is_dir() {
        FileKind::Dir
    } else if attrs.is_regular() {
        FileKind::File
    } else {
        FileKind::Other
    };
    FileStat {
        kind,
        size: attrs.size,
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn probe(&self) -> Result<(), SessionError> {
        if self.handle.is_closed() {
            return Err(SessionError::Lost("SSH transport closed".to_string()));
        }
        self.sftp.canonicalize(".").await?;
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn exec(&self, cmd: &str) -> Result<CommandOutput, SessionError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, cmd).await?;

        let mut status = -1;
        let mut output = Vec::new();

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    output.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = exit_status.cast_signed();
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!(command = %cmd, signal = ?signal_name, "remote command killed by signal");
                }
                Some(_) => {}
                None => break,
            }
        }

        debug!(command = %cmd, status, "remote command completed");
        Ok(CommandOutput { status, output })
    }

    async fn stat(&self, path: &str) -> Result<FileStat, SessionError> {
        let attrs = self.sftp.metadata(path).await?;
        Ok(file_stat(&attrs))
    }

    async fn lstat(&self, path: &str) -> Result<FileStat, SessionError> {
        let attrs = self.sftp.symlink_metadata(path).await?;
        Ok(file_stat(&attrs))
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), SessionError> {
        let mut current = if path.starts_with('/') {
            "/".to_string()
        } else {
            String::new()
        };

        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = join_path(&current, component);
            match self.sftp.metadata(current.as_str()).await {
                Ok(attrs) if attrs.is_dir() => {}
                Ok(_) => {
                    return Err(SessionError::Rejected(format!(
                        "{current} exists and is not a directory"
                    )));
                }
                Err(e) => {
                    let e = SessionError::from(e);
                    if !e.is_not_found() {
                        return Err(e);
                    }
                    self.sftp.create_dir(current.as_str()).await?;
                }
            }
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SessionError> {
        let entries = self.sftp.read_dir(path).await?;
        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| DirEntry {
                name: entry.file_name(),
                stat: file_stat(&entry.metadata()),
            })
            .collect())
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SessionError> {
        let file = self.sftp.create(path).await?;
        Ok(Box::new(file))
    }

    async fn open(&self, path: &str) -> Result<RemoteReader, SessionError> {
        let file = self.sftp.open(path).await?;
        Ok(Box::new(file))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SessionError> {
        self.sftp.remove_file(path).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SessionError> {
        self.sftp.remove_dir(path).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let sftp_result = self.sftp.close().await;
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        sftp_result?;
        info!(host = %self.host, "SSH disconnected");
        Ok(())
    }

    fn session_type(&self) -> &'static str {
        "ssh"
    }
}
