//! Result and value types shared across the crate

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::keys::{KeyError, KeySource, SecretKey};

/// Ordered lines captured from a process or remote command
///
/// Lines of one stream keep their order; interleaving between stdout and
/// stderr is whatever the readers observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput(Vec<String>);

impl CapturedOutput {
    /// Split raw bytes into lines, replacing invalid UTF-8
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(
            String::from_utf8_lossy(bytes)
                .lines()
                .map(str::to_string)
                .collect(),
        )
    }

    /// Captured lines
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.0
    }

    /// Whether nothing was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, line: String) {
        self.0.push(line);
    }
}

impl From<Vec<String>> for CapturedOutput {
    fn from(lines: Vec<String>) -> Self {
        Self(lines)
    }
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("\n"))
    }
}

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status code (-1 if the remote never reported one)
    pub status: i32,
    /// stdout and stderr bytes in arrival order
    pub output: Vec<u8>,
}

impl CommandOutput {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Byte counts reported by an upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes written to the destination
    pub bytes: u64,
    /// Largest number of bytes held in the read-ahead window at once
    pub peak_buffered: usize,
}

/// Login details for one remote host
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Host address
    pub host: String,
    /// Port (default 22)
    pub port: u16,
    /// Username
    pub login: String,
    /// Private key material
    pub key: SecretKey,
}

impl Credentials {
    /// Create credentials for `root@host:22`
    pub fn new(host: impl Into<String>, key: SecretKey) -> Self {
        Self {
            host: host.into(),
            port: 22,
            login: "root".to_string(),
            key,
        }
    }

    /// Read the key from `path` and build credentials
    ///
    /// # Errors
    /// Returns `KeyError` if the key file cannot be read
    pub fn from_key_file(
        host: impl Into<String>,
        port: u16,
        login: impl Into<String>,
        path: &Path,
    ) -> Result<Self, KeyError> {
        let key = KeySource::Path(path.to_path_buf()).load()?;
        Ok(Self {
            host: host.into(),
            port,
            login: login.into(),
            key,
        })
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set login
    #[must_use]
    pub fn with_login(mut self, login: impl Into<String>) -> Self {
        self.login = login.into();
        self
    }

    /// `host:port` for logs and errors
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
