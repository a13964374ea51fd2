//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{WrapErr, eyre};
use serde::{Deserialize, Serialize};
use vmimport_exec::{AGENT_REMOTE_PATH, MIB, ReadAhead};

/// Top-level configuration for vmimport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node to import onto
    #[serde(default)]
    pub source: SourceConfig,
    /// Agent placement and deadlines
    #[serde(default)]
    pub agent: AgentConfig,
    /// Upload tuning
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

/// SSH target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Hostname or IP address; required
    pub host: Option<String>,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH username
    #[serde(default = "default_login")]
    pub login: String,
    /// Private key file; must not be readable by group or others
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            login: default_login(),
            private_key: default_private_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Where the agent is placed on the node
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    /// Local agent binary; defaults to the running executable
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            remote_path: default_remote_path(),
            binary: None,
            upload_timeout_secs: default_upload_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

impl AgentConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Read-ahead window used for uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in MiB
    #[serde(default = "default_chunk_mib")]
    pub chunk_mib: usize,
    /// Chunks prefetched at once
    #[serde(default = "default_chunks")]
    pub chunks: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_mib: default_chunk_mib(),
            chunks: default_chunks(),
        }
    }
}

impl TransferConfig {
    pub fn read_ahead(&self) -> ReadAhead {
        ReadAhead::new(self.chunk_mib.saturating_mul(MIB), self.chunks)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_login() -> String {
    "root".to_string()
}

fn default_private_key() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".ssh/id_rsa")
}

fn default_remote_path() -> String {
    AGENT_REMOTE_PATH.to_string()
}

fn default_upload_timeout() -> u64 {
    10 * 60
}

fn default_download_timeout() -> u64 {
    60
}

fn default_chunk_mib() -> usize {
    64
}

fn default_chunks() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, then the default paths, or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be loaded
    pub fn load_default(explicit: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var("VMIMPORT_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let mut paths = vec![
            PathBuf::from("vmimport.toml"),
            PathBuf::from("/etc/vmimport/vmimport.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("vmimport/vmimport.toml"));
        }

        for path in paths {
            if path.exists() {
                return Self::load(&path);
            }
        }

        // logging is not installed yet at this point
        Ok(Config::default())
    }

    /// Configured host, failing when none was given
    ///
    /// # Errors
    /// Returns error if `source.host` is unset
    pub fn host(&self) -> eyre::Result<&str> {
        self.source
            .host
            .as_deref()
            .ok_or_else(|| eyre!("source.host is not set (config file or --host)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.source.port, 22);
        assert_eq!(config.source.login, "root");
        assert_eq!(config.agent.remote_path, "/tmp/import-agent");
        assert_eq!(config.agent.upload_timeout(), Duration::from_secs(600));
        assert_eq!(config.agent.download_timeout(), Duration::from_secs(60));
        assert_eq!(config.transfer.read_ahead(), ReadAhead::default());
        assert_eq!(config.log.level, "info");
        assert!(config.host().is_err());
    }

    #[test]
    fn test_parse_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [source]
            host = "10.0.0.5"
            private_key = "/etc/vmimport/id_ed25519"

            [transfer]
            chunk_mib = 8

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.host().unwrap(), "10.0.0.5");
        assert_eq!(config.source.port, 22);
        assert_eq!(
            config.source.private_key,
            PathBuf::from("/etc/vmimport/id_ed25519")
        );
        assert_eq!(config.transfer.read_ahead(), ReadAhead::new(8 * MIB, 4));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.agent.upload_timeout_secs, 600);
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmimport.toml");
        std::fs::write(&path, "[source]\nhost = \"node1\"\nport = 2222\n").unwrap();

        let config = Config::load_default(Some(&path)).unwrap();
        assert_eq!(config.host().unwrap(), "node1");
        assert_eq!(config.source.port, 2222);
    }

    #[test]
    fn test_load_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[source\nhost = ").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err}").contains("failed to parse config"));
    }
}
