//! vmimport-exec: Remote and local execution for VM import
//!
//! Connection management with single-reconnect recovery, streaming file
//! transfer over SFTP, remote command execution and local subprocess
//! running, all bounded by a cancellation scope.

pub mod cancel;
pub mod connection;
pub mod error;
pub mod keys;
pub mod local;
pub mod node;
pub mod process;
pub mod readahead;
pub mod remote;
pub mod result;
pub mod session;
pub mod ssh;
pub mod transfer;

pub use cancel::{CancelReason, CancelScope};
pub use connection::{Connection, ConnectionManager, ConnectionState};
pub use error::{ConnectStage, ExecError, SessionError};
pub use keys::{KeyError, KeySource, SecretKey};
pub use local::{LocalConnector, LocalSession};
pub use node::{AGENT_REMOTE_PATH, NodeConnection};
pub use process::{
    LineLogger, LocalProcessRunner, NoopLineLogger, OutputStream, ProcessBuilder, ProcessOutput,
    ProcessState, TracingLineLogger,
};
pub use readahead::{MIB, ReadAhead};
pub use remote::RemoteExecutor;
pub use result::{CapturedOutput, CommandOutput, Credentials, TransferStats};
pub use session::{Connector, DirEntry, FileKind, FileStat, RemoteSession};
pub use ssh::{SshConnector, SshSession};
pub use transfer::{DownloadReader, RemoteFileTransfer};
