//! Short remote command execution

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, instrument};

use crate::cancel::CancelScope;
use crate::error::ExecError;
use crate::result::CapturedOutput;
use crate::session::RemoteSession;
use crate::transfer::scoped;

/// Runs commands on the remote host and buffers their output
///
/// Meant for short control actions (chmod, starting or killing the agent);
/// the whole output is held in memory.
#[derive(Clone)]
pub struct RemoteExecutor {
    session: Arc<dyn RemoteSession>,
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("session", &self.session.session_type())
            .finish()
    }
}

impl RemoteExecutor {
    /// Wrap a session
    #[must_use]
    pub fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self { session }
    }

    /// Run `cmd` to completion and return combined stdout and stderr
    ///
    /// # Errors
    /// Returns `ExecError::ProcessExit` carrying the output when the command
    /// exits non-zero, or a session/cancellation error
    #[instrument(skip(self, scope))]
    pub async fn exec(&self, cmd: &str, scope: &CancelScope) -> Result<Vec<u8>, ExecError> {
        let start = Instant::now();
        let result = scoped(scope, "exec", cmd, self.session.exec(cmd)).await?;

        debug!(
            command = %cmd,
            status = result.status,
            duration = ?start.elapsed(),
            "remote command completed"
        );

        if !result.success() {
            error!(command = %cmd, status = result.status, "remote command failed");
            return Err(ExecError::ProcessExit {
                command: cmd.to_string(),
                code: result.status,
                output: CapturedOutput::from_bytes(&result.output),
            });
        }

        Ok(result.output)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::local::LocalSession;

    fn executor() -> RemoteExecutor {
        RemoteExecutor::new(Arc::new(LocalSession::new()))
    }

    #[tokio::test]
    async fn test_exec_returns_combined_output() {
        let out = executor()
            .exec("echo hello; echo oops >&2", &CancelScope::new())
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("hello"));
        assert!(text.contains("oops"));
    }

    #[tokio::test]
    async fn test_exec_failure_carries_output() {
        let err = executor()
            .exec("echo cannot chmod; exit 3", &CancelScope::new())
            .await
            .unwrap_err();

        match err {
            ExecError::ProcessExit { code, output, .. } => {
                assert_eq!(code, 3);
                assert_eq!(output.lines(), ["cannot chmod"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_exec_deadline() {
        let err = executor()
            .exec("sleep 5", &CancelScope::with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
    }
}
