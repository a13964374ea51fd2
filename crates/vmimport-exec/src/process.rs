//! Local subprocess execution with concurrent output capture
//!
//! stdout and stderr are read through separate pipes by two tasks. Some
//! tools (disk converters in particular) hang when both streams are merged
//! into one, so they are never combined at the pipe level.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{AbortOnDrop, CancelReason, CancelScope};
use crate::error::ExecError;
use crate::result::CapturedOutput;

/// Signal sent when the scope fires
const SIGKILL: i32 = 9;

/// How long to wait for pipes to drain after killing the process
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Per-invocation logging capability
///
/// Implementations must not fail; logging is best effort.
pub trait LineLogger: Send + Sync {
    /// Process is about to start
    fn started(&self, command: &str);
    /// One captured output line
    fn line(&self, command: &str, stream: OutputStream, line: &str);
    /// Process finished (successfully or not)
    fn finished(&self, command: &str, elapsed: Duration);
}

/// Logs through `tracing` at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLineLogger;

impl LineLogger for TracingLineLogger {
    fn started(&self, command: &str) {
        info!(command = %command, "start executing");
    }

    fn line(&self, command: &str, stream: OutputStream, line: &str) {
        info!(command = %command, %stream, "{line}");
    }

    fn finished(&self, command: &str, elapsed: Duration) {
        info!(command = %command, elapsed = ?elapsed, "command executed");
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLineLogger;

impl LineLogger for NoopLineLogger {
    fn started(&self, _command: &str) {}
    fn line(&self, _command: &str, _stream: OutputStream, _line: &str) {}
    fn finished(&self, _command: &str, _elapsed: Duration) {}
}

/// Lifecycle of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Succeeded,
    /// Non-zero exit code that the caller declared acceptable
    SucceededIgnoredExit,
    Failed,
    /// Stopped by the cancellation scope
    Cancelled,
}

impl ProcessState {
    /// Terminal state implied by an error from [`ProcessBuilder::exec`]
    #[must_use]
    pub fn from_error(err: &ExecError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Failed
        }
    }
}

/// Successful result of [`ProcessBuilder::exec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `Succeeded` or `SucceededIgnoredExit`
    pub state: ProcessState,
    /// Exit code
    pub code: i32,
    /// Combined captured output
    pub output: CapturedOutput,
}

/// Entry point for building local process invocations
#[derive(Clone)]
pub struct LocalProcessRunner {
    logger: Arc<dyn LineLogger>,
}

impl fmt::Debug for LocalProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProcessRunner").finish_non_exhaustive()
    }
}

impl Default for LocalProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProcessRunner {
    /// Runner that logs through `tracing`
    #[must_use]
    pub fn new() -> Self {
        Self {
            logger: Arc::new(TracingLineLogger),
        }
    }

    /// Runner whose invocations default to `logger`
    #[must_use]
    pub fn with_logger(logger: Arc<dyn LineLogger>) -> Self {
        Self { logger }
    }

    /// Start configuring an invocation of `program`
    pub fn build<I, S>(&self, program: impl Into<String>, args: I) -> ProcessBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessBuilder {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            stdin: None,
            stdout: None,
            scope: CancelScope::new(),
            logger: Arc::clone(&self.logger),
            ignore_exit_codes: Vec::new(),
        }
    }
}

/// One configured process invocation; consumed by [`ProcessBuilder::exec`]
pub struct ProcessBuilder {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    scope: CancelScope,
    logger: Arc<dyn LineLogger>,
    ignore_exit_codes: Vec<i32>,
}

impl fmt::Debug for ProcessBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBuilder")
            .field("command", &self.command_line())
            .field("env", &self.env)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("ignore_exit_codes", &self.ignore_exit_codes)
            .finish_non_exhaustive()
    }
}

impl ProcessBuilder {
    /// Set the cancellation/deadline scope
    #[must_use]
    pub fn with_scope(mut self, scope: CancelScope) -> Self {
        self.scope = scope;
        self
    }

    /// Replace the argument list
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add environment variables on top of the inherited environment
    #[must_use]
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Feed `reader` to the process's stdin
    #[must_use]
    pub fn with_stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    /// Forward raw stdout bytes to `writer` as they are read
    #[must_use]
    pub fn with_stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    /// Use a specific logger for this invocation
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn LineLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Suppress informational logging for this invocation
    #[must_use]
    pub fn with_no_info_log(self) -> Self {
        self.with_logger(Arc::new(NoopLineLogger))
    }

    /// Treat these non-zero exit codes as success
    #[must_use]
    pub fn with_ignore_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.ignore_exit_codes = codes.into_iter().collect();
        self
    }

    /// Program and arguments joined for logs and errors
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run the process to completion
    ///
    /// # Errors
    /// - `ExecError::Spawn` if the process cannot start
    /// - `ExecError::Cancelled` (deadline exceeded) if the scope killed it, or
    ///   if the scope fired while an otherwise successful process exited
    /// - `ExecError::ProcessExit` with the captured output for any exit code
    ///   that is neither 0 nor declared acceptable
    #[instrument(skip(self), fields(command = %self.command_line()))]
    pub async fn exec(self) -> Result<ProcessOutput, ExecError> {
        let command = self.command_line();
        let logger = Arc::clone(&self.logger);

        let start = Instant::now();
        logger.started(&command);
        let result = self.run(&command).await;
        logger.finished(&command, start.elapsed());

        let state = match &result {
            Ok(out) => out.state,
            Err(e) => ProcessState::from_error(e),
        };
        debug!(command = %command, ?state, "process finished");
        result
    }

    async fn run(self, command_line: &str) -> Result<ProcessOutput, ExecError> {
        let Self {
            program,
            args,
            env,
            stdin,
            stdout: sink,
            scope,
            logger,
            ignore_exit_codes,
        } = self;

        let mut state = ProcessState::NotStarted;
        transition(command_line, &mut state, ProcessState::Starting);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: command_line.to_string(),
            source,
        })?;
        transition(command_line, &mut state, ProcessState::Running);

        let _stdin_task = match (stdin, child.stdin.take()) {
            (Some(mut input), Some(mut pipe)) => Some(AbortOnDrop(tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut input, &mut pipe).await {
                    debug!(error = %e, "stdin copy stopped");
                }
                let _ = pipe.shutdown().await;
            }))),
            _ => None,
        };

        let (Some(out_pipe), Some(err_pipe)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExecError::ConfigError(format!(
                "{command_line}: output pipes unavailable"
            )));
        };

        let captured = Arc::new(Mutex::new(CapturedOutput::default()));
        let command: Arc<str> = Arc::from(command_line);
        let mut out_task = tokio::spawn(read_lines(
            out_pipe,
            OutputStream::Stdout,
            sink,
            Arc::clone(&captured),
            Arc::clone(&logger),
            Arc::clone(&command),
        ));
        let mut err_task = tokio::spawn(read_lines(
            err_pipe,
            OutputStream::Stderr,
            None,
            Arc::clone(&captured),
            Arc::clone(&logger),
            Arc::clone(&command),
        ));

        // Both readers must finish before waiting on exit so no output is lost.
        let cancelled = {
            let readers = async {
                let _ = tokio::join!(&mut out_task, &mut err_task);
            };
            tokio::pin!(readers);

            let cancelled = tokio::select! {
                biased;
                () = &mut readers => None,
                reason = scope.cancelled() => Some(reason),
            };

            if let Some(reason) = cancelled {
                warn!(command = %command_line, %reason, "killing process");
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "kill failed, process already exited");
                }
                if tokio::time::timeout(KILL_GRACE, &mut readers).await.is_err() {
                    warn!(command = %command_line, "output pipes still open after kill");
                }
            }
            cancelled
        };
        out_task.abort();
        err_task.abort();

        let status = child.wait().await.map_err(|source| ExecError::Io {
            op: "wait",
            target: command_line.to_string(),
            source,
        })?;

        let output = std::mem::take(&mut *captured.lock().unwrap_or_else(PoisonError::into_inner));

        if cancelled.is_some() && status.signal() == Some(SIGKILL) {
            transition(command_line, &mut state, ProcessState::Cancelled);
            return Err(ExecError::Cancelled {
                op: "exec",
                target: command_line.to_string(),
                reason: CancelReason::DeadlineExceeded,
                source: Some(io::Error::other(format!("process terminated: {status}"))),
            });
        }

        let code = status.code().unwrap_or(-1);
        let next = match status.code() {
            Some(0) => ProcessState::Succeeded,
            Some(c) if ignore_exit_codes.contains(&c) => ProcessState::SucceededIgnoredExit,
            _ => {
                transition(command_line, &mut state, ProcessState::Failed);
                return Err(ExecError::ProcessExit {
                    command: command_line.to_string(),
                    code,
                    output,
                });
            }
        };

        // a late cancellation still wins over a fast exit
        if let Err(reason) = scope.check() {
            transition(command_line, &mut state, ProcessState::Cancelled);
            return Err(ExecError::cancelled("exec", command_line, reason));
        }

        transition(command_line, &mut state, next);
        Ok(ProcessOutput {
            state: next,
            code,
            output,
        })
    }
}

fn transition(command: &str, state: &mut ProcessState, next: ProcessState) {
    debug!(command = %command, from = ?*state, to = ?next, "process state");
    *state = next;
}

/// Read one pipe line by line until EOF
///
/// Every line is appended to `captured`; stdout lines are also forwarded
/// byte for byte (newline included) to `sink`. A failing sink is dropped
/// with a warning and capture continues.
async fn read_lines<R>(
    pipe: R,
    stream: OutputStream,
    mut sink: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    captured: Arc<Mutex<CapturedOutput>>,
    logger: Arc<dyn LineLogger>,
    command: Arc<str>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(command = %command, %stream, error = %e, "failed to read output");
                break;
            }
        }

        let line = String::from_utf8_lossy(strip_newline(&buf)).into_owned();
        logger.line(&command, stream, &line);

        if let Some(writer) = sink.as_mut()
            && let Err(e) = writer.write_all(&buf).await
        {
            warn!(command = %command, error = %e, "output sink failed, detaching it");
            sink = None;
        }

        captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    if let Some(writer) = sink.as_mut()
        && let Err(e) = writer.flush().await
    {
        warn!(command = %command, error = %e, "failed to flush output sink");
    }
}

fn strip_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> LocalProcessRunner {
        LocalProcessRunner::new()
    }

    #[tokio::test]
    async fn test_exec_success_captures_output() {
        let out = runner()
            .build("sh", ["-c", "echo one; echo two"])
            .exec()
            .await
            .unwrap();

        assert_eq!(out.state, ProcessState::Succeeded);
        assert_eq!(out.code, 0);
        assert_eq!(out.output.lines(), ["one", "two"]);
    }

    #[tokio::test]
    async fn test_ignored_exit_code_is_success() {
        let out = runner()
            .build("sh", ["-c", "exit 3"])
            .with_ignore_exit_codes([3])
            .exec()
            .await
            .unwrap();

        assert_eq!(out.state, ProcessState::SucceededIgnoredExit);
        assert_eq!(out.code, 3);
    }

    #[tokio::test]
    async fn test_undeclared_exit_code_fails_with_output() {
        let err = runner()
            .build("sh", ["-c", "echo first; echo second; exit 3"])
            .with_ignore_exit_codes([1, 2])
            .exec()
            .await
            .unwrap_err();

        match err {
            ExecError::ProcessExit { code, output, .. } => {
                assert_eq!(code, 3);
                assert_eq!(output.lines(), ["first", "second"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_streams_are_captured_and_stdout_forwarded() {
        let (sink, mut sink_reader) = tokio::io::duplex(4096);
        let out = runner()
            .build("sh", ["-c", "echo A; echo C >&2; echo B"])
            .with_stdout(sink)
            .exec()
            .await
            .unwrap();

        let lines = out.output.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&"C".to_string()));
        let a = lines.iter().position(|l| l == "A").unwrap();
        let b = lines.iter().position(|l| l == "B").unwrap();
        assert!(a < b);

        let mut forwarded = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut sink_reader, &mut forwarded)
            .await
            .unwrap();
        assert_eq!(forwarded, b"A\nB\n");
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let started = Instant::now();
        let err = runner()
            .build("sleep", ["30"])
            .with_scope(CancelScope::with_timeout(Duration::from_millis(200)))
            .exec()
            .await
            .unwrap_err();

        assert!(err.is_deadline_exceeded());
        assert_eq!(ProcessState::from_error(&err), ProcessState::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("process terminated"));
    }

    #[tokio::test]
    async fn test_cancelled_process_is_reaped() {
        let (sink, mut sink_reader) = tokio::io::duplex(4096);
        let err = runner()
            .build("sh", ["-c", "echo $$; exec sleep 30"])
            .with_stdout(sink)
            .with_scope(CancelScope::with_timeout(Duration::from_millis(300)))
            .exec()
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());

        let mut forwarded = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut sink_reader, &mut forwarded)
            .await
            .unwrap();
        let pid = forwarded.trim();
        assert!(!pid.is_empty());

        let alive = std::process::Command::new("sh")
            .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
            .status()
            .unwrap();
        assert!(!alive.success(), "process {pid} still running");
    }

    #[tokio::test]
    async fn test_late_cancellation_is_reported() {
        let scope = CancelScope::new();
        scope.cancel();
        // `true` exits immediately; the already-fired scope must still surface
        let err = runner()
            .build("true", Vec::<String>::new())
            .with_scope(scope)
            .exec()
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_stdin_and_env() {
        let out = runner()
            .build("sh", ["-c", "cat; echo \"$VMIMPORT_TEST_VAR\""])
            .with_env([("VMIMPORT_TEST_VAR", "from-env")])
            .with_stdin(std::io::Cursor::new(b"from-stdin\n".to_vec()))
            .with_no_info_log()
            .exec()
            .await
            .unwrap();

        assert_eq!(out.output.lines(), ["from-stdin", "from-env"]);
    }

    #[tokio::test]
    async fn test_with_args_replaces_arguments() {
        let out = runner()
            .build("echo", ["ignored"])
            .with_args(["replaced"])
            .exec()
            .await
            .unwrap();
        assert_eq!(out.output.lines(), ["replaced"]);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = runner()
            .build("/nonexistent/vmimport-binary", Vec::<String>::new())
            .exec()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
