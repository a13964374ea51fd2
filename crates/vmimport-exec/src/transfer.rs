//! Streaming upload and download over a remote session

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelReason, CancelScope};
use crate::error::{ExecError, SessionError};
use crate::readahead::{self, CopyError, ReadAhead};
use crate::result::TransferStats;
use crate::session::{DirEntry, RemoteReader, RemoteSession, join_path};

/// Chunks queued between the download pump and the reader
const PIPE_DEPTH: usize = 8;

/// Bytes read from the remote file per pump iteration
const PUMP_CHUNK: usize = 256 * 1024;

/// Run one session call under `scope`, classifying failures for `op` on `target`
pub(crate) async fn scoped<T, F>(
    scope: &CancelScope,
    op: &'static str,
    target: &str,
    fut: F,
) -> Result<T, ExecError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    match scope.run(fut).await {
        Err(reason) => Err(ExecError::cancelled(op, target, reason)),
        Ok(Err(e)) => Err(ExecError::session(op, target, e)),
        Ok(Ok(value)) => Ok(value),
    }
}

/// File operations against one live session
#[derive(Clone)]
pub struct RemoteFileTransfer {
    session: Arc<dyn RemoteSession>,
    read_ahead: ReadAhead,
}

impl std::fmt::Debug for RemoteFileTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFileTransfer")
            .field("session", &self.session.session_type())
            .field("read_ahead", &self.read_ahead)
            .finish()
    }
}

impl RemoteFileTransfer {
    /// Wrap a session
    #[must_use]
    pub fn new(session: Arc<dyn RemoteSession>, read_ahead: ReadAhead) -> Self {
        Self {
            session,
            read_ahead,
        }
    }

    /// Stream `reader` into `dest_dir/name`
    ///
    /// `dest_dir` is created when missing. An existing non-directory at that
    /// path fails with [`ExecError::NotADirectory`] before any byte moves.
    ///
    /// # Errors
    /// Returns `ExecError` on validation, session, I/O failure or cancellation
    #[instrument(skip(self, reader, scope))]
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
        self.ensure_directory(dest_dir, scope).await?;

        let path = join_path(dest_dir, name);
        info!(path = %path, "start upload");

        let mut file = scoped(scope, "create", &path, self.session.create(&path)).await?;

        let stats = readahead::copy(reader, &mut file, self.read_ahead, scope)
            .await
            .map_err(|e| match e {
                CopyError::Cancelled(reason) => ExecError::cancelled("upload", &path, reason),
                CopyError::Read(source) => ExecError::from_io("read upload source", &path, source),
                CopyError::Write(source) => ExecError::from_io("write", &path, source),
            })?;

        info!(path = %path, bytes = stats.bytes, "upload finished");
        Ok(stats)
    }

    async fn ensure_directory(&self, path: &str, scope: &CancelScope) -> Result<(), ExecError> {
        match scoped(scope, "stat", path, self.session.stat(path)).await {
            Ok(stat) if stat.is_dir() => Ok(()),
            Ok(_) => Err(ExecError::NotADirectory {
                op: "upload",
                path: path.to_string(),
            }),
            Err(ExecError::NotFound { .. }) => {
                debug!(path = %path, "creating destination directory");
                scoped(scope, "mkdir", path, self.session.mkdir_all(path)).await
            }
            Err(e) => Err(e),
        }
    }

    /// Open a pull-style reader over a remote regular file
    ///
    /// A background pump copies the remote file into a pipe; the returned
    /// reader drains it at the caller's pace. When `scope` fires the reader
    /// fails with the cancellation reason on its next poll.
    ///
    /// # Errors
    /// Returns `ExecError::NotFound` or `ExecError::NotAFile` when the source
    /// is not a regular file, before anything is opened
    #[instrument(skip(self, scope))]
    pub async fn download(
        &self,
        src_path: &str,
        scope: &CancelScope,
    ) -> Result<DownloadReader, ExecError> {
        let stat = scoped(scope, "stat", src_path, self.session.stat(src_path)).await?;
        if !stat.is_file() {
            return Err(ExecError::NotAFile {
                op: "download",
                path: src_path.to_string(),
            });
        }

        let file = scoped(scope, "open", src_path, self.session.open(src_path)).await?;
        info!(path = %src_path, size = ?stat.size, "start download");

        let (tx, mut rx) = mpsc::channel(PIPE_DEPTH);
        let pump = tokio::spawn(pump(file, tx, scope.clone(), src_path.to_string()));

        let chunks: BoxStream<'static, io::Result<Bytes>> =
            stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();
        let watch = scope.clone();

        Ok(DownloadReader {
            inner: StreamReader::new(chunks),
            cancelled: Some(Box::pin(async move { watch.cancelled().await })),
            fired: None,
            pump,
        })
    }

    /// Remove a file or a whole directory tree
    ///
    /// A missing path is success. Directories are walked depth-first with an
    /// explicit worklist: files are removed as they are found, each directory
    /// once all of its children are gone.
    ///
    /// # Errors
    /// Returns `ExecError` if any entry cannot be stat'ed, listed or removed
    #[instrument(skip(self, scope))]
    pub async fn remove(&self, path: &str, scope: &CancelScope) -> Result<(), ExecError> {
        // a symlink is removed itself, never the tree it points to
        let stat = match scoped(scope, "stat", path, self.session.lstat(path)).await {
            Ok(stat) => stat,
            Err(ExecError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        if !stat.is_dir() {
            return scoped(scope, "remove", path, self.session.remove_file(path)).await;
        }

        // (directory, children already queued)
        let mut worklist = vec![(path.to_string(), false)];
        while let Some((dir, expanded)) = worklist.pop() {
            if expanded {
                scoped(scope, "remove directory", &dir, self.session.remove_dir(&dir)).await?;
                continue;
            }

            worklist.push((dir.clone(), true));
            let entries = scoped(scope, "read directory", &dir, self.session.read_dir(&dir)).await?;
            for entry in entries {
                let child = join_path(&dir, &entry.name);
                if entry.stat.is_dir() {
                    worklist.push((child, false));
                } else {
                    scoped(scope, "remove", &child, self.session.remove_file(&child)).await?;
                }
            }
        }

        debug!(path = %path, "removed directory tree");
        Ok(())
    }

    /// List a directory
    ///
    /// # Errors
    /// Returns `ExecError::NotADirectory` when `path` is not a directory
    pub async fn list(&self, path: &str, scope: &CancelScope) -> Result<Vec<DirEntry>, ExecError> {
        let stat = scoped(scope, "stat", path, self.session.stat(path)).await?;
        if !stat.is_dir() {
            return Err(ExecError::NotADirectory {
                op: "list",
                path: path.to_string(),
            });
        }
        scoped(scope, "read directory", path, self.session.read_dir(path)).await
    }

    /// Check whether a path exists
    ///
    /// # Errors
    /// Returns `ExecError` for failures other than not-found
    pub async fn is_exists(&self, path: &str, scope: &CancelScope) -> Result<bool, ExecError> {
        match scoped(scope, "stat", path, self.session.stat(path)).await {
            Ok(_) => Ok(true),
            Err(ExecError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Copy the remote file into the pipe until EOF, error, cancellation or the
/// reader going away. Dropping `tx` on return closes the write end.
async fn pump(
    mut file: RemoteReader,
    tx: mpsc::Sender<io::Result<Bytes>>,
    scope: CancelScope,
    path: String,
) {
    let mut buf = vec![0u8; PUMP_CHUNK];
    loop {
        let read = tokio::select! {
            biased;
            reason = scope.cancelled() => {
                debug!(path = %path, %reason, "download pump cancelled");
                let _ = tx.try_send(Err(reason.into_io()));
                return;
            }
            read = file.read(&mut buf) => read,
        };

        let item = match read {
            Ok(0) => {
                debug!(path = %path, "download pump reached EOF");
                return;
            }
            Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                warn!(path = %path, error = %e, "download pump read failed");
                Err(e)
            }
        };
        let failed = item.is_err();

        tokio::select! {
            biased;
            reason = scope.cancelled() => {
                let _ = tx.try_send(Err(reason.into_io()));
                return;
            }
            sent = tx.send(item) => {
                if sent.is_err() || failed {
                    return;
                }
            }
        }
    }
}

/// Reader end of a download pipe
///
/// Dropping it stops the background pump.
pub struct DownloadReader {
    inner: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    cancelled: Option<Pin<Box<dyn Future<Output = CancelReason> + Send>>>,
    fired: Option<CancelReason>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for DownloadReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadReader")
            .field("fired", &self.fired)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for DownloadReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(watch) = this.cancelled.as_mut()
            && let Poll::Ready(reason) = watch.as_mut().poll(cx)
        {
            this.fired = Some(reason);
            this.cancelled = None;
        }
        if let Some(reason) = this.fired {
            return Poll::Ready(Err(reason.into_io()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl Drop for DownloadReader {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
