//! Bounded read-ahead copy
//!
//! A prefetch task reads fixed-size chunks from the source while the caller
//! writes earlier chunks to the destination. The channel between them caps
//! how many chunks exist at once, so memory stays bounded regardless of the
//! total size.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::{AbortOnDrop, CancelReason, CancelScope};
use crate::result::TransferStats;

/// Bytes in one mebibyte
pub const MIB: usize = 1024 * 1024;

/// Smallest growth step of a chunk buffer
const FILL_STEP: usize = 64 * 1024;

/// Read-ahead window: `chunks` buffers of `chunk_size` bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAhead {
    /// Size of one prefetched chunk in bytes
    pub chunk_size: usize,
    /// Number of chunks that may be prefetched
    pub chunks: usize,
}

impl Default for ReadAhead {
    fn default() -> Self {
        Self {
            chunk_size: 64 * MIB,
            chunks: 4,
        }
    }
}

impl ReadAhead {
    /// Create a window of at least one byte per chunk and two chunks, so
    /// reading and writing can overlap
    #[must_use]
    pub fn new(chunk_size: usize, chunks: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunks: chunks.max(2),
        }
    }

    /// Nominal window size in bytes
    #[must_use]
    pub fn window(&self) -> usize {
        self.chunk_size.saturating_mul(self.chunks)
    }

    /// Upper bound on bytes buffered at once
    ///
    /// The chunk being written and the chunk being filled both count
    /// against the window.
    #[must_use]
    pub fn max_buffered(&self) -> usize {
        self.window()
    }
}

/// Why a read-ahead copy stopped
#[derive(Debug)]
pub(crate) enum CopyError {
    Read(io::Error),
    Write(io::Error),
    Cancelled(CancelReason),
}

/// Tracks bytes sitting in the window
#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn add(&self, n: usize) {
        let now = self.current.fetch_add(n, Ordering::AcqRel) + n;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn sub(&self, n: usize) {
        self.current.fetch_sub(n, Ordering::AcqRel);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// Read up to `chunk_size` bytes, growing the buffer only as data arrives
async fn fill_chunk<R>(reader: &mut R, chunk_size: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    while buf.len() < chunk_size {
        let remaining = chunk_size - buf.len();
        if buf.capacity() == buf.len() {
            buf.reserve_exact(remaining.min(buf.len().max(FILL_STEP)));
        }
        let spare = (buf.capacity() - buf.len()).min(remaining);
        let n = (&mut *reader).take(spare as u64).read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf)
}

async fn prefetch<R>(
    mut reader: R,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
    chunk_size: usize,
    gauge: Arc<Gauge>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        // the slot is taken before filling so the chunk in flight counts too
        let Ok(permit) = tx.reserve().await else {
            return;
        };
        match fill_chunk(&mut reader, chunk_size).await {
            Ok(chunk) if chunk.is_empty() => return,
            Ok(chunk) => {
                gauge.add(chunk.len());
                permit.send(Ok(chunk));
            }
            Err(e) => {
                permit.send(Err(e));
                return;
            }
        }
    }
}

/// Copy `reader` into `writer` through the read-ahead window
///
/// The in-flight write is raced against `scope`, so cancellation interrupts
/// it instead of waiting for it to finish.
pub(crate) async fn copy<R, W>(
    reader: R,
    writer: &mut W,
    config: ReadAhead,
    scope: &CancelScope,
) -> Result<TransferStats, CopyError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Unpin + ?Sized,
{
    let config = ReadAhead::new(config.chunk_size, config.chunks);
    // one chunk is held by the writer, the rest are queued or being filled
    let (tx, mut rx) = mpsc::channel(config.chunks - 1);
    let gauge = Arc::new(Gauge::default());
    let _prefetch = AbortOnDrop(tokio::spawn(prefetch(
        reader,
        tx,
        config.chunk_size,
        Arc::clone(&gauge),
    )));

    let mut bytes = 0u64;
    loop {
        let chunk = match scope.run(rx.recv()).await {
            Err(reason) => return Err(CopyError::Cancelled(reason)),
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(CopyError::Read(e)),
            Ok(Some(Ok(chunk))) => chunk,
        };

        match scope.run(writer.write_all(&chunk)).await {
            Err(reason) => return Err(CopyError::Cancelled(reason)),
            Ok(Err(e)) => return Err(CopyError::Write(e)),
            Ok(Ok(())) => {}
        }
        gauge.sub(chunk.len());
        bytes += chunk.len() as u64;
    }

    match scope.run(writer.shutdown()).await {
        Err(reason) => return Err(CopyError::Cancelled(reason)),
        Ok(Err(e)) => return Err(CopyError::Write(e)),
        Ok(Ok(())) => {}
    }

    debug!(bytes, peak_buffered = gauge.peak(), "read-ahead copy finished");

    Ok(TransferStats {
        bytes,
        peak_buffered: gauge.peak(),
    })
}
