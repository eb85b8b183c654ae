//! Dedicated writer task for the outbound half of the connection.
//!
//! The session never touches the socket directly. It encodes a message,
//! hands the bytes to a [`WriterHandle`] and moves on; the writer task
//! owns the write half and flushes whatever is queued.
//!
//! # Architecture
//!
//! ```text
//! Session ─► mpsc::UnboundedSender<Bytes> ─► Writer Task ─► socket
//! ```
//!
//! Sending is synchronous so that the session state machine can enqueue a
//! request and its pending entry in the same step. Several queued messages
//! are written with a single `write_vectored` call.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{DebuggerError, Result};

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for queueing encoded messages on the writer task.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    /// Messages queued but not yet written.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Queue one encoded message.
    ///
    /// Fails with `Disconnected` once the writer task has stopped.
    pub fn send(&self, data: Bytes) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(data).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            DebuggerError::Disconnected
        })
    }

    /// Number of queued, unwritten messages.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Create a handle whose receiving end is returned to the caller
/// instead of being driven by a writer task.
#[cfg(test)]
pub(crate) fn channel() -> (WriterHandle, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WriterHandle {
        tx,
        pending: Arc::new(AtomicUsize::new(0)),
    };
    (handle, rx)
}

/// Spawn the writer task for `writer`.
///
/// The task ends cleanly when every handle is dropped, or with an error
/// when a write fails.
pub fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        let Some(first) = rx.recv().await else {
            // All handles dropped
            let _ = writer.shutdown().await;
            return Ok(());
        };

        batch.clear();
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(data) => batch.push(data),
                Err(_) => break,
            }
        }

        let count = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::warn!("Write to target failed: {}", e);
            return Err(e);
        }
        pending.fetch_sub(count, Ordering::Release);
    }
}

/// Write every chunk in `batch`, continuing after partial vectored writes.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(DebuggerError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything after the first `skip` bytes of `batch`.
fn remaining_slices(batch: &[Bytes], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for chunk in batch {
        let end = offset + chunk.len();
        if skip < end && !chunk.is_empty() {
            slices.push(IoSlice::new(&chunk[skip.saturating_sub(offset)..]));
        }
        offset = end;
    }

    slices
}
