//! Transport module - connecting to the target and moving bytes.
//!
//! A [`Connector`] produces a byte stream. The connection task spawned by
//! [`spawn_connection`] splits it, runs the writer task on the write half
//! and forwards everything read to the session as [`TransportEvent`]s,
//! tagged with the connection generation so stale events can be dropped.

mod connector;

pub use connector::{FnConnector, TcpConnector};

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::writer::{spawn_writer_task, WriterHandle};

/// Boxed future returned by connectors.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream to the target.
pub trait TargetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TargetStream for T {}

/// Opens connections to the target.
pub trait Connector: Send + Sync {
    /// Open a new stream.
    fn connect(&self) -> BoxFuture<'static, io::Result<Box<dyn TargetStream>>>;
}

/// Read buffer size for the connection task.
const READ_CHUNK: usize = 64 * 1024;

/// Something that happened on a connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The stream is open; outbound bytes go through the handle.
    Connected(WriterHandle),
    /// A chunk of inbound bytes.
    Data(Bytes),
    /// The peer closed the stream.
    Closed,
    /// Connecting, reading or writing failed.
    Error(io::Error),
}

/// Event tagged with the generation of the connection it came from.
pub type TaggedEvent = (u64, TransportEvent);

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn the task that owns connection `generation`.
///
/// Aborting the returned handle tears down both halves of the stream,
/// including a writer blocked on a write that never completes. Dropping
/// every [`WriterHandle`] stops the writer task cleanly.
pub fn spawn_connection(
    connector: Arc<dyn Connector>,
    generation: u64,
    events: mpsc::UnboundedSender<TaggedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let emit = |event| {
            // Receiver gone means the session shut down
            let _ = events.send((generation, event));
        };

        let stream = match connector.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("Connect failed: {}", e);
                emit(TransportEvent::Error(e));
                return;
            }
        };

        let (mut reader, writer) = tokio::io::split(stream);
        let (handle, writer_task) = spawn_writer_task(writer);
        let mut writer_task = AbortOnDrop(writer_task);
        emit(TransportEvent::Connected(handle));

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        emit(TransportEvent::Closed);
                        return;
                    }
                    Ok(n) => emit(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n]))),
                    Err(e) => {
                        emit(TransportEvent::Error(e));
                        return;
                    }
                },
                done = &mut writer_task.0 => {
                    match done {
                        Ok(Err(e)) => emit(TransportEvent::Error(io::Error::other(e.to_string()))),
                        Err(e) if e.is_panic() => {
                            emit(TransportEvent::Error(io::Error::other("writer task panicked")))
                        }
                        // Writer stopped because the session dropped its handle
                        _ => {}
                    }
                    return;
                }
            }
        }
    })
}
