//! Stock connectors: TCP and closure based.

use std::future::Future;
use std::io;

use tokio::net::TcpStream;

use super::{BoxFuture, Connector, TargetStream};

/// Connects to a debug target over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    /// Connector for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Target address as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'static, io::Result<Box<dyn TargetStream>>> {
        let addr = self.address();
        Box::pin(async move {
            tracing::debug!("Connecting to {}", addr);
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as Box<dyn TargetStream>)
        })
    }
}

/// Connector backed by a closure returning a future.
///
/// Useful for in-memory streams and custom transports.
pub struct FnConnector<F> {
    connect: F,
}

impl<F> FnConnector<F> {
    /// Wrap `connect`.
    pub fn new(connect: F) -> Self {
        Self { connect }
    }
}

impl<F, Fut> Connector for FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<Box<dyn TargetStream>>> + Send + 'static,
{
    fn connect(&self) -> BoxFuture<'static, io::Result<Box<dyn TargetStream>>> {
        Box::pin((self.connect)())
    }
}
