use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Relay side: yields one stream per incoming connection (control, work or visitor).
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, Option<SocketAddr>)>;
}

/// Client side: opens a fresh stream to the relay.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> anyhow::Result<BoxedStream>;
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

impl TcpTransportListener {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let ln = TcpListener::bind(addr).await?;
        Ok(Self { ln })
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, Option<SocketAddr>)> {
        let (c, remote) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok((Box::new(c), Some(remote)))
    }
}

pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> anyhow::Result<BoxedStream> {
        let c = TcpStream::connect(&self.addr).await?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }
}
