//! Connection sources for [`Server::serve`](crate::Server::serve).

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Something that yields byte streams to serve
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next connection
    async fn accept(&mut self) -> io::Result<Self::Stream>;

    /// Stop listening. Connections already accepted are unaffected.
    async fn close(self) -> io::Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
impl Listener for tokio::net::TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        let (stream, peer) = tokio::net::TcpListener::accept(self).await?;
        debug!(%peer, "Accepted TCP connection");
        Ok(stream)
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        let (stream, _) = tokio::net::UnixListener::accept(self).await?;
        debug!("Accepted Unix socket connection");
        Ok(stream)
    }
}
