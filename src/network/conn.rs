//! Byte-stream abstraction over plain and TLS sockets
//!
//! Handlers, middleware, and the client all speak [`BoxedConn`] so the
//! same code path serves both transports. The extra [`peek`](Conn::peek)
//! method backs the pool's non-consuming liveness probe.

use std::io;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Get current Unix timestamp in seconds
pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A connected byte stream: plain TCP or TLS over TCP.
#[async_trait]
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Remote endpoint address.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Read without consuming. Probes go to the TCP layer, so for TLS
    /// streams a positive result counts undecrypted record bytes.
    async fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Boxed connection handed to handlers and middleware. Dropping it
/// closes the underlying socket.
pub type BoxedConn = Box<dyn Conn>;

#[async_trait]
impl Conn for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    async fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::peek(self, buf).await
    }
}

#[async_trait]
impl Conn for tokio_rustls::client::TlsStream<TcpStream> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }

    async fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.get_ref().0.peek(buf).await
    }
}

#[async_trait]
impl Conn for tokio_rustls::server::TlsStream<TcpStream> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }

    async fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.get_ref().0.peek(buf).await
    }
}
