//! TCP client with connection management and statistics
//!
//! All I/O is bounded by per-operation deadlines and the client's
//! cancellation scope. The connection handle is snapshotted under a
//! short lock and the blocking I/O itself runs outside it, so a
//! concurrent [`close`](Client::close) is never stuck behind a slow
//! read.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Cause, ConfigError, ConnectionError};
use crate::network::conn::{current_timestamp, BoxedConn};

const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Client-side TLS settings.
#[derive(Clone)]
pub struct ClientTlsConfig {
    /// rustls client configuration.
    pub config: Arc<rustls::ClientConfig>,
    /// Name presented for SNI and certificate verification.
    pub server_name: String,
}

/// Configuration for a [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Deadline for a single read.
    pub read_timeout: Duration,
    /// Deadline for a single write; also bounds dialing.
    pub write_timeout: Duration,
    /// Maximum bytes returned by one [`Client::read`].
    pub buffer_size: usize,
    /// When present, the connection is dialed through TLS.
    pub tls: Option<ClientTlsConfig>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("buffer_size", &self.buffer_size)
            .field(
                "tls",
                &self.tls.as_ref().map(|tls| tls.server_name.as_str()),
            )
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read and write deadlines.
    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Set the read buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Dial through TLS, verifying against `server_name`.
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>, server_name: impl Into<String>) -> Self {
        self.tls = Some(ClientTlsConfig {
            config,
            server_name: server_name.into(),
        });
        self
    }

    /// Configuration for testing (tight deadlines).
    pub fn for_testing() -> Self {
        Self {
            read_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
            buffer_size: DEFAULT_BUFFER_SIZE,
            tls: None,
        }
    }
}

/// Statistics about the connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Bytes read since construction; survives reconnects.
    pub bytes_read: u64,
    /// Bytes written since construction; survives reconnects.
    pub bytes_written: u64,
    /// Unix timestamp of the last successful operation.
    pub last_activity: i64,
    /// Consecutive failed attempts in the current retry loop; reset to
    /// zero on success.
    pub retry_count: u32,
}

/// One live connection. I/O serializes on the internal mutex; the
/// client swaps the whole handle on reconnect.
pub(crate) struct ClientConn {
    pub(crate) io: tokio::sync::Mutex<BoxedConn>,
    pub(crate) peer_addr: SocketAddr,
}

/// TCP client with deadlines, cancellation, and reconnect support.
pub struct Client {
    address: String,
    config: ClientConfig,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
    pub(crate) conn: RwLock<Option<Arc<ClientConn>>>,
    cancel: RwLock<CancellationToken>,
    pub(crate) stats: RwLock<ConnectionStats>,
}

impl Client {
    /// Create a new client. Does not dial; call
    /// [`connect`](Self::connect).
    pub fn new(address: impl Into<String>, config: ClientConfig) -> Result<Self, ConfigError> {
        let address = address.into();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }

        let tls = match &config.tls {
            Some(tls) => {
                let name = ServerName::try_from(tls.server_name.clone())
                    .map_err(|_| ConfigError::InvalidServerName(tls.server_name.clone()))?;
                Some((tls.config.clone(), name))
            }
            None => None,
        };

        Ok(Self {
            address,
            config,
            tls,
            conn: RwLock::new(None),
            cancel: RwLock::new(CancellationToken::new()),
            stats: RwLock::new(ConnectionStats {
                last_activity: current_timestamp(),
                ..ConnectionStats::default()
            }),
        })
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().clone()
    }

    /// Establish the connection. Fails if already connected. The dial
    /// is bounded by the write timeout and honors cancellation.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.conn.read().is_some() {
            return Err(ConnectionError::new(
                "connect",
                Cause::AlreadyConnected,
                false,
            ));
        }
        let token = self.cancel_token();
        if token.is_cancelled() {
            return Err(ConnectionError::cancelled("connect"));
        }

        // Dial without holding any lock.
        let stream = tokio::select! {
            _ = token.cancelled() => return Err(ConnectionError::cancelled("connect")),
            dialed = tokio::time::timeout(
                self.config.write_timeout,
                TcpStream::connect(&self.address),
            ) => match dialed {
                Err(_) => return Err(ConnectionError::timeout("connect")),
                Ok(Err(err)) => {
                    // Refused/unreachable may clear up; the caller may
                    // retry.
                    return Err(ConnectionError::new("connect", Cause::Io(err), true));
                }
                Ok(Ok(stream)) => stream,
            },
        };
        let peer_addr = stream.peer_addr().map_err(|err| ConnectionError::io("connect", err))?;

        let conn: BoxedConn = match &self.tls {
            Some((tls_config, server_name)) => {
                let connector = TlsConnector::from(tls_config.clone());
                let handshake = tokio::time::timeout(
                    self.config.write_timeout,
                    connector.connect(server_name.clone(), stream),
                );
                match handshake.await {
                    Err(_) => return Err(ConnectionError::timeout("connect")),
                    Ok(Err(err)) => {
                        return Err(ConnectionError::new(
                            "connect",
                            Cause::Handshake(err.to_string()),
                            false,
                        ))
                    }
                    Ok(Ok(tls_stream)) => Box::new(tls_stream),
                }
            }
            None => Box::new(stream),
        };

        // Re-check under the write lock: another task may have
        // connected, or the scope may have been cancelled mid-dial.
        {
            let mut guard = self.conn.write();
            if guard.is_some() {
                return Err(ConnectionError::new(
                    "connect",
                    Cause::AlreadyConnected,
                    false,
                ));
            }
            if token.is_cancelled() {
                return Err(ConnectionError::cancelled("connect"));
            }
            *guard = Some(Arc::new(ClientConn {
                io: tokio::sync::Mutex::new(conn),
                peer_addr,
            }));
        }
        self.stats.write().last_activity = current_timestamp();

        info!(address = %self.address, peer = %peer_addr, "connected");
        Ok(())
    }

    fn snapshot(&self, op: &'static str) -> Result<(Arc<ClientConn>, CancellationToken), ConnectionError> {
        let conn = self
            .conn
            .read()
            .clone()
            .ok_or_else(|| ConnectionError::closed(op))?;
        let token = self.cancel_token();
        if token.is_cancelled() {
            return Err(ConnectionError::cancelled(op));
        }
        Ok((conn, token))
    }

    /// Record bytes moved, unless the handle was swapped by a
    /// concurrent reconnect while the I/O was in flight.
    fn record(&self, conn: &Arc<ClientConn>, read: u64, written: u64) {
        let current = self.conn.read().clone();
        if let Some(current) = current {
            if Arc::ptr_eq(&current, conn) {
                let mut stats = self.stats.write();
                stats.bytes_read += read;
                stats.bytes_written += written;
                stats.last_activity = current_timestamp();
            }
        }
    }

    /// One read of up to `buffer_size` bytes, bounded by the read
    /// timeout.
    pub async fn read(&self) -> Result<Vec<u8>, ConnectionError> {
        let (conn, token) = self.snapshot("read")?;
        let mut buf = vec![0u8; self.config.buffer_size];

        let n = {
            let mut io = conn.io.lock().await;
            tokio::select! {
                _ = token.cancelled() => return Err(ConnectionError::cancelled("read")),
                result = tokio::time::timeout(self.config.read_timeout, io.read(&mut buf)) => {
                    match result {
                        Err(_) => return Err(ConnectionError::timeout("read")),
                        Ok(Err(err)) => return Err(ConnectionError::io("read", err)),
                        Ok(Ok(0)) => return Err(ConnectionError::closed("read")),
                        Ok(Ok(n)) => n,
                    }
                }
            }
        };

        buf.truncate(n);
        self.record(&conn, n as u64, 0);
        Ok(buf)
    }

    /// Write the whole buffer, bounded by the write timeout.
    pub async fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let (conn, token) = self.snapshot("write")?;

        {
            let mut io = conn.io.lock().await;
            tokio::select! {
                _ = token.cancelled() => return Err(ConnectionError::cancelled("write")),
                result = tokio::time::timeout(self.config.write_timeout, io.write_all(data)) => {
                    match result {
                        Err(_) => return Err(ConnectionError::timeout("write")),
                        Ok(Err(err)) => return Err(ConnectionError::io("write", err)),
                        Ok(Ok(())) => {}
                    }
                }
            }
        }

        self.record(&conn, 0, data.len() as u64);
        Ok(())
    }

    /// Cancel the client scope and drop the connection. Idempotent;
    /// in-flight I/O observes cancellation or the closing stream.
    pub fn close(&self) {
        self.cancel.read().cancel();
        let conn = self.conn.write().take();
        if let Some(conn) = conn {
            debug!(peer = %conn.peer_addr, "connection closed");
        } else {
            debug!("close called with no connection");
        }
    }

    /// Close, install a fresh cancellation scope, and connect again.
    /// Operations pending at close time stay cancelled.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        debug!(address = %self.address, "reconnect requested");
        self.close();
        *self.cancel.write() = CancellationToken::new();
        self.connect().await
    }

    /// Remote address of the live connection, if any.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.read().as_ref().map(|conn| conn.peer_addr)
    }

    /// Get current connection statistics.
    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().clone()
    }

    /// Check that a pooled connection is still alive without consuming
    /// bytes: peek under a short deadline. A timeout means the socket
    /// is open with nothing pending; EOF or an error means it is dead.
    pub async fn probe_liveness(&self, ping_timeout: Duration) -> bool {
        let conn = match self.conn.read().clone() {
            Some(conn) => conn,
            None => return false,
        };

        let mut io = conn.io.lock().await;
        let mut probe = [0u8; 1];
        match tokio::time::timeout(ping_timeout, io.peek(&mut probe)).await {
            Err(_) => true,
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!(peer = %conn.peer_addr, error = %err, "liveness probe failed");
                false
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.address)
            .field("connected", &self.conn.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Echo server that serves every accepted connection until EOF.
    async fn spawn_echo_listener() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn test_new_rejects_empty_address() {
        assert!(matches!(
            Client::new("", ClientConfig::default()),
            Err(ConfigError::EmptyAddress)
        ));
    }

    #[tokio::test]
    async fn test_connect_read_write_round_trip() {
        let addr = spawn_echo_listener().await;
        let client = Client::new(addr.to_string(), ClientConfig::for_testing()).unwrap();

        client.connect().await.unwrap();
        assert_eq!(client.remote_addr(), Some(addr));

        client.write(b"hello").await.unwrap();
        let echoed = client.read().await.unwrap();
        assert_eq!(echoed, b"hello");

        let stats = client.stats();
        assert_eq!(stats.bytes_written, 5);
        assert_eq!(stats.bytes_read, 5);

        client.close();
    }

    #[tokio::test]
    async fn test_connect_when_connected_fails() {
        let addr = spawn_echo_listener().await;
        let client = Client::new(addr.to_string(), ClientConfig::for_testing()).unwrap();

        client.connect().await.unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err.cause, Cause::AlreadyConnected));
        client.close();
    }

    #[tokio::test]
    async fn test_close_without_connect_is_fine() {
        let client = Client::new("127.0.0.1:1", ClientConfig::for_testing()).unwrap();
        client.close();
        client.close();
    }

    #[tokio::test]
    async fn test_io_without_connection_is_closed_error() {
        let client = Client::new("127.0.0.1:1", ClientConfig::for_testing()).unwrap();
        assert!(client.read().await.unwrap_err().is_closed());
        assert!(client.write(b"x").await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_read_timeout_is_retryable() {
        // A listener that accepts and then stays silent.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = ClientConfig::for_testing()
            .with_timeouts(Duration::from_millis(80), Duration::from_millis(500));
        let client = Client::new(addr.to_string(), config).unwrap();
        client.connect().await.unwrap();

        let err = client.read().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.retryable);
        client.close();
    }

    #[tokio::test]
    async fn test_peer_eof_reads_as_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = Client::new(addr.to_string(), ClientConfig::for_testing()).unwrap();
        client.connect().await.unwrap();

        let err = client.read().await.unwrap_err();
        assert!(err.is_closed());
        assert!(err.is_reconnectable());
        client.close();
    }

    #[tokio::test]
    async fn test_operations_after_close_are_cancelled() {
        let addr = spawn_echo_listener().await;
        let client = Client::new(addr.to_string(), ClientConfig::for_testing()).unwrap();
        client.connect().await.unwrap();
        client.close();

        // The connection is gone and the scope is cancelled; both
        // surface as terminal errors.
        let err = client.read().await.unwrap_err();
        assert!(err.is_closed() || err.is_cancelled());
        assert!(!err.retryable);

        let err = client.connect().await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_reconnect_restores_service() {
        let addr = spawn_echo_listener().await;
        let client = Client::new(addr.to_string(), ClientConfig::for_testing()).unwrap();
        client.connect().await.unwrap();
        client.close();

        client.reconnect().await.unwrap();
        client.write(b"after").await.unwrap();
        assert_eq!(client.read().await.unwrap(), b"after");
        client.close();
    }

    #[tokio::test]
    async fn test_dial_refused_is_retryable_io() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(addr.to_string(), ClientConfig::for_testing()).unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(err.retryable || err.is_timeout());
    }

    #[tokio::test]
    async fn test_stats_survive_reconnect() {
        let addr = spawn_echo_listener().await;
        let client = Client::new(addr.to_string(), ClientConfig::for_testing()).unwrap();

        client.connect().await.unwrap();
        client.write(b"one").await.unwrap();
        let _ = client.read().await.unwrap();

        client.reconnect().await.unwrap();
        client.write(b"two").await.unwrap();
        let _ = client.read().await.unwrap();

        let stats = client.stats();
        assert_eq!(stats.bytes_written, 6);
        assert_eq!(stats.bytes_read, 6);
        client.close();
    }
}
