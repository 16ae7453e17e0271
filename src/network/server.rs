//! TCP server with connection management and statistics
//!
//! The acceptor loop runs as a background task under a cancellation
//! token; every accepted connection gets its own task on a tracker so
//! [`Server::stop`] can wait for in-flight handlers. Connections pass
//! through an optional admission [`Middleware`] before reaching the
//! user [`Handler`].

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, ServerError};
use crate::metrics::{self, names, MetricsSink};
use crate::network::conn::{current_timestamp, BoxedConn, Conn};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_CONNECTIONS: i64 = 65_101;

/// Per-connection entry point. Implemented for any async closure taking
/// a [`BoxedConn`].
pub trait Handler: Send + Sync + 'static {
    /// Serve one admitted connection. The socket closes when the future
    /// completes and the stream is dropped.
    fn handle(&self, conn: BoxedConn) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(BoxedConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, conn: BoxedConn) -> BoxFuture<'static, ()> {
        Box::pin(self(conn))
    }
}

/// Admission decision made before the user handler runs.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Return true to admit the connection. On false the server drops
    /// the stream, which closes the socket; the handler never sees it.
    /// Implementations must not leave deadline state behind on the
    /// connection when admitting.
    async fn admit(&self, conn: &mut BoxedConn, peer: SocketAddr) -> bool;
}

/// Configuration for a [`Server`].
#[derive(Clone)]
pub struct ServerConfig {
    /// Budget for the whole per-connection lifetime: TLS handshake,
    /// admission, and handler.
    pub idle_timeout: Duration,
    /// Cap on concurrently active connections.
    pub max_connections: i64,
    /// When present, every accepted connection is wrapped in TLS.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Admission middleware; absent means admit-all.
    pub middleware: Option<Arc<dyn Middleware>>,
    /// Metrics destination; absent means discard.
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("tls", &self.tls.as_ref().map(|_| "[configured]"))
            .field(
                "middleware",
                &self.middleware.as_ref().map(|_| "[configured]"),
            )
            .field("metrics", &self.metrics.as_ref().map(|_| "[configured]"))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tls: None,
            middleware: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-connection idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the active connection cap.
    pub fn with_max_connections(mut self, max: i64) -> Self {
        self.max_connections = max;
        self
    }

    /// Wrap accepted connections in TLS.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Install an admission middleware.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware = Some(middleware);
        self
    }

    /// Install a metrics sink.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Configuration for testing (short idle timeout, small cap).
    pub fn for_testing() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            max_connections: 64,
            tls: None,
            middleware: None,
            metrics: None,
        }
    }
}

/// Statistics about the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    /// Connections currently being handled.
    pub active_connections: i64,
    /// Connections accepted since start.
    pub total_connections: u64,
    /// Bytes read from connections by handlers and middleware.
    pub bytes_read: u64,
    /// Bytes written to connections by handlers and middleware.
    pub bytes_written: u64,
    /// Unix timestamp of the most recent accept or byte of traffic.
    pub last_activity: i64,
}

#[derive(Debug, Default)]
struct ServerCounters {
    active: AtomicI64,
    total: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    last_activity: AtomicI64,
}

impl ServerCounters {
    fn touch(&self) {
        self.last_activity
            .store(current_timestamp(), Ordering::Relaxed);
    }
}

/// Stream wrapper that feeds the server's byte counters as the
/// connection is read and written.
struct MeteredConn {
    inner: BoxedConn,
    counters: Arc<ServerCounters>,
}

impl AsyncRead for MeteredConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.counters
                    .bytes_read
                    .fetch_add(n as u64, Ordering::Relaxed);
                this.counters.touch();
            }
        }
        result
    }
}

impl AsyncWrite for MeteredConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.counters
                    .bytes_written
                    .fetch_add(*n as u64, Ordering::Relaxed);
                this.counters.touch();
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl Conn for MeteredConn {
    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    async fn peek(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.peek(buf).await
    }
}

/// Restores the active-connection count even when a handler panics.
struct ActiveGuard(Arc<ServerCounters>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Everything a per-connection task needs, assembled once at start.
struct ConnContext {
    handler: Arc<dyn Handler>,
    middleware: Option<Arc<dyn Middleware>>,
    metrics: Arc<dyn MetricsSink>,
    tls: Option<TlsAcceptor>,
    idle_timeout: Duration,
    counters: Arc<ServerCounters>,
}

/// TCP server with connection caps, admission middleware, and graceful
/// shutdown.
pub struct Server {
    address: String,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<ServerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    max_connections: Arc<AtomicI64>,
    counters: Arc<ServerCounters>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Create a new server; the handler runs once per admitted
    /// connection.
    pub fn new(
        address: impl Into<String>,
        handler: impl Handler,
        config: ServerConfig,
    ) -> Result<Self, ConfigError> {
        let address = address.into();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }

        let metrics = config.metrics.clone().unwrap_or_else(metrics::noop);
        let max_connections = Arc::new(AtomicI64::new(config.max_connections));
        let counters = Arc::new(ServerCounters::default());
        counters.touch();

        Ok(Self {
            address,
            handler: Arc::new(handler),
            config,
            metrics,
            state: Mutex::new(ServerState::Created),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            accept_task: Mutex::new(None),
            max_connections,
            counters,
            local_addr: Mutex::new(None),
        })
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Created {
                return Err(ServerError::AlreadyStarted);
            }
            *state = ServerState::Running;
        }

        let listener = match TcpListener::bind(&self.address).await {
            Ok(listener) => listener,
            Err(err) => {
                *self.state.lock() = ServerState::Created;
                return Err(ServerError::Io(err));
            }
        };
        if let Ok(addr) = listener.local_addr() {
            *self.local_addr.lock() = Some(addr);
        }

        let context = Arc::new(ConnContext {
            handler: self.handler.clone(),
            middleware: self.config.middleware.clone(),
            metrics: self.metrics.clone(),
            tls: self.config.tls.clone().map(TlsAcceptor::from),
            idle_timeout: self.config.idle_timeout,
            counters: self.counters.clone(),
        });

        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        let max_connections = self.max_connections.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, context, cancel, tracker, max_connections).await;
        });
        *self.accept_task.lock() = Some(task);

        info!(address = %self.address, "server started");
        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        context: Arc<ConnContext>,
        cancel: CancellationToken,
        tracker: TaskTracker,
        max_connections: Arc<AtomicI64>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "accept error");
                    // Transient errors (EMFILE and friends); back off
                    // briefly instead of spinning.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let active = context.counters.active.load(Ordering::Relaxed);
            if active >= max_connections.load(Ordering::Relaxed) {
                debug!(%peer, active, "max connections reached, rejecting");
                context.metrics.incr(names::CONNECTIONS_REJECTED_CAPACITY, 1);
                drop(stream);
                continue;
            }

            context.counters.active.fetch_add(1, Ordering::Relaxed);
            context.counters.total.fetch_add(1, Ordering::Relaxed);
            context.counters.touch();
            context.metrics.incr(names::CONNECTIONS_ACCEPTED, 1);

            let context = context.clone();
            tracker.spawn(async move {
                Self::handle_connection(stream, peer, context).await;
            });
        }

        debug!("acceptor exited");
    }

    async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: Arc<ConnContext>) {
        let _guard = ActiveGuard(context.counters.clone());
        debug!(%peer, "connection accepted");

        let work = async {
            let conn: BoxedConn = match &context.tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => Box::new(tls_stream),
                    Err(err) => {
                        debug!(%peer, error = %err, "tls handshake failed");
                        return;
                    }
                },
                None => Box::new(stream),
            };

            let mut conn: BoxedConn = Box::new(MeteredConn {
                inner: conn,
                counters: context.counters.clone(),
            });

            if let Some(middleware) = &context.middleware {
                if !middleware.admit(&mut conn, peer).await {
                    debug!(%peer, "connection rejected by middleware");
                    return;
                }
            }
            context.metrics.incr(names::CONNECTIONS_ADMITTED, 1);

            context.handler.handle(conn).await;
        };

        // The idle timeout bounds the whole connection lifetime; a
        // panicking handler must not take the process down with it.
        let bounded = tokio::time::timeout(
            context.idle_timeout,
            std::panic::AssertUnwindSafe(work).catch_unwind(),
        );
        match bounded.await {
            Ok(Ok(())) => {}
            Ok(Err(_panic)) => {
                error!(%peer, "connection handler panicked");
            }
            Err(_) => {
                debug!(%peer, "connection exceeded idle timeout");
            }
        }
        debug!(%peer, "connection closed");
    }

    /// Stop accepting, then wait for all in-flight handlers to finish.
    pub async fn stop(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Created => return Err(ServerError::NotStarted),
                ServerState::Stopped => return Ok(()),
                ServerState::Running | ServerState::Stopping => {
                    *state = ServerState::Stopping;
                }
            }
        }

        self.cancel.cancel();
        self.tracker.close();

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }
        self.tracker.wait().await;

        *self.state.lock() = ServerState::Stopped;
        info!(address = %self.address, "server stopped");
        Ok(())
    }

    /// Like [`stop`](Self::stop) but bounded. On timeout the shutdown
    /// keeps draining in the background and `StopTimeout` is returned.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<(), ServerError> {
        match tokio::time::timeout(timeout, self.stop()).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::StopTimeout),
        }
    }

    /// Change the active connection cap.
    pub fn set_max_connections(&self, max: i64) {
        self.max_connections.store(max, Ordering::Relaxed);
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Get current server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_connections: self.counters.active.load(Ordering::Relaxed),
            total_connections: self.counters.total.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            last_activity: self.counters.last_activity.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn echo_handler() -> impl Handler {
        |mut conn: BoxedConn| async move {
            let mut buf = [0u8; 1024];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn started_echo_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let server = Arc::new(Server::new("127.0.0.1:0", echo_handler(), config).unwrap());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    #[test]
    fn test_new_rejects_empty_address() {
        let result = Server::new("", echo_handler(), ServerConfig::for_testing());
        assert!(matches!(result, Err(ConfigError::EmptyAddress)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (server, _) = started_echo_server(ServerConfig::for_testing()).await;
        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyStarted)
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_fails() {
        let server =
            Server::new("127.0.0.1:0", echo_handler(), ServerConfig::for_testing()).unwrap();
        assert!(matches!(server.stop().await, Err(ServerError::NotStarted)));
    }

    #[tokio::test]
    async fn test_echo_round_trip_and_stats() {
        let (server, addr) = started_echo_server(ServerConfig::for_testing()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(client);

        server.stop().await.unwrap();

        let stats = server.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 0);
        assert!(stats.bytes_read >= 5);
        assert!(stats.bytes_written >= 5);
    }

    #[tokio::test]
    async fn test_connection_cap_rejects_excess() {
        let config = ServerConfig::for_testing().with_max_connections(1);
        let (server, addr) = started_echo_server(config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        first.read_exact(&mut buf).await.unwrap();

        // The cap is reached; the second connection is dropped without
        // being served.
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut probe = [0u8; 1];
        assert_eq!(second.read(&mut probe).await.unwrap(), 0);

        drop(first);
        drop(second);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handlers() {
        let handler = |mut conn: BoxedConn| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = conn.write_all(b"done").await;
        };
        let server = Arc::new(
            Server::new("127.0.0.1:0", handler, ServerConfig::for_testing()).unwrap(),
        );
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        // Let the acceptor pick both up.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let begun = Instant::now();
        server.stop().await.unwrap();
        assert!(begun.elapsed() >= Duration::from_millis(200));
        assert_eq!(server.stats().active_connections, 0);

        // Both handlers ran to completion before stop returned.
        let mut buf = [0u8; 4];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"done");
        b.read_exact(&mut buf).await.unwrap();

        // No new connections are accepted after stop.
        match TcpStream::connect(addr).await {
            Err(_) => {}
            Ok(mut conn) => {
                let mut probe = [0u8; 1];
                assert_eq!(conn.read(&mut probe).await.unwrap_or(0), 0);
            }
        }
    }

    #[tokio::test]
    async fn test_stop_with_timeout_reports_slow_drain() {
        let handler = |_conn: BoxedConn| async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
        };
        let server = Arc::new(
            Server::new("127.0.0.1:0", handler, ServerConfig::for_testing()).unwrap(),
        );
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            server.stop_with_timeout(Duration::from_millis(50)).await,
            Err(ServerError::StopTimeout)
        ));

        // The background drain still completes.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_bounds_handler() {
        let config = ServerConfig::for_testing().with_idle_timeout(Duration::from_millis(100));
        let handler = |mut conn: BoxedConn| async move {
            // Wait for data that never arrives.
            let mut buf = [0u8; 1];
            let _ = conn.read(&mut buf).await;
        };
        let server = Arc::new(Server::new("127.0.0.1:0", handler, config).unwrap());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut probe = [0u8; 1];
        // The server closes the connection when the budget elapses.
        assert_eq!(client.read(&mut probe).await.unwrap_or(0), 0);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let handler = |_conn: BoxedConn| async move {
            panic!("handler blew up");
        };
        let server = Arc::new(
            Server::new("127.0.0.1:0", handler, ServerConfig::for_testing()).unwrap(),
        );
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The server survives and keeps serving.
        let _second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop().await.unwrap();
        let stats = server.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_rejecting_middleware_blocks_handler() {
        struct DenyAll;

        #[async_trait]
        impl Middleware for DenyAll {
            async fn admit(&self, _conn: &mut BoxedConn, _peer: SocketAddr) -> bool {
                false
            }
        }

        let config = ServerConfig::for_testing().with_middleware(Arc::new(DenyAll));
        let (server, addr) = started_echo_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut probe = [0u8; 1];
        // Middleware rejected: the connection just closes.
        assert_eq!(client.read(&mut probe).await.unwrap_or(0), 0);

        server.stop().await.unwrap();
    }
}
