//! Drawbridge
//!
//! TCP service framework with adaptive admission control.
//!
//! The server side defends itself against connection-rate abuse by
//! combining three mechanisms in front of the user handler:
//! per-source rate limiting, temporary bans, and a proof-of-work
//! challenge whose difficulty adapts to each source's behavior. The
//! client side is a retrying, stats-tracking TCP client with a bounded
//! connection pool that probes liveness before reuse.
//!
//! # Module Structure
//!
//! - `network/`: server, client, retry, pool, admission gate, TLS
//! - `resilience/`: proof of work and rate limiting
//! - `error`: error taxonomy
//! - `metrics`: injected metrics sink
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use drawbridge::{
//!     AdmissionGate, RateLimitConfig, RateLimiter, Server, ServerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limiter = Arc::new(RateLimiter::with_config(RateLimitConfig::default()));
//!     let gate = Arc::new(AdmissionGate::new(limiter.clone()));
//!
//!     let config = ServerConfig::new().with_middleware(gate);
//!     let server = Server::new("0.0.0.0:9000", echo, config)?;
//!     server.start().await?;
//!
//!     // ... serve traffic ...
//!
//!     server.stop().await?;
//!     limiter.stop().await;
//!     Ok(())
//! }
//!
//! async fn echo(mut conn: drawbridge::BoxedConn) {
//!     use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!     let mut buf = [0u8; 1024];
//!     while let Ok(n) = conn.read(&mut buf).await {
//!         if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod error;
pub mod metrics;
pub mod network;
pub mod resilience;

// Re-export the main API types for convenience
pub use error::{Cause, ConfigError, ConnectionError, PoolError, PowError, ServerError};
pub use metrics::{MetricsSink, NoopMetrics};
pub use network::{
    client_tls_config, server_tls_config, AdmissionGate, BoxedConn, Client, ClientConfig,
    ClientFactory, ClientTlsConfig, Conn, ConnectionPool, ConnectionStats, Handler, Middleware,
    PoolConfig, PoolStats, Server, ServerConfig, ServerStats, TlsError,
};
pub use resilience::{
    Challenge, RateDecision, RateLimitConfig, RateLimitStats, RateLimiter, Solution,
};
