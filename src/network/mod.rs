//! Networking: server, client, pool, admission gate, TLS wrapping.
//!
//! - `server`: accept loop, connection caps, graceful stop
//! - `client`: dial/read/write with deadlines and reconnect
//! - `retry`: bounded retry with reconnect-on-broken-pipe
//! - `pool`: bounded LIFO reuse with liveness probing
//! - `gate`: ban / rate / proof-of-work admission middleware
//! - `conn`: byte-stream abstraction over plain TCP and TLS
//! - `tls`: rustls configuration helpers

pub mod client;
pub mod conn;
pub mod gate;
pub mod pool;
pub mod retry;
pub mod server;
pub mod tls;

pub use client::{Client, ClientConfig, ClientTlsConfig, ConnectionStats};
pub use conn::{BoxedConn, Conn};
pub use gate::AdmissionGate;
pub use pool::{ClientFactory, ConnectionPool, PoolConfig, PoolStats};
pub use server::{Handler, Middleware, Server, ServerConfig, ServerStats};
pub use tls::{client_tls_config, server_tls_config, TlsError};
