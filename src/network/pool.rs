//! Bounded pool of idle clients
//!
//! Reuse is last-in-first-out so the most recently returned (and most
//! likely still warm) connection goes out first. Every candidate is
//! probed for liveness before reuse; dead connections are closed and
//! replaced through the factory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::PoolError;
use crate::network::client::Client;

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Produces a freshly connected [`Client`] when the pool has nothing to
/// reuse.
pub type ClientFactory = Box<dyn Fn() -> BoxFuture<'static, Result<Client, PoolError>> + Send + Sync>;

/// Configuration for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Deadline for the liveness probe on a pooled connection.
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the liveness probe deadline.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }
}

/// Statistics about a connection pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Idle clients waiting for reuse.
    pub idle: usize,
    /// Idle capacity fixed at construction.
    pub max_size: usize,
}

/// Bounded LIFO pool of idle clients with a liveness probe on reuse.
pub struct ConnectionPool {
    factory: ClientFactory,
    idle: Mutex<Vec<Client>>,
    max_size: usize,
    ping_timeout: Duration,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool. `max_size` bounds the idle buffer; in-use clients
    /// are not counted.
    pub fn new(factory: ClientFactory, max_size: usize, config: PoolConfig) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
            ping_timeout: config.ping_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Take a live client: the most recent idle one if it probes
    /// healthy, otherwise a fresh build.
    pub async fn get(&self) -> Result<Client, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let candidate = self.idle.lock().pop();
        match candidate {
            Some(client) => {
                if client.probe_liveness(self.ping_timeout).await {
                    trace!(peer = ?client.remote_addr(), "reusing pooled connection");
                    Ok(client)
                } else {
                    debug!("pooled connection failed liveness probe, replacing");
                    client.close();
                    (self.factory)().await
                }
            }
            None => {
                trace!("pool empty, building new connection");
                (self.factory)().await
            }
        }
    }

    /// Return a client. A full or closed pool closes it instead.
    pub fn put(&self, client: Client) {
        if self.closed.load(Ordering::Acquire) {
            client.close();
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.max_size {
            idle.push(client);
        } else {
            drop(idle);
            debug!("pool full, closing returned connection");
            client.close();
        }
    }

    /// Drain and close every idle client. Further `get`s fail and
    /// further `put`s close their argument.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Client> = self.idle.lock().drain(..).collect();
        for client in &drained {
            client.close();
        }
        debug!(drained = drained.len(), "connection pool closed");
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            max_size: self.max_size,
        }
    }
}
