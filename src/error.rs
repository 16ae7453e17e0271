//! Error types
//!
//! Socket-layer failures are wrapped as [`ConnectionError`] with the
//! operation name, the underlying cause, and a retryability flag at the
//! point of capture. Lifecycle misuse surfaces as [`ServerError`] /
//! [`PoolError`], invalid construction as [`ConfigError`].

use std::fmt;
use std::io;

/// Invalid construction of a client, server, or pool.
#[derive(Debug)]
pub enum ConfigError {
    /// Address string is empty.
    EmptyAddress,
    /// TLS server name could not be parsed.
    InvalidServerName(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyAddress => write!(f, "address cannot be empty"),
            ConfigError::InvalidServerName(name) => {
                write!(f, "invalid TLS server name: {}", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Underlying cause of a [`ConnectionError`].
#[derive(Debug)]
pub enum Cause {
    /// An I/O error from the socket layer.
    Io(io::Error),
    /// The connection is closed or was never established.
    Closed,
    /// A deadline elapsed before the operation completed.
    Timeout,
    /// The owning scope was cancelled.
    Cancelled,
    /// `connect` was called on an already-connected client.
    AlreadyConnected,
    /// TLS handshake failed.
    Handshake(String),
    /// The retry loop gave up after the allotted attempts.
    ExhaustedRetries {
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<ConnectionError>,
    },
    /// A reconnect following a broken-connection error failed too.
    ReconnectFailed {
        /// Why the reconnect failed.
        reconnect: Box<ConnectionError>,
        /// The error that triggered the reconnect.
        original: Box<ConnectionError>,
    },
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Io(err) => write!(f, "{}", err),
            Cause::Closed => write!(f, "connection closed"),
            Cause::Timeout => write!(f, "operation timed out"),
            Cause::Cancelled => write!(f, "operation cancelled"),
            Cause::AlreadyConnected => write!(f, "already connected"),
            Cause::Handshake(msg) => write!(f, "tls handshake failed: {}", msg),
            Cause::ExhaustedRetries { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            Cause::ReconnectFailed {
                reconnect,
                original,
            } => {
                write!(
                    f,
                    "reconnect failed: {} (original error: {})",
                    reconnect, original
                )
            }
        }
    }
}

/// Any socket-layer failure, wrapped with the operation that produced it.
#[derive(Debug)]
pub struct ConnectionError {
    /// Operation that failed ("connect", "read", "write", ...).
    pub op: &'static str,
    /// Underlying cause.
    pub cause: Cause,
    /// Whether retrying the same operation may succeed without
    /// re-establishing the connection. Timeouts are retryable;
    /// closed connections and cancellation are not.
    pub retryable: bool,
}

impl ConnectionError {
    pub(crate) fn new(op: &'static str, cause: Cause, retryable: bool) -> Self {
        Self {
            op,
            cause,
            retryable,
        }
    }

    /// Wrap an I/O error, deriving retryability from its kind.
    pub(crate) fn io(op: &'static str, err: io::Error) -> Self {
        let retryable = matches!(
            err.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        );
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Self::closed(op);
        }
        Self::new(op, Cause::Io(err), retryable)
    }

    pub(crate) fn closed(op: &'static str) -> Self {
        Self::new(op, Cause::Closed, false)
    }

    pub(crate) fn timeout(op: &'static str) -> Self {
        Self::new(op, Cause::Timeout, true)
    }

    pub(crate) fn cancelled(op: &'static str) -> Self {
        Self::new(op, Cause::Cancelled, false)
    }

    pub(crate) fn exhausted(op: &'static str, attempts: u32, last: ConnectionError) -> Self {
        Self::new(
            op,
            Cause::ExhaustedRetries {
                attempts,
                last: Box::new(last),
            },
            false,
        )
    }

    /// True when the cause is a cancelled scope.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, Cause::Cancelled)
    }

    /// True when the cause is an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, Cause::Timeout)
    }

    /// True when the cause is a closed or absent connection.
    pub fn is_closed(&self) -> bool {
        matches!(self.cause, Cause::Closed)
    }

    /// True when the error indicates a broken pipe that a fresh
    /// connection could fix: closed, EOF, reset, or aborted. Distinct
    /// from `retryable`, which covers errors where the *same*
    /// connection may still work.
    pub fn is_reconnectable(&self) -> bool {
        match &self.cause {
            Cause::Closed => true,
            Cause::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.op, self.cause)
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Cause::Io(err) => Some(err),
            Cause::ExhaustedRetries { last, .. } => Some(last.as_ref()),
            Cause::ReconnectFailed { reconnect, .. } => Some(reconnect.as_ref()),
            _ => None,
        }
    }
}

/// Server lifecycle errors.
#[derive(Debug)]
pub enum ServerError {
    /// `start` was called on a server that is not in the created state.
    AlreadyStarted,
    /// `stop` was called on a server that never started.
    NotStarted,
    /// The bounded stop wait elapsed; shutdown continues in the background.
    StopTimeout,
    /// Binding or closing the listener failed.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::AlreadyStarted => write!(f, "server already started"),
            ServerError::NotStarted => write!(f, "server not started"),
            ServerError::StopTimeout => write!(f, "server stop timed out"),
            ServerError::Io(err) => write!(f, "server io error: {}", err),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Connection pool errors.
#[derive(Debug)]
pub enum PoolError {
    /// The pool has been closed.
    Closed,
    /// Client construction inside the factory failed.
    Config(ConfigError),
    /// Establishing a fresh connection failed.
    Connect(ConnectionError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Closed => write!(f, "connection pool is closed"),
            PoolError::Config(err) => write!(f, "pool factory config error: {}", err),
            PoolError::Connect(err) => write!(f, "pool connect error: {}", err),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Config(err) => Some(err),
            PoolError::Connect(err) => Some(err),
            PoolError::Closed => None,
        }
    }
}

impl From<ConfigError> for PoolError {
    fn from(err: ConfigError) -> Self {
        PoolError::Config(err)
    }
}

impl From<ConnectionError> for PoolError {
    fn from(err: ConnectionError) -> Self {
        PoolError::Connect(err)
    }
}

/// Proof-of-work errors.
#[derive(Debug)]
pub enum PowError {
    /// Requested difficulty is outside `[0, 256]`.
    InvalidDifficulty(i32),
}

impl fmt::Display for PowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowError::InvalidDifficulty(d) => write!(f, "invalid difficulty: {}", d),
        }
    }
}

impl std::error::Error for PowError {}
