//! Retrying reads and writes with reconnection
//!
//! Distinguishes a bad pipe from a bad attempt: broken-connection
//! errors trigger a reconnect before the next try, plain retryable
//! errors (timeouts) just wait out the backoff, and terminal errors
//! return immediately. Every backoff sleep honors the client's
//! cancellation scope.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Cause, ConnectionError};
use crate::network::client::Client;

impl Client {
    /// Write with up to `max_attempts` tries, reconnecting when the
    /// connection itself is broken. A zero attempt budget is treated
    /// as one.
    pub async fn write_with_retry(
        &self,
        data: &[u8],
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<(), ConnectionError> {
        let max_attempts = max_attempts.max(1);
        let mut last: Option<ConnectionError> = None;

        for attempt in 1..=max_attempts {
            if self.cancel_token().is_cancelled() {
                return Err(ConnectionError::cancelled("write"));
            }

            match self.write(data).await {
                Ok(()) => {
                    self.stats.write().retry_count = 0;
                    return Ok(());
                }
                Err(err) => {
                    debug!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "write attempt failed"
                    );
                    self.stats.write().retry_count += 1;

                    if err.is_cancelled() {
                        return Err(err);
                    }
                    self.backoff_sleep(backoff, "write").await?;

                    // A wedged or broken pipe needs a fresh connection;
                    // writes reconnect on any retryable failure too,
                    // since a timed-out write leaves the stream in an
                    // unknown position.
                    if err.is_reconnectable() || err.retryable {
                        if let Err(reconnect_err) = self.reconnect().await {
                            warn!(error = %reconnect_err, "reconnect after write failure failed");
                            return Err(ConnectionError::new(
                                "write",
                                Cause::ReconnectFailed {
                                    reconnect: Box::new(reconnect_err),
                                    original: Box::new(err),
                                },
                                false,
                            ));
                        }
                        debug!("reconnect successful");
                        last = Some(err);
                    } else {
                        return Err(err);
                    }
                }
            }
        }

        let attempts = max_attempts;
        match last {
            Some(err) => Err(ConnectionError::exhausted("write", attempts, err)),
            None => Err(ConnectionError::closed("write")),
        }
    }

    /// Read with up to `max_attempts` tries. Broken connections
    /// reconnect first; other retryable errors re-read over the same
    /// connection after the backoff. A zero attempt budget is treated
    /// as one.
    pub async fn read_with_retry(
        &self,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<Vec<u8>, ConnectionError> {
        let max_attempts = max_attempts.max(1);
        let mut last: Option<ConnectionError> = None;

        for attempt in 1..=max_attempts {
            if self.cancel_token().is_cancelled() {
                return Err(ConnectionError::cancelled("read"));
            }

            match self.read().await {
                Ok(data) => {
                    self.stats.write().retry_count = 0;
                    return Ok(data);
                }
                Err(err) => {
                    debug!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "read attempt failed"
                    );
                    self.stats.write().retry_count += 1;

                    if err.is_cancelled() {
                        return Err(err);
                    }
                    self.backoff_sleep(backoff, "read").await?;

                    if err.is_reconnectable() {
                        if let Err(reconnect_err) = self.reconnect().await {
                            warn!(error = %reconnect_err, "reconnect after read failure failed");
                            return Err(ConnectionError::new(
                                "read",
                                Cause::ReconnectFailed {
                                    reconnect: Box::new(reconnect_err),
                                    original: Box::new(err),
                                },
                                false,
                            ));
                        }
                        debug!("reconnect successful");
                        last = Some(err);
                    } else if err.retryable {
                        // Bad attempt, good pipe: just try again.
                        last = Some(err);
                    } else {
                        return Err(err);
                    }
                }
            }
        }

        match last {
            Some(err) => Err(ConnectionError::exhausted("read", max_attempts, err)),
            None => Err(ConnectionError::closed("read")),
        }
    }

    async fn backoff_sleep(
        &self,
        backoff: Duration,
        op: &'static str,
    ) -> Result<(), ConnectionError> {
        let token = self.cancel_token();
        tokio::select! {
            _ = token.cancelled() => Err(ConnectionError::cancelled(op)),
            _ = tokio::time::sleep(backoff) => Ok(()),
        }
    }
}
