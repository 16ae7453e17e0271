//! Injected metrics sink
//!
//! The server and admission gate report a handful of counters through
//! this trait instead of a process-global registry. The default sink
//! discards everything; bind your own implementation to feed whatever
//! metrics backend the host process uses.

use std::sync::Arc;

/// Counter names emitted by the server and admission gate.
pub mod names {
    pub const CONNECTIONS_ACCEPTED: &str = "connections_accepted";
    pub const CONNECTIONS_REJECTED_CAPACITY: &str = "connections_rejected_capacity";
    pub const CONNECTIONS_REJECTED_BANNED: &str = "connections_rejected_banned";
    pub const CONNECTIONS_ADMITTED: &str = "connections_admitted";
    pub const BANS_INSTALLED: &str = "bans_installed";
    pub const POW_CHALLENGES_ISSUED: &str = "pow_challenges_issued";
    pub const POW_CHALLENGES_FAILED: &str = "pow_challenges_failed";
}

/// Destination for operational counters and gauges.
pub trait MetricsSink: Send + Sync {
    /// Add `value` to the named counter.
    fn incr(&self, name: &'static str, value: u64);

    /// Set the named gauge.
    fn gauge(&self, name: &'static str, value: i64);
}

/// Sink that discards every measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _name: &'static str, _value: u64) {}

    fn gauge(&self, _name: &'static str, _value: i64) {}
}

pub(crate) fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Recording sink used by tests across the crate.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub counters: std::sync::Mutex<std::collections::HashMap<&'static str, u64>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn count(&self, name: &'static str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
impl MetricsSink for RecordingSink {
    fn incr(&self, name: &'static str, value: u64) {
        *self.counters.lock().unwrap().entry(name).or_default() += value;
    }

    fn gauge(&self, _name: &'static str, _value: i64) {}
}
