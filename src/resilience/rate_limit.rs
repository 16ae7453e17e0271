//! Per-source rate limiting with bans and adaptive difficulty
//!
//! Tracks three maps keyed by source IP behind a single reader-writer
//! lock: fixed-window connection counters, ban deadlines, and the
//! current proof-of-work difficulty. A background task garbage-collects
//! stale entries on an interval; expired bans are also evicted lazily
//! on lookup.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Counting window length. Counters survive one extra window before the
/// garbage collector drops them.
const WINDOW: Duration = Duration::from_secs(1);

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Connections allowed per source IP per window.
    pub rate_per_sec: i64,
    /// Floor of the adaptive proof-of-work difficulty.
    pub initial_difficulty: i32,
    /// Ceiling of the adaptive proof-of-work difficulty.
    pub max_difficulty: i32,
    /// How long a source stays banned after exceeding the rate.
    pub ban_duration: Duration,
    /// Period of the background garbage-collection pass.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 10,
            initial_difficulty: 4,
            max_difficulty: 8,
            ban_duration: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl RateLimitConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-window connection allowance.
    pub fn with_rate_per_sec(mut self, rate: i64) -> Self {
        self.rate_per_sec = rate;
        self
    }

    /// Set the difficulty floor and ceiling.
    pub fn with_difficulty_range(mut self, initial: i32, max: i32) -> Self {
        self.initial_difficulty = initial;
        self.max_difficulty = max;
        self
    }

    /// Set the ban duration.
    pub fn with_ban_duration(mut self, duration: Duration) -> Self {
        self.ban_duration = duration;
        self
    }

    /// Set the background cleanup interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Configuration for testing (short bans, fast cleanup).
    pub fn for_testing() -> Self {
        Self {
            rate_per_sec: 10,
            initial_difficulty: 4,
            max_difficulty: 8,
            ban_duration: Duration::from_secs(1),
            cleanup_interval: Duration::from_millis(100),
        }
    }
}

/// Outcome of a rate check for one incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Within the rate and no bad recent history; admit directly.
    Allowed,
    /// Rate exceeded; a ban was installed for this source.
    Banned,
    /// Within the rate but the source's difficulty is elevated; admit
    /// only after a solved proof-of-work challenge.
    PowRequired,
}

#[derive(Debug)]
struct RateCounter {
    count: i64,
    window_start: Instant,
}

#[derive(Debug, Default)]
struct SourceMaps {
    counters: HashMap<String, RateCounter>,
    bans: HashMap<String, Instant>,
    difficulties: HashMap<String, i32>,
}

#[derive(Debug)]
struct Shared {
    config: RateLimitConfig,
    maps: RwLock<SourceMaps>,
}

/// Statistics about the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    /// Sources with a live counting window.
    pub tracked_sources: usize,
    /// Sources currently banned (including not-yet-evicted expired bans).
    pub active_bans: usize,
    /// Sources with an elevated difficulty entry.
    pub elevated_sources: usize,
}

/// Per-source rate limiter with bans and adaptive PoW difficulty.
///
/// Construction spawns the background cleanup task, so a limiter must
/// be created inside a tokio runtime. [`stop`](Self::stop) cancels the
/// task and waits for it to exit.
#[derive(Debug)]
pub struct RateLimiter {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    cleanup_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a new rate limiter with default config.
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    /// Create a new rate limiter with custom config and start the
    /// background cleanup task.
    pub fn with_config(config: RateLimitConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            maps: RwLock::new(SourceMaps::default()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::cleanup_loop(shared.clone(), cancel.clone()));

        Self {
            shared,
            cancel,
            cleanup_task: Mutex::new(Some(task)),
        }
    }

    async fn cleanup_loop(shared: Arc<Shared>, cancel: CancellationToken) {
        let period = shared.config.cleanup_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!(
            interval_secs = period.as_secs_f64(),
            "rate limiter cleanup loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    shared.cleanup_at(Instant::now());
                }
            }
        }
        info!("rate limiter cleanup loop stopped");
    }

    /// Signal the cleanup task and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.cleanup_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Check whether a source is currently banned. Expired bans are
    /// evicted on the way through.
    pub fn is_banned(&self, ip: &str) -> bool {
        {
            let maps = self.shared.maps.read();
            match maps.bans.get(ip) {
                None => return false,
                Some(&until) if Instant::now() < until => return true,
                Some(_) => {}
            }
        }

        // Expired: upgrade to the write lock and re-check, since another
        // writer may have re-banned or already evicted in between.
        let mut maps = self.shared.maps.write();
        if let Some(&until) = maps.bans.get(ip) {
            if Instant::now() < until {
                return true;
            }
            maps.bans.remove(ip);
            debug!(ip, "ban expired");
        }
        false
    }

    /// Advance the source's counting window and decide admission.
    ///
    /// Exactly `rate_per_sec` connections in a window are allowed; one
    /// more installs a ban. Sources within the rate but carrying an
    /// elevated difficulty must pass a proof-of-work challenge first.
    pub fn check_and_update_rate(&self, ip: &str) -> RateDecision {
        let now = Instant::now();
        let config = &self.shared.config;
        let mut maps = self.shared.maps.write();
        let SourceMaps {
            counters,
            bans,
            difficulties,
        } = &mut *maps;

        match counters.get_mut(ip) {
            Some(counter) if now.duration_since(counter.window_start) < WINDOW => {
                counter.count += 1;
                if counter.count > config.rate_per_sec {
                    bans.insert(ip.to_string(), now + config.ban_duration);
                    counters.remove(ip);
                    raise_difficulty(difficulties, config, ip);
                    info!(ip, "source banned: rate exceeded");
                    return RateDecision::Banned;
                }
            }
            _ => {
                // First touch in a fresh window.
                counters.insert(
                    ip.to_string(),
                    RateCounter {
                        count: 1,
                        window_start: now,
                    },
                );
            }
        }

        if current_difficulty(difficulties, config, ip) > config.initial_difficulty {
            RateDecision::PowRequired
        } else {
            RateDecision::Allowed
        }
    }

    /// Raise the source's difficulty one step, capped at the ceiling.
    pub fn increase_difficulty(&self, ip: &str) {
        let mut maps = self.shared.maps.write();
        raise_difficulty(&mut maps.difficulties, &self.shared.config, ip);
    }

    /// Lower the source's difficulty one step; reaching the floor
    /// removes the entry.
    pub fn decrease_difficulty(&self, ip: &str) {
        let config = &self.shared.config;
        let mut maps = self.shared.maps.write();
        let current = current_difficulty(&maps.difficulties, config, ip);
        if current > config.initial_difficulty {
            let lowered = current - 1;
            if lowered <= config.initial_difficulty {
                maps.difficulties.remove(ip);
                debug!(ip, "difficulty back at initial");
            } else {
                maps.difficulties.insert(ip.to_string(), lowered);
                debug!(ip, difficulty = lowered, "difficulty lowered");
            }
        }
    }

    /// Current difficulty for a source; absent means the initial value.
    pub fn get_difficulty(&self, ip: &str) -> i32 {
        current_difficulty(
            &self.shared.maps.read().difficulties,
            &self.shared.config,
            ip,
        )
    }

    /// Run a garbage-collection pass over all three maps.
    pub fn cleanup(&self) {
        self.shared.cleanup_at(Instant::now());
    }

    /// Get current stats.
    pub fn stats(&self) -> RateLimitStats {
        let maps = self.shared.maps.read();
        RateLimitStats {
            tracked_sources: maps.counters.len(),
            active_bans: maps.bans.len(),
            elevated_sources: maps.difficulties.len(),
        }
    }

    #[cfg(test)]
    fn age_counter(&self, ip: &str, by: Duration) {
        if let Some(counter) = self.shared.maps.write().counters.get_mut(ip) {
            counter.window_start -= by;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn current_difficulty(
    difficulties: &HashMap<String, i32>,
    config: &RateLimitConfig,
    ip: &str,
) -> i32 {
    difficulties
        .get(ip)
        .copied()
        .unwrap_or(config.initial_difficulty)
}

fn raise_difficulty(difficulties: &mut HashMap<String, i32>, config: &RateLimitConfig, ip: &str) {
    let current = current_difficulty(difficulties, config, ip);
    if current < config.max_difficulty {
        difficulties.insert(ip.to_string(), current + 1);
        debug!(ip, difficulty = current + 1, "difficulty raised");
    }
}

impl Shared {
    fn cleanup_at(&self, now: Instant) {
        let mut maps = self.maps.write();
        let SourceMaps {
            counters,
            bans,
            difficulties,
        } = &mut *maps;

        let before_bans = bans.len();
        bans.retain(|_, &mut until| now < until);

        let before_counters = counters.len();
        counters.retain(|_, counter| now.duration_since(counter.window_start) < WINDOW * 2);

        // Difficulty entries live only as long as a counter or ban keeps
        // the source on the radar; dropping the entry is what gives a
        // reformed source its fresh start.
        let before_difficulties = difficulties.len();
        difficulties.retain(|ip, _| counters.contains_key(ip) || bans.contains_key(ip));

        let removed = (before_bans - bans.len())
            + (before_counters - counters.len())
            + (before_difficulties - difficulties.len());
        if removed > 0 {
            trace!(
                bans = before_bans - bans.len(),
                counters = before_counters - counters.len(),
                difficulties = before_difficulties - difficulties.len(),
                "cleanup removed stale entries"
            );
        }
    }
}
