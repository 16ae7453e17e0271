//! Connection admission gate
//!
//! Decides, per incoming connection, between three outcomes: admit
//! directly, reject (ban or failed challenge), or admit after a solved
//! proof-of-work challenge. The cheap checks (ban, rate) run first; the
//! costly challenge only fires on the ambiguous path, when the source
//! is within its rate but carries an elevated difficulty from recent
//! abuse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::metrics::{self, names, MetricsSink};
use crate::network::conn::BoxedConn;
use crate::network::server::Middleware;
use crate::resilience::pow;
use crate::resilience::rate_limit::{RateDecision, RateLimiter};

/// Deadline for writing the challenge to the peer.
pub const CHALLENGE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the peer to produce a solution.
pub const SOLUTION_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Admission middleware combining ban checks, rate limiting, and the
/// proof-of-work handshake.
pub struct AdmissionGate {
    limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
}

impl AdmissionGate {
    /// Create a gate over a shared rate limiter.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            metrics: metrics::noop(),
        }
    }

    /// Install a metrics sink.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Run the challenge handshake. Both steps carry their own
    /// deadline so a peer cannot hold the socket open indefinitely
    /// mid-handshake.
    async fn run_challenge(&self, conn: &mut BoxedConn, ip: &str, peer: SocketAddr) -> bool {
        // Raise before generating so a repeat offender faces the harder
        // puzzle on this very connection.
        self.limiter.increase_difficulty(ip);
        let difficulty = self.limiter.get_difficulty(ip);

        let challenge = match pow::generate(difficulty) {
            Ok(challenge) => challenge,
            Err(err) => {
                warn!(%peer, error = %err, "failed to generate challenge");
                return false;
            }
        };
        self.metrics.incr(names::POW_CHALLENGES_ISSUED, 1);

        match tokio::time::timeout(
            CHALLENGE_WRITE_TIMEOUT,
            pow::write_challenge(conn, &challenge),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(%peer, error = %err, "failed to write challenge");
                self.metrics.incr(names::POW_CHALLENGES_FAILED, 1);
                return false;
            }
            Err(_) => {
                debug!(%peer, "challenge write timed out");
                self.metrics.incr(names::POW_CHALLENGES_FAILED, 1);
                return false;
            }
        }

        let solution = match tokio::time::timeout(SOLUTION_READ_TIMEOUT, pow::read_solution(conn))
            .await
        {
            Ok(Ok(solution)) => solution,
            Ok(Err(err)) => {
                debug!(%peer, error = %err, "failed to read solution");
                self.metrics.incr(names::POW_CHALLENGES_FAILED, 1);
                return false;
            }
            Err(_) => {
                debug!(%peer, "no solution before deadline");
                self.metrics.incr(names::POW_CHALLENGES_FAILED, 1);
                return false;
            }
        };

        if !challenge.validate(&solution) {
            // The difficulty was already raised; the next attempt pays
            // more.
            debug!(%peer, difficulty, "invalid solution");
            self.metrics.incr(names::POW_CHALLENGES_FAILED, 1);
            return false;
        }

        self.limiter.decrease_difficulty(ip);
        debug!(%peer, difficulty, "solution accepted");
        true
    }
}

#[async_trait]
impl Middleware for AdmissionGate {
    async fn admit(&self, conn: &mut BoxedConn, peer: SocketAddr) -> bool {
        let ip = peer.ip().to_string();

        if self.limiter.is_banned(&ip) {
            debug!(%peer, "rejected: currently banned");
            self.metrics.incr(names::CONNECTIONS_REJECTED_BANNED, 1);
            return false;
        }

        match self.limiter.check_and_update_rate(&ip) {
            RateDecision::Banned => {
                info!(%peer, "rejected: rate limit exceeded, source banned");
                self.metrics.incr(names::BANS_INSTALLED, 1);
                false
            }
            RateDecision::Allowed => {
                trace!(%peer, "admitted within rate");
                true
            }
            RateDecision::PowRequired => self.run_challenge(conn, &ip, peer).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingSink;
    use crate::resilience::rate_limit::RateLimitConfig;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = async { listener.accept().await.unwrap() };
        let (client, (server, peer)) = tokio::join!(client, server);
        (client.unwrap(), server, peer)
    }

    fn gate() -> (AdmissionGate, Arc<RateLimiter>, Arc<RecordingSink>) {
        // Long cleanup interval so the collector cannot race the
        // difficulty assertions below.
        let limiter = Arc::new(RateLimiter::with_config(
            RateLimitConfig::for_testing().with_cleanup_interval(Duration::from_secs(60)),
        ));
        let sink = Arc::new(RecordingSink::default());
        let gate = AdmissionGate::new(limiter.clone()).with_metrics(sink.clone());
        (gate, limiter, sink)
    }

    #[tokio::test]
    async fn test_clean_source_admitted_without_challenge() {
        let (gate, limiter, _sink) = gate();
        let (mut client, server, peer) = tcp_pair().await;
        let mut conn: BoxedConn = Box::new(server);

        assert!(gate.admit(&mut conn, peer).await);

        // No challenge was written: the client side has nothing to read.
        let mut probe = [0u8; 1];
        client.set_nodelay(true).unwrap();
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            tokio::io::AsyncReadExt::read(&mut client, &mut probe),
        )
        .await;
        assert!(pending.is_err());

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_banned_source_rejected() {
        let (gate, limiter, sink) = gate();
        let (_client, server, peer) = tcp_pair().await;
        let mut conn: BoxedConn = Box::new(server);

        let ip = peer.ip().to_string();
        for _ in 0..11 {
            let _ = limiter.check_and_update_rate(&ip);
        }
        assert!(!gate.admit(&mut conn, peer).await);
        assert_eq!(sink.count(names::CONNECTIONS_REJECTED_BANNED), 1);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_rate_exceeding_connection_installs_ban() {
        let (gate, limiter, sink) = gate();
        let (_client, server, peer) = tcp_pair().await;
        let mut conn: BoxedConn = Box::new(server);

        let ip = peer.ip().to_string();
        for _ in 0..10 {
            let _ = limiter.check_and_update_rate(&ip);
        }
        // This connection is number eleven in the window.
        assert!(!gate.admit(&mut conn, peer).await);
        assert!(limiter.is_banned(&ip));
        assert_eq!(sink.count(names::BANS_INSTALLED), 1);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_challenge_round_trip_admits_solver() {
        let (gate, limiter, sink) = gate();
        let (mut client, server, peer) = tcp_pair().await;
        let mut conn: BoxedConn = Box::new(server);

        let ip = peer.ip().to_string();
        limiter.increase_difficulty(&ip);
        assert_eq!(limiter.get_difficulty(&ip), 5);

        let solver = tokio::spawn(async move {
            let challenge = pow::read_challenge(&mut client).await.unwrap();
            let solution = challenge.solve(1 << 24).unwrap();
            pow::write_solution(&mut client, &solution).await.unwrap();
            challenge
        });

        assert!(gate.admit(&mut conn, peer).await);
        let challenge = solver.await.unwrap();

        // Raised to 6 before the challenge went out, then lowered on
        // success.
        assert_eq!(challenge.difficulty, 6);
        assert_eq!(limiter.get_difficulty(&ip), 5);
        assert_eq!(sink.count(names::POW_CHALLENGES_ISSUED), 1);
        assert_eq!(sink.count(names::POW_CHALLENGES_FAILED), 0);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_solution_rejected_and_difficulty_stays_up() {
        let (gate, limiter, sink) = gate();
        let (mut client, server, peer) = tcp_pair().await;
        let mut conn: BoxedConn = Box::new(server);

        let ip = peer.ip().to_string();
        // Drive the difficulty to the ceiling so no lucky nonce slips
        // through in a unit test.
        for _ in 0..4 {
            limiter.increase_difficulty(&ip);
        }
        assert_eq!(limiter.get_difficulty(&ip), 8);

        let solver = tokio::spawn(async move {
            let challenge = pow::read_challenge(&mut client).await.unwrap();
            // Search for a nonce that does NOT satisfy the challenge.
            let mut nonce = 0u64;
            while challenge.validate(&pow::Solution { nonce }) {
                nonce += 1;
            }
            pow::write_solution(&mut client, &pow::Solution { nonce })
                .await
                .unwrap();
        });

        assert!(!gate.admit(&mut conn, peer).await);
        solver.await.unwrap();

        // Already at the ceiling before the handshake; the failure
        // leaves it there.
        assert_eq!(limiter.get_difficulty(&ip), 8);
        assert_eq!(sink.count(names::POW_CHALLENGES_FAILED), 1);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_peer_hanging_up_mid_handshake_rejected() {
        let (gate, limiter, sink) = gate();
        let (client, server, peer) = tcp_pair().await;
        let mut conn: BoxedConn = Box::new(server);

        let ip = peer.ip().to_string();
        limiter.increase_difficulty(&ip);

        // The peer reads the challenge and disconnects without
        // answering.
        let quitter = tokio::spawn(async move {
            let mut client = client;
            let _ = pow::read_challenge(&mut client).await;
        });

        assert!(!gate.admit(&mut conn, peer).await);
        quitter.await.unwrap();
        assert_eq!(sink.count(names::POW_CHALLENGES_FAILED), 1);

        limiter.stop().await;
    }
}
