//! Proof-of-work challenge/response prelude
//!
//! A challenge is 44 bytes on the wire, big-endian:
//!
//! ```text
//! +0   i64   timestamp (seconds since Unix epoch)
//! +8   [32]  random bytes
//! +40  i32   difficulty (required leading zero bits)
//! ```
//!
//! The solution is a single big-endian `u64` nonce. A solution is valid
//! when `SHA-256(timestamp || random || nonce)` has at least
//! `difficulty` leading zero bits and the challenge is no more than
//! [`CHALLENGE_TTL_SECS`] old at verification time.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PowError;

/// Wire size of a challenge.
pub const CHALLENGE_LEN: usize = 44;

/// Wire size of a solution.
pub const SOLUTION_LEN: usize = 8;

/// Maximum accepted age of a challenge at verification time.
pub const CHALLENGE_TTL_SECS: i64 = 60;

/// Highest meaningful difficulty (the digest is 256 bits).
pub const MAX_DIFFICULTY_BITS: i32 = 256;

/// Get current Unix timestamp in seconds
fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A proof-of-work puzzle sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Unix timestamp (seconds) when the challenge was generated.
    pub timestamp: i64,
    /// CSPRNG output binding the puzzle to this challenge.
    pub random: [u8; 32],
    /// Required number of leading zero bits, in `[0, 256]`.
    pub difficulty: i32,
}

/// A nonce answering a [`Challenge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solution {
    /// Nonce that produces the required leading zeros.
    pub nonce: u64,
}

/// Generate a fresh challenge at the given difficulty.
pub fn generate(difficulty: i32) -> Result<Challenge, PowError> {
    if !(0..=MAX_DIFFICULTY_BITS).contains(&difficulty) {
        return Err(PowError::InvalidDifficulty(difficulty));
    }

    let mut random = [0u8; 32];
    OsRng.fill_bytes(&mut random);

    Ok(Challenge {
        timestamp: current_timestamp(),
        random,
        difficulty,
    })
}

impl Challenge {
    /// Check a solution against the current wall clock.
    pub fn validate(&self, solution: &Solution) -> bool {
        self.validate_at(solution, current_timestamp())
    }

    /// Check a solution as of `now` (Unix seconds). Rejects challenges
    /// older than [`CHALLENGE_TTL_SECS`]; age exactly at the limit is
    /// still accepted.
    pub fn validate_at(&self, solution: &Solution, now: i64) -> bool {
        if now - self.timestamp > CHALLENGE_TTL_SECS {
            return false;
        }
        count_leading_zeros(&self.digest(solution.nonce)) >= self.difficulty
    }

    /// Brute-force a nonce for this challenge, trying at most
    /// `max_iterations` candidates.
    pub fn solve(&self, max_iterations: u64) -> Option<Solution> {
        for nonce in 0..max_iterations {
            if count_leading_zeros(&self.digest(nonce)) >= self.difficulty {
                return Some(Solution { nonce });
            }
        }
        None
    }

    fn digest(&self, nonce: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.random);
        hasher.update(nonce.to_be_bytes());
        hasher.finalize().into()
    }

    /// Encode in wire order.
    pub fn to_bytes(&self) -> [u8; CHALLENGE_LEN] {
        let mut buf = [0u8; CHALLENGE_LEN];
        buf[0..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..40].copy_from_slice(&self.random);
        buf[40..44].copy_from_slice(&self.difficulty.to_be_bytes());
        buf
    }

    /// Decode from wire order.
    pub fn from_bytes(buf: &[u8; CHALLENGE_LEN]) -> Self {
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[0..8]);
        let mut random = [0u8; 32];
        random.copy_from_slice(&buf[8..40]);
        let mut difficulty = [0u8; 4];
        difficulty.copy_from_slice(&buf[40..44]);

        Self {
            timestamp: i64::from_be_bytes(timestamp),
            random,
            difficulty: i32::from_be_bytes(difficulty),
        }
    }
}

impl Solution {
    /// Encode in wire order.
    pub fn to_bytes(&self) -> [u8; SOLUTION_LEN] {
        self.nonce.to_be_bytes()
    }

    /// Decode from wire order.
    pub fn from_bytes(buf: &[u8; SOLUTION_LEN]) -> Self {
        Self {
            nonce: u64::from_be_bytes(*buf),
        }
    }
}

/// Count leading zero bits, most significant bit first.
pub fn count_leading_zeros(data: &[u8]) -> i32 {
    let mut zeros = 0i32;
    for byte in data {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros() as i32;
            break;
        }
    }
    zeros
}

/// Write a challenge to the sink.
pub async fn write_challenge<W>(sink: &mut W, challenge: &Challenge) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(&challenge.to_bytes()).await
}

/// Read a challenge with an exact-length read; a short read is an error.
pub async fn read_challenge<R>(source: &mut R) -> std::io::Result<Challenge>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CHALLENGE_LEN];
    source.read_exact(&mut buf).await?;
    Ok(Challenge::from_bytes(&buf))
}

/// Write a solution to the sink.
pub async fn write_solution<W>(sink: &mut W, solution: &Solution) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(&solution.to_bytes()).await
}

/// Read a solution with an exact-length read; a short read is an error.
pub async fn read_solution<R>(source: &mut R) -> std::io::Result<Solution>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; SOLUTION_LEN];
    source.read_exact(&mut buf).await?;
    Ok(Solution::from_bytes(&buf))
}
