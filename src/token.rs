//! Token Generator
//!
//! Produces the correctness markers carried through each round-trip.
//! Tokens only need to be unique, not unpredictable, so a seeded
//! non-cryptographic generator per worker is enough.
//!
//! # Example
//!
//! ```rust,ignore
//! use crosstalk_probe::token::{TokenGenerator, DEFAULT_TOKEN_LENGTH};
//!
//! let mut tokens = TokenGenerator::for_worker(3);
//! let token = tokens.generate(DEFAULT_TOKEN_LENGTH);
//! assert_eq!(token.as_str().len(), 22);
//! ```

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of symbols in `{0-9, A-Z, a-z}`
pub const ALPHABET_SIZE: u32 = 62;

/// 62^22 is about 2.7e39, far beyond any realistic run volume squared
pub const DEFAULT_TOKEN_LENGTH: usize = 22;

/// Upper bound on the collision probability accepted by [`is_collision_safe`]
pub const MAX_COLLISION_PROBABILITY: f64 = 1e-9;

/// Odd 64-bit constant used to spread worker indices across the seed space
const WORKER_SEED_SPREAD: u64 = 0x9E37_79B9_7F4A_7C15;

/// Opaque alphanumeric identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Fixed token for tests; only alphanumeric ASCII is accepted.
    #[cfg(test)]
    pub(crate) fn parse(s: &str) -> Option<Self> {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-worker token source
#[derive(Debug, Clone)]
pub struct TokenGenerator {
    rng: StdRng,
}

impl TokenGenerator {
    /// Seed from wall-clock time mixed with the worker index, so workers
    /// started in the same instant still draw independent sequences.
    pub fn for_worker(worker_id: usize) -> Self {
        let now = chrono::Utc::now();
        let nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().wrapping_mul(1_000)) as u64;
        let seed = nanos ^ (worker_id as u64 + 1).wrapping_mul(WORKER_SEED_SPREAD);
        Self::with_seed(seed)
    }

    /// Deterministic generator
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw a token of exactly `length` characters, uniform over the alphabet.
    pub fn generate(&mut self, length: usize) -> Token {
        let s: String = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect();
        Token(s)
    }
}

/// Birthday bound: P(any collision) <= n^2 / (2 * 62^length)
pub fn collision_probability(length: usize, total_tokens: u64) -> f64 {
    let space = (ALPHABET_SIZE as f64).powi(length as i32);
    let n = total_tokens as f64;
    ((n * n) / (2.0 * space)).min(1.0)
}

pub fn is_collision_safe(length: usize, total_tokens: u64) -> bool {
    collision_probability(length, total_tokens) <= MAX_COLLISION_PROBABILITY
}
