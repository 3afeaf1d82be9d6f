//! Deterministic Random Number Generator
//!
//! Uses Xorshift128+ algorithm for fast, high-quality, deterministic randomness.
//! Given the same seed, produces identical sequence on all platforms, which is
//! what lets a client replay a server-side `execute` bit for bit.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Source of randomness handed to `DomainCore::execute`.
///
/// Only `next_u64` is required; every other draw is derived from it so that
/// wrappers (see [`RandomProbe`]) observe each draw.
pub trait RandomSource {
    /// Generate the next 64-bit random value.
    fn next_u64(&mut self) -> u64;

    /// Generate a random integer in range [0, max).
    fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        // Simple modulo - slight bias for very large max, but acceptable
        (self.next_u64() % max as u64) as u32
    }

    /// Roll a die with `sides` faces, returning [1, sides].
    fn d(&mut self, sides: u32) -> u32 {
        if sides == 0 {
            return 0;
        }
        self.next_int(sides) + 1
    }

    /// Generate a random integer in range [min, max].
    fn range(&mut self, min: i32, max: i32) -> i32 {
        if min >= max {
            return min;
        }
        let span = (max as i64 - min as i64 + 1) as u64;
        (min as i64 + (self.next_u64() % span) as i64) as i32
    }
}

/// Shuffle a slice in place using Fisher-Yates algorithm.
pub fn shuffle<R: RandomSource + ?Sized, T>(rng: &mut R, slice: &mut [T]) {
    let len = slice.len();
    for i in (1..len).rev() {
        let j = rng.next_int((i + 1) as u32) as usize;
        slice.swap(i, j);
    }
}

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Determinism Guarantee
///
/// Given the same seed, this RNG will produce the exact same sequence
/// of random numbers on any platform.
///
/// # Example
///
/// ```
/// use turnsync::core::rng::{DeterministicRng, RandomSource};
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Get current state (for checkpointing/debugging).
    pub fn state(&self) -> [u64; 2] {
        self.state
    }

    /// Restore from saved state.
    pub fn set_state(&mut self, state: [u64; 2]) {
        self.state = state;
    }
}

impl RandomSource for DeterministicRng {
    #[inline]
    fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }
}

/// Wraps a [`RandomSource`] and counts how many draws went through it.
///
/// The optimistic engine runs commands without a determinism declaration
/// through a probe; any draw means the outcome depends on server randomness
/// and the local prediction is thrown away.
pub struct RandomProbe<'a> {
    inner: &'a mut dyn RandomSource,
    draws: u32,
}

impl<'a> RandomProbe<'a> {
    /// Wrap a random source.
    pub fn new(inner: &'a mut dyn RandomSource) -> Self {
        Self { inner, draws: 0 }
    }

    /// Whether any randomness was consumed.
    pub fn was_used(&self) -> bool {
        self.draws > 0
    }

    /// Number of 64-bit draws made through the probe.
    pub fn draws(&self) -> u32 {
        self.draws
    }
}

impl RandomSource for RandomProbe<'_> {
    fn next_u64(&mut self) -> u64 {
        self.draws += 1;
        self.inner.next_u64()
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a match seed from the match identity.
///
/// - `match_id`: Unique match identifier
/// - `player_ids`: Seated player IDs in seat order
/// - `salt`: Server-side secret so clients cannot precompute rolls
pub fn derive_match_seed(match_id: &[u8; 16], player_ids: &[[u8; 16]], salt: u64) -> u64 {
    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"TURNSYNC_SEED_V1");
    hasher.update(match_id);
    for pid in player_ids {
        hasher.update(pid);
    }
    hasher.update(salt.to_le_bytes());

    let hash = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// TESTS
// =============================================================================
