//! Core deterministic primitives.
//!
//! Randomness, state hashing and time. Everything the sync layer needs to
//! behave identically on client and server lives here.

pub mod rng;
pub mod hash;
pub mod clock;
pub mod scheduler;

// Re-export core types
pub use rng::{DeterministicRng, RandomProbe, RandomSource};
pub use hash::{compute_state_hash, StateHash};
pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use scheduler::{TimerSlot, TimerToken};
