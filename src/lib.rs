//! # turnsync
//!
//! Optimistic synchronization for authoritative turn-based matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TURNSYNC                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Xorshift128+ PRNG, random probe           │
//! │  ├── hash.rs     - State hashing for verification            │
//! │  ├── clock.rs    - Wall and manual clocks                    │
//! │  └── scheduler.rs- Cancellable timer slots                   │
//! │                                                              │
//! │  game/           - Rules plumbing (deterministic)            │
//! │  ├── domain.rs   - DomainCore trait                          │
//! │  ├── command.rs  - Commands and their wire form              │
//! │  ├── events.rs   - Events and the event stream               │
//! │  ├── state.rs    - Match state, undo, interactions           │
//! │  └── pipeline.rs - validate / execute / reduce               │
//! │                                                              │
//! │  sync/           - Client side                               │
//! │  ├── batcher.rs  - Command batching                          │
//! │  ├── interaction.rs - Local multi-step interactions          │
//! │  ├── observer.rs - Watermarks and effect observers           │
//! │  └── engine.rs   - Prediction and reconciliation             │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── session.rs  - Authoritative match sessions              │
//! │  ├── client.rs   - Client transport and driver               │
//! │  └── server.rs   - WebSocket server                          │
//! │                                                              │
//! │  demo/           - Skirmish reference game                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! Client prediction only works if the client and the server compute the
//! same thing. `core/` and `game/` therefore:
//! - use BTreeMap, never HashMap, for iteration order
//! - read randomness only through `RandomSource`
//! - take time from the command, never from the system

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod sync;
pub mod network;
pub mod demo;

// Re-export commonly used types
pub use crate::core::rng::{DeterministicRng, RandomSource};
pub use crate::game::domain::{DomainCore, Validation};
pub use crate::game::state::{MatchState, PlayerId};
pub use crate::sync::engine::{AuthoritativeUpdate, EngineConfig, OptimisticEngine};
pub use crate::network::session::{MatchSession, SessionManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
