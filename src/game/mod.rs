//! Game Logic Module
//!
//! The domain contract and the pure state-transition pipeline shared by
//! client prediction and server authority.
//!
//! ## Module Structure
//!
//! - `domain`: the `DomainCore` trait each game implements
//! - `command`: commands and their batched wire form
//! - `events`: game events and the event stream
//! - `state`: match state (`core` + engine-owned `sys`)
//! - `pipeline`: validate -> execute -> reduce

pub mod domain;
pub mod command;
pub mod events;
pub mod state;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod test_domain;

// Re-export key types
pub use domain::{CommandOf, DomainCore, DomainError, StateOf, SysDirective, Validation};
pub use command::{BatchedCommand, Command, CommandKind};
pub use events::{EventId, EventKind, EventStream, EventStreamEntry, GameEvent};
pub use state::{MatchState, PlayerId};
pub use pipeline::{guarded_transition, setup, transition, PipelineConfig, PipelineError, TransitionOutcome};
