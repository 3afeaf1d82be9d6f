//! Optimistic synchronization.
//!
//! Client-side machinery that makes an authoritative server feel local:
//!
//! - `batcher`: groups outgoing commands into ordered network batches
//! - `interaction`: multi-step local decisions that produce one command
//! - `observer`: render watermark and effect observers
//! - `engine`: prediction, pending chain and reconciliation

pub mod batcher;
pub mod interaction;
pub mod observer;
pub mod engine;

pub use batcher::{BatchSink, BatcherConfig, BufferedSink, CommandBatcher, SendFailure};
pub use interaction::{InteractionDeclaration, InteractionError, InteractionPhase, LocalInteractionManager};
pub use observer::{EffectObserver, RecordingObserver, Watermark};
pub use engine::{
    AnimationMap, AnimationMode, AuthoritativeUpdate, CommandDeterminismMap, EngineConfig, EngineError,
    OptimisticEngine, ReconcileOutcome, ReconcileReport, Rejection, SubmitOutcome,
};
