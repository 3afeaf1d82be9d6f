//! Local Interaction Manager
//!
//! Multi-step decisions (pick targets, arrange cards) happen entirely on the
//! client. Each step updates a local draft; nothing touches the network until
//! `commit` turns the draft into exactly one command.
//!
//! ```text
//! Idle --begin--> Active --update*--> Active --commit/cancel--> Idle
//! ```

use std::fmt::Debug;

use thiserror::Error;
use tracing::debug;

/// Describes one kind of local interaction.
pub trait InteractionDeclaration {
    /// Local working state.
    type Draft: Clone + Debug;
    /// One user step.
    type Step;
    /// Command produced on commit.
    type Command;

    /// Stable name, for logs and UI.
    fn interaction_id(&self) -> &'static str;

    /// Initial draft.
    fn seed(&self) -> Self::Draft;

    /// Apply a step to the draft.
    fn reduce(&self, draft: &Self::Draft, step: Self::Step) -> Result<Self::Draft, InteractionError>;

    /// Turn the final draft into the command to submit.
    fn finalize(&self, draft: Self::Draft) -> Self::Command;
}

/// Interaction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InteractionError {
    /// No interaction is active.
    #[error("no active interaction")]
    NotActive,

    /// The reducer refused a step.
    #[error("step refused: {0}")]
    StepRefused(String),
}

/// Observable phase of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionPhase {
    /// Nothing in progress
    Idle,
    /// An interaction is collecting steps
    Active {
        /// Which interaction
        interaction_id: &'static str,
        /// Steps applied so far
        steps: usize,
    },
}

struct ActiveInteraction<I: InteractionDeclaration> {
    declaration: I,
    draft: I::Draft,
    steps: usize,
}

/// Runs at most one local interaction at a time.
pub struct LocalInteractionManager<I: InteractionDeclaration> {
    active: Option<ActiveInteraction<I>>,
}

impl<I: InteractionDeclaration> Default for LocalInteractionManager<I> {
    fn default() -> Self {
        Self { active: None }
    }
}

impl<I: InteractionDeclaration> LocalInteractionManager<I> {
    /// Create an idle manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an interaction. An active one is discarded.
    pub fn begin(&mut self, declaration: I) {
        if let Some(previous) = &self.active {
            debug!(
                "Interaction {} replaced by {}",
                previous.declaration.interaction_id(),
                declaration.interaction_id()
            );
        }
        let draft = declaration.seed();
        self.active = Some(ActiveInteraction { declaration, draft, steps: 0 });
    }

    /// Apply one step. A refused step cancels the interaction.
    pub fn update(&mut self, step: I::Step) -> Result<&I::Draft, InteractionError> {
        let active = self.active.as_mut().ok_or(InteractionError::NotActive)?;
        match active.declaration.reduce(&active.draft, step) {
            Ok(draft) => {
                active.draft = draft;
                active.steps += 1;
            }
            Err(e) => {
                debug!("Interaction {} cancelled: {}", active.declaration.interaction_id(), e);
                self.active = None;
                return Err(e);
            }
        }
        self.draft().ok_or(InteractionError::NotActive)
    }

    /// Finish the interaction and produce its command.
    pub fn commit(&mut self) -> Result<I::Command, InteractionError> {
        let active = self.active.take().ok_or(InteractionError::NotActive)?;
        debug!(
            "Interaction {} committed after {} steps",
            active.declaration.interaction_id(),
            active.steps
        );
        Ok(active.declaration.finalize(active.draft))
    }

    /// Abandon the interaction. Returns whether one was active.
    pub fn cancel(&mut self) -> bool {
        self.active.take().is_some()
    }

    /// Whether an interaction is in progress.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Current draft.
    pub fn draft(&self) -> Option<&I::Draft> {
        self.active.as_ref().map(|a| &a.draft)
    }

    /// Current phase.
    pub fn phase(&self) -> InteractionPhase {
        match &self.active {
            None => InteractionPhase::Idle,
            Some(active) => InteractionPhase::Active {
                interaction_id: active.declaration.interaction_id(),
                steps: active.steps,
            },
        }
    }
}
