//! Domain Core contract
//!
//! Each game supplies one [`DomainCore`]. All functions are pure: the same
//! inputs must give the same outputs on client and server, which is the whole
//! basis for optimistic prediction.

use std::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::core::rng::RandomSource;
use crate::game::command::{Command, CommandKind};
use crate::game::events::{EventKind, GameEvent};
use crate::game::state::{GameOver, MatchState, PlayerId};

/// Verdict of `validate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Validation {
    /// The command may be executed.
    Valid,
    /// The command is refused; `reason` is a hint for the UI.
    Invalid {
        /// Human-readable reason
        reason: String,
    },
}

impl Validation {
    /// Refuse with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Validation::Invalid { reason: reason.into() }
    }

    /// Whether the command may be executed.
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

/// A bug or impossible state inside domain code.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DomainError(pub String);

impl DomainError {
    /// Create from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Request from domain code to change engine-owned state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SysDirective {
    /// Queue a decision owed by `player_id`.
    QueueInteraction {
        /// Player who must decide
        player_id: PlayerId,
        /// Game-defined prompt key
        prompt: String,
    },
    /// Resolve the current interaction.
    ResolveInteraction,
    /// Only `responders` may act until the window closes.
    OpenResponseWindow {
        /// Players allowed to respond
        responders: Vec<PlayerId>,
    },
    /// Close the response window.
    CloseResponseWindow,
}

/// Game rules, supplied per game.
pub trait DomainCore {
    /// Game-specific state (`core`).
    type State: Clone + Debug + PartialEq + Serialize + DeserializeOwned;
    /// Command enum.
    type Command: CommandKind;
    /// Event enum.
    type Event: EventKind;

    /// Stable game identifier.
    fn game_id(&self) -> &'static str;

    /// Initial core for the seated players.
    fn setup(&self, players: &[PlayerId], random: &mut dyn RandomSource) -> Self::State;

    /// Decide whether `command` is allowed in `state`.
    fn validate(&self, state: &Self::State, command: &Command<Self::Command>) -> Validation;

    /// Produce the events of an allowed command. The only phase that may
    /// consume randomness.
    fn execute(
        &self,
        state: &Self::State,
        command: &Command<Self::Command>,
        random: &mut dyn RandomSource,
    ) -> Result<Vec<Self::Event>, DomainError>;

    /// Apply one event.
    fn reduce(&self, state: Self::State, event: &Self::Event) -> Result<Self::State, DomainError>;

    /// What `player` is allowed to see. Defaults to everything.
    fn player_view(&self, state: &Self::State, _player: PlayerId) -> Self::State {
        state.clone()
    }

    /// What `player` is allowed to see of an event. Defaults to everything.
    fn event_view(&self, event: &Self::Event, _player: PlayerId) -> Self::Event {
        event.clone()
    }

    /// Match result, once the match is over.
    fn is_game_over(&self, _state: &Self::State) -> Option<GameOver> {
        None
    }

    /// Engine-state changes triggered by an applied event.
    fn directives(&self, _state: &Self::State, _event: &GameEvent<Self::Event>) -> Vec<SysDirective> {
        Vec::new()
    }
}

/// Full match state type of a domain.
pub type StateOf<D> = MatchState<<D as DomainCore>::State, <D as DomainCore>::Event>;

/// Command type of a domain.
pub type CommandOf<D> = Command<<D as DomainCore>::Command>;
