//! State-Transition Pipeline
//!
//! `validate -> execute -> reduce`, shared by client prediction, client replay
//! and server authority. Invoking it identically on both sides is what makes
//! optimistic prediction meaningful.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

use crate::core::rng::RandomSource;
use crate::game::command::Command;
use crate::game::domain::{CommandOf, DomainCore, DomainError, StateOf, SysDirective, Validation};
use crate::game::events::{DEFAULT_EVENT_CAPACITY, EventStreamEntry, GameEvent};
use crate::game::state::{
    MatchState, PlayerId, ResponseWindow, SysState, UndoSnapshot, DEFAULT_UNDO_CAPACITY,
};

/// Sizes of the engine-owned history.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Event stream entries kept per state
    pub event_capacity: usize,
    /// Undo snapshots kept (0 disables undo)
    pub undo_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            undo_capacity: DEFAULT_UNDO_CAPACITY,
        }
    }
}

/// Pipeline phase, for fault reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `DomainCore::execute`
    Execute,
    /// `DomainCore::reduce`
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Execute => f.write_str("execute"),
            Phase::Reduce => f.write_str("reduce"),
        }
    }
}

/// Domain code failed while running a command.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// `execute` or `reduce` returned an error.
    #[error("domain fault during {phase} of {command_type}: {source}")]
    DomainFault {
        /// Failing phase
        phase: Phase,
        /// Command being run
        command_type: String,
        /// The domain's error
        #[source]
        source: DomainError,
    },

    /// Domain code panicked.
    #[error("domain code panicked during {command_type}: {message}")]
    Panicked {
        /// Command being run
        command_type: String,
        /// Panic payload, if it was a string
        message: String,
    },
}

/// A successfully applied command.
#[derive(Debug, Clone)]
pub struct Transition<G, E> {
    /// State after the command
    pub state: MatchState<G, E>,
    /// Entries appended to the event stream, in order
    pub events: Vec<EventStreamEntry<E>>,
}

/// Result of running one command.
#[derive(Debug, Clone)]
pub enum TransitionOutcome<G, E> {
    /// The command was applied.
    Applied(Transition<G, E>),
    /// Validation refused the command; nothing changed.
    Rejected {
        /// Reason given by the gate or the domain
        reason: String,
    },
}

/// Create the initial match state.
pub fn setup<D: DomainCore + ?Sized>(
    domain: &D,
    players: &[PlayerId],
    random: &mut dyn RandomSource,
    config: &PipelineConfig,
) -> StateOf<D> {
    let core = domain.setup(players, random);
    let mut state = MatchState::new(core, config.event_capacity, config.undo_capacity);
    state.sys.game_over = domain.is_game_over(&state.core);
    state
}

/// Run one command against `state`. `state` itself is never modified.
pub fn transition<D: DomainCore + ?Sized>(
    domain: &D,
    state: &StateOf<D>,
    command: &CommandOf<D>,
    random: &mut dyn RandomSource,
) -> Result<TransitionOutcome<D::State, D::Event>, PipelineError> {
    let command_type = command.command_type();

    if let Validation::Invalid { reason } = sys_gate(&state.sys, command) {
        return Ok(TransitionOutcome::Rejected { reason });
    }
    if let Validation::Invalid { reason } = domain.validate(&state.core, command) {
        return Ok(TransitionOutcome::Rejected { reason });
    }

    let produced = domain
        .execute(&state.core, command, random)
        .map_err(|source| PipelineError::DomainFault {
            phase: Phase::Execute,
            command_type: command_type.to_string(),
            source,
        })?;

    let mut core = state.core.clone();
    let mut sys = state.sys.clone();
    let mut events = Vec::with_capacity(produced.len());

    for data in produced {
        let event = GameEvent::new(data, command.timestamp, command_type);
        core = domain
            .reduce(core, &event.data)
            .map_err(|source| PipelineError::DomainFault {
                phase: Phase::Reduce,
                command_type: command_type.to_string(),
                source,
            })?;

        for directive in domain.directives(&core, &event) {
            apply_directive(&mut sys, directive, command_type);
        }

        let id = sys.event_stream.append(event.clone());
        events.push(EventStreamEntry { id, event });
    }

    sys.undo.push(UndoSnapshot {
        version: state.sys.version,
        command_type: command_type.to_string(),
        core: state.core.clone(),
    });
    sys.version += 1;
    sys.game_over = domain.is_game_over(&core);

    #[cfg(feature = "debug-tracing")]
    tracing::trace!(
        game = domain.game_id(),
        command = command_type,
        version = sys.version,
        events = events.len(),
        "transition applied"
    );

    Ok(TransitionOutcome::Applied(Transition {
        state: MatchState { core, sys },
        events,
    }))
}

/// [`transition`], with panics in domain code turned into
/// [`PipelineError::Panicked`].
pub fn guarded_transition<D: DomainCore + ?Sized>(
    domain: &D,
    state: &StateOf<D>,
    command: &CommandOf<D>,
    random: &mut dyn RandomSource,
) -> Result<TransitionOutcome<D::State, D::Event>, PipelineError> {
    match panic::catch_unwind(AssertUnwindSafe(|| transition(domain, state, command, random))) {
        Ok(result) => result,
        Err(payload) => Err(PipelineError::Panicked {
            command_type: command.command_type().to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Engine-level admission: finished matches, response windows, interactions.
fn sys_gate<G, E, C>(sys: &SysState<G, E>, command: &Command<C>) -> Validation {
    if sys.game_over.is_some() {
        return Validation::deny("match is over");
    }
    if let Some(window) = &sys.response_window {
        if !window.responders.contains(&command.player_id) {
            return Validation::deny(format!("waiting for a response to {}", window.opened_by));
        }
        return Validation::Valid;
    }
    if let Some(current) = sys.interaction.current() {
        if current.player_id != command.player_id {
            return Validation::deny(format!(
                "waiting for {} to resolve {}",
                current.player_id, current.prompt
            ));
        }
    }
    Validation::Valid
}

fn apply_directive<G, E>(sys: &mut SysState<G, E>, directive: SysDirective, command_type: &str) {
    match directive {
        SysDirective::QueueInteraction { player_id, prompt } => {
            sys.interaction.push(player_id, prompt);
        }
        SysDirective::ResolveInteraction => {
            sys.interaction.resolve_current();
        }
        SysDirective::OpenResponseWindow { responders } => {
            sys.response_window = Some(ResponseWindow {
                responders,
                opened_by: command_type.to_string(),
            });
        }
        SysDirective::CloseResponseWindow => {
            sys.response_window = None;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::DeterministicRng;
    use crate::game::test_domain::{add, Counter, CounterCommand, CounterEvent, CounterState, ALICE, BOB};

    type Outcome = TransitionOutcome<CounterState, CounterEvent>;

    fn fresh() -> StateOf<Counter> {
        let mut rng = DeterministicRng::new(1);
        setup(&Counter, &[ALICE, BOB], &mut rng, &PipelineConfig::default())
    }

    fn applied(outcome: Outcome) -> Transition<CounterState, CounterEvent> {
        match outcome {
            TransitionOutcome::Applied(t) => t,
            TransitionOutcome::Rejected { reason } => panic!("unexpected rejection: {reason}"),
        }
    }

    fn run(state: &StateOf<Counter>, command: CommandOf<Counter>) -> Outcome {
        let mut rng = DeterministicRng::new(9);
        transition(&Counter, state, &command, &mut rng).unwrap()
    }

    #[test]
    fn test_applies_events_in_order() {
        let state = fresh();
        let t = applied(run(&state, add(ALICE, 5)));

        assert_eq!(t.state.core.value, 5);
        assert_eq!(t.state.sys.version, 1);
        assert_eq!(t.events.len(), 1);
        assert_eq!(t.events[0].id, 1);
        assert_eq!(t.events[0].event.source_command_type, "ADD");
        assert_eq!(t.events[0].event.data, CounterEvent::Added { amount: 5 });

        // Input state untouched.
        assert_eq!(state.core.value, 0);
        assert_eq!(state.sys.event_stream.next_id(), 1);
    }

    #[test]
    fn test_rejection_changes_nothing() {
        let state = fresh();
        match run(&state, add(ALICE, 0)) {
            TransitionOutcome::Rejected { reason } => assert_eq!(reason, "amount must be non-zero"),
            TransitionOutcome::Applied(_) => panic!("zero add must be rejected"),
        }
    }

    #[test]
    fn test_same_inputs_same_outputs() {
        let state = fresh();
        let roll = Command::new(ALICE, 42, CounterCommand::Roll);

        let mut rng_a = DeterministicRng::new(77);
        let mut rng_b = DeterministicRng::new(77);
        let a = applied(transition(&Counter, &state, &roll, &mut rng_a).unwrap());
        let b = applied(transition(&Counter, &state, &roll, &mut rng_b).unwrap());

        assert_eq!(a.state, b.state);
        assert_eq!(a.events, b.events);
        assert_eq!(a.events[0].event.timestamp, 42);
    }

    #[test]
    fn test_execute_error_is_fault() {
        let state = fresh();
        let mut rng = DeterministicRng::new(1);
        let cmd = Command::new(ALICE, 0, CounterCommand::Explode);

        match transition(&Counter, &state, &cmd, &mut rng) {
            Err(PipelineError::DomainFault { phase, command_type, .. }) => {
                assert_eq!(phase, Phase::Execute);
                assert_eq!(command_type, "EXPLODE");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_guarded_catches_panics() {
        let state = fresh();
        let mut rng = DeterministicRng::new(1);
        let cmd = Command::new(ALICE, 0, CounterCommand::Panic);

        match guarded_transition(&Counter, &state, &cmd, &mut rng) {
            Err(PipelineError::Panicked { command_type, message }) => {
                assert_eq!(command_type, "PANIC");
                assert_eq!(message, "counter panicked");
            }
            other => panic!("expected panic report, got {other:?}"),
        }
    }

    #[test]
    fn test_response_window_gates_other_players() {
        let state = fresh();
        let t = applied(run(&state, Command::new(ALICE, 0, CounterCommand::Challenge { target: BOB })));
        let window = t.state.sys.response_window.clone().unwrap();
        assert_eq!(window.responders, vec![BOB]);
        assert_eq!(window.opened_by, "CHALLENGE");

        assert!(matches!(run(&t.state, add(ALICE, 1)), TransitionOutcome::Rejected { .. }));

        let responded = applied(run(&t.state, Command::new(BOB, 0, CounterCommand::Respond)));
        assert!(responded.state.sys.response_window.is_none());
        assert!(matches!(run(&responded.state, add(ALICE, 1)), TransitionOutcome::Applied(_)));
    }

    #[test]
    fn test_interaction_queue_gates_other_players() {
        let state = fresh();
        let t = applied(run(&state, Command::new(ALICE, 0, CounterCommand::Ask { player: BOB })));
        assert_eq!(t.state.sys.interaction.current().map(|i| i.player_id), Some(BOB));

        assert!(matches!(run(&t.state, add(ALICE, 1)), TransitionOutcome::Rejected { .. }));

        let answered = applied(run(&t.state, Command::new(BOB, 0, CounterCommand::Answer)));
        assert!(answered.state.sys.interaction.is_empty());
    }

    #[test]
    fn test_game_over_rejects_everything() {
        let state = fresh();
        let t = applied(run(&state, add(ALICE, 100)));
        assert!(t.state.is_over());

        match run(&t.state, add(BOB, 1)) {
            TransitionOutcome::Rejected { reason } => assert_eq!(reason, "match is over"),
            TransitionOutcome::Applied(_) => panic!("finished match accepted a command"),
        }
    }

    #[test]
    fn test_undo_snapshot_recorded() {
        let state = fresh();
        let t = applied(run(&state, add(ALICE, 3)));
        let t = applied(run(&t.state, add(ALICE, 4)));

        let mut undone = t.state.clone();
        assert_eq!(undone.undo().as_deref(), Some("ADD"));
        assert_eq!(undone.core.value, 3);
        // Event ids keep climbing after an undo.
        let next = applied(run(&undone, add(BOB, 1)));
        assert_eq!(next.events[0].id, 3);
    }
}
