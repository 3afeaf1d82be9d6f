//! Tiny counter game shared by unit tests.

use serde::{Serialize, Deserialize};

use crate::core::rng::RandomSource;
use crate::game::command::{Command, CommandKind};
use crate::game::domain::{DomainCore, DomainError, SysDirective, Validation};
use crate::game::events::{EventKind, GameEvent};
use crate::game::state::{GameOver, PlayerId};

pub const ALICE: PlayerId = PlayerId::from_seat(1);
pub const BOB: PlayerId = PlayerId::from_seat(2);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i64,
    pub rolls: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CounterCommand {
    #[serde(rename = "ADD")]
    Add { amount: i64 },
    #[serde(rename = "ROLL")]
    Roll,
    #[serde(rename = "EXPLODE")]
    Explode,
    #[serde(rename = "PANIC")]
    Panic,
    #[serde(rename = "CHALLENGE")]
    Challenge { target: PlayerId },
    #[serde(rename = "RESPOND")]
    Respond,
    #[serde(rename = "ASK")]
    Ask { player: PlayerId },
    #[serde(rename = "ANSWER")]
    Answer,
}

impl CommandKind for CounterCommand {
    fn command_type(&self) -> &'static str {
        match self {
            CounterCommand::Add { .. } => "ADD",
            CounterCommand::Roll => "ROLL",
            CounterCommand::Explode => "EXPLODE",
            CounterCommand::Panic => "PANIC",
            CounterCommand::Challenge { .. } => "CHALLENGE",
            CounterCommand::Respond => "RESPOND",
            CounterCommand::Ask { .. } => "ASK",
            CounterCommand::Answer => "ANSWER",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CounterEvent {
    Added { amount: i64 },
    Rolled { value: u32 },
    Challenged { target: PlayerId },
    Responded,
    Asked { player: PlayerId },
    Answered,
}

impl EventKind for CounterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CounterEvent::Added { .. } => "ADDED",
            CounterEvent::Rolled { .. } => "ROLLED",
            CounterEvent::Challenged { .. } => "CHALLENGED",
            CounterEvent::Responded => "RESPONDED",
            CounterEvent::Asked { .. } => "ASKED",
            CounterEvent::Answered => "ANSWERED",
        }
    }
}

/// Counter rules: `ADD` must be non-zero, the match ends at 100.
#[derive(Clone, Debug, Default)]
pub struct Counter;

impl DomainCore for Counter {
    type State = CounterState;
    type Command = CounterCommand;
    type Event = CounterEvent;

    fn game_id(&self) -> &'static str {
        "counter"
    }

    fn setup(&self, _players: &[PlayerId], _random: &mut dyn RandomSource) -> CounterState {
        CounterState::default()
    }

    fn validate(&self, _state: &CounterState, command: &Command<CounterCommand>) -> Validation {
        match command.kind {
            CounterCommand::Add { amount: 0 } => Validation::deny("amount must be non-zero"),
            _ => Validation::Valid,
        }
    }

    fn execute(
        &self,
        _state: &CounterState,
        command: &Command<CounterCommand>,
        random: &mut dyn RandomSource,
    ) -> Result<Vec<CounterEvent>, DomainError> {
        match &command.kind {
            CounterCommand::Add { amount } => Ok(vec![CounterEvent::Added { amount: *amount }]),
            CounterCommand::Roll => Ok(vec![CounterEvent::Rolled { value: random.d(6) }]),
            CounterCommand::Explode => Err(DomainError::new("counter exploded")),
            CounterCommand::Panic => panic!("counter panicked"),
            CounterCommand::Challenge { target } => Ok(vec![CounterEvent::Challenged { target: *target }]),
            CounterCommand::Respond => Ok(vec![CounterEvent::Responded]),
            CounterCommand::Ask { player } => Ok(vec![CounterEvent::Asked { player: *player }]),
            CounterCommand::Answer => Ok(vec![CounterEvent::Answered]),
        }
    }

    fn reduce(&self, mut state: CounterState, event: &CounterEvent) -> Result<CounterState, DomainError> {
        match event {
            CounterEvent::Added { amount } => state.value += amount,
            CounterEvent::Rolled { value } => {
                state.value += *value as i64;
                state.rolls.push(*value);
            }
            CounterEvent::Challenged { .. }
            | CounterEvent::Responded
            | CounterEvent::Asked { .. }
            | CounterEvent::Answered => {}
        }
        Ok(state)
    }

    fn is_game_over(&self, state: &CounterState) -> Option<GameOver> {
        (state.value >= 100).then(|| GameOver { winners: Vec::new() })
    }

    fn directives(&self, _state: &CounterState, event: &GameEvent<CounterEvent>) -> Vec<SysDirective> {
        match &event.data {
            CounterEvent::Challenged { target } => vec![SysDirective::OpenResponseWindow {
                responders: vec![*target],
            }],
            CounterEvent::Responded => vec![SysDirective::CloseResponseWindow],
            CounterEvent::Asked { player } => vec![SysDirective::QueueInteraction {
                player_id: *player,
                prompt: "answer".into(),
            }],
            CounterEvent::Answered => vec![SysDirective::ResolveInteraction],
            _ => Vec::new(),
        }
    }
}

pub fn add(player: PlayerId, amount: i64) -> Command<CounterCommand> {
    Command::new(player, 0, CounterCommand::Add { amount })
}
