//! Reference domain: Skirmish
//!
//! A small turn-based duel used to exercise the sync core end to end.
//! Shields are hidden information: other players see them as zero, so
//! attacks against a shielded fighter are mispredicted and get rolled back.

pub mod interaction;
pub mod simulation;

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::core::rng::RandomSource;
use crate::game::command::{Command, CommandKind};
use crate::game::domain::{DomainCore, DomainError, Validation};
use crate::game::events::EventKind;
use crate::game::state::{GameOver, PlayerId};
use crate::sync::engine::{AnimationMap, CommandDeterminismMap, EngineConfig};
use crate::sync::batcher::BatcherConfig;

pub use interaction::{VolleyDraft, VolleyStep, VolleyTargeting};
pub use simulation::{run_demo_match, DemoConfig, DemoError, DemoReport};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Hit points every fighter starts with.
pub const STARTING_HP: i32 = 20;
/// Strongest single attack.
pub const MAX_ATTACK_POWER: u32 = 10;
/// Strongest volley, per target.
pub const MAX_VOLLEY_POWER: u32 = 4;
/// Most targets one volley may hit.
pub const MAX_VOLLEY_TARGETS: usize = 3;
/// Largest shield a fighter may hold.
pub const MAX_SHIELD: u32 = 5;
/// Most dice per roll.
pub const MAX_DICE: u32 = 3;

// =============================================================================
// STATE
// =============================================================================

/// One seated fighter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fighter {
    /// Remaining hit points
    pub hp: i32,
    /// Damage the next hits absorb. Hidden from other players.
    pub shield: u32,
}

impl Fighter {
    /// Whether the fighter is still in the match.
    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }
}

/// Skirmish game state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkirmishState {
    /// Fighters by player
    pub fighters: BTreeMap<PlayerId, Fighter>,
    /// Seat order
    pub order: Vec<PlayerId>,
    /// Index into `order` of the acting player
    pub active: usize,
    /// Turns completed
    pub turn: u32,
    /// Last dice thrown
    pub last_roll: Vec<u32>,
}

impl SkirmishState {
    /// Player whose turn it is.
    pub fn active_player(&self) -> Option<PlayerId> {
        self.order.get(self.active).copied()
    }

    /// Living fighters in seat order.
    pub fn alive(&self) -> Vec<PlayerId> {
        self.order
            .iter()
            .copied()
            .filter(|p| self.fighters.get(p).is_some_and(Fighter::is_alive))
            .collect()
    }

    fn is_alive(&self, player: &PlayerId) -> bool {
        self.fighters.get(player).is_some_and(Fighter::is_alive)
    }

    /// Next living player after the active one.
    fn next_player(&self) -> Option<PlayerId> {
        let n = self.order.len();
        (1..=n)
            .map(|step| self.order[(self.active + step) % n])
            .find(|p| self.is_alive(p))
    }
}

// =============================================================================
// COMMANDS & EVENTS
// =============================================================================

/// Skirmish commands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkirmishCommand {
    /// Hit one fighter.
    Attack {
        /// Who is hit
        target: PlayerId,
        /// Damage before shields
        power: u32,
    },
    /// Hit several fighters at reduced power.
    Volley {
        /// Who is hit
        targets: Vec<PlayerId>,
        /// Damage per target before shields
        power: u32,
    },
    /// Add to the actor's hidden shield.
    RaiseShield {
        /// Shield points
        amount: u32,
    },
    /// Throw dice and heal by their sum.
    RollDice {
        /// Number of dice
        count: u32,
    },
    /// Pass the turn.
    EndTurn,
}

impl CommandKind for SkirmishCommand {
    fn command_type(&self) -> &'static str {
        match self {
            SkirmishCommand::Attack { .. } => "ATTACK",
            SkirmishCommand::Volley { .. } => "VOLLEY",
            SkirmishCommand::RaiseShield { .. } => "RAISE_SHIELD",
            SkirmishCommand::RollDice { .. } => "ROLL_DICE",
            SkirmishCommand::EndTurn => "END_TURN",
        }
    }
}

/// Skirmish events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkirmishEvent {
    /// A hit landed.
    Damaged {
        /// Attacker
        attacker: PlayerId,
        /// Target
        target: PlayerId,
        /// Hit points lost
        amount: u32,
        /// Damage eaten by the shield
        absorbed: u32,
    },
    /// A fighter dropped to zero.
    Defeated {
        /// Defeated player
        player: PlayerId,
    },
    /// A shield went up. `amount` is hidden from other players.
    ShieldRaised {
        /// Shielded player
        player: PlayerId,
        /// Shield points, if visible
        amount: Option<u32>,
    },
    /// Dice were thrown.
    Rolled {
        /// Roller
        player: PlayerId,
        /// Faces
        values: Vec<u32>,
    },
    /// The turn passed.
    TurnEnded {
        /// Previous player
        player: PlayerId,
        /// Next player
        next: PlayerId,
    },
}

impl EventKind for SkirmishEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SkirmishEvent::Damaged { .. } => "DAMAGED",
            SkirmishEvent::Defeated { .. } => "DEFEATED",
            SkirmishEvent::ShieldRaised { .. } => "SHIELD_RAISED",
            SkirmishEvent::Rolled { .. } => "ROLLED",
            SkirmishEvent::TurnEnded { .. } => "TURN_ENDED",
        }
    }
}

// =============================================================================
// RULES
// =============================================================================

/// Skirmish rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct Skirmish;

impl Skirmish {
    /// Engine configuration suited to the game: dice are never predicted,
    /// hits wait for the server before they animate.
    pub fn engine_config(batching: BatcherConfig) -> EngineConfig<Skirmish> {
        EngineConfig {
            determinism: CommandDeterminismMap::new()
                .deterministic("ATTACK")
                .deterministic("VOLLEY")
                .deterministic("RAISE_SHIELD")
                .non_deterministic("ROLL_DICE")
                .deterministic("END_TURN"),
            animation: AnimationMap::new()
                .deferred("ATTACK")
                .deferred("VOLLEY")
                .optimistic("RAISE_SHIELD")
                .optimistic("END_TURN"),
            batching: batching.immediate("END_TURN"),
            ..EngineConfig::default()
        }
    }

    fn hit(state: &SkirmishState, attacker: PlayerId, target: PlayerId, power: u32) -> Vec<SkirmishEvent> {
        let Some(fighter) = state.fighters.get(&target) else {
            return Vec::new();
        };
        let absorbed = fighter.shield.min(power);
        let amount = power - absorbed;

        let mut events = vec![SkirmishEvent::Damaged { attacker, target, amount, absorbed }];
        if fighter.hp - amount as i32 <= 0 {
            events.push(SkirmishEvent::Defeated { player: target });
        }
        events
    }

    fn check_target(state: &SkirmishState, actor: PlayerId, target: PlayerId) -> Option<Validation> {
        if target == actor {
            return Some(Validation::deny("cannot target yourself"));
        }
        if !state.is_alive(&target) {
            return Some(Validation::deny("target is not in the fight"));
        }
        None
    }
}

impl DomainCore for Skirmish {
    type State = SkirmishState;
    type Command = SkirmishCommand;
    type Event = SkirmishEvent;

    fn game_id(&self) -> &'static str {
        "skirmish"
    }

    fn setup(&self, players: &[PlayerId], _random: &mut dyn RandomSource) -> SkirmishState {
        SkirmishState {
            fighters: players
                .iter()
                .map(|p| (*p, Fighter { hp: STARTING_HP, shield: 0 }))
                .collect(),
            order: players.to_vec(),
            active: 0,
            turn: 0,
            last_roll: Vec::new(),
        }
    }

    fn validate(&self, state: &SkirmishState, command: &Command<SkirmishCommand>) -> Validation {
        let actor = command.player_id;
        if state.active_player() != Some(actor) {
            return Validation::deny("not your turn");
        }

        match &command.kind {
            SkirmishCommand::Attack { target, power } => {
                if let Some(denied) = Self::check_target(state, actor, *target) {
                    return denied;
                }
                if !(1..=MAX_ATTACK_POWER).contains(power) {
                    return Validation::deny(format!("power must be 1..={}", MAX_ATTACK_POWER));
                }
                Validation::Valid
            }
            SkirmishCommand::Volley { targets, power } => {
                if targets.is_empty() || targets.len() > MAX_VOLLEY_TARGETS {
                    return Validation::deny(format!("a volley hits 1..={} targets", MAX_VOLLEY_TARGETS));
                }
                for (i, target) in targets.iter().enumerate() {
                    if targets[..i].contains(target) {
                        return Validation::deny("duplicate target");
                    }
                    if let Some(denied) = Self::check_target(state, actor, *target) {
                        return denied;
                    }
                }
                if !(1..=MAX_VOLLEY_POWER).contains(power) {
                    return Validation::deny(format!("volley power must be 1..={}", MAX_VOLLEY_POWER));
                }
                Validation::Valid
            }
            SkirmishCommand::RaiseShield { amount } => {
                let current = state.fighters.get(&actor).map_or(0, |f| f.shield);
                if *amount == 0 || current + amount > MAX_SHIELD {
                    return Validation::deny(format!("shield must stay within 1..={}", MAX_SHIELD));
                }
                Validation::Valid
            }
            SkirmishCommand::RollDice { count } => {
                if !(1..=MAX_DICE).contains(count) {
                    return Validation::deny(format!("roll 1..={} dice", MAX_DICE));
                }
                Validation::Valid
            }
            SkirmishCommand::EndTurn => Validation::Valid,
        }
    }

    fn execute(
        &self,
        state: &SkirmishState,
        command: &Command<SkirmishCommand>,
        random: &mut dyn RandomSource,
    ) -> Result<Vec<SkirmishEvent>, DomainError> {
        let actor = command.player_id;
        let events = match &command.kind {
            SkirmishCommand::Attack { target, power } => Self::hit(state, actor, *target, *power),
            SkirmishCommand::Volley { targets, power } => targets
                .iter()
                .flat_map(|target| Self::hit(state, actor, *target, *power))
                .collect(),
            SkirmishCommand::RaiseShield { amount } => vec![SkirmishEvent::ShieldRaised {
                player: actor,
                amount: Some(*amount),
            }],
            SkirmishCommand::RollDice { count } => vec![SkirmishEvent::Rolled {
                player: actor,
                values: (0..*count).map(|_| random.d(6)).collect(),
            }],
            SkirmishCommand::EndTurn => {
                let next = state
                    .next_player()
                    .ok_or_else(|| DomainError::new("no living player to pass the turn to"))?;
                vec![SkirmishEvent::TurnEnded { player: actor, next }]
            }
        };
        Ok(events)
    }

    fn reduce(&self, mut state: SkirmishState, event: &SkirmishEvent) -> Result<SkirmishState, DomainError> {
        match event {
            SkirmishEvent::Damaged { target, amount, absorbed, .. } => {
                let fighter = state
                    .fighters
                    .get_mut(target)
                    .ok_or_else(|| DomainError::new(format!("unknown fighter {}", target)))?;
                fighter.shield = fighter.shield.saturating_sub(*absorbed);
                fighter.hp -= *amount as i32;
            }
            SkirmishEvent::Defeated { player } => {
                if let Some(fighter) = state.fighters.get_mut(player) {
                    fighter.hp = fighter.hp.min(0);
                    fighter.shield = 0;
                }
            }
            SkirmishEvent::ShieldRaised { player, amount } => {
                if let (Some(fighter), Some(amount)) = (state.fighters.get_mut(player), amount) {
                    fighter.shield += amount;
                }
            }
            SkirmishEvent::Rolled { player, values } => {
                let heal: u32 = values.iter().sum();
                if let Some(fighter) = state.fighters.get_mut(player) {
                    fighter.hp = (fighter.hp + heal as i32).min(STARTING_HP);
                }
                state.last_roll = values.clone();
            }
            SkirmishEvent::TurnEnded { next, .. } => {
                state.active = state
                    .order
                    .iter()
                    .position(|p| p == next)
                    .ok_or_else(|| DomainError::new(format!("unknown player {}", next)))?;
                state.turn += 1;
            }
        }
        Ok(state)
    }

    fn player_view(&self, state: &SkirmishState, player: PlayerId) -> SkirmishState {
        let mut view = state.clone();
        for (id, fighter) in view.fighters.iter_mut() {
            if *id != player {
                fighter.shield = 0;
            }
        }
        view
    }

    fn event_view(&self, event: &SkirmishEvent, player: PlayerId) -> SkirmishEvent {
        match event {
            SkirmishEvent::ShieldRaised { player: owner, .. } if *owner != player => {
                SkirmishEvent::ShieldRaised { player: *owner, amount: None }
            }
            other => other.clone(),
        }
    }

    fn is_game_over(&self, state: &SkirmishState) -> Option<GameOver> {
        let alive = state.alive();
        (alive.len() <= 1).then(|| GameOver { winners: alive })
    }
}
