//! In-process demo match.
//!
//! One [`OptimisticEngine`] per seat plays Skirmish against a
//! [`MatchSession`] over simulated links with random latency. Each link is
//! FIFO, like a WebSocket. When play stops and every link is drained, each
//! client's visible state must equal the server's view for that player.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::core::clock::{Clock, ManualClock, Millis};
use crate::core::rng::{DeterministicRng, RandomSource};
use crate::demo::{
    Skirmish, SkirmishCommand, SkirmishEvent, SkirmishState, VolleyStep, VolleyTargeting, MAX_ATTACK_POWER, MAX_DICE,
    MAX_SHIELD, MAX_VOLLEY_POWER,
};
use crate::game::command::BatchedCommand;
use crate::game::events::EventStreamEntry;
use crate::game::state::PlayerId;
use crate::network::session::{MatchSession, SessionConfig, SessionError, UpdateOf};
use crate::sync::batcher::{BatcherConfig, BufferedSink};
use crate::sync::engine::{EngineError, OptimisticEngine, ReconcileOutcome, SubmitOutcome};
use crate::sync::interaction::LocalInteractionManager;

/// Simulated time per step.
const STEP_MS: Millis = 10;

/// Steps after which a match that will not settle is abandoned.
const MAX_STEPS: u64 = 200_000;

/// Demo settings.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Seed for latency, choices and the match id.
    pub seed: u64,
    /// Seats (2..=4).
    pub players: u8,
    /// Stop taking turns after this many.
    pub max_turns: u32,
    /// Upper bound of one-way latency.
    pub max_delay_ms: Millis,
    /// Client batching.
    pub batching: BatcherConfig,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            players: 2,
            max_turns: 40,
            max_delay_ms: 120,
            batching: BatcherConfig::default(),
        }
    }
}

/// What happened during a demo match.
#[derive(Debug, Clone, Default)]
pub struct DemoReport {
    /// Commands accepted by the client engines.
    pub submitted: u64,
    /// Commands refused before sending.
    pub rejected_locally: u64,
    /// Updates that confirmed predictions as-is.
    pub confirmations: u64,
    /// Updates that forced a rollback.
    pub rollbacks: u64,
    /// Effects each player's observer was shown.
    pub rendered: BTreeMap<PlayerId, usize>,
    /// Final authoritative version.
    pub version: u64,
    /// Turns played.
    pub turns: u32,
    /// Winners, if the match ended.
    pub winners: Option<Vec<PlayerId>>,
    /// Simulated duration.
    pub elapsed_ms: Millis,
}

/// Demo failures.
#[derive(Debug, Error)]
pub enum DemoError {
    /// The session refused a request.
    #[error("session: {0}")]
    Session(#[from] SessionError),

    /// An engine refused a request.
    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    /// A client ended up with a different state than the server.
    #[error("player {player} diverged at version {version}")]
    Diverged {
        /// Player whose state differs
        player: PlayerId,
        /// Server version
        version: u64,
    },

    /// Links never drained.
    #[error("match did not settle after {0} steps")]
    Stalled(u64),
}

struct DemoClient {
    player: PlayerId,
    engine: OptimisticEngine<Skirmish, BufferedSink>,
    targeting: LocalInteractionManager<VolleyTargeting>,
    rendered: usize,
    issued: u64,
    acted_turn: Option<u32>,
}

impl DemoClient {
    fn is_settled(&self) -> bool {
        !self.engine.has_pending()
            && self.engine.batcher().queued_len() == 0
            && self.engine.acked() >= self.issued
    }
}

/// One FIFO direction of a simulated connection.
struct Link<T> {
    queue: VecDeque<(Millis, T)>,
}

impl<T> Link<T> {
    fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    fn send(&mut self, arrival: Millis, payload: T) {
        // Never overtake what is already in flight.
        let arrival = self.queue.back().map_or(arrival, |(last, _)| arrival.max(*last));
        self.queue.push_back((arrival, payload));
    }

    fn due(&mut self, now: Millis) -> Vec<T> {
        let mut out = Vec::new();
        while self.queue.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, payload)) = self.queue.pop_front() {
                out.push(payload);
            }
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Play a full match and check every client converged.
pub fn run_demo_match(config: &DemoConfig) -> Result<DemoReport, DemoError> {
    let mut rng = DeterministicRng::new(config.seed);
    let players: Vec<PlayerId> = (1..=config.players.clamp(2, 4)).map(PlayerId::from_seat).collect();

    let mut id_bytes = [0u8; 16];
    id_bytes[..8].copy_from_slice(&rng.next_u64().to_le_bytes());
    id_bytes[8..].copy_from_slice(&rng.next_u64().to_le_bytes());
    let match_id = uuid::Uuid::from_bytes(id_bytes);

    let mut session = MatchSession::new(match_id, Skirmish, players.clone(), &SessionConfig::default())?;
    let clock = Arc::new(ManualClock::new(0));

    let mut clients: Vec<DemoClient> = players
        .iter()
        .map(|&player| DemoClient {
            player,
            engine: OptimisticEngine::new(
                Skirmish,
                Skirmish::engine_config(config.batching.clone()),
                BufferedSink::default(),
                clock.clone(),
            ),
            targeting: LocalInteractionManager::new(),
            rendered: 0,
            issued: 0,
            acted_turn: None,
        })
        .collect();

    let mut uplinks: Vec<Link<Vec<BatchedCommand>>> = players.iter().map(|_| Link::new()).collect();
    let mut downlinks: Vec<Link<UpdateOf<Skirmish>>> = players.iter().map(|_| Link::new()).collect();
    let mut report = DemoReport::default();

    for (i, player) in players.iter().enumerate() {
        downlinks[i].send(delay(&mut rng, config), session.sync_for(*player)?);
    }
    info!("Demo match {} with {} players", match_id, players.len());

    let mut steps = 0u64;
    loop {
        let now = clock.now_ms();

        for client in clients.iter_mut() {
            take_turn(client, config, &mut rng, &mut report)?;
            client.engine.poll_timers();
        }

        for (i, client) in clients.iter_mut().enumerate() {
            for batch in client.engine.batcher_mut().sink_mut().drain() {
                uplinks[i].send(now + delay(&mut rng, config), batch);
            }
        }

        for (i, player) in players.iter().enumerate() {
            for batch in uplinks[i].due(now) {
                for delivery in session.apply_batch(*player, &batch)? {
                    if let Some(seat) = players.iter().position(|p| *p == delivery.player_id) {
                        downlinks[seat].send(now + delay(&mut rng, config), delivery.update);
                    }
                }
            }
        }

        for (i, client) in clients.iter_mut().enumerate() {
            for update in downlinks[i].due(now) {
                let reconciled = client.engine.on_authoritative_update(update)?;
                match reconciled.outcome {
                    ReconcileOutcome::Confirmed => report.confirmations += 1,
                    ReconcileOutcome::RolledBack => report.rollbacks += 1,
                    ReconcileOutcome::Applied => {}
                }
            }
            let mut count = 0;
            client
                .engine
                .render_to(&mut |effects: &[EventStreamEntry<SkirmishEvent>]| count += effects.len());
            client.rendered += count;
        }

        let play_over = session.state().is_over() || session.state().core.turn >= config.max_turns;
        let drained = uplinks.iter().all(Link::is_empty)
            && downlinks.iter().all(Link::is_empty)
            && clients.iter().all(DemoClient::is_settled);
        if play_over && drained {
            break;
        }

        steps += 1;
        if steps >= MAX_STEPS {
            return Err(DemoError::Stalled(steps));
        }
        clock.advance(STEP_MS);
    }

    for client in &clients {
        let expected = session.sync_for(client.player)?.state;
        let converged = client
            .engine
            .visible_state()
            .is_some_and(|visible| visible.same_outcome(&expected));
        if !converged {
            return Err(DemoError::Diverged { player: client.player, version: expected.sys.version });
        }
        report.rendered.insert(client.player, client.rendered);
    }

    let state = session.state();
    report.version = state.sys.version;
    report.turns = state.core.turn;
    report.winners = state.sys.game_over.as_ref().map(|g| g.winners.clone());
    report.elapsed_ms = clock.now_ms();

    info!(
        "Demo finished: version {}, {} turns, {} confirmations, {} rollbacks",
        report.version, report.turns, report.confirmations, report.rollbacks
    );
    Ok(report)
}

fn delay(rng: &mut DeterministicRng, config: &DemoConfig) -> Millis {
    rng.next_u64() % (config.max_delay_ms + 1)
}

/// Act if it is this client's turn as far as it can tell.
fn take_turn(
    client: &mut DemoClient,
    config: &DemoConfig,
    rng: &mut DeterministicRng,
    report: &mut DemoReport,
) -> Result<(), DemoError> {
    let Some(visible) = client.engine.visible_state() else {
        return Ok(());
    };
    if visible.is_over()
        || visible.core.turn >= config.max_turns
        || visible.core.active_player() != Some(client.player)
    {
        return Ok(());
    }

    let turn = visible.core.turn;
    let mut plan = Vec::new();
    if client.acted_turn != Some(turn) {
        let core = visible.core.clone();
        plan.extend(choose_action(client, &core, rng));
    } else if !client.is_settled() {
        return Ok(());
    }
    // A refused END_TURN leaves the turn open; try again once settled.
    plan.push(SkirmishCommand::EndTurn);
    client.acted_turn = Some(turn);

    for kind in plan {
        debug!("{} plays {:?}", client.player, kind);
        match client.engine.submit(client.player, kind)? {
            SubmitOutcome::Predicted { .. } | SubmitOutcome::Sent { .. } => {
                client.issued += 1;
                report.submitted += 1;
            }
            SubmitOutcome::Rejected { reason } => {
                debug!("{} refused locally: {}", client.player, reason);
                report.rejected_locally += 1;
            }
        }
    }
    Ok(())
}

fn choose_action(client: &mut DemoClient, state: &SkirmishState, rng: &mut DeterministicRng) -> Option<SkirmishCommand> {
    let me = client.player;
    let foes: Vec<PlayerId> = state.alive().into_iter().filter(|p| *p != me).collect();
    if foes.is_empty() {
        return None;
    }
    let shield = state.fighters.get(&me).map_or(0, |f| f.shield);

    match rng.next_int(4) {
        0 => Some(SkirmishCommand::Attack {
            target: foes[rng.next_int(foes.len() as u32) as usize],
            power: rng.d(MAX_ATTACK_POWER),
        }),
        1 => {
            client.targeting.begin(VolleyTargeting::new(me, state));
            for foe in foes.iter().take(2) {
                client.targeting.update(VolleyStep::Toggle(*foe)).ok()?;
            }
            client.targeting.update(VolleyStep::Power(rng.d(MAX_VOLLEY_POWER))).ok()?;
            client.targeting.commit().ok()
        }
        2 if shield < MAX_SHIELD => Some(SkirmishCommand::RaiseShield {
            amount: rng.d(MAX_SHIELD - shield),
        }),
        _ => Some(SkirmishCommand::RollDice { count: rng.d(MAX_DICE) }),
    }
}
