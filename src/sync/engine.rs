//! Optimistic Engine
//!
//! Predicts the outcome of local commands with the shared pipeline, keeps the
//! chain of unconfirmed predictions, and reconciles it against authoritative
//! updates.
//!
//! ## Reconciliation
//!
//! Every [`AuthoritativeUpdate`] carries `acked`, the number of this client's
//! commands the server has processed. Pending predictions with a sequence at
//! or below it are confirmed. If the newest confirmed prediction produced the
//! same outcome and the same events as the server, it is simply dropped.
//! Otherwise the engine rolls back to the authoritative state and replays the
//! remaining predictions on top of it.
//!
//! ## Rendering
//!
//! Observers are fed through [`OptimisticEngine::render_to`]. Events of
//! `Optimistic` commands surface immediately, events of `Deferred` commands
//! (and everything after them) wait for confirmation.
//!
//! Confirmed events are tracked by the watermark, which only ever covers
//! authoritative ids. Predictions are tracked per pending command: once a
//! prediction was shown, replays of it stay silent, and when the server
//! answers that command its authoritative events stand in for what was
//! already shown. Events of other players are rendered when they are
//! confirmed, even if a prediction had briefly used the same ids.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::clock::{Clock, Millis};
use crate::core::hash::{compute_state_hash, short_hex};
use crate::core::rng::{DeterministicRng, RandomProbe};
use crate::core::scheduler::TimerToken;
use crate::game::command::{BatchedCommand, Command, CommandCodecError};
use crate::game::domain::{CommandOf, DomainCore, StateOf};
use crate::game::events::{EventId, EventStreamEntry};
use crate::game::pipeline::{guarded_transition, TransitionOutcome};
use crate::game::state::{MatchState, PlayerId};
use crate::sync::batcher::{BatchSink, BatcherConfig, CommandBatcher};
use crate::sync::interaction::{InteractionDeclaration, InteractionError, LocalInteractionManager};
use crate::sync::observer::{EffectObserver, Watermark};

// =============================================================================
// DECLARATIONS
// =============================================================================

/// How a command type's determinism is decided.
pub enum DeterminismRule<D: DomainCore> {
    /// Always (true) or never (false) deterministic.
    Fixed(bool),
    /// Decided per command against the state it would run on.
    Dynamic(fn(&CommandOf<D>, &StateOf<D>) -> bool),
}

impl<D: DomainCore> fmt::Debug for DeterminismRule<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeterminismRule::Fixed(b) => write!(f, "Fixed({b})"),
            DeterminismRule::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Per command type determinism declarations.
///
/// Types without a declaration are run through a random probe.
pub struct CommandDeterminismMap<D: DomainCore> {
    rules: BTreeMap<String, DeterminismRule<D>>,
}

impl<D: DomainCore> Default for CommandDeterminismMap<D> {
    fn default() -> Self {
        Self { rules: BTreeMap::new() }
    }
}

impl<D: DomainCore> fmt::Debug for CommandDeterminismMap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.rules.iter()).finish()
    }
}

impl<D: DomainCore> CommandDeterminismMap<D> {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `command_type` deterministic.
    pub fn deterministic(mut self, command_type: &str) -> Self {
        self.rules.insert(command_type.to_string(), DeterminismRule::Fixed(true));
        self
    }

    /// Declare `command_type` non-deterministic (never predicted).
    pub fn non_deterministic(mut self, command_type: &str) -> Self {
        self.rules.insert(command_type.to_string(), DeterminismRule::Fixed(false));
        self
    }

    /// Decide `command_type` per command.
    pub fn dynamic(mut self, command_type: &str, rule: fn(&CommandOf<D>, &StateOf<D>) -> bool) -> Self {
        self.rules.insert(command_type.to_string(), DeterminismRule::Dynamic(rule));
        self
    }

    /// `Some(deterministic)` if declared, `None` to probe.
    pub fn resolve(&self, command: &CommandOf<D>, state: &StateOf<D>) -> Option<bool> {
        self.rules.get(command.command_type()).map(|rule| match rule {
            DeterminismRule::Fixed(b) => *b,
            DeterminismRule::Dynamic(f) => f(command, state),
        })
    }
}

/// When predicted events may be rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimationMode {
    /// Render predicted events right away.
    Optimistic,
    /// Wait for the server's confirmation.
    #[default]
    Deferred,
}

/// Per command type animation modes. Undeclared types are `Deferred`.
#[derive(Debug, Clone, Default)]
pub struct AnimationMap {
    modes: BTreeMap<String, AnimationMode>,
}

impl AnimationMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `command_type` optimistically.
    pub fn optimistic(mut self, command_type: &str) -> Self {
        self.modes.insert(command_type.to_string(), AnimationMode::Optimistic);
        self
    }

    /// Wait for confirmation before rendering `command_type`.
    pub fn deferred(mut self, command_type: &str) -> Self {
        self.modes.insert(command_type.to_string(), AnimationMode::Deferred);
        self
    }

    /// Mode of `command_type`.
    pub fn mode_for(&self, command_type: &str) -> AnimationMode {
        self.modes.get(command_type).copied().unwrap_or_default()
    }
}

/// Engine configuration.
pub struct EngineConfig<D: DomainCore> {
    /// Determinism declarations
    pub determinism: CommandDeterminismMap<D>,
    /// Animation modes
    pub animation: AnimationMap,
    /// Outgoing batching
    pub batching: BatcherConfig,
    /// Seed of the local random source used for prediction
    pub local_seed: u64,
}

impl<D: DomainCore> Default for EngineConfig<D> {
    fn default() -> Self {
        Self {
            determinism: CommandDeterminismMap::default(),
            animation: AnimationMap::default(),
            batching: BatcherConfig::default(),
            local_seed: 0x5EED,
        }
    }
}

// =============================================================================
// AUTHORITATIVE UPDATES
// =============================================================================

/// Why the server refused one of this client's commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Refused command type
    pub command_type: String,
    /// Server's reason
    pub reason: String,
}

/// Confirmed state as seen by one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeUpdate<G, E> {
    /// Player view of the state, without event entries or undo history
    pub state: MatchState<G, E>,
    /// Event entries appended since the previous update
    pub events: Vec<EventStreamEntry<E>>,
    /// Commands of the receiving player processed so far
    pub acked: u64,
    /// Hex SHA-256 of `state.core` at `state.sys.version`
    pub state_hash: String,
    /// Set when the update answers a refused command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl<G: Serialize + Clone, E> AuthoritativeUpdate<G, E> {
    /// Package `state` for the wire.
    pub fn build(
        state: &MatchState<G, E>,
        events: Vec<EventStreamEntry<E>>,
        acked: u64,
        rejection: Option<Rejection>,
    ) -> Result<Self, bincode::Error> {
        let hash = compute_state_hash(state.sys.version, &state.core)?;
        Ok(Self {
            state: state.for_wire(),
            events,
            acked,
            state_hash: hex::encode(hash),
            rejection,
        })
    }

    /// Whether `state_hash` matches `state`.
    pub fn verify_hash(&self) -> bool {
        compute_state_hash(self.state.sys.version, &self.state.core)
            .map(|hash| hex::encode(hash) == self.state_hash)
            .unwrap_or(false)
    }
}

// =============================================================================
// ENGINE TYPES
// =============================================================================

/// An unconfirmed, locally predicted command.
pub struct PendingCommand<D: DomainCore> {
    /// Client sequence number (1-based)
    pub sequence: u64,
    /// The command as predicted
    pub command: CommandOf<D>,
    /// State after this command on top of the previous prediction
    pub predicted_state: StateOf<D>,
    /// Events the prediction appended
    pub events: Vec<EventStreamEntry<D::Event>>,
    /// Rendering mode of those events
    pub animation: AnimationMode,
    /// Whether the observer was already shown these events
    pub rendered: bool,
    /// When the command was submitted
    pub enqueued_at: Millis,
}

impl<D: DomainCore> fmt::Debug for PendingCommand<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommand")
            .field("sequence", &self.sequence)
            .field("command", &self.command.command_type())
            .field("events", &self.events.len())
            .field("animation", &self.animation)
            .field("rendered", &self.rendered)
            .finish()
    }
}

/// What `submit` did with a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Predicted locally and sent.
    Predicted {
        /// Assigned sequence
        sequence: u64,
    },
    /// Sent without a prediction.
    Sent {
        /// Assigned sequence
        sequence: u64,
    },
    /// Refused locally; nothing was sent.
    Rejected {
        /// Validation reason
        reason: String,
    },
}

/// How an authoritative update was folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No predictions were involved; the new state was adopted.
    Applied,
    /// Confirmed predictions matched exactly.
    Confirmed,
    /// Rolled back to the authoritative state and replayed.
    RolledBack,
}

/// Result of [`OptimisticEngine::on_authoritative_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// What happened
    pub outcome: ReconcileOutcome,
    /// Predictions confirmed by this update
    pub confirmed: usize,
    /// Predictions replayed on the new baseline
    pub replayed: usize,
    /// Predictions dropped because replay refused them
    pub dropped: usize,
    /// Server's refusal, if the update carries one
    pub rejection: Option<Rejection>,
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was torn down.
    #[error("engine torn down")]
    TornDown,

    /// A command could not be encoded for the wire.
    #[error(transparent)]
    Codec(#[from] CommandCodecError),

    /// Committing a local interaction failed.
    #[error(transparent)]
    Interaction(#[from] InteractionError),
}

// =============================================================================
// ENGINE
// =============================================================================

/// Client-side optimistic synchronization engine for one match.
pub struct OptimisticEngine<D: DomainCore, S: BatchSink> {
    domain: D,
    determinism: CommandDeterminismMap<D>,
    animation: AnimationMap,
    batcher: CommandBatcher<S>,
    clock: Arc<dyn Clock>,
    local_rng: DeterministicRng,
    confirmed: Option<StateOf<D>>,
    pending: VecDeque<PendingCommand<D>>,
    next_sequence: u64,
    acked: u64,
    watermark: Watermark,
    /// Confirmed ids whose effect was already rendered as a prediction.
    suppressed: BTreeSet<EventId>,
    /// Rendered predictions discarded before the server answered them, by
    /// sequence.
    orphaned: BTreeMap<u64, &'static str>,
    torn_down: bool,
}

impl<D: DomainCore, S: BatchSink> OptimisticEngine<D, S> {
    /// Create an engine sending through `sink`.
    pub fn new(domain: D, config: EngineConfig<D>, sink: S, clock: Arc<dyn Clock>) -> Self {
        let batcher = CommandBatcher::new(config.batching, sink, clock.clone());
        Self {
            domain,
            determinism: config.determinism,
            animation: config.animation,
            batcher,
            clock,
            local_rng: DeterministicRng::new(config.local_seed),
            confirmed: None,
            pending: VecDeque::new(),
            next_sequence: 1,
            acked: 0,
            watermark: Watermark::new(),
            suppressed: BTreeSet::new(),
            orphaned: BTreeMap::new(),
            torn_down: false,
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Submit a local command: predict it if possible, then send it.
    pub fn submit(&mut self, player: PlayerId, kind: D::Command) -> Result<SubmitOutcome, EngineError> {
        if self.torn_down {
            return Err(EngineError::TornDown);
        }

        let enqueued_at = self.clock.now_ms();
        let command = Command::new(player, enqueued_at, kind);
        let batched = BatchedCommand::encode(&command.kind)?;
        let command_type = command.command_type();

        let Some(base) = self
            .pending
            .back()
            .map(|p| &p.predicted_state)
            .or(self.confirmed.as_ref())
        else {
            debug!("No confirmed state yet, sending {} unpredicted", command_type);
            return Ok(self.send_unpredicted(batched));
        };

        let declared = self.determinism.resolve(&command, base);
        if declared == Some(false) {
            return Ok(self.send_unpredicted(batched));
        }

        let (result, drew_randomness) = match declared {
            Some(_) => (guarded_transition(&self.domain, base, &command, &mut self.local_rng), false),
            None => {
                let mut probe = RandomProbe::new(&mut self.local_rng);
                let result = guarded_transition(&self.domain, base, &command, &mut probe);
                (result, probe.was_used())
            }
        };

        match result {
            Ok(TransitionOutcome::Rejected { reason }) => {
                debug!("{} rejected locally: {}", command_type, reason);
                Ok(SubmitOutcome::Rejected { reason })
            }
            Ok(TransitionOutcome::Applied(_)) if drew_randomness => {
                debug!("{} drew randomness, sending unpredicted", command_type);
                Ok(self.send_unpredicted(batched))
            }
            Ok(TransitionOutcome::Applied(transition)) => {
                let sequence = self.take_sequence();
                let animation = self.animation.mode_for(command_type);
                self.pending.push_back(PendingCommand {
                    sequence,
                    command,
                    predicted_state: transition.state,
                    events: transition.events,
                    animation,
                    rendered: false,
                    enqueued_at,
                });
                self.batcher.push(batched);
                Ok(SubmitOutcome::Predicted { sequence })
            }
            Err(e) => {
                error!("Prediction failed, discarding {} pending commands: {}", self.pending.len(), e);
                let discarded: Vec<PendingCommand<D>> = self.pending.drain(..).collect();
                self.orphan_rendered(discarded);
                Ok(self.send_unpredicted(batched))
            }
        }
    }

    /// Commit a local interaction and submit the resulting command.
    pub fn submit_interaction<I>(
        &mut self,
        manager: &mut LocalInteractionManager<I>,
        player: PlayerId,
    ) -> Result<SubmitOutcome, EngineError>
    where
        I: InteractionDeclaration<Command = D::Command>,
    {
        if self.torn_down {
            return Err(EngineError::TornDown);
        }
        let kind = manager.commit()?;
        self.submit(player, kind)
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Remember which discarded predictions were already on screen.
    fn orphan_rendered(&mut self, discarded: impl IntoIterator<Item = PendingCommand<D>>) {
        for entry in discarded.into_iter().filter(|p| p.rendered) {
            self.orphaned.insert(entry.sequence, entry.command.command_type());
        }
    }

    fn send_unpredicted(&mut self, batched: BatchedCommand) -> SubmitOutcome {
        let sequence = self.take_sequence();
        self.batcher.push(batched);
        SubmitOutcome::Sent { sequence }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Fold in a confirmed state from the server.
    pub fn on_authoritative_update(
        &mut self,
        update: AuthoritativeUpdate<D::State, D::Event>,
    ) -> Result<ReconcileReport, EngineError> {
        if self.torn_down {
            return Err(EngineError::TornDown);
        }

        if !update.verify_hash() {
            warn!(
                "State hash mismatch at version {} (server {})",
                update.state.sys.version,
                update.state_hash.get(..16).unwrap_or(&update.state_hash)
            );
        }
        if let Some(rejection) = &update.rejection {
            info!("Server refused {}: {}", rejection.command_type, rejection.reason);
        }

        if update.acked < self.acked {
            warn!("Ack went backwards ({} < {}), keeping {}", update.acked, self.acked, self.acked);
        }
        self.acked = self.acked.max(update.acked);

        let baseline = self.baseline_from(&update);
        let confirmed_count = self
            .pending
            .iter()
            .take_while(|p| p.sequence <= self.acked)
            .count();
        let confirmed: Vec<PendingCommand<D>> = self.pending.drain(..confirmed_count).collect();

        let mut report = ReconcileReport {
            outcome: ReconcileOutcome::Applied,
            confirmed: confirmed.len(),
            replayed: 0,
            dropped: 0,
            rejection: update.rejection.clone(),
        };

        let matched = confirmed.last().is_some_and(|last| {
            let predicted: Vec<&EventStreamEntry<D::Event>> =
                confirmed.iter().flat_map(|p| p.events.iter()).collect();
            last.predicted_state.same_outcome(&baseline) && same_effects(&predicted, &update.events)
        });

        self.suppress_stand_ins(&confirmed, &update.events, matched);

        if matched {
            report.outcome = ReconcileOutcome::Confirmed;
        } else if !self.pending.is_empty() || !confirmed.is_empty() {
            let (replayed, dropped) = self.replay_onto(&baseline);
            report.outcome = ReconcileOutcome::RolledBack;
            report.replayed = replayed;
            report.dropped = dropped;
            debug!(
                "Rolled back to version {}: replayed {}, dropped {}",
                baseline.sys.version, replayed, dropped
            );
        }

        self.confirmed = Some(baseline);
        Ok(report)
    }

    /// Mark authoritative events that answer an already rendered prediction.
    ///
    /// On an exact match the ids line up one to one. Otherwise the server's
    /// events of a rendered command type take the prediction's place.
    fn suppress_stand_ins(
        &mut self,
        confirmed: &[PendingCommand<D>],
        events: &[EventStreamEntry<D::Event>],
        matched: bool,
    ) {
        let acked = self.acked;
        let mut shown: BTreeSet<&'static str> = BTreeSet::new();
        while let Some(entry) = self.orphaned.first_entry() {
            if *entry.key() > acked {
                break;
            }
            shown.insert(entry.remove());
        }

        let stand_ins: Vec<EventId> = if matched {
            confirmed
                .iter()
                .filter(|p| p.rendered)
                .flat_map(|p| p.events.iter().map(|e| e.id))
                .collect()
        } else {
            shown.extend(confirmed.iter().filter(|p| p.rendered).map(|p| p.command.command_type()));
            events
                .iter()
                .filter(|e| shown.contains(e.event.source_command_type.as_str()))
                .map(|e| e.id)
                .collect()
        };

        let watermark = self.watermark;
        self.suppressed.extend(stand_ins.into_iter().filter(|id| !watermark.covers(*id)));
    }

    /// New confirmed state: the update's state plus the running event log.
    fn baseline_from(&self, update: &AuthoritativeUpdate<D::State, D::Event>) -> StateOf<D> {
        let mut baseline = update.state.clone();
        let mut stream = match &self.confirmed {
            Some(previous) => previous.sys.event_stream.clone(),
            None => update.state.sys.event_stream.clone(),
        };
        stream.absorb(&update.events, update.state.sys.event_stream.next_id());
        baseline.sys.event_stream = stream;
        baseline
    }

    /// Re-run every pending command on `baseline`. Returns (replayed, dropped).
    fn replay_onto(&mut self, baseline: &StateOf<D>) -> (usize, usize) {
        let originals: Vec<PendingCommand<D>> = self.pending.drain(..).collect();
        let total = originals.len();
        let mut base = baseline.clone();
        let mut dropped = Vec::new();
        let mut remaining = originals.into_iter();

        for entry in remaining.by_ref() {
            let outcome = guarded_transition(&self.domain, &base, &entry.command, &mut self.local_rng);
            let transition = match outcome {
                Ok(TransitionOutcome::Applied(transition)) => transition,
                Ok(TransitionOutcome::Rejected { reason }) => {
                    debug!("Replay of #{} refused: {}", entry.sequence, reason);
                    dropped.push(entry);
                    break;
                }
                Err(e) => {
                    warn!("Replay of #{} failed: {}", entry.sequence, e);
                    dropped.push(entry);
                    break;
                }
            };

            base = transition.state.clone();
            self.pending.push_back(PendingCommand {
                predicted_state: transition.state,
                events: transition.events,
                ..entry
            });
        }

        dropped.extend(remaining);
        self.orphan_rendered(dropped);

        let replayed = self.pending.len();
        (replayed, total - replayed)
    }

    // -------------------------------------------------------------------------
    // Rendering
    // -------------------------------------------------------------------------

    /// Take every event that may be rendered now.
    ///
    /// Confirmed events come first and advance the watermark. Predictions
    /// follow in submission order up to the first `Deferred` one.
    pub fn take_renderable(&mut self) -> Vec<EventStreamEntry<D::Event>> {
        let mut effects = Vec::new();

        if let Some(confirmed) = &self.confirmed {
            let fresh = self.watermark.unrendered(confirmed.sys.event_stream.entries(), None);
            if let Some(last) = fresh.last().map(|e| e.id) {
                effects.extend(
                    fresh
                        .into_iter()
                        .filter(|e| !self.suppressed.contains(&e.id))
                        .cloned(),
                );
                self.watermark.advance(last);
                self.suppressed.retain(|id| *id > last);
            }
        }

        for pending in self.pending.iter_mut() {
            if pending.animation == AnimationMode::Deferred && !pending.events.is_empty() {
                break;
            }
            if !pending.rendered {
                effects.extend(pending.events.iter().cloned());
                pending.rendered = true;
            }
        }

        effects
    }

    /// Hand renderable events to `observer`.
    pub fn render_to<O: EffectObserver<D::Event> + ?Sized>(&mut self, observer: &mut O) -> usize {
        let effects = self.take_renderable();
        if !effects.is_empty() {
            observer.on_effects(&effects);
        }
        effects.len()
    }

    // -------------------------------------------------------------------------
    // Timers and transport
    // -------------------------------------------------------------------------

    /// Flush an expired batch window.
    pub fn poll_timers(&mut self) -> bool {
        self.batcher.poll()
    }

    /// External timer callback for the batch window.
    pub fn on_timer(&mut self, token: TimerToken) -> bool {
        self.batcher.on_timer(token)
    }

    /// When the batch window expires, if armed.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.batcher.next_deadline()
    }

    /// Send queued commands now.
    pub fn flush(&mut self) {
        self.batcher.flush();
    }

    /// Resend batches the transport refused.
    pub fn retry_undelivered(&mut self) -> usize {
        self.batcher.retry_undelivered()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Forget predictions and the confirmed state, e.g. after a reconnect.
    ///
    /// The watermark and sequence counters survive: the server keeps counting
    /// and already rendered events stay rendered.
    pub fn reset(&mut self) {
        info!("Engine reset with {} pending commands", self.pending.len());
        self.pending.clear();
        self.suppressed.clear();
        self.orphaned.clear();
        self.confirmed = None;
    }

    /// Stop for good. No batch is sent and no timer fires afterwards.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.batcher.destroy();
        self.pending.clear();
        self.suppressed.clear();
        self.orphaned.clear();
        debug!("Engine torn down");
    }

    /// Whether `teardown` was called.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Newest predicted state, or the confirmed state.
    pub fn visible_state(&self) -> Option<&StateOf<D>> {
        self.pending
            .back()
            .map(|p| &p.predicted_state)
            .or(self.confirmed.as_ref())
    }

    /// Last confirmed state.
    pub fn confirmed_state(&self) -> Option<&StateOf<D>> {
        self.confirmed.as_ref()
    }

    /// Whether unconfirmed predictions exist.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of unconfirmed predictions.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Unconfirmed predictions, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingCommand<D>> {
        self.pending.iter()
    }

    /// Newest confirmed event id handed to observers.
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Commands acknowledged by the server.
    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// Short hex hash of the visible core, for logs.
    pub fn visible_hash(&self) -> Option<String> {
        let state = self.visible_state()?;
        compute_state_hash(state.sys.version, &state.core)
            .ok()
            .map(|hash| short_hex(&hash))
    }

    /// The domain.
    pub fn domain(&self) -> &D {
        &self.domain
    }

    /// The outgoing batcher.
    pub fn batcher(&self) -> &CommandBatcher<S> {
        &self.batcher
    }

    /// The outgoing batcher, mutably.
    pub fn batcher_mut(&mut self) -> &mut CommandBatcher<S> {
        &mut self.batcher
    }
}

/// Same events in the same order, ignoring timestamps.
fn same_effects<E: PartialEq>(predicted: &[&EventStreamEntry<E>], authoritative: &[EventStreamEntry<E>]) -> bool {
    predicted.len() == authoritative.len()
        && predicted.iter().zip(authoritative).all(|(p, a)| {
            p.id == a.id
                && p.event.data == a.event.data
                && p.event.source_command_type == a.event.source_command_type
        })
}
