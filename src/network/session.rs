//! Match Session Management
//!
//! A session owns one authoritative match: its state, its random source and
//! the seated players. Every batch a client sends runs through the same
//! pipeline the clients predict with; the result goes back to each seat as a
//! player-specific [`AuthoritativeUpdate`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::rng::{derive_match_seed, DeterministicRng};
use crate::game::command::{BatchedCommand, Command};
use crate::game::domain::{DomainCore, StateOf};
use crate::game::events::EventStreamEntry;
use crate::game::pipeline::{guarded_transition, setup, PipelineConfig, TransitionOutcome};
use crate::game::state::PlayerId;
use crate::network::protocol::{MatchId, ServerMessage};
use crate::sync::engine::{AuthoritativeUpdate, Rejection};

/// Server message type of a domain.
pub type MessageOf<D> = ServerMessage<<D as DomainCore>::State, <D as DomainCore>::Event>;

/// Update type of a domain.
pub type UpdateOf<D> = AuthoritativeUpdate<<D as DomainCore>::State, <D as DomainCore>::Event>;

/// Configuration for a match session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Event stream and undo sizes.
    pub pipeline: PipelineConfig,
    /// Server secret mixed into match seeds.
    pub seed_salt: u64,
    /// Maximum seats per match.
    pub max_players: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            seed_salt: 0,
            max_players: 8,
        }
    }
}

/// One update addressed to one seat.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<G, E> {
    /// Recipient
    pub player_id: PlayerId,
    /// Update for that player's view
    pub update: AuthoritativeUpdate<G, E>,
}

/// Delivery type of a domain.
pub type DeliveryOf<D> = Delivery<<D as DomainCore>::State, <D as DomainCore>::Event>;

/// A message bound for one live connection.
#[derive(Debug)]
pub struct Outgoing<G, E> {
    /// Recipient
    pub player_id: PlayerId,
    /// The recipient's connection
    pub sender: mpsc::Sender<ServerMessage<G, E>>,
    /// What to send
    pub message: ServerMessage<G, E>,
}

/// Outgoing type of a domain.
pub type OutgoingOf<D> = Outgoing<<D as DomainCore>::State, <D as DomainCore>::Event>;

impl<G, E> Outgoing<G, E> {
    /// Queue the message without waiting.
    ///
    /// A full queue means the reader has stalled. The message is dropped; the
    /// next update carries the full state again.
    pub fn dispatch(self) -> bool {
        match self.sender.try_send(self.message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Player {} is not reading, dropping message", self.player_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Player {} is gone, dropping message", self.player_id);
                false
            }
        }
    }
}

/// Dispatch every message. Returns how many were queued.
///
/// Call this after releasing the session lock.
pub fn dispatch_all<G, E>(outgoing: Vec<Outgoing<G, E>>) -> usize {
    outgoing.into_iter().map(Outgoing::dispatch).filter(|sent| *sent).count()
}

/// A seated player.
pub struct Seat<D: DomainCore> {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Commands from this player processed so far.
    pub processed: u64,
    /// Message channel to this player, while connected.
    pub sender: Option<mpsc::Sender<MessageOf<D>>>,
}

impl<D: DomainCore> Seat<D> {
    /// Check if player is connected.
    pub fn is_connected(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| !s.is_closed())
    }
}

/// Session errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// No players given.
    #[error("A match needs at least one player")]
    NoPlayers,

    /// Too many players given.
    #[error("Too many players ({0})")]
    TooManyPlayers(usize),

    /// The same player was seated twice.
    #[error("Player {0} seated twice")]
    DuplicatePlayer(PlayerId),

    /// Player holds no seat.
    #[error("Player {0} is not seated")]
    NotSeated(PlayerId),

    /// Match not found.
    #[error("Match not found")]
    MatchNotFound,

    /// Session closed.
    #[error("Session closed")]
    Closed,

    /// Nothing to undo.
    #[error("Nothing to undo")]
    NothingToUndo,

    /// State could not be hashed for the wire.
    #[error("Encoding failed: {0}")]
    Encode(String),
}

// =============================================================================
// MATCH SESSION
// =============================================================================

/// A match session.
pub struct MatchSession<D: DomainCore> {
    /// Unique match identifier.
    pub id: MatchId,
    domain: D,
    state: StateOf<D>,
    rng: DeterministicRng,
    order: Vec<PlayerId>,
    seats: BTreeMap<PlayerId, Seat<D>>,
    closed: bool,
    created_at: Instant,
}

impl<D: DomainCore> MatchSession<D> {
    /// Set up a new match for `players` (seat order).
    pub fn new(id: MatchId, domain: D, players: Vec<PlayerId>, config: &SessionConfig) -> Result<Self, SessionError> {
        if players.is_empty() {
            return Err(SessionError::NoPlayers);
        }
        if players.len() > config.max_players {
            return Err(SessionError::TooManyPlayers(players.len()));
        }

        let mut seats = BTreeMap::new();
        for &player_id in &players {
            let seat = Seat { player_id, processed: 0, sender: None };
            if seats.insert(player_id, seat).is_some() {
                return Err(SessionError::DuplicatePlayer(player_id));
            }
        }

        let player_bytes: Vec<[u8; 16]> = players.iter().map(|p| *p.as_bytes()).collect();
        let seed = derive_match_seed(id.as_bytes(), &player_bytes, config.seed_salt);
        let mut rng = DeterministicRng::new(seed);
        let state = setup(&domain, &players, &mut rng, &config.pipeline);

        Ok(Self {
            id,
            domain,
            state,
            rng,
            order: players,
            seats,
            closed: false,
            created_at: Instant::now(),
        })
    }

    /// Apply a batch from `player`. Returns the updates to deliver.
    ///
    /// Applied commands produce one update per seat; refused ones only answer
    /// the sender. Every command counts towards the sender's ack either way.
    pub fn apply_batch(&mut self, player: PlayerId, batch: &[BatchedCommand]) -> Result<Vec<DeliveryOf<D>>, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if !self.seats.contains_key(&player) {
            return Err(SessionError::NotSeated(player));
        }

        let mut deliveries = Vec::new();
        for batched in batch {
            if let Some(seat) = self.seats.get_mut(&player) {
                seat.processed += 1;
            }

            let kind = match batched.decode::<D::Command>() {
                Ok(kind) => kind,
                Err(e) => {
                    debug!("Undecodable {} from {}: {}", batched.command_type, player, e);
                    let rejection = Rejection {
                        command_type: batched.command_type.clone(),
                        reason: e.to_string(),
                    };
                    deliveries.push(self.delivery(player, &[], Some(rejection))?);
                    continue;
                }
            };

            let command = Command::new(player, SystemClock.now_ms(), kind);
            match guarded_transition(&self.domain, &self.state, &command, &mut self.rng) {
                Ok(TransitionOutcome::Applied(transition)) => {
                    self.state = transition.state;
                    for seat in self.order.clone() {
                        deliveries.push(self.delivery(seat, &transition.events, None)?);
                    }
                    if self.state.is_over() {
                        info!("Match {} is over at version {}", self.id, self.state.sys.version);
                    }
                }
                Ok(TransitionOutcome::Rejected { reason }) => {
                    debug!("{} from {} rejected: {}", batched.command_type, player, reason);
                    let rejection = Rejection { command_type: batched.command_type.clone(), reason };
                    deliveries.push(self.delivery(player, &[], Some(rejection))?);
                }
                Err(e) => {
                    error!("Match {}: {}", self.id, e);
                    let rejection = Rejection {
                        command_type: batched.command_type.clone(),
                        reason: e.to_string(),
                    };
                    deliveries.push(self.delivery(player, &[], Some(rejection))?);
                }
            }
        }
        Ok(deliveries)
    }

    /// Undo the last applied command on behalf of `player`.
    pub fn undo(&mut self, player: PlayerId) -> Result<Vec<DeliveryOf<D>>, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if !self.seats.contains_key(&player) {
            return Err(SessionError::NotSeated(player));
        }

        let undone = self.state.undo().ok_or(SessionError::NothingToUndo)?;
        self.state.sys.game_over = self.domain.is_game_over(&self.state.core);
        info!("Match {}: {} undid {}", self.id, player, undone);

        self.order
            .clone()
            .into_iter()
            .map(|seat| self.delivery(seat, &[], None))
            .collect()
    }

    /// Full state for `player`, e.g. after a reconnect.
    pub fn sync_for(&self, player: PlayerId) -> Result<UpdateOf<D>, SessionError> {
        if !self.seats.contains_key(&player) {
            return Err(SessionError::NotSeated(player));
        }
        Ok(self.delivery(player, &[], None)?.update)
    }

    fn delivery(
        &self,
        player: PlayerId,
        events: &[EventStreamEntry<D::Event>],
        rejection: Option<Rejection>,
    ) -> Result<DeliveryOf<D>, SessionError> {
        let mut view = self.state.for_wire();
        view.core = self.domain.player_view(&self.state.core, player);

        let events = events
            .iter()
            .map(|entry| {
                let mut entry = entry.clone();
                entry.event.data = self.domain.event_view(&entry.event.data, player);
                entry
            })
            .collect();

        let acked = self.seats.get(&player).map(|s| s.processed).unwrap_or(0);
        let update = AuthoritativeUpdate::build(&view, events, acked, rejection)
            .map_err(|e| SessionError::Encode(e.to_string()))?;
        Ok(Delivery { player_id: player, update })
    }

    /// Attach a connection to `player`'s seat.
    pub fn subscribe(&mut self, player: PlayerId, sender: mpsc::Sender<MessageOf<D>>) -> Result<usize, SessionError> {
        let seat = self.seats.get_mut(&player).ok_or(SessionError::NotSeated(player))?;
        if seat.sender.replace(sender).is_some() {
            debug!("Player {} replaced an existing connection", player);
        }
        self.order
            .iter()
            .position(|p| *p == player)
            .ok_or(SessionError::NotSeated(player))
    }

    /// Detach `connection` from `player`'s seat.
    ///
    /// A seat taken over by a newer connection stays attached.
    pub fn unsubscribe(&mut self, player: PlayerId, connection: &mpsc::Sender<MessageOf<D>>) -> bool {
        let Some(seat) = self.seats.get_mut(&player) else {
            return false;
        };
        if !seat.sender.as_ref().is_some_and(|s| s.same_channel(connection)) {
            return false;
        }
        seat.sender = None;
        true
    }

    /// Address updates to their connected recipients.
    pub fn outbox(&self, deliveries: Vec<DeliveryOf<D>>) -> Vec<OutgoingOf<D>> {
        deliveries
            .into_iter()
            .filter_map(|delivery| {
                let sender = self.seats.get(&delivery.player_id)?.sender.clone()?;
                Some(Outgoing {
                    player_id: delivery.player_id,
                    sender,
                    message: ServerMessage::Update(delivery.update),
                })
            })
            .collect()
    }

    /// Address `message` to every connected player.
    pub fn announce(&self, message: MessageOf<D>) -> Vec<OutgoingOf<D>> {
        self.seats
            .values()
            .filter_map(|seat| {
                Some(Outgoing {
                    player_id: seat.player_id,
                    sender: seat.sender.clone()?,
                    message: message.clone(),
                })
            })
            .collect()
    }

    /// Close the session. Further batches are refused.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether the session was closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Authoritative state.
    pub fn state(&self) -> &StateOf<D> {
        &self.state
    }

    /// Seated players in seat order.
    pub fn players(&self) -> &[PlayerId] {
        &self.order
    }

    /// Commands processed for `player`.
    pub fn processed(&self, player: PlayerId) -> Option<u64> {
        self.seats.get(&player).map(|s| s.processed)
    }

    /// Number of seats with a live connection.
    pub fn connected_count(&self) -> usize {
        self.seats.values().filter(|s| s.is_connected()).count()
    }

    /// Time since the session was created.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Manages all active sessions.
pub struct SessionManager<D: DomainCore> {
    domain: D,
    config: SessionConfig,
    sessions: RwLock<BTreeMap<MatchId, Arc<RwLock<MatchSession<D>>>>>,
}

impl<D: DomainCore + Clone> SessionManager<D> {
    /// Create new session manager.
    pub fn new(domain: D, config: SessionConfig) -> Self {
        Self {
            domain,
            config,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a match for `players`.
    pub async fn create_match(&self, players: Vec<PlayerId>) -> Result<MatchId, SessionError> {
        let id = uuid::Uuid::new_v4();
        let count = players.len();
        let session = MatchSession::new(id, self.domain.clone(), players, &self.config)?;

        let mut sessions = self.sessions.write().await;
        sessions.insert(id, Arc::new(RwLock::new(session)));
        info!("Created match {} with {} players", id, count);

        Ok(id)
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &MatchId) -> Option<Arc<RwLock<MatchSession<D>>>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Close and remove a match. Connected players are told why.
    pub async fn teardown_match(&self, id: &MatchId, reason: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(id)
        };
        let Some(session) = removed else {
            return false;
        };

        let outgoing = {
            let mut session = session.write().await;
            session.close();
            session.announce(ServerMessage::MatchClosed { reason: reason.to_string() })
        };
        dispatch_all(outgoing);
        info!("Match {} torn down: {}", id, reason);
        true
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Drop closed sessions and finished ones nobody is connected to.
    pub async fn cleanup(&self) -> usize {
        let candidates: Vec<_> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(id, session)| (*id, session.clone())).collect()
        };

        let mut to_remove = Vec::new();
        for (id, session) in candidates {
            let s = session.read().await;
            if s.is_closed() || (s.state().is_over() && s.connected_count() == 0) {
                to_remove.push(id);
            }
        }
        if to_remove.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().await;
        for id in &to_remove {
            sessions.remove(id);
        }
        info!("Cleaned up {} sessions", to_remove.len());
        to_remove.len()
    }
}
