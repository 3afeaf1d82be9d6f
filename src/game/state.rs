//! Match State Definitions
//!
//! A match state is the game's own `core` plus the engine-owned `sys` block
//! (event stream, undo history, interaction queue, response window).
//! Game rules only ever produce `core`.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::game::events::EventStream;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Unique player identifier (UUID as bytes).
///
/// Implements Ord for deterministic BTreeMap ordering. Serializes as a UUID
/// string so it can key JSON maps.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Seat-style id, handy for tests and demos: every byte is `seat`.
    pub const fn from_seat(seat: u8) -> Self {
        Self([seat; 16])
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s)
            .ok()
            .map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlayerId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

impl Serialize for PlayerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_uuid_string())
    }
}

impl<'de> Deserialize<'de> for PlayerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_uuid_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid player id: {s}")))
    }
}

// =============================================================================
// SYSTEM STATE
// =============================================================================

/// Default number of undo snapshots kept.
pub const DEFAULT_UNDO_CAPACITY: usize = 16;

/// Structural snapshot of `core` taken before a command was applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UndoSnapshot<G> {
    /// State version the snapshot was taken at
    pub version: u64,
    /// Command type that moved the state past this snapshot
    pub command_type: String,
    /// The core as it was
    pub core: G,
}

/// Bounded, version-indexed history of core snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UndoHistory<G> {
    snapshots: VecDeque<UndoSnapshot<G>>,
    capacity: usize,
}

impl<G> Default for UndoHistory<G> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_UNDO_CAPACITY)
    }
}

impl<G> UndoHistory<G> {
    /// Create a history keeping at most `capacity` snapshots (0 disables).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            capacity,
        }
    }

    /// Whether snapshots are recorded at all.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Number of snapshots held.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no snapshots are held.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Record a snapshot, evicting the oldest past capacity.
    pub fn push(&mut self, snapshot: UndoSnapshot<G>) {
        if self.capacity == 0 {
            return;
        }
        self.snapshots.push_back(snapshot);
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
    }

    /// Remove and return the newest snapshot.
    pub fn pop(&mut self) -> Option<UndoSnapshot<G>> {
        self.snapshots.pop_back()
    }

    /// Snapshot taken at `version`, if still held.
    pub fn at_version(&self, version: u64) -> Option<&UndoSnapshot<G>> {
        self.snapshots.iter().find(|s| s.version == version)
    }

    /// Same capacity, no snapshots.
    pub fn cleared(&self) -> Self {
        Self::with_capacity(self.capacity)
    }
}

/// A decision some player owes before play continues.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInteraction {
    /// Queue-assigned id
    pub id: u64,
    /// Player who must act
    pub player_id: PlayerId,
    /// Game-defined prompt key
    pub prompt: String,
}

/// FIFO of pending interactions; the front one is current.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionQueue {
    queue: VecDeque<PendingInteraction>,
    next_id: u64,
}

impl InteractionQueue {
    /// Interaction currently blocking play.
    pub fn current(&self) -> Option<&PendingInteraction> {
        self.queue.front()
    }

    /// Number of queued interactions.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue an interaction and return its id.
    pub fn push(&mut self, player_id: PlayerId, prompt: impl Into<String>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.queue.push_back(PendingInteraction {
            id,
            player_id,
            prompt: prompt.into(),
        });
        id
    }

    /// Resolve the current interaction.
    pub fn resolve_current(&mut self) -> Option<PendingInteraction> {
        self.queue.pop_front()
    }
}

/// Window during which only the listed players may respond.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseWindow {
    /// Players allowed to act while the window is open
    pub responders: Vec<PlayerId>,
    /// Command type that opened the window
    pub opened_by: String,
}

/// Result of a finished match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOver {
    /// Winning players; empty for a draw
    pub winners: Vec<PlayerId>,
}

/// Engine-owned, cross-cutting part of the match state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SysState<G, E> {
    /// Event log
    pub event_stream: EventStream<E>,
    /// Undo snapshots
    pub undo: UndoHistory<G>,
    /// Pending interactions
    pub interaction: InteractionQueue,
    /// Open response window
    pub response_window: Option<ResponseWindow>,
    /// Number of commands applied so far
    pub version: u64,
    /// Set once the domain reports the match over
    pub game_over: Option<GameOver>,
}

/// Complete match state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchState<G, E> {
    /// Game-specific state
    pub core: G,
    /// Engine-owned state
    pub sys: SysState<G, E>,
}

impl<G, E> MatchState<G, E> {
    /// Wrap a freshly set up core.
    pub fn new(core: G, event_capacity: usize, undo_capacity: usize) -> Self {
        Self {
            core,
            sys: SysState {
                event_stream: EventStream::with_capacity(event_capacity),
                undo: UndoHistory::with_capacity(undo_capacity),
                interaction: InteractionQueue::default(),
                response_window: None,
                version: 0,
                game_over: None,
            },
        }
    }

    /// Whether the match has finished.
    pub fn is_over(&self) -> bool {
        self.sys.game_over.is_some()
    }

    /// Restore the newest undo snapshot.
    ///
    /// The event stream is left alone: ids stay monotonic and observers are
    /// never rewound. Returns the command type that was undone.
    pub fn undo(&mut self) -> Option<String> {
        let snapshot = self.sys.undo.pop()?;
        self.core = snapshot.core;
        self.sys.version += 1;
        self.sys.game_over = None;
        Some(snapshot.command_type)
    }
}

impl<G: Clone, E> MatchState<G, E> {
    /// Copy suitable for the wire: no event entries, no undo snapshots.
    pub fn for_wire(&self) -> Self {
        Self {
            core: self.core.clone(),
            sys: SysState {
                event_stream: self.sys.event_stream.stripped(),
                undo: self.sys.undo.cleared(),
                interaction: self.sys.interaction.clone(),
                response_window: self.sys.response_window.clone(),
                version: self.sys.version,
                game_over: self.sys.game_over.clone(),
            },
        }
    }

    /// Same state with a different core (used for per-player views).
    pub fn with_core(&self, core: G) -> Self
    where
        E: Clone,
    {
        Self {
            core,
            sys: self.sys.clone(),
        }
    }
}

impl<G: PartialEq, E> MatchState<G, E> {
    /// Whether two states agree on everything a prediction can get wrong.
    ///
    /// Retained event entries and undo snapshots are ignored; the event id
    /// cursor is compared so differing event counts are caught.
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.core == other.core
            && self.sys.version == other.sys.version
            && self.sys.event_stream.next_id() == other.sys.event_stream.next_id()
            && self.sys.interaction == other.sys.interaction
            && self.sys.response_window == other.sys.response_window
            && self.sys.game_over == other.sys.game_over
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::events::GameEvent;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note(u32);

    impl crate::game::events::EventKind for Note {
        fn event_type(&self) -> &'static str {
            "NOTE"
        }
    }

    #[test]
    fn test_player_id_serializes_as_uuid() {
        let id = PlayerId::from_seat(1);
        let text = serde_json::to_string(&id).unwrap();
        assert_eq!(text, "\"01010101-0101-0101-0101-010101010101\"");

        let back: PlayerId = serde_json::from_str(&text).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<PlayerId>("\"nope\"").is_err());
    }

    #[test]
    fn test_player_id_as_map_key() {
        let mut hp = std::collections::BTreeMap::new();
        hp.insert(PlayerId::from_seat(2), 10);
        let text = serde_json::to_string(&hp).unwrap();
        let back: std::collections::BTreeMap<PlayerId, i32> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, hp);
    }

    #[test]
    fn test_undo_history_capacity() {
        let mut history = UndoHistory::with_capacity(2);
        for v in 0..4u64 {
            history.push(UndoSnapshot { version: v, command_type: "X".into(), core: v });
        }

        assert_eq!(history.len(), 2);
        assert!(history.at_version(1).is_none());
        assert_eq!(history.at_version(3).map(|s| s.core), Some(3));
        assert_eq!(history.pop().map(|s| s.version), Some(3));

        let mut disabled: UndoHistory<u64> = UndoHistory::with_capacity(0);
        disabled.push(UndoSnapshot { version: 0, command_type: "X".into(), core: 0 });
        assert!(disabled.is_empty());
    }

    #[test]
    fn test_undo_restores_core_keeps_stream() {
        let mut state: MatchState<u32, Note> = MatchState::new(5, 16, 4);
        state.sys.undo.push(UndoSnapshot { version: 0, command_type: "ADD".into(), core: 5 });
        state.core = 9;
        state.sys.version = 1;
        state.sys.event_stream.append(GameEvent::new(Note(4), 0, "ADD"));

        assert_eq!(state.undo().as_deref(), Some("ADD"));
        assert_eq!(state.core, 5);
        assert_eq!(state.sys.version, 2);
        assert_eq!(state.sys.event_stream.next_id(), 2);
        assert_eq!(state.undo(), None);
    }

    #[test]
    fn test_interaction_queue_fifo() {
        let mut queue = InteractionQueue::default();
        let a = queue.push(PlayerId::from_seat(1), "choose");
        let b = queue.push(PlayerId::from_seat(2), "respond");

        assert!(b > a);
        assert_eq!(queue.current().map(|i| i.id), Some(a));
        assert_eq!(queue.resolve_current().map(|i| i.id), Some(a));
        assert_eq!(queue.current().map(|i| i.id), Some(b));
    }

    #[test]
    fn test_for_wire_strips_history() {
        let mut state: MatchState<u32, Note> = MatchState::new(1, 16, 4);
        state.sys.event_stream.append(GameEvent::new(Note(1), 0, "ADD"));
        state.sys.undo.push(UndoSnapshot { version: 0, command_type: "ADD".into(), core: 0 });

        let wire = state.for_wire();
        assert!(wire.sys.event_stream.is_empty());
        assert!(wire.sys.undo.is_empty());
        assert!(wire.same_outcome(&state));
    }
}
