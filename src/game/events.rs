//! Game Events and the Event Stream
//!
//! Events are immutable facts produced by `execute` and applied by `reduce`.
//! Every applied event is appended to the match's [`EventStream`] under a
//! strictly increasing id, which observers use as a cursor.

use std::collections::VecDeque;
use std::fmt::Debug;

use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;

use crate::core::clock::Millis;

/// Game-defined event enum.
pub trait EventKind: Clone + Debug + PartialEq + Serialize + DeserializeOwned {
    /// Stable type name of this event variant.
    fn event_type(&self) -> &'static str;
}

/// Stream-assigned event identifier. Ids start at 1.
pub type EventId = u64;

/// Default number of entries an event stream keeps.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A game event with timing and provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameEvent<E> {
    /// Event data
    pub data: E,
    /// Timestamp of the command that produced the event
    pub timestamp: Millis,
    /// Type of the command that produced the event
    pub source_command_type: String,
}

impl<E: EventKind> GameEvent<E> {
    /// Create a new event.
    pub fn new(data: E, timestamp: Millis, source_command_type: impl Into<String>) -> Self {
        Self {
            data,
            timestamp,
            source_command_type: source_command_type.into(),
        }
    }

    /// Type name of the wrapped event.
    pub fn event_type(&self) -> &'static str {
        self.data.event_type()
    }
}

/// One entry of the event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventStreamEntry<E> {
    /// Strictly increasing id
    pub id: EventId,
    /// The event
    pub event: GameEvent<E>,
}

/// Append-only, monotonically identified event log.
///
/// Only the newest `capacity` entries are retained; eviction drops the oldest
/// entries and never touches id assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventStream<E> {
    entries: VecDeque<EventStreamEntry<E>>,
    next_id: EventId,
    capacity: usize,
}

impl<E> Default for EventStream<E> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E> EventStream<E> {
    /// Create an empty stream retaining at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    /// Id the next appended event will receive.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Id of the newest retained entry.
    pub fn last_id(&self) -> Option<EventId> {
        self.entries.back().map(|e| e.id)
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &EventStreamEntry<E>> {
        self.entries.iter()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with an id strictly greater than `after`.
    pub fn since(&self, after: EventId) -> impl Iterator<Item = &EventStreamEntry<E>> {
        self.entries.iter().filter(move |e| e.id > after)
    }

    /// Append an event and return its id.
    pub fn append(&mut self, event: GameEvent<E>) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(EventStreamEntry { id, event });
        self.evict();
        id
    }

    /// Copy of this stream with no retained entries but the same id cursor.
    ///
    /// Used when a state is put on the wire; the new entries travel alongside.
    pub fn stripped(&self) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: self.next_id,
            capacity: self.capacity,
        }
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

impl<E: Clone> EventStream<E> {
    /// Merge authoritative entries into this stream.
    ///
    /// Entries at or below the newest retained id are skipped, so absorbing
    /// the same update twice is harmless. The id cursor is raised to at least
    /// `next_id`.
    pub fn absorb(&mut self, incoming: &[EventStreamEntry<E>], next_id: EventId) {
        let floor = self.last_id().unwrap_or(0);
        for entry in incoming.iter().filter(|e| e.id > floor) {
            self.next_id = self.next_id.max(entry.id + 1);
            self.entries.push_back(entry.clone());
        }
        self.next_id = self.next_id.max(next_id);
        self.evict();
    }
}
