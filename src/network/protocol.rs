//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON, internally tagged by `type`.

use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::game::command::BatchedCommand;
use crate::game::state::PlayerId;
use crate::sync::engine::AuthoritativeUpdate;

/// Unique match identifier.
pub type MatchId = Uuid;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a new match for the listed seats.
    CreateMatch {
        /// Seated players, in seat order
        player_ids: Vec<PlayerId>,
    },

    /// Attach this connection to a seat.
    Join {
        /// Match to join
        match_id: MatchId,
        /// Seat to take
        player_id: PlayerId,
    },

    /// A batch of commands, in submission order.
    Batch {
        /// Commands
        commands: Vec<BatchedCommand>,
    },

    /// Undo the last applied command.
    Undo,

    /// Request current match state (for reconnection).
    SyncRequest,

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp
        timestamp: u64,
    },

    /// Player is leaving the match.
    Leave,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(bound(
    serialize = "G: Serialize, E: Serialize",
    deserialize = "G: DeserializeOwned, E: DeserializeOwned"
))]
pub enum ServerMessage<G, E> {
    /// A match was created.
    MatchCreated {
        /// New match
        match_id: MatchId,
    },

    /// This connection now holds a seat.
    Joined {
        /// Match joined
        match_id: MatchId,
        /// Seat taken
        player_id: PlayerId,
        /// Seat index
        seat: usize,
    },

    /// Confirmed state.
    Update(AuthoritativeUpdate<G, E>),

    /// Error message.
    Error(ServerError),

    /// Pong response.
    Pong {
        /// Echoed client timestamp
        timestamp: u64,
        /// Server wall clock (ms)
        server_time: u64,
    },

    /// The match is gone.
    MatchClosed {
        /// Why
        reason: String,
    },
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Create an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message could not be parsed.
    InvalidMessage,
    /// Match not found.
    MatchNotFound,
    /// Player holds no seat in the match.
    NotSeated,
    /// Connection already joined a match.
    AlreadyInMatch,
    /// Connection has not joined a match.
    NotInMatch,
    /// Nothing to undo.
    UndoUnavailable,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

/// Failure to decode a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not valid JSON for the expected message.
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame type the protocol does not use.
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

impl<G: Serialize, E: Serialize> ServerMessage<G, E> {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<G: DeserializeOwned, E: DeserializeOwned> ServerMessage<G, E> {
    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

impl<G, E> ServerMessage<G, E> {
    /// Shorthand for an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}
