//! Commands
//!
//! A command is a player-issued request to change state. Games define their
//! commands as one tagged enum; on the wire a command travels as a
//! [`BatchedCommand`] (`{"type": ..., "payload": ...}`).

use std::fmt::Debug;

use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::clock::Millis;
use crate::game::state::PlayerId;

/// Game-defined command enum.
///
/// Implementors are expected to use adjacent tagging,
/// `#[serde(tag = "type", content = "payload")]`, with variant names matching
/// [`CommandKind::command_type`]; that is the shape [`BatchedCommand`] maps to.
pub trait CommandKind: Clone + Debug + PartialEq + Serialize + DeserializeOwned {
    /// Stable type name of this command variant.
    fn command_type(&self) -> &'static str;
}

/// A command issued by a player at a point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command<C> {
    /// Issuing player
    pub player_id: PlayerId,
    /// Client timestamp; copied onto every event the command produces
    pub timestamp: Millis,
    /// Game-specific command
    pub kind: C,
}

impl<C: CommandKind> Command<C> {
    /// Create a new command.
    pub fn new(player_id: PlayerId, timestamp: Millis, kind: C) -> Self {
        Self { player_id, timestamp, kind }
    }

    /// Type name of the wrapped command.
    pub fn command_type(&self) -> &'static str {
        self.kind.command_type()
    }
}

/// Wire-facing subset of a command, as sent in a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchedCommand {
    /// Command type
    #[serde(rename = "type")]
    pub command_type: String,
    /// Command payload
    #[serde(default)]
    pub payload: Value,
}

/// Failure to move a command between its typed and wire forms.
#[derive(Debug, Error)]
pub enum CommandCodecError {
    /// serde_json refused the value.
    #[error("command codec: {0}")]
    Json(#[from] serde_json::Error),

    /// The command did not serialize to `{"type", "payload"}`.
    #[error("command {0} is not adjacently tagged")]
    NotTagged(String),
}

impl BatchedCommand {
    /// Create a batched command from raw parts.
    pub fn new(command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            command_type: command_type.into(),
            payload,
        }
    }

    /// Encode a typed command.
    pub fn encode<C: CommandKind>(kind: &C) -> Result<Self, CommandCodecError> {
        let command_type = kind.command_type();
        match serde_json::to_value(kind)? {
            Value::Object(mut map) => {
                let payload = map.remove("payload").unwrap_or(Value::Null);
                Ok(Self::new(command_type, payload))
            }
            // Unit variants of an adjacently tagged enum still serialize as
            // objects; anything else is a mis-declared enum.
            _ => Err(CommandCodecError::NotTagged(command_type.to_string())),
        }
    }

    /// Decode into a typed command.
    pub fn decode<C: CommandKind>(&self) -> Result<C, CommandCodecError> {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.command_type.clone()));
        if !self.payload.is_null() {
            map.insert("payload".to_string(), self.payload.clone());
        }
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}
