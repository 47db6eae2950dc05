//! Protocol message definitions
//!
//! Defines the JSON frames exchanged between clients and the relay server.
//! Client frames carry a `type` tag (`JOIN`, `PONG`); server events use the
//! lowerCamelCase tags (`init`, `userJoined`, ...) expected by clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum display name length in bytes
pub const MAX_NAME_LENGTH: usize = 50;

/// Maximum room name length in bytes
pub const MAX_ROOM_LENGTH: usize = 50;

/// Close reason sent with code 1008 when a connection exceeds the rate limit
pub const RATE_LIMIT_CLOSE_REASON: &str = "Rate limit exceeded";

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Frames
// ============================================================================

/// Frames sent from client to server
///
/// Unknown `type` tags deserialize to [`ClientFrame::Unknown`] and are
/// silently dropped by the session handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Announce a display name and room; valid at most once per connection
    #[serde(rename = "JOIN")]
    Join { name: String, room: String },

    /// Liveness reply to a server PING
    #[serde(rename = "PONG")]
    Pong,

    /// Any unrecognized message type
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Validate frame contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientFrame::Join { name, room } => validate_join(name, room),
            ClientFrame::Pong | ClientFrame::Unknown => Ok(()),
        }
    }
}

/// Validate JOIN fields: both non-empty, both within the length limits
pub fn validate_join(name: &str, room: &str) -> ProtocolResult<()> {
    if name.is_empty() {
        return Err(ProtocolError::ValidationError(
            "name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "name exceeds maximum length of {} characters",
            MAX_NAME_LENGTH
        )));
    }
    if room.is_empty() {
        return Err(ProtocolError::ValidationError(
            "room cannot be empty".to_string(),
        ));
    }
    if room.len() > MAX_ROOM_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "room exceeds maximum length of {} characters",
            MAX_ROOM_LENGTH
        )));
    }
    Ok(())
}

// ============================================================================
// Server Events
// ============================================================================

/// A joined connection as presented to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    /// Connection id
    pub id: Uuid,
    /// Display name announced via JOIN
    pub name: String,
    /// Room announced via JOIN
    pub room: String,
}

/// Events sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Sent once per connection immediately after registration
    #[serde(rename = "init")]
    Init { id: Uuid },

    /// Heartbeat probe; clients answer with a PONG frame
    #[serde(rename = "PING")]
    Ping,

    /// A connection in the recipient's room completed a JOIN
    #[serde(rename = "userJoined")]
    UserJoined { user: UserInfo },

    /// A joined connection in the recipient's room went away
    #[serde(rename = "userLeft")]
    UserLeft { id: Uuid },

    /// Full roster of joined connections, recomputed per send
    #[serde(rename = "userList")]
    UserList { users: Vec<UserInfo> },
}

impl ServerEvent {
    /// Create an Init event
    pub fn init(id: Uuid) -> Self {
        ServerEvent::Init { id }
    }

    /// Create a UserJoined event
    pub fn user_joined(user: UserInfo) -> Self {
        ServerEvent::UserJoined { user }
    }

    /// Create a UserLeft event
    pub fn user_left(id: Uuid) -> Self {
        ServerEvent::UserLeft { id }
    }

    /// Create a UserList event
    pub fn user_list(users: Vec<UserInfo>) -> Self {
        ServerEvent::UserList { users }
    }

    /// Serialize the event to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
