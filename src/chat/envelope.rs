//! Chat envelope
//!
//! The unit every chat event travels in. On the wire it is a flat JSON object
//! keyed by field name:
//!
//! ```json
//! {"id":"…","author":"alice","body":"hi","room":"general","kind":"user","createdAt":"2025-01-01T12:00:00Z"}
//! ```
//!
//! Decoding is tolerant in both directions: unknown fields are ignored,
//! everything except `author` has a default, and any `kind` other than
//! `system` reads as a user message. The older field names (`username`,
//! `message`, `timestamp`, `messageType`) are accepted too; when a payload
//! carries both spellings the current one wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_ROOM: &str = "general";
pub const SYSTEM_AUTHOR: &str = "SYSTEM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[default]
    User,
    System,
}

impl Kind {
    /// `system` in any case is a notice; every other kind is shown as a message.
    fn from_wire(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("system") {
            Kind::System
        } else {
            Kind::User
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "WireEnvelope")]
pub struct Envelope {
    pub id: String,
    pub author: String,
    pub body: String,
    pub room: String,
    pub kind: Kind,
    pub created_at: DateTime<Utc>,
}

/// Every field any writer has used, all optional.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    id: Option<String>,
    author: Option<String>,
    username: Option<String>,
    body: Option<String>,
    message: Option<String>,
    room: Option<String>,
    kind: Option<String>,
    message_type: Option<String>,
    created_at: Option<DateTime<Utc>>,
    timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ParseError;

    fn try_from(wire: WireEnvelope) -> Result<Self, ParseError> {
        let author = wire
            .author
            .or(wire.username)
            .ok_or_else(|| ParseError::Schema("missing field `author`".to_string()))?;
        if author.trim().is_empty() {
            return Err(ParseError::MissingAuthor);
        }

        Ok(Self {
            id: wire.id.unwrap_or_else(new_id),
            author,
            body: wire.body.or(wire.message).unwrap_or_default(),
            room: wire.room.unwrap_or_else(default_room),
            kind: wire
                .kind
                .or(wire.message_type)
                .map(|k| Kind::from_wire(&k))
                .unwrap_or_default(),
            created_at: wire.created_at.or(wire.timestamp).unwrap_or_else(Utc::now),
        })
    }
}

/// Why a payload could not be turned into an `Envelope`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload does not match the envelope schema: {0}")]
    Schema(String),

    #[error("envelope has an empty author")]
    MissingAuthor,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

impl Envelope {
    fn new(author: &str, body: &str, room: &str, kind: Kind) -> Self {
        Self {
            id: new_id(),
            author: author.to_string(),
            body: body.to_string(),
            room: room.to_string(),
            kind,
            created_at: Utc::now(),
        }
    }

    /// A message typed by `username`.
    pub fn user(username: &str, message: &str, room: &str) -> Self {
        Self::new(username, message, room, Kind::User)
    }

    /// A notice authored by `SYSTEM` (joins, leaves).
    pub fn system(message: &str, room: &str) -> Self {
        Self::new(SYSTEM_AUTHOR, message, room, Kind::System)
    }

    pub fn is_system(&self) -> bool {
        self.kind == Kind::System
    }

    /// Encode for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of strings and a timestamp always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a payload received from the broker into a fresh envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(|e| match e.classify() {
            Category::Data => ParseError::Schema(e.to_string()),
            Category::Io | Category::Syntax | Category::Eof => ParseError::Malformed(e.to_string()),
        })?;
        Envelope::try_from(wire)
    }
}
