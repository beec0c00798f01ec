//! Broker wire protocol
//!
//! Every frame is a JSON text message tagged by `type`. Each client request
//! carries a `request_id` chosen by the client; the server echoes it in the
//! reply so a connection can have several requests outstanding. Server errors
//! that cannot be tied to a request (an unparseable frame) have no id.

use serde::{Deserialize, Serialize};

use crate::broker::{ConsumerEvent, Delivery, OutgoingRecord, TopicPartition};
use crate::config::OffsetReset;
use crate::utils::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Produce {
        request_id: u64,
        record: OutgoingRecord,
    },
    /// Join `group` as a new member subscribed to `topics`.
    Join {
        request_id: u64,
        group: String,
        topics: Vec<String>,
        offset_reset: OffsetReset,
        auto_commit_interval_ms: u64,
    },
    Subscribe {
        request_id: u64,
        member_id: String,
        topics: Vec<String>,
    },
    /// Long poll: answered with the next event, or `None` after `max_wait_ms`.
    Fetch {
        request_id: u64,
        member_id: String,
        max_wait_ms: u64,
    },
    Commit {
        request_id: u64,
        member_id: String,
    },
    Describe {
        request_id: u64,
        member_id: String,
    },
    Leave {
        request_id: u64,
        member_id: String,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientMessage::Produce { request_id, .. }
            | ClientMessage::Join { request_id, .. }
            | ClientMessage::Subscribe { request_id, .. }
            | ClientMessage::Fetch { request_id, .. }
            | ClientMessage::Commit { request_id, .. }
            | ClientMessage::Describe { request_id, .. }
            | ClientMessage::Leave { request_id, .. } => *request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Produced {
        request_id: u64,
        delivery: Delivery,
    },
    Joined {
        request_id: u64,
        member_id: String,
    },
    Event {
        request_id: u64,
        event: Option<ConsumerEvent>,
    },
    Described {
        request_id: u64,
        assignment: Vec<TopicPartition>,
        positions: Vec<(TopicPartition, u64)>,
    },
    Ok {
        request_id: u64,
    },
    Error {
        request_id: Option<u64>,
        message: String,
        retriable: bool,
        error: BrokerError,
    },
}

impl ServerMessage {
    pub fn error(request_id: Option<u64>, error: BrokerError) -> Self {
        ServerMessage::Error {
            request_id,
            message: error.to_string(),
            retriable: error.is_retriable(),
            error,
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Produced { request_id, .. }
            | ServerMessage::Joined { request_id, .. }
            | ServerMessage::Event { request_id, .. }
            | ServerMessage::Described { request_id, .. }
            | ServerMessage::Ok { request_id } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
        }
    }
}
