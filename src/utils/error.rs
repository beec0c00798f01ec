//! Error types shared across `popchat`.
//!
//! `BrokerError` covers everything that can go wrong between a client and the
//! broker (in-process or remote). `ChatError` is what the chat layer hands to
//! its callers; broker failures are wrapped rather than flattened so the
//! publisher can still tell transient failures from permanent ones.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Also travels over the WebSocket transport, so remote callers can classify it.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("unknown consumer group member '{0}'")]
    UnknownMember(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client closed")]
    Closed,

    /// The connection a consumer's group membership lived on is gone.
    #[error("connection to broker lost")]
    ConnectionLost,
}

impl BrokerError {
    /// Transient failures worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Timeout(_))
    }

    /// Failures after which a consume loop cannot make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Closed | BrokerError::UnknownMember(_) | BrokerError::ConnectionLost
        )
    }
}

impl From<sled::Error> for BrokerError {
    fn from(e: sled::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Protocol(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("session is not connected")]
    NotConnected,

    #[error("send failed after {attempts} attempt(s): {source}")]
    SendFailed {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid subscriber state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("console I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
