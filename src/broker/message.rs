//! Record definitions for the broker
//!
//! `OutgoingRecord` is what a producer hands to the broker; `Record` is what a
//! consumer gets back once the broker has placed it at a partition offset.
//!
//! Notes on fields:
//! - `key`: partition key; records with the same key land on the same partition
//! - `payload`: opaque bytes, the broker never looks inside
//! - `timestamp`: milliseconds since UNIX epoch, chosen by the producer
//! - `producer_id` / `sequence`: identify a send attempt so a retried record
//!   is appended once (idempotent producer)

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: &str, partition: u32) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: i64,
    #[serde(default)]
    pub producer_id: Option<String>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

/// Broker acknowledgment for a produced record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// What a consumer poll can yield.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsumerEvent {
    Record(Record),
    Assigned { partitions: Vec<TopicPartition> },
    Revoked { partitions: Vec<TopicPartition> },
}
