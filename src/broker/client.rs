//! Broker client seam.
//!
//! The chat layer only talks to these traits, so the in-process broker and
//! the WebSocket transport are interchangeable. A connector hands out one
//! producer or consumer per call; each is owned by exactly one publisher or
//! subscriber.

use std::time::Duration;

use async_trait::async_trait;

use crate::broker::message::{ConsumerEvent, Delivery, OutgoingRecord, TopicPartition};
use crate::config::{ConsumerSettings, OffsetReset};
use crate::utils::BrokerError;

/// Options for a new consumer.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub offset_reset: OffsetReset,
    /// How often the client commits its positions while polling.
    pub auto_commit_interval: Duration,
}

impl From<&ConsumerSettings> for ConsumerOptions {
    fn from(settings: &ConsumerSettings) -> Self {
        Self {
            offset_reset: settings.offset_reset,
            auto_commit_interval: Duration::from_millis(settings.auto_commit_interval_ms),
        }
    }
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn producer(&self) -> Result<Box<dyn ProducerTransport>, BrokerError>;

    async fn consumer(
        &self,
        group: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn ConsumerTransport>, BrokerError>;

    /// Human readable description of where this connector points.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait ProducerTransport: Send + Sync {
    /// One produce attempt. Retrying is the caller's business.
    async fn produce(&self, record: OutgoingRecord) -> Result<Delivery, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait ConsumerTransport: Send {
    /// Join the consumer group on the first call, change the subscription afterwards.
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next event. `Ok(None)` means nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerEvent>, BrokerError>;

    async fn commit(&mut self) -> Result<(), BrokerError>;

    async fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError>;

    async fn positions(&self) -> Result<Vec<(TopicPartition, u64)>, BrokerError>;

    /// Commit and leave the group. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
