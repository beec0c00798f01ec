//! The broker: a partitioned publish/subscribe log with consumer groups.
//!
//! - `engine`: topics, partition logs, consumer groups, offsets
//! - `group`: group membership and range assignment
//! - `topic`: partition routing
//! - `message`: records, deliveries and consumer events
//! - `client`: the trait seam the chat layer is written against
//! - `local`: in-process implementation of that seam

pub mod client;
pub mod engine;
pub mod group;
pub mod local;
pub mod message;
pub mod topic;

pub use client::{BrokerConnector, ConsumerOptions, ConsumerTransport, ProducerTransport};
pub use engine::{Broker, SharedBroker};
pub use local::LocalConnector;
pub use message::{ConsumerEvent, Delivery, OutgoingRecord, Record, TopicPartition};

#[cfg(test)]
mod tests;
