//! The `persistence` module stores the broker's partition logs and committed
//! consumer-group offsets.
//!
//! It uses `sled` as an embedded key-value store, so a broker started with a
//! data directory keeps its topics, records and offsets across restarts.

pub mod sled_store;

pub use sled_store::{LogStore, StoredRecord};
