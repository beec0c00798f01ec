//! # popchat
//!
//! `popchat` is a multi-room chat relay built on a small partitioned log
//! broker. Every room is a topic, every user reads it through their own
//! consumer group, and the broker can run in-process or be shared over
//! WebSockets with `popchat serve`.
//!
//! ## Core Modules
//!
//! - `broker`: the partitioned log engine, consumer groups and the producer/consumer client seam.
//! - `chat`: message envelopes, the publisher, the subscriber loop and the chat session.
//! - `config`: loads settings from `config/default.toml` and `POPCHAT__*` environment variables.
//! - `console`: the interactive terminal front end.
//! - `persistence`: the sled-backed partition log.
//! - `transport`: the WebSocket broker server and its remote client.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod chat;
pub mod config;
pub mod console;
pub mod persistence;
pub mod transport;
pub mod utils;
