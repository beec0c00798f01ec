//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `popchat` application.
//!
//! It centralizes the error types shared by the broker client, the chat
//! session layer and the transport, plus the tracing bootstrap.

pub mod error;
pub mod logging;

pub use error::{BrokerError, ChatError};
