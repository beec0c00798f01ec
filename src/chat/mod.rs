//! The chat layer: envelopes, the publisher and subscriber built on the
//! broker client seam, and the session that ties them to one user.

pub mod envelope;
pub mod publisher;
pub mod session;
pub mod sink;
pub mod subscriber;

pub use envelope::{Envelope, Kind, ParseError};
pub use publisher::{Publisher, PublisherStats};
pub use session::{Session, SessionState, SessionStats};
pub use sink::{ChannelSink, DedupFilter, DispatchSink, EchoFilter, SinkEvent};
pub use subscriber::{StopOutcome, Subscriber, SubscriberState, SubscriberStats};

#[cfg(test)]
mod tests;


#[cfg(test)]
mod subscriber_tests;
