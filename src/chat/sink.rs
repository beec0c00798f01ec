//! Dispatch sinks
//!
//! A `DispatchSink` is where delivered envelopes and diagnostics end up. The
//! subscriber calls it from its background task, so implementations must be
//! thread-safe and must not block for long; a UI with thread affinity should
//! use `ChannelSink` and drain the receiver on its own thread.
//!
//! `EchoFilter` and `DedupFilter` wrap another sink and drop envelopes before
//! they reach it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::chat::envelope::Envelope;

pub trait DispatchSink: Send + Sync {
    fn deliver(&self, envelope: Envelope);

    fn report_error(&self, message: &str);

    /// Lifecycle and rebalance notices. Logged and otherwise ignored by default.
    fn report_status(&self, message: &str) {
        info!("{message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Delivered(Envelope),
    Error(String),
    Status(String),
}

/// Forwards everything over an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            debug!("Sink receiver dropped; discarding event");
        }
    }
}

impl DispatchSink for ChannelSink {
    fn deliver(&self, envelope: Envelope) {
        self.forward(SinkEvent::Delivered(envelope));
    }

    fn report_error(&self, message: &str) {
        self.forward(SinkEvent::Error(message.to_string()));
    }

    fn report_status(&self, message: &str) {
        self.forward(SinkEvent::Status(message.to_string()));
    }
}

/// Drops envelopes written by the local user; they were rendered when sent.
pub struct EchoFilter {
    local_author: String,
    inner: Arc<dyn DispatchSink>,
}

impl EchoFilter {
    pub fn new(local_author: &str, inner: Arc<dyn DispatchSink>) -> Self {
        Self {
            local_author: local_author.to_string(),
            inner,
        }
    }
}

impl DispatchSink for EchoFilter {
    fn deliver(&self, envelope: Envelope) {
        if envelope.author == self.local_author {
            debug!(id = %envelope.id, "Suppressed echo of own message");
            return;
        }
        self.inner.deliver(envelope);
    }

    fn report_error(&self, message: &str) {
        self.inner.report_error(message);
    }

    fn report_status(&self, message: &str) {
        self.inner.report_status(message);
    }
}

/// Drops envelopes whose `id` was seen among the last `capacity` deliveries.
///
/// Redelivery after a consumer restart is the usual source of duplicates.
pub struct DedupFilter {
    capacity: usize,
    seen: Mutex<(HashSet<String>, VecDeque<String>)>,
    inner: Arc<dyn DispatchSink>,
}

impl DedupFilter {
    pub fn new(capacity: usize, inner: Arc<dyn DispatchSink>) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: Mutex::new((HashSet::new(), VecDeque::new())),
            inner,
        }
    }

    /// Record the id; false when it was already present.
    fn first_sighting(&self, id: &str) -> bool {
        let mut guard = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let (ids, order) = &mut *guard;
        if ids.contains(id) {
            return false;
        }
        ids.insert(id.to_string());
        order.push_back(id.to_string());
        if order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                ids.remove(&oldest);
            }
        }
        true
    }
}

impl DispatchSink for DedupFilter {
    fn deliver(&self, envelope: Envelope) {
        if self.first_sighting(&envelope.id) {
            self.inner.deliver(envelope);
        } else {
            debug!(id = %envelope.id, "Dropped duplicate delivery");
        }
    }

    fn report_error(&self, message: &str) {
        self.inner.report_error(message);
    }

    fn report_status(&self, message: &str) {
        self.inner.report_status(message);
    }
}
