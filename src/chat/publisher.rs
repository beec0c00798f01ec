//! Publisher
//!
//! Sends envelopes to the room topics. Each send is one logical delivery:
//! - the author's username is the partition key, so one user's messages stay
//!   in order on one partition
//! - each attempt is bounded by `request_timeout_ms`; transient failures are
//!   retried up to `max_retries` times with a fixed `retry_backoff_ms`
//! - the whole delivery, retries included, is bounded by `delivery_timeout_ms`
//! - every attempt carries the same `(producer_id, sequence)`, so a retry of
//!   a write the broker already took is not appended twice
//!
//! `Publisher` is cheap to clone; clones share the producer and the
//! in-flight accounting that `flush` waits on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Delivery, OutgoingRecord, ProducerTransport};
use crate::chat::envelope::Envelope;
use crate::config::ProducerSettings;
use crate::utils::{BrokerError, ChatError};

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    producer: Box<dyn ProducerTransport>,
    producer_id: String,
    sequence: AtomicU64,
    topic_prefix: String,
    settings: ProducerSettings,
    in_flight: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    sent: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Snapshot of the publisher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub sent: u64,
    pub failed: u64,
    pub retries: u64,
    pub in_flight: usize,
}

/// Counts a send as in flight for as long as it lives.
struct InFlight {
    inner: Arc<PublisherInner>,
}

impl InFlight {
    fn enter(inner: &Arc<PublisherInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Topic a room's messages are published to.
pub fn topic_for_room(prefix: &str, room: &str) -> String {
    format!("{prefix}{room}")
}

impl Publisher {
    pub fn new(
        producer: Box<dyn ProducerTransport>,
        topic_prefix: &str,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                producer,
                producer_id: Uuid::new_v4().to_string(),
                sequence: AtomicU64::new(0),
                topic_prefix: topic_prefix.to_string(),
                settings,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
                sent: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
            }),
        }
    }

    /// Send and wait for the broker's acknowledgment.
    pub async fn send(&self, envelope: &Envelope) -> Result<Delivery, ChatError> {
        let record = self.prepare(envelope)?;
        let _in_flight = InFlight::enter(&self.inner);
        deliver(&self.inner, record).await
    }

    /// Start a send in the background. `flush` waits for it.
    pub fn enqueue(
        &self,
        envelope: &Envelope,
    ) -> Result<JoinHandle<Result<Delivery, ChatError>>, ChatError> {
        let record = self.prepare(envelope)?;
        let in_flight = InFlight::enter(&self.inner);
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let _in_flight = in_flight;
            deliver(&inner, record).await
        }))
    }

    /// Wait until every in-flight send has been acknowledged or has failed.
    pub async fn flush(&self, limit: Duration) -> Result<(), ChatError> {
        let deadline = Instant::now() + limit;
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            if timeout_at(deadline, idle).await.is_err() {
                let pending = self.inner.in_flight.load(Ordering::SeqCst);
                warn!(pending, "Flush timed out with sends still in flight");
                return Err(ChatError::Timeout(limit.as_millis() as u64));
            }
        }
    }

    /// Flush with the configured budget, then release the producer.
    ///
    /// Further sends are rejected. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), ChatError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let flushed = self
            .flush(Duration::from_millis(self.inner.settings.flush_timeout_ms))
            .await;
        self.inner.producer.close().await?;
        debug!(producer_id = %self.inner.producer_id, "Producer closed");
        flushed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn topic_for(&self, room: &str) -> String {
        topic_for_room(&self.inner.topic_prefix, room)
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Validate the envelope and build the record every attempt will reuse.
    fn prepare(&self, envelope: &Envelope) -> Result<OutgoingRecord, ChatError> {
        if self.is_closed() {
            return Err(ChatError::NotConnected);
        }
        if envelope.author.trim().is_empty() {
            return Err(ChatError::InvalidArgument(
                "envelope author must not be empty".to_string(),
            ));
        }
        if envelope.room.trim().is_empty() {
            return Err(ChatError::InvalidArgument(
                "envelope room must not be empty".to_string(),
            ));
        }

        Ok(OutgoingRecord {
            topic: self.topic_for(&envelope.room),
            key: Some(envelope.author.clone()),
            payload: envelope.to_bytes(),
            timestamp: envelope.created_at.timestamp_millis(),
            producer_id: Some(self.inner.producer_id.clone()),
            sequence: Some(self.inner.sequence.fetch_add(1, Ordering::SeqCst)),
        })
    }
}

async fn deliver(inner: &PublisherInner, record: OutgoingRecord) -> Result<Delivery, ChatError> {
    let budget = inner.settings.delivery_timeout_ms;
    let result = match timeout(Duration::from_millis(budget), send_with_retries(inner, record)).await
    {
        Ok(result) => result,
        Err(_) => Err(ChatError::Timeout(budget)),
    };

    match &result {
        Ok(delivery) => {
            inner.sent.fetch_add(1, Ordering::Relaxed);
            debug!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                "Message delivered"
            );
        }
        Err(e) => {
            inner.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Message delivery failed");
        }
    }
    result
}

async fn send_with_retries(
    inner: &PublisherInner,
    record: OutgoingRecord,
) -> Result<Delivery, ChatError> {
    let request_timeout = Duration::from_millis(inner.settings.request_timeout_ms);
    let backoff = Duration::from_millis(inner.settings.retry_backoff_ms);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let outcome = match timeout(request_timeout, inner.producer.produce(record.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BrokerError::Timeout(inner.settings.request_timeout_ms)),
        };

        match outcome {
            Ok(delivery) => return Ok(delivery),
            Err(e) if e.is_retriable() && attempts <= inner.settings.max_retries => {
                inner.retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %record.topic,
                    attempt = attempts,
                    error = %e,
                    "Produce failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                return Err(ChatError::SendFailed {
                    attempts,
                    source: e,
                });
            }
        }
    }
}
