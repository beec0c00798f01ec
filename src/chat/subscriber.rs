//! Subscriber
//!
//! Owns one broker consumer and runs its poll loop on a dedicated tokio task.
//!
//! Lifecycle: `Created -> Subscribed -> Running -> Stopping -> Closed`.
//! - `subscribe` joins the consumer group, `start` spawns the loop and returns.
//! - The loop checks the cancellation flag once per iteration; each poll waits
//!   at most `poll_timeout_ms`, so a stop request is seen within one interval.
//! - `stop` waits up to `stop_grace_ms` for the loop to hand the consumer back,
//!   then commits and closes it. Overrunning the grace period aborts the task
//!   and is reported to the sink.
//!
//! Offsets are committed by the consumer on its own cadence, so delivery is
//! at-least-once and a restarted subscriber may see a message twice.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{ConsumerEvent, ConsumerTransport, Record, TopicPartition};
use crate::chat::envelope::Envelope;
use crate::chat::sink::DispatchSink;
use crate::config::ConsumerSettings;
use crate::utils::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Created,
    Subscribed,
    Running,
    Stopping,
    Closed,
}

impl SubscriberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberState::Created => "created",
            SubscriberState::Subscribed => "subscribed",
            SubscriberState::Running => "running",
            SubscriberState::Stopping => "stopping",
            SubscriberState::Closed => "closed",
        }
    }
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a `stop` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The loop exited within the grace period and the consumer was closed.
    Stopped,
    /// The loop overran the grace period and was aborted.
    TimedOut,
    AlreadyClosed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub received: u64,
    pub delivered: u64,
    pub parse_failures: u64,
    pub consume_errors: u64,
    pub assignment: Vec<TopicPartition>,
    /// Next offset to be read, per partition.
    pub positions: Vec<(TopicPartition, u64)>,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    parse_failures: AtomicU64,
    consume_errors: AtomicU64,
    assignment: Mutex<BTreeSet<TopicPartition>>,
    positions: Mutex<BTreeMap<TopicPartition, u64>>,
}

impl Counters {
    fn assign(&self, partitions: &[TopicPartition]) {
        let mut assignment = self.assignment.lock().unwrap_or_else(|e| e.into_inner());
        assignment.extend(partitions.iter().cloned());
    }

    fn revoke(&self, partitions: &[TopicPartition]) {
        let mut assignment = self.assignment.lock().unwrap_or_else(|e| e.into_inner());
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        for tp in partitions {
            assignment.remove(tp);
            positions.remove(tp);
        }
    }

    fn advance(&self, record: &Record) {
        let tp = TopicPartition::new(&record.topic, record.partition);
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        positions.insert(tp, record.offset + 1);
    }
}

type StateCell = Arc<Mutex<SubscriberState>>;

fn set_state(cell: &StateCell, state: SubscriberState) {
    *cell.lock().unwrap_or_else(|e| e.into_inner()) = state;
}

pub struct Subscriber {
    consumer: Option<Box<dyn ConsumerTransport>>,
    sink: Arc<dyn DispatchSink>,
    poll_timeout: Duration,
    stop_grace: Duration,
    state: StateCell,
    cancel: Arc<AtomicBool>,
    task: Option<JoinHandle<Box<dyn ConsumerTransport>>>,
    topics: Vec<String>,
    counters: Arc<Counters>,
}

impl Subscriber {
    pub fn new(
        consumer: Box<dyn ConsumerTransport>,
        sink: Arc<dyn DispatchSink>,
        settings: &ConsumerSettings,
    ) -> Self {
        Self {
            consumer: Some(consumer),
            sink,
            poll_timeout: Duration::from_millis(settings.poll_timeout_ms),
            stop_grace: Duration::from_millis(settings.stop_grace_ms),
            state: Arc::new(Mutex::new(SubscriberState::Created)),
            cancel: Arc::new(AtomicBool::new(false)),
            task: None,
            topics: Vec::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Join the consumer group for `topics`. Only valid once, before `start`.
    pub async fn subscribe(&mut self, topics: &[String]) -> Result<(), ChatError> {
        self.expect_state(SubscriberState::Created)?;
        validate_topics(topics)?;

        let consumer = self.consumer.as_mut().ok_or(ChatError::NotConnected)?;
        consumer.subscribe(topics).await?;
        self.topics = topics.to_vec();
        set_state(&self.state, SubscriberState::Subscribed);
        info!(topics = ?self.topics, "Subscribed");
        Ok(())
    }

    /// Spawn the consume loop. Returns as soon as the task is running.
    pub fn start(&mut self) -> Result<(), ChatError> {
        self.expect_state(SubscriberState::Subscribed)?;
        let consumer = self.consumer.take().ok_or(ChatError::NotConnected)?;
        self.spawn(consumer);
        set_state(&self.state, SubscriberState::Running);
        Ok(())
    }

    /// Switch the subscription, pausing the loop around the change if it runs.
    pub async fn resubscribe(&mut self, topics: &[String]) -> Result<(), ChatError> {
        validate_topics(topics)?;
        let state = self.state();
        match state {
            SubscriberState::Subscribed => {
                let consumer = self.consumer.as_mut().ok_or(ChatError::NotConnected)?;
                consumer.subscribe(topics).await?;
            }
            SubscriberState::Running => {
                if self.halt().await == StopOutcome::TimedOut {
                    set_state(&self.state, SubscriberState::Closed);
                    return Err(ChatError::Timeout(self.stop_grace.as_millis() as u64));
                }
                let mut consumer = self.consumer.take().ok_or(ChatError::NotConnected)?;
                if let Err(e) = consumer.subscribe(topics).await {
                    // Keep the consumer so `stop` can still close it.
                    self.consumer = Some(consumer);
                    set_state(&self.state, SubscriberState::Subscribed);
                    return Err(e.into());
                }
                self.spawn(consumer);
                set_state(&self.state, SubscriberState::Running);
            }
            other => {
                return Err(ChatError::InvalidState {
                    expected: "subscribed or running",
                    found: other.as_str(),
                });
            }
        }

        self.topics = topics.to_vec();
        info!(topics = ?self.topics, "Resubscribed");
        Ok(())
    }

    /// Stop the loop and close the consumer. Safe to call more than once.
    pub async fn stop(&mut self) -> Result<StopOutcome, ChatError> {
        if self.state() == SubscriberState::Closed {
            return Ok(StopOutcome::AlreadyClosed);
        }
        set_state(&self.state, SubscriberState::Stopping);

        let outcome = self.halt().await;
        let closed = match self.consumer.take() {
            Some(mut consumer) => consumer.close().await,
            None => Ok(()),
        };
        set_state(&self.state, SubscriberState::Closed);
        info!(outcome = ?outcome, "Subscriber stopped");

        closed?;
        Ok(outcome)
    }

    pub fn stats(&self) -> SubscriberStats {
        let c = &self.counters;
        SubscriberStats {
            received: c.received.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            parse_failures: c.parse_failures.load(Ordering::Relaxed),
            consume_errors: c.consume_errors.load(Ordering::Relaxed),
            assignment: c
                .assignment
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect(),
            positions: c
                .positions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(tp, offset)| (tp.clone(), *offset))
                .collect(),
        }
    }

    fn expect_state(&self, expected: SubscriberState) -> Result<(), ChatError> {
        let found = self.state();
        if found != expected {
            return Err(ChatError::InvalidState {
                expected: expected.as_str(),
                found: found.as_str(),
            });
        }
        Ok(())
    }

    fn spawn(&mut self, consumer: Box<dyn ConsumerTransport>) {
        self.cancel.store(false, Ordering::SeqCst);
        self.task = Some(tokio::spawn(consume_loop(
            consumer,
            self.sink.clone(),
            self.poll_timeout,
            self.cancel.clone(),
            self.state.clone(),
            self.counters.clone(),
        )));
    }

    /// Cancel the loop and take the consumer back from it.
    async fn halt(&mut self) -> StopOutcome {
        self.cancel.store(true, Ordering::SeqCst);
        let Some(mut task) = self.task.take() else {
            return StopOutcome::Stopped;
        };

        match tokio::time::timeout(self.stop_grace, &mut task).await {
            Ok(Ok(consumer)) => {
                self.consumer = Some(consumer);
                StopOutcome::Stopped
            }
            Ok(Err(e)) => {
                error!(error = %e, "Consume task failed");
                self.sink
                    .report_error(&format!("Consumer task ended abnormally: {e}"));
                StopOutcome::Stopped
            }
            Err(_) => {
                task.abort();
                let grace = self.stop_grace.as_millis();
                warn!(grace_ms = grace as u64, "Consume loop overran the stop grace period");
                self.sink.report_error(&format!(
                    "Consumer did not stop within {grace} ms; abandoned it"
                ));
                StopOutcome::TimedOut
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if self.task.is_some() {
            warn!("Subscriber dropped while running; loop will exit on its next iteration");
        }
    }
}

fn validate_topics(topics: &[String]) -> Result<(), ChatError> {
    if topics.is_empty() || topics.iter().any(|t| t.trim().is_empty()) {
        return Err(ChatError::InvalidArgument(
            "at least one non-empty topic is required".to_string(),
        ));
    }
    Ok(())
}

async fn consume_loop(
    mut consumer: Box<dyn ConsumerTransport>,
    sink: Arc<dyn DispatchSink>,
    poll_timeout: Duration,
    cancel: Arc<AtomicBool>,
    state: StateCell,
    counters: Arc<Counters>,
) -> Box<dyn ConsumerTransport> {
    debug!("Consume loop started");

    while !cancel.load(Ordering::SeqCst) {
        match consumer.poll(poll_timeout).await {
            Ok(None) => {}
            Ok(Some(ConsumerEvent::Record(record))) => {
                handle_record(&record, sink.as_ref(), &counters);
            }
            Ok(Some(ConsumerEvent::Assigned { partitions })) => {
                counters.assign(&partitions);
                sink.report_status(&format!("Partitions assigned: {}", list(&partitions)));
            }
            Ok(Some(ConsumerEvent::Revoked { partitions })) => {
                counters.revoke(&partitions);
                sink.report_status(&format!("Partitions revoked: {}", list(&partitions)));
            }
            Err(e) => {
                counters.consume_errors.fetch_add(1, Ordering::Relaxed);
                if e.is_fatal() {
                    error!(error = %e, "Consume loop failed");
                    sink.report_error(&format!("Consumer stopped: {e}"));
                    set_state(&state, SubscriberState::Stopping);
                    break;
                }
                warn!(error = %e, "Consume error");
                sink.report_error(&format!("Consume error: {e}"));
                tokio::time::sleep(poll_timeout).await;
            }
        }
    }

    debug!("Consume loop exited");
    consumer
}

fn handle_record(record: &Record, sink: &dyn DispatchSink, counters: &Counters) {
    counters.received.fetch_add(1, Ordering::Relaxed);
    counters.advance(record);

    match Envelope::from_bytes(&record.payload) {
        Ok(envelope) => {
            if catch_unwind(AssertUnwindSafe(|| sink.deliver(envelope))).is_err() {
                error!(topic = %record.topic, offset = record.offset, "Sink panicked on delivery");
                sink.report_error("Message handler failed; message skipped");
            } else {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(e) => {
            counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Skipping unreadable message"
            );
            sink.report_error(&format!(
                "Skipped unreadable message at {} [{}] offset {}: {e}",
                record.topic, record.partition, record.offset
            ));
        }
    }
}

fn list(partitions: &[TopicPartition]) -> String {
    if partitions.is_empty() {
        return "none".to_string();
    }
    partitions
        .iter()
        .map(|tp| tp.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
