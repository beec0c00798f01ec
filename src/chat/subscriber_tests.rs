use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::envelope::Envelope;
use super::sink::DispatchSink;
use super::subscriber::{StopOutcome, Subscriber, SubscriberState};
use super::tests::{RecordingSink, wait_until};
use crate::broker::engine::lock;
use crate::broker::{
    Broker, BrokerConnector, ConsumerEvent, ConsumerOptions, ConsumerTransport, LocalConnector,
    OutgoingRecord, SharedBroker, TopicPartition,
};
use crate::config::{ConsumerSettings, OffsetReset};
use crate::utils::{BrokerError, ChatError};

fn settings() -> ConsumerSettings {
    ConsumerSettings {
        group_prefix: "test-".to_string(),
        poll_timeout_ms: 20,
        stop_grace_ms: 500,
        auto_commit_interval_ms: 50,
        offset_reset: OffsetReset::Latest,
    }
}

fn produce(broker: &SharedBroker, topic: &str, payload: Vec<u8>) {
    lock(broker)
        .produce(OutgoingRecord {
            topic: topic.to_string(),
            key: Some("bob".to_string()),
            payload,
            timestamp: 0,
            producer_id: None,
            sequence: None,
        })
        .unwrap();
}

async fn running_subscriber(
    broker: &SharedBroker,
    group: &str,
    topic: &str,
) -> (Subscriber, Arc<RecordingSink>) {
    let connector = LocalConnector::new(broker.clone());
    let consumer = connector
        .consumer(group, ConsumerOptions::from(&settings()))
        .await
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    let mut subscriber = Subscriber::new(consumer, sink.clone(), &settings());
    subscriber.subscribe(&[topic.to_string()]).await.unwrap();
    subscriber.start().unwrap();
    (subscriber, sink)
}

#[tokio::test]
async fn test_lifecycle_states() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let connector = LocalConnector::new(broker.clone());
    let consumer = connector
        .consumer("g", ConsumerOptions::from(&settings()))
        .await
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    let mut subscriber = Subscriber::new(consumer, sink, &settings());

    assert_eq!(subscriber.state(), SubscriberState::Created);
    subscriber.subscribe(&["chat-general".to_string()]).await.unwrap();
    assert_eq!(subscriber.state(), SubscriberState::Subscribed);
    subscriber.start().unwrap();
    assert_eq!(subscriber.state(), SubscriberState::Running);
    assert_eq!(subscriber.stop().await.unwrap(), StopOutcome::Stopped);
    assert_eq!(subscriber.state(), SubscriberState::Closed);
}

#[tokio::test]
async fn test_start_before_subscribe_is_rejected() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let connector = LocalConnector::new(broker);
    let consumer = connector
        .consumer("g", ConsumerOptions::from(&settings()))
        .await
        .unwrap();
    let mut subscriber = Subscriber::new(consumer, Arc::new(RecordingSink::default()), &settings());

    let err = subscriber.start().unwrap_err();
    assert!(matches!(
        err,
        ChatError::InvalidState {
            expected: "subscribed",
            found: "created"
        }
    ));
}

#[tokio::test]
async fn test_subscribe_requires_topics() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let connector = LocalConnector::new(broker);
    let consumer = connector
        .consumer("g", ConsumerOptions::from(&settings()))
        .await
        .unwrap();
    let mut subscriber = Subscriber::new(consumer, Arc::new(RecordingSink::default()), &settings());

    let err = subscriber.subscribe(&[]).await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidArgument(_)));
    assert_eq!(subscriber.state(), SubscriberState::Created);
}

#[tokio::test]
async fn test_delivers_records_in_order() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let (mut subscriber, sink) = running_subscriber(&broker, "g", "chat-general").await;

    for body in ["one", "two", "three"] {
        produce(
            &broker,
            "chat-general",
            Envelope::user("bob", body, "general").to_bytes(),
        );
    }

    wait_until(|| sink.delivered().len() == 3).await;
    assert_eq!(sink.bodies(), vec!["one", "two", "three"]);

    let stats = subscriber.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.delivered, 3);
    assert_eq!(
        stats.positions,
        vec![(TopicPartition::new("chat-general", 0), 3)]
    );
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_assignment_is_reported_as_status() {
    let broker = Broker::in_memory(2).unwrap().shared();
    let (mut subscriber, sink) = running_subscriber(&broker, "g", "chat-general").await;

    wait_until(|| !sink.statuses().is_empty()).await;
    assert!(sink.statuses()[0].starts_with("Partitions assigned: chat-general [0]"));
    assert_eq!(subscriber.stats().assignment.len(), 2);
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_record_is_reported_and_skipped() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let (mut subscriber, sink) = running_subscriber(&broker, "g", "chat-general").await;

    produce(&broker, "chat-general", b"{\"author\":".to_vec());
    produce(
        &broker,
        "chat-general",
        Envelope::user("bob", "after", "general").to_bytes(),
    );

    wait_until(|| sink.delivered().len() == 1).await;
    assert_eq!(sink.bodies(), vec!["after"]);
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("offset 0"));
    assert_eq!(subscriber.stats().parse_failures, 1);
    subscriber.stop().await.unwrap();
}

struct PanickingSink {
    inner: Arc<RecordingSink>,
}

impl DispatchSink for PanickingSink {
    fn deliver(&self, envelope: Envelope) {
        if envelope.body == "explode" {
            panic!("display failed");
        }
        self.inner.deliver(envelope);
    }

    fn report_error(&self, message: &str) {
        self.inner.report_error(message);
    }
}

#[tokio::test]
async fn test_panicking_sink_does_not_kill_the_loop() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let connector = LocalConnector::new(broker.clone());
    let consumer = connector
        .consumer("g", ConsumerOptions::from(&settings()))
        .await
        .unwrap();
    let recorder = Arc::new(RecordingSink::default());
    let sink = Arc::new(PanickingSink {
        inner: recorder.clone(),
    });
    let mut subscriber = Subscriber::new(consumer, sink, &settings());
    subscriber.subscribe(&["t".to_string()]).await.unwrap();
    subscriber.start().unwrap();

    produce(&broker, "t", Envelope::user("bob", "explode", "general").to_bytes());
    produce(&broker, "t", Envelope::user("bob", "fine", "general").to_bytes());

    wait_until(|| recorder.delivered().len() == 1).await;
    assert_eq!(recorder.bodies(), vec!["fine"]);
    assert_eq!(recorder.errors().len(), 1);
    assert_eq!(subscriber.state(), SubscriberState::Running);
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_prompt_and_idempotent() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let (mut subscriber, _sink) = running_subscriber(&broker, "g", "chat-general").await;

    let started = Instant::now();
    assert_eq!(subscriber.stop().await.unwrap(), StopOutcome::Stopped);
    // One poll interval plus the grace period at most.
    assert!(started.elapsed() < Duration::from_millis(520));

    assert_eq!(subscriber.stop().await.unwrap(), StopOutcome::AlreadyClosed);
    assert_eq!(subscriber.state(), SubscriberState::Closed);
}

#[tokio::test]
async fn test_stop_commits_and_leaves_group() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let (mut subscriber, sink) = running_subscriber(&broker, "g", "chat-general").await;

    produce(
        &broker,
        "chat-general",
        Envelope::user("bob", "seen", "general").to_bytes(),
    );
    wait_until(|| sink.delivered().len() == 1).await;
    subscriber.stop().await.unwrap();

    let guard = lock(&broker);
    assert!(!guard.groups.contains_key("g"));
    assert_eq!(
        guard
            .committed_offset("g", &TopicPartition::new("chat-general", 0))
            .unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn test_resubscribe_moves_to_new_topic() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let (mut subscriber, sink) = running_subscriber(&broker, "g", "chat-general").await;

    subscriber.resubscribe(&["chat-rust".to_string()]).await.unwrap();
    assert_eq!(subscriber.state(), SubscriberState::Running);
    assert_eq!(subscriber.topics(), ["chat-rust".to_string()]);

    produce(
        &broker,
        "chat-general",
        Envelope::user("bob", "old room", "general").to_bytes(),
    );
    produce(
        &broker,
        "chat-rust",
        Envelope::user("bob", "new room", "rust").to_bytes(),
    );

    wait_until(|| sink.delivered().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(sink.bodies(), vec!["new room"]);
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_resubscribe_after_close_is_rejected() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let (mut subscriber, _sink) = running_subscriber(&broker, "g", "chat-general").await;
    subscriber.stop().await.unwrap();

    let err = subscriber
        .resubscribe(&["chat-rust".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidState { found: "closed", .. }));
}

/// A consumer whose poll misbehaves in a configurable way.
struct FakeConsumer {
    polls: Arc<AtomicU32>,
    fail_with: Option<BrokerError>,
    hang: bool,
}

#[async_trait]
impl ConsumerTransport for FakeConsumer {
    async fn subscribe(&mut self, _topics: &[String]) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerEvent>, BrokerError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
        Ok(Vec::new())
    }

    async fn positions(&self) -> Result<Vec<(TopicPartition, u64)>, BrokerError> {
        Ok(Vec::new())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn fake_subscriber(
    fail_with: Option<BrokerError>,
    hang: bool,
    settings: &ConsumerSettings,
) -> (Subscriber, Arc<RecordingSink>, Arc<AtomicU32>) {
    let polls = Arc::new(AtomicU32::new(0));
    let consumer = FakeConsumer {
        polls: polls.clone(),
        fail_with,
        hang,
    };
    let sink = Arc::new(RecordingSink::default());
    (
        Subscriber::new(Box::new(consumer), sink.clone(), settings),
        sink,
        polls,
    )
}

#[tokio::test]
async fn test_transient_consume_errors_are_reported_and_loop_continues() {
    let (mut subscriber, sink, polls) = fake_subscriber(
        Some(BrokerError::Unavailable("broker restarting".to_string())),
        false,
        &settings(),
    );
    subscriber.subscribe(&["t".to_string()]).await.unwrap();
    subscriber.start().unwrap();

    wait_until(|| polls.load(Ordering::SeqCst) >= 3).await;
    assert_eq!(subscriber.state(), SubscriberState::Running);
    assert!(sink.errors().len() >= 2);
    assert!(subscriber.stats().consume_errors >= 2);
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_fatal_consume_error_moves_to_stopping() {
    let (mut subscriber, sink, polls) = fake_subscriber(Some(BrokerError::Closed), false, &settings());
    subscriber.subscribe(&["t".to_string()]).await.unwrap();
    subscriber.start().unwrap();

    wait_until(|| subscriber.state() == SubscriberState::Stopping).await;
    assert_eq!(polls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.errors(), vec!["Consumer stopped: client closed"]);

    assert_eq!(subscriber.stop().await.unwrap(), StopOutcome::Stopped);
    assert_eq!(subscriber.state(), SubscriberState::Closed);
}

#[tokio::test]
async fn test_stop_overrunning_grace_period_is_reported() {
    let mut short_grace = settings();
    short_grace.stop_grace_ms = 50;
    let (mut subscriber, sink, polls) = fake_subscriber(None, true, &short_grace);
    subscriber.subscribe(&["t".to_string()]).await.unwrap();
    subscriber.start().unwrap();
    wait_until(|| polls.load(Ordering::SeqCst) == 1).await;

    let started = Instant::now();
    assert_eq!(subscriber.stop().await.unwrap(), StopOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(subscriber.state(), SubscriberState::Closed);
    assert_eq!(sink.errors().len(), 1);

    assert_eq!(subscriber.stop().await.unwrap(), StopOutcome::AlreadyClosed);
}
