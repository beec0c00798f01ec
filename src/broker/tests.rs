use std::collections::HashMap;
use std::time::Duration;

use super::client::{ConsumerOptions, ConsumerTransport, ProducerTransport};
use super::engine::{Broker, lock};
use super::group::{ConsumerGroup, Member};
use super::local::{LocalConsumer, LocalProducer};
use super::message::{ConsumerEvent, OutgoingRecord, TopicPartition};
use super::topic::{Topic, hash_key};
use crate::config::OffsetReset;
use crate::utils::BrokerError;

fn record(topic: &str, key: &str, payload: &str) -> OutgoingRecord {
    OutgoingRecord {
        topic: topic.to_string(),
        key: Some(key.to_string()),
        payload: payload.as_bytes().to_vec(),
        timestamp: 0,
        producer_id: None,
        sequence: None,
    }
}

fn options(offset_reset: OffsetReset) -> ConsumerOptions {
    ConsumerOptions {
        offset_reset,
        auto_commit_interval: Duration::from_secs(60),
    }
}

fn topics(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_topic_keyed_routing_is_stable() {
    let mut topic = Topic::new("chat-general", 3);
    let first = topic.partition_for(Some("alice"));
    for _ in 0..10 {
        assert_eq!(topic.partition_for(Some("alice")), first);
    }
    assert_eq!(first, hash_key("alice") % 3);
}

#[test]
fn test_topic_keyless_round_robin() {
    let mut topic = Topic::new("t", 2);
    assert_eq!(topic.partition_for(None), 0);
    assert_eq!(topic.partition_for(None), 1);
    assert_eq!(topic.partition_for(None), 0);
}

#[test]
fn test_topic_has_at_least_one_partition() {
    let mut topic = Topic::new("t", 0);
    assert_eq!(topic.partitions, 1);
    assert_eq!(topic.partition_for(Some("anyone")), 0);
}

#[test]
fn test_range_assignment_splits_partitions() {
    let mut group = ConsumerGroup::new("g");
    for id in ["a", "b"] {
        group.members.insert(
            id.to_string(),
            Member::new(id.to_string(), topics(&["t"]), OffsetReset::Latest),
        );
    }
    let counts = HashMap::from([("t".to_string(), 3)]);

    let target = group.compute_assignment(&counts);
    let a: Vec<u32> = target["a"].iter().map(|tp| tp.partition).collect();
    let b: Vec<u32> = target["b"].iter().map(|tp| tp.partition).collect();
    assert_eq!(a, vec![0, 1]);
    assert_eq!(b, vec![2]);
}

#[test]
fn test_broker_new() {
    let broker = Broker::in_memory(3).unwrap();
    assert!(broker.topics.is_empty());
    assert!(broker.groups.is_empty());
}

#[test]
fn test_produce_auto_creates_topic_and_assigns_offsets() {
    let mut broker = Broker::in_memory(2).unwrap();

    let first = broker.produce(record("chat-general", "alice", "hi")).unwrap();
    let second = broker.produce(record("chat-general", "alice", "again")).unwrap();

    assert_eq!(broker.topics["chat-general"].partitions, 2);
    assert_eq!(first.partition, second.partition);
    assert_eq!(first.offset, 0);
    assert_eq!(second.offset, 1);
}

#[test]
fn test_produce_rejects_empty_topic() {
    let mut broker = Broker::in_memory(1).unwrap();
    let err = broker.produce(record("", "alice", "hi")).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRecord(_)));
}

#[test]
fn test_retried_sequence_is_appended_once() {
    let mut broker = Broker::in_memory(1).unwrap();
    let mut rec = record("t", "alice", "once");
    rec.producer_id = Some("producer-1".to_string());
    rec.sequence = Some(7);

    let first = broker.produce(rec.clone()).unwrap();
    let retry = broker.produce(rec).unwrap();
    assert_eq!(first, retry);

    let tp = TopicPartition::new("t", 0);
    assert_eq!(broker.end_offset(&tp).unwrap(), 1);
}

#[test]
fn test_join_emits_assignment_then_records() {
    let mut broker = Broker::in_memory(1).unwrap();
    let member = broker
        .join_group("g", &topics(&["t"]), OffsetReset::Latest)
        .unwrap();

    match broker.fetch(&member).unwrap() {
        Some(ConsumerEvent::Assigned { partitions }) => {
            assert_eq!(partitions, vec![TopicPartition::new("t", 0)]);
        }
        other => panic!("expected assignment, got {other:?}"),
    }
    assert!(broker.fetch(&member).unwrap().is_none());

    broker.produce(record("t", "alice", "hello")).unwrap();
    match broker.fetch(&member).unwrap() {
        Some(ConsumerEvent::Record(r)) => {
            assert_eq!(r.payload, b"hello");
            assert_eq!(r.offset, 0);
            assert_eq!(r.key.as_deref(), Some("alice"));
        }
        other => panic!("expected record, got {other:?}"),
    }
}

#[test]
fn test_latest_reset_skips_existing_records() {
    let mut broker = Broker::in_memory(1).unwrap();
    broker.produce(record("t", "alice", "before")).unwrap();

    let latest = broker
        .join_group("late", &topics(&["t"]), OffsetReset::Latest)
        .unwrap();
    let earliest = broker
        .join_group("replay", &topics(&["t"]), OffsetReset::Earliest)
        .unwrap();
    broker.fetch(&latest).unwrap();
    broker.fetch(&earliest).unwrap();

    assert!(broker.fetch(&latest).unwrap().is_none());
    assert!(matches!(
        broker.fetch(&earliest).unwrap(),
        Some(ConsumerEvent::Record(_))
    ));
}

#[test]
fn test_second_member_triggers_revoke_and_assign() {
    let mut broker = Broker::in_memory(2).unwrap();
    let a = broker
        .join_group("g", &topics(&["t"]), OffsetReset::Earliest)
        .unwrap();
    assert!(matches!(
        broker.fetch(&a).unwrap(),
        Some(ConsumerEvent::Assigned { .. })
    ));

    let b = broker
        .join_group("g", &topics(&["t"]), OffsetReset::Earliest)
        .unwrap();

    assert!(matches!(
        broker.fetch(&a).unwrap(),
        Some(ConsumerEvent::Revoked { .. })
    ));
    assert!(matches!(
        broker.fetch(&b).unwrap(),
        Some(ConsumerEvent::Assigned { .. })
    ));
    assert_eq!(broker.assignment(&a).unwrap().len(), 1);
    assert_eq!(broker.assignment(&b).unwrap().len(), 1);
}

#[test]
fn test_committed_offset_survives_rejoin() {
    let mut broker = Broker::in_memory(1).unwrap();
    let member = broker
        .join_group("g", &topics(&["t"]), OffsetReset::Earliest)
        .unwrap();
    broker.fetch(&member).unwrap();

    broker.produce(record("t", "alice", "one")).unwrap();
    broker.produce(record("t", "alice", "two")).unwrap();
    broker.fetch(&member).unwrap();
    broker.leave_group(&member).unwrap();

    let rejoined = broker
        .join_group("g", &topics(&["t"]), OffsetReset::Earliest)
        .unwrap();
    broker.fetch(&rejoined).unwrap();
    match broker.fetch(&rejoined).unwrap() {
        Some(ConsumerEvent::Record(r)) => assert_eq!(r.payload, b"two"),
        other => panic!("expected second record, got {other:?}"),
    }
}

#[test]
fn test_unknown_member_is_reported() {
    let mut broker = Broker::in_memory(1).unwrap();
    let err = broker.fetch("ghost").unwrap_err();
    assert_eq!(err, BrokerError::UnknownMember("ghost".to_string()));
}

#[tokio::test]
async fn test_local_consumer_wakes_on_produce() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let mut consumer = LocalConsumer::new(broker.clone(), "g", options(OffsetReset::Latest));
    consumer.subscribe(&topics(&["t"])).await.unwrap();
    let assigned = consumer.poll(Duration::from_millis(50)).await.unwrap();
    assert!(matches!(assigned, Some(ConsumerEvent::Assigned { .. })));

    let producer = LocalProducer::new(broker.clone());
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        producer.produce(record("t", "bob", "ping")).await.unwrap();
    });

    let event = consumer.poll(Duration::from_secs(2)).await.unwrap();
    handle.await.unwrap();
    match event {
        Some(ConsumerEvent::Record(r)) => assert_eq!(r.payload, b"ping"),
        other => panic!("expected record, got {other:?}"),
    }
}

#[tokio::test]
async fn test_local_consumer_poll_times_out_empty() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let mut consumer = LocalConsumer::new(broker, "g", options(OffsetReset::Latest));
    consumer.subscribe(&topics(&["t"])).await.unwrap();
    consumer.poll(Duration::from_millis(10)).await.unwrap();

    let started = std::time::Instant::now();
    let event = consumer.poll(Duration::from_millis(100)).await.unwrap();
    assert!(event.is_none());
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[tokio::test]
async fn test_local_consumer_poll_before_subscribe_fails() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let mut consumer = LocalConsumer::new(broker, "g", options(OffsetReset::Latest));
    assert!(consumer.poll(Duration::from_millis(10)).await.is_err());
}

#[tokio::test]
async fn test_local_consumer_close_is_idempotent_and_leaves_group() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let mut consumer = LocalConsumer::new(broker.clone(), "g", options(OffsetReset::Latest));
    consumer.subscribe(&topics(&["t"])).await.unwrap();
    assert!(lock(&broker).groups.contains_key("g"));

    consumer.close().await.unwrap();
    consumer.close().await.unwrap();
    assert!(!lock(&broker).groups.contains_key("g"));
}

#[tokio::test]
async fn test_dropped_consumer_leaves_group() {
    let broker = Broker::in_memory(1).unwrap().shared();
    {
        let mut consumer =
            LocalConsumer::new(broker.clone(), "g", options(OffsetReset::Latest));
        consumer.subscribe(&topics(&["t"])).await.unwrap();
    }
    assert!(!lock(&broker).groups.contains_key("g"));
}

#[tokio::test]
async fn test_closed_producer_rejects_records() {
    let broker = Broker::in_memory(1).unwrap().shared();
    let producer = LocalProducer::new(broker);
    producer.close().await.unwrap();
    let err = producer.produce(record("t", "a", "x")).await.unwrap_err();
    assert_eq!(err, BrokerError::Closed);
}
