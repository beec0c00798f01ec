use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};

use super::envelope::{DEFAULT_ROOM, Envelope, Kind, ParseError, SYSTEM_AUTHOR};
use super::sink::{ChannelSink, DedupFilter, DispatchSink, EchoFilter, SinkEvent};

/// Records every call for inspection.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub delivered: Mutex<Vec<Envelope>>,
    pub errors: Mutex<Vec<String>>,
    pub statuses: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<Envelope> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.delivered().into_iter().map(|e| e.body).collect()
    }
}

impl DispatchSink for RecordingSink {
    fn deliver(&self, envelope: Envelope) {
        self.delivered.lock().unwrap().push(envelope);
    }

    fn report_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn report_status(&self, message: &str) {
        self.statuses.lock().unwrap().push(message.to_string());
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[test]
fn test_envelope_round_trip_preserves_fields() {
    let mut original = Envelope::user("alice", "hello, world", "general");
    original.created_at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();

    let decoded = Envelope::from_bytes(&original.to_bytes()).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_envelope_wire_uses_camel_case_names() {
    let envelope = Envelope::user("alice", "hi", "general");
    let value: serde_json::Value = serde_json::from_slice(&envelope.to_bytes()).unwrap();

    assert_eq!(value["author"], "alice");
    assert_eq!(value["body"], "hi");
    assert_eq!(value["kind"], "user");
    assert!(value.get("createdAt").is_some());
}

#[test]
fn test_system_constructor() {
    let notice = Envelope::system("bob has joined", "rust");
    assert_eq!(notice.author, SYSTEM_AUTHOR);
    assert_eq!(notice.kind, Kind::System);
    assert_eq!(notice.room, "rust");
    assert!(notice.is_system());
    assert!(!Envelope::user("bob", "hi", "rust").is_system());
}

#[test]
fn test_envelopes_get_distinct_ids() {
    let a = Envelope::user("alice", "same", "general");
    let b = Envelope::user("alice", "same", "general");
    assert_ne!(a.id, b.id);
}

#[test]
fn test_decode_fills_defaults_and_ignores_unknown_fields() {
    let envelope = Envelope::from_bytes(br#"{"author":"carol","extra":42}"#).unwrap();
    assert_eq!(envelope.author, "carol");
    assert_eq!(envelope.body, "");
    assert_eq!(envelope.room, DEFAULT_ROOM);
    assert_eq!(envelope.kind, Kind::User);
    assert!(!envelope.id.is_empty());
}

#[test]
fn test_decode_accepts_legacy_field_names() {
    let payload = br#"{
        "username": "dave",
        "message": "old client",
        "room": "lobby",
        "messageType": "text",
        "timestamp": "2024-12-31T23:59:59Z"
    }"#;
    let envelope = Envelope::from_bytes(payload).unwrap();
    assert_eq!(envelope.author, "dave");
    assert_eq!(envelope.body, "old client");
    assert_eq!(envelope.kind, Kind::User);
    assert_eq!(
        envelope.created_at,
        Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap()
    );
}

#[test]
fn test_decode_treats_unknown_kinds_as_messages() {
    let envelope =
        Envelope::from_bytes(br#"{"author":"alice","body":":+1:","kind":"reaction"}"#).unwrap();
    assert_eq!(envelope.kind, Kind::User);
    assert_eq!(envelope.body, ":+1:");

    let envelope = Envelope::from_bytes(br#"{"author":"SYSTEM","messageType":"System"}"#).unwrap();
    assert!(envelope.is_system());
}

#[test]
fn test_decode_prefers_current_names_when_both_are_sent() {
    let payload = br#"{
        "author": "alice",
        "username": "alice-old",
        "body": "new body",
        "message": "old body",
        "kind": "system",
        "messageType": "text"
    }"#;
    let envelope = Envelope::from_bytes(payload).unwrap();
    assert_eq!(envelope.author, "alice");
    assert_eq!(envelope.body, "new body");
    assert_eq!(envelope.kind, Kind::System);
}

#[test]
fn test_decode_truncated_payload_is_malformed() {
    let bytes = Envelope::user("alice", "hi", "general").to_bytes();
    let err = Envelope::from_bytes(&bytes[..bytes.len() / 2]).unwrap_err();
    assert!(matches!(err, ParseError::Malformed(_)));

    let err = Envelope::from_bytes(b"not json at all").unwrap_err();
    assert!(matches!(err, ParseError::Malformed(_)));
}

#[test]
fn test_decode_schema_violations() {
    let err = Envelope::from_bytes(br#"{"body":"no author"}"#).unwrap_err();
    assert!(matches!(err, ParseError::Schema(_)));

    let err = Envelope::from_bytes(br#"{"author":"alice","room":7}"#).unwrap_err();
    assert!(matches!(err, ParseError::Schema(_)));

    let err = Envelope::from_bytes(br#"[1,2,3]"#).unwrap_err();
    assert!(matches!(err, ParseError::Schema(_)));
}

#[test]
fn test_decode_rejects_blank_author() {
    let err = Envelope::from_bytes(br#"{"author":"   ","body":"x"}"#).unwrap_err();
    assert_eq!(err, ParseError::MissingAuthor);
}

#[test]
fn test_echo_filter_drops_own_messages_only() {
    let recorder = Arc::new(RecordingSink::default());
    let filter = EchoFilter::new("alice", recorder.clone());

    filter.deliver(Envelope::user("alice", "mine", "general"));
    filter.deliver(Envelope::user("bob", "theirs", "general"));
    filter.deliver(Envelope::system("alice has joined", "general"));
    filter.report_error("boom");

    assert_eq!(recorder.bodies(), vec!["theirs", "alice has joined"]);
    assert_eq!(recorder.errors(), vec!["boom"]);
}

#[test]
fn test_dedup_filter_drops_repeated_ids() {
    let recorder = Arc::new(RecordingSink::default());
    let filter = DedupFilter::new(8, recorder.clone());

    let envelope = Envelope::user("bob", "once", "general");
    filter.deliver(envelope.clone());
    filter.deliver(envelope);
    filter.deliver(Envelope::user("bob", "twice", "general"));

    assert_eq!(recorder.bodies(), vec!["once", "twice"]);
}

#[test]
fn test_dedup_filter_forgets_beyond_capacity() {
    let recorder = Arc::new(RecordingSink::default());
    let filter = DedupFilter::new(2, recorder.clone());

    let first = Envelope::user("bob", "1", "general");
    filter.deliver(first.clone());
    filter.deliver(Envelope::user("bob", "2", "general"));
    filter.deliver(Envelope::user("bob", "3", "general"));
    // "1" has been evicted, so it is delivered again.
    filter.deliver(first);

    assert_eq!(recorder.bodies(), vec!["1", "2", "3", "1"]);
}

#[tokio::test]
async fn test_channel_sink_forwards_events() {
    let (sink, mut rx) = ChannelSink::new();
    let envelope = Envelope::user("bob", "hi", "general");

    sink.deliver(envelope.clone());
    sink.report_error("bad");
    sink.report_status("ok");

    assert_eq!(rx.recv().await, Some(SinkEvent::Delivered(envelope)));
    assert_eq!(rx.recv().await, Some(SinkEvent::Error("bad".to_string())));
    assert_eq!(rx.recv().await, Some(SinkEvent::Status("ok".to_string())));
}

#[test]
fn test_channel_sink_tolerates_dropped_receiver() {
    let (sink, rx) = ChannelSink::new();
    drop(rx);
    sink.deliver(Envelope::user("bob", "nobody listening", "general"));
}
