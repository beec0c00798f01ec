//! Partition log backed by `sled`
//!
//! Every topic-partition gets its own `sled` tree whose keys are big-endian
//! offsets, so iteration yields records in offset order. Three bookkeeping
//! trees sit next to them:
//! - `__topics`: topic name -> partition count
//! - `__watermarks`: next offset to assign per partition (survives trimming)
//! - `__offsets`: committed consumer-group offsets
//!
//! Retention policy, applied on append:
//! - `retention_secs`: records appended longer ago than this are removed from the head
//! - `max_records_per_partition`: oldest records are removed past this cap
//!
//! Offsets in a partition tree are contiguous from the head to the watermark,
//! so the record count is `end - first` and never needs a tree scan.
//!
//! Callers serialize writes (the broker keeps the store behind its lock).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::utils::BrokerError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: i64,
    /// Broker clock at append, in millis. Set by `LogStore::append`.
    #[serde(default)]
    pub appended_at: i64,
}

#[derive(Clone)]
pub struct LogStore {
    db: Db,
    topics: Tree,
    watermarks: Tree,
    offsets: Tree,
    retention_secs: Option<i64>,
    max_records_per_partition: Option<usize>,
}

impl LogStore {
    /// Open or create a sled database at `path` with the given retention policy.
    pub fn open(
        path: &str,
        retention_secs: Option<i64>,
        max_records_per_partition: Option<usize>,
    ) -> Result<Self, BrokerError> {
        let db = sled::open(path)?;
        Self::with_db(db, retention_secs, max_records_per_partition)
    }

    /// A store that lives only as long as this process.
    pub fn temporary(
        retention_secs: Option<i64>,
        max_records_per_partition: Option<usize>,
    ) -> Result<Self, BrokerError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, retention_secs, max_records_per_partition)
    }

    fn with_db(
        db: Db,
        retention_secs: Option<i64>,
        max_records_per_partition: Option<usize>,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            topics: db.open_tree("__topics")?,
            watermarks: db.open_tree("__watermarks")?,
            offsets: db.open_tree("__offsets")?,
            db,
            retention_secs,
            max_records_per_partition,
        })
    }

    fn partition_tree(&self, topic: &str, partition: u32) -> Result<Tree, BrokerError> {
        Ok(self.db.open_tree(partition_key(topic, partition))?)
    }

    /// Remember a topic's partition count. Re-registering keeps the first value.
    pub fn register_topic(&self, topic: &str, partitions: u32) -> Result<u32, BrokerError> {
        if let Some(existing) = self.topics.get(topic.as_bytes())? {
            return Ok(decode_u32(&existing));
        }
        self.topics
            .insert(topic.as_bytes(), partitions.to_be_bytes().to_vec())?;
        Ok(partitions)
    }

    /// All known topics with their partition counts.
    pub fn topics(&self) -> Result<Vec<(String, u32)>, BrokerError> {
        let mut out = Vec::new();
        for entry in self.topics.iter() {
            let (name, count) = entry?;
            out.push((
                String::from_utf8_lossy(&name).into_owned(),
                decode_u32(&count),
            ));
        }
        Ok(out)
    }

    /// Append a record and return the offset it was written at.
    pub fn append(
        &self,
        topic: &str,
        partition: u32,
        record: &StoredRecord,
    ) -> Result<u64, BrokerError> {
        self.append_at(topic, partition, record, Utc::now().timestamp_millis())
    }

    pub(crate) fn append_at(
        &self,
        topic: &str,
        partition: u32,
        record: &StoredRecord,
        now_ms: i64,
    ) -> Result<u64, BrokerError> {
        let tree = self.partition_tree(topic, partition)?;
        let offset = self.end_offset(topic, partition)?;
        let stamped = StoredRecord {
            appended_at: now_ms,
            ..record.clone()
        };
        let serialized = serde_json::to_vec(&stamped)?;

        tree.insert(offset.to_be_bytes(), serialized)?;
        self.watermarks.insert(
            partition_key(topic, partition),
            (offset + 1).to_be_bytes().to_vec(),
        )?;

        self.apply_retention(&tree, offset + 1, now_ms)?;
        Ok(offset)
    }

    /// Read up to `max` records starting at `from` (or the log start if it was trimmed).
    pub fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<(u64, StoredRecord)>, BrokerError> {
        let tree = self.partition_tree(topic, partition)?;
        let mut out = Vec::with_capacity(max.min(64));
        for entry in tree.range(from.to_be_bytes()..).take(max) {
            let (key, value) = entry?;
            let record: StoredRecord = serde_json::from_slice(&value)?;
            out.push((decode_u64(&key), record));
        }
        Ok(out)
    }

    /// Offset of the oldest retained record, or the end offset when the log is empty.
    pub fn start_offset(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        let tree = self.partition_tree(topic, partition)?;
        match tree.first()? {
            Some((key, _)) => Ok(decode_u64(&key)),
            None => self.end_offset(topic, partition),
        }
    }

    /// Offset the next appended record will receive.
    pub fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        let stored = self
            .watermarks
            .get(partition_key(topic, partition))?
            .map(|v| decode_u64(&v))
            .unwrap_or(0);

        // The watermark write can trail the record write after a crash.
        let tree = self.partition_tree(topic, partition)?;
        let from_log = tree.last()?.map(|(k, _)| decode_u64(&k) + 1).unwrap_or(0);

        Ok(stored.max(from_log))
    }

    pub fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<(), BrokerError> {
        self.offsets.insert(
            offset_key(group, topic, partition),
            offset.to_be_bytes().to_vec(),
        )?;
        Ok(())
    }

    pub fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, BrokerError> {
        Ok(self
            .offsets
            .get(offset_key(group, topic, partition))?
            .map(|v| decode_u64(&v)))
    }

    /// Force pending writes to disk.
    pub fn flush(&self) -> Result<(), BrokerError> {
        self.db.flush()?;
        Ok(())
    }

    fn apply_retention(&self, tree: &Tree, end: u64, now_ms: i64) -> Result<(), BrokerError> {
        if let Some(ttl) = self.retention_secs {
            let expiry_time = now_ms - ttl * 1000;
            while let Some((key, value)) = tree.first()? {
                let expired = serde_json::from_slice::<StoredRecord>(&value)
                    .map(|r| retained_since(&r) < expiry_time)
                    .unwrap_or(true);
                if !expired {
                    break;
                }
                tree.remove(key)?;
            }
        }

        if let Some(max) = self.max_records_per_partition {
            while let Some((key, _)) = tree.first()? {
                if end.saturating_sub(decode_u64(&key)) <= max as u64 {
                    break;
                }
                tree.remove(key)?;
            }
        }

        Ok(())
    }
}

// Logs written before append times were stored fall back to the record time.
fn retained_since(record: &StoredRecord) -> i64 {
    if record.appended_at > 0 {
        record.appended_at
    } else {
        record.timestamp
    }
}

fn partition_key(topic: &str, partition: u32) -> Vec<u8> {
    format!("log\0{topic}\0{partition}").into_bytes()
}

fn offset_key(group: &str, topic: &str, partition: u32) -> Vec<u8> {
    format!("{group}\0{topic}\0{partition}").into_bytes()
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(buf)
}

fn decode_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = bytes.len().min(4);
    buf[4 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u32::from_be_bytes(buf)
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("db", &"sled::Db")
            .field("retention_secs", &self.retention_secs)
            .field("max_records_per_partition", &self.max_records_per_partition)
            .finish()
    }
}
