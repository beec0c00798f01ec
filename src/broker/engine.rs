//! Broker engine
//!
//! This module contains the partitioned broker implementation responsible for:
//! - managing topics and routing produced records to partitions
//! - appending records to the partition logs in the `LogStore`
//! - consumer-group membership, range rebalancing and read positions
//! - committing offsets so a restarted member resumes where its group left off
//! - recognising retried producer sends so they are appended once
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   lock (`SharedBroker`) by the client and transport layers. Callers
//!   should avoid holding the broker lock across awaits.
//! - Every append and every rebalance wakes the `data_ready` notifier so
//!   long-polling consumers can re-check without spinning.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::group::{ConsumerGroup, Member, MemberId};
use crate::broker::message::{ConsumerEvent, Delivery, OutgoingRecord, Record, TopicPartition};
use crate::broker::topic::Topic;
use crate::config::{BrokerSettings, OffsetReset};
use crate::persistence::{LogStore, StoredRecord};
use crate::utils::BrokerError;

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Lock the shared broker, recovering from a poisoned lock.
pub fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
pub struct Broker {
    pub topics: HashMap<String, Topic>,
    pub groups: HashMap<String, ConsumerGroup>,
    member_groups: HashMap<MemberId, String>,
    producer_windows: HashMap<String, VecDeque<(u64, Delivery)>>,
    store: LogStore,
    default_partitions: u32,
    data_ready: Arc<Notify>,
}

impl Broker {
    /// Number of recent sequences remembered per producer for duplicate detection.
    pub const PRODUCER_WINDOW: usize = 64;

    /// Open a broker over an existing store, restoring its topic metadata.
    pub fn new(store: LogStore, default_partitions: u32) -> Result<Self, BrokerError> {
        let mut topics = HashMap::new();
        for (name, partitions) in store.topics()? {
            topics.insert(name.clone(), Topic::new(&name, partitions));
        }
        if !topics.is_empty() {
            info!(topics = topics.len(), "Restored topic metadata");
        }

        Ok(Self {
            topics,
            groups: HashMap::new(),
            member_groups: HashMap::new(),
            producer_windows: HashMap::new(),
            store,
            default_partitions: default_partitions.max(1),
            data_ready: Arc::new(Notify::new()),
        })
    }

    /// A broker whose log is discarded when the process exits.
    pub fn in_memory(default_partitions: u32) -> Result<Self, BrokerError> {
        Self::new(LogStore::temporary(None, None)?, default_partitions)
    }

    pub fn from_settings(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let store = match &settings.data_dir {
            Some(dir) => LogStore::open(
                dir,
                settings.retention_secs,
                settings.max_records_per_partition,
            )?,
            None => LogStore::temporary(
                settings.retention_secs,
                settings.max_records_per_partition,
            )?,
        };
        Self::new(store, settings.default_partitions)
    }

    pub fn shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    /// Notifier signalled after every append and rebalance.
    pub fn data_ready(&self) -> Arc<Notify> {
        self.data_ready.clone()
    }

    /// Create a topic with an explicit partition count. Existing topics are kept as-is.
    pub fn create_topic(&mut self, name: &str, partitions: u32) -> Result<u32, BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::InvalidRecord("topic name is empty".to_string()));
        }
        if let Some(topic) = self.topics.get(name) {
            return Ok(topic.partitions);
        }
        let partitions = self.store.register_topic(name, partitions.max(1))?;
        self.topics.insert(name.to_string(), Topic::new(name, partitions));
        info!(topic = name, partitions, "Created topic");
        Ok(partitions)
    }

    fn ensure_topic(&mut self, name: &str) -> Result<u32, BrokerError> {
        let partitions = self.default_partitions;
        self.create_topic(name, partitions)
    }

    /// Append a record and return where it landed.
    ///
    /// A record whose `(producer_id, sequence)` was already appended is not
    /// written again; the original delivery is returned instead.
    pub fn produce(&mut self, record: OutgoingRecord) -> Result<Delivery, BrokerError> {
        if let (Some(producer_id), Some(sequence)) = (&record.producer_id, record.sequence) {
            if let Some(delivery) = self
                .producer_windows
                .get(producer_id)
                .and_then(|w| w.iter().find(|(seq, _)| *seq == sequence))
                .map(|(_, d)| d.clone())
            {
                debug!(
                    producer_id = %producer_id,
                    sequence,
                    "Duplicate produce, returning original delivery"
                );
                return Ok(delivery);
            }
        }

        self.ensure_topic(&record.topic)?;
        let partition = match self.topics.get_mut(&record.topic) {
            Some(topic) => topic.partition_for(record.key.as_deref()),
            None => return Err(BrokerError::InvalidRecord(record.topic)),
        };

        let stored = StoredRecord {
            key: record.key,
            payload: record.payload,
            timestamp: record.timestamp,
            appended_at: 0,
        };
        let offset = self.store.append(&record.topic, partition, &stored)?;
        let delivery = Delivery {
            topic: record.topic,
            partition,
            offset,
        };

        if let (Some(producer_id), Some(sequence)) = (record.producer_id, record.sequence) {
            let window = self.producer_windows.entry(producer_id).or_default();
            window.push_back((sequence, delivery.clone()));
            if window.len() > Self::PRODUCER_WINDOW {
                window.pop_front();
            }
        }

        debug!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "Appended record"
        );
        self.data_ready.notify_waiters();
        Ok(delivery)
    }

    /// Add a new member to `group` subscribed to `topics` and rebalance the group.
    pub fn join_group(
        &mut self,
        group: &str,
        topics: &[String],
        offset_reset: OffsetReset,
    ) -> Result<MemberId, BrokerError> {
        if group.is_empty() {
            return Err(BrokerError::InvalidRecord("group id is empty".to_string()));
        }
        for topic in topics {
            self.ensure_topic(topic)?;
        }

        let member_id = format!("{group}-{}", Uuid::new_v4());
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| ConsumerGroup::new(group))
            .members
            .insert(
                member_id.clone(),
                Member::new(member_id.clone(), topics.to_vec(), offset_reset),
            );
        self.member_groups.insert(member_id.clone(), group.to_string());

        info!(group, member = %member_id, ?topics, "Member joined group");
        self.rebalance(group)?;
        Ok(member_id)
    }

    /// Replace a member's topic subscription and rebalance its group.
    pub fn subscribe(&mut self, member_id: &str, topics: &[String]) -> Result<(), BrokerError> {
        let group = self.group_of(member_id)?;
        for topic in topics {
            self.ensure_topic(topic)?;
        }
        if let Some(member) = self
            .groups
            .get_mut(&group)
            .and_then(|g| g.members.get_mut(member_id))
        {
            member.topics = topics.to_vec();
        }
        info!(group = %group, member = member_id, ?topics, "Member changed subscription");
        self.rebalance(&group)
    }

    /// Remove a member, committing its positions first.
    pub fn leave_group(&mut self, member_id: &str) -> Result<(), BrokerError> {
        let group = self.group_of(member_id)?;
        self.commit(member_id)?;

        self.member_groups.remove(member_id);
        let now_empty = match self.groups.get_mut(&group) {
            Some(g) => {
                g.members.remove(member_id);
                g.members.is_empty()
            }
            None => true,
        };

        info!(group = %group, member = member_id, "Member left group");
        if now_empty {
            self.groups.remove(&group);
            Ok(())
        } else {
            self.rebalance(&group)
        }
    }

    /// Next event for a member: pending rebalance notices first, then records.
    pub fn fetch(&mut self, member_id: &str) -> Result<Option<ConsumerEvent>, BrokerError> {
        let group = self.group_of(member_id)?;
        let store = &self.store;
        let member = self
            .groups
            .get_mut(&group)
            .and_then(|g| g.members.get_mut(member_id))
            .ok_or_else(|| BrokerError::UnknownMember(member_id.to_string()))?;

        if let Some(event) = member.events.pop_front() {
            return Ok(Some(event));
        }

        let assignment: Vec<TopicPartition> = member.assignment.iter().cloned().collect();
        if assignment.is_empty() {
            return Ok(None);
        }

        for step in 0..assignment.len() {
            let index = (member.cursor + step) % assignment.len();
            let tp = &assignment[index];
            let position = member.positions.get(tp).copied().unwrap_or(0);

            if let Some((offset, stored)) = store
                .read(&tp.topic, tp.partition, position, 1)?
                .into_iter()
                .next()
            {
                member.positions.insert(tp.clone(), offset + 1);
                member.cursor = (index + 1) % assignment.len();
                return Ok(Some(ConsumerEvent::Record(Record {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset,
                    key: stored.key,
                    payload: stored.payload,
                    timestamp: stored.timestamp,
                })));
            }
        }

        Ok(None)
    }

    /// Store the member's current positions as the group's committed offsets.
    pub fn commit(&mut self, member_id: &str) -> Result<(), BrokerError> {
        let group = self.group_of(member_id)?;
        let member = self
            .groups
            .get(&group)
            .and_then(|g| g.members.get(member_id))
            .ok_or_else(|| BrokerError::UnknownMember(member_id.to_string()))?;

        for (tp, position) in &member.positions {
            self.store
                .commit_offset(&group, &tp.topic, tp.partition, *position)?;
        }
        Ok(())
    }

    pub fn assignment(&self, member_id: &str) -> Result<Vec<TopicPartition>, BrokerError> {
        Ok(self.member(member_id)?.assignment.iter().cloned().collect())
    }

    pub fn positions(&self, member_id: &str) -> Result<Vec<(TopicPartition, u64)>, BrokerError> {
        let mut positions: Vec<_> = self
            .member(member_id)?
            .positions
            .iter()
            .map(|(tp, pos)| (tp.clone(), *pos))
            .collect();
        positions.sort();
        Ok(positions)
    }

    pub fn committed_offset(
        &self,
        group: &str,
        tp: &TopicPartition,
    ) -> Result<Option<u64>, BrokerError> {
        self.store.committed_offset(group, &tp.topic, tp.partition)
    }

    pub fn end_offset(&self, tp: &TopicPartition) -> Result<u64, BrokerError> {
        self.store.end_offset(&tp.topic, tp.partition)
    }

    pub fn flush(&self) -> Result<(), BrokerError> {
        self.store.flush()
    }

    fn member(&self, member_id: &str) -> Result<&Member, BrokerError> {
        self.member_groups
            .get(member_id)
            .and_then(|g| self.groups.get(g))
            .and_then(|g| g.members.get(member_id))
            .ok_or_else(|| BrokerError::UnknownMember(member_id.to_string()))
    }

    fn group_of(&self, member_id: &str) -> Result<String, BrokerError> {
        self.member_groups
            .get(member_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownMember(member_id.to_string()))
    }

    /// Recompute partition ownership for a group.
    ///
    /// All revocations (with their position commits) are applied before any
    /// new assignment, so a partition moving between members resumes from
    /// the offset its previous owner reached.
    fn rebalance(&mut self, group_name: &str) -> Result<(), BrokerError> {
        let Some(group) = self.groups.get(group_name) else {
            return Ok(());
        };
        let partition_counts: HashMap<String, u32> = group
            .subscribed_topics()
            .into_iter()
            .filter_map(|t| self.topics.get(&t).map(|topic| (t, topic.partitions)))
            .collect();
        let mut target = group.compute_assignment(&partition_counts);

        let store = &self.store;
        let Some(group) = self.groups.get_mut(group_name) else {
            return Ok(());
        };
        group.generation += 1;

        for member in group.members.values_mut() {
            let owned = target.get(&member.id).cloned().unwrap_or_default();
            let revoked: Vec<TopicPartition> =
                member.assignment.difference(&owned).cloned().collect();
            if revoked.is_empty() {
                continue;
            }
            for tp in &revoked {
                if let Some(position) = member.positions.remove(tp) {
                    store.commit_offset(group_name, &tp.topic, tp.partition, position)?;
                }
                member.assignment.remove(tp);
            }
            member.events.push_back(ConsumerEvent::Revoked {
                partitions: revoked,
            });
        }

        for member in group.members.values_mut() {
            let owned = target.remove(&member.id).unwrap_or_default();
            let assigned: Vec<TopicPartition> =
                owned.difference(&member.assignment).cloned().collect();
            if assigned.is_empty() {
                continue;
            }
            for tp in &assigned {
                let start = match store.committed_offset(group_name, &tp.topic, tp.partition)? {
                    Some(offset) => offset,
                    None => match member.offset_reset {
                        OffsetReset::Latest => store.end_offset(&tp.topic, tp.partition)?,
                        OffsetReset::Earliest => store.start_offset(&tp.topic, tp.partition)?,
                    },
                };
                member.positions.insert(tp.clone(), start);
            }
            member.assignment = owned;
            member.cursor = 0;
            member.events.push_back(ConsumerEvent::Assigned {
                partitions: assigned,
            });
        }

        if group.members.values().any(|m| m.assignment.is_empty()) {
            warn!(
                group = group_name,
                generation = group.generation,
                "Some members have no partitions; the group has more members than partitions"
            );
        }
        info!(group = group_name, generation = group.generation, "Rebalanced group");
        self.data_ready.notify_waiters();
        Ok(())
    }
}
