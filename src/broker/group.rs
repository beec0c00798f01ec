//! Consumer groups
//!
//! A group is a set of members that share the partitions of the topics they
//! subscribe to. Each partition belongs to at most one member at a time; the
//! broker recomputes ownership (range assignment) whenever a member joins,
//! leaves or changes its subscription.
//!
//! Members also carry their read positions and a queue of rebalance
//! notifications that the next fetch hands back before any record.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::broker::message::{ConsumerEvent, TopicPartition};
use crate::config::OffsetReset;

pub type MemberId = String;

#[derive(Debug)]
pub struct Member {
    pub id: MemberId,
    pub topics: Vec<String>,
    pub offset_reset: OffsetReset,
    pub assignment: BTreeSet<TopicPartition>,
    pub positions: HashMap<TopicPartition, u64>,
    pub events: VecDeque<ConsumerEvent>,
    pub(crate) cursor: usize,
}

impl Member {
    pub fn new(id: MemberId, topics: Vec<String>, offset_reset: OffsetReset) -> Self {
        Self {
            id,
            topics,
            offset_reset,
            assignment: BTreeSet::new(),
            positions: HashMap::new(),
            events: VecDeque::new(),
            cursor: 0,
        }
    }
}

#[derive(Debug)]
pub struct ConsumerGroup {
    pub name: String,
    pub members: BTreeMap<MemberId, Member>,
    pub generation: u64,
}

impl ConsumerGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeMap::new(),
            generation: 0,
        }
    }

    /// Every topic at least one member is subscribed to.
    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.members
            .values()
            .flat_map(|m| m.topics.iter().cloned())
            .collect()
    }

    /// Range assignment.
    ///
    /// For each topic the subscribed members (ordered by id) receive
    /// contiguous partition ranges; the first `partitions % members` members
    /// get one extra partition.
    pub fn compute_assignment(
        &self,
        partition_counts: &HashMap<String, u32>,
    ) -> HashMap<MemberId, BTreeSet<TopicPartition>> {
        let mut target: HashMap<MemberId, BTreeSet<TopicPartition>> = self
            .members
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        for topic in self.subscribed_topics() {
            let partitions = partition_counts.get(&topic).copied().unwrap_or(0);
            let subscribers: Vec<&MemberId> = self
                .members
                .values()
                .filter(|m| m.topics.contains(&topic))
                .map(|m| &m.id)
                .collect();
            if subscribers.is_empty() || partitions == 0 {
                continue;
            }

            let count = subscribers.len() as u32;
            let per_member = partitions / count;
            let extra = partitions % count;

            for (i, member_id) in subscribers.into_iter().enumerate() {
                let i = i as u32;
                let start = i * per_member + i.min(extra);
                let len = per_member + u32::from(i < extra);
                if let Some(owned) = target.get_mut(member_id) {
                    owned.extend((start..start + len).map(|p| TopicPartition::new(&topic, p)));
                }
            }
        }

        target
    }
}
