//! Topic metadata and partition routing
//!
//! A `Topic` only knows its partition count; the records themselves live in
//! the `LogStore`. Keyed records are routed with a stable FNV-1a hash so the
//! same key always maps to the same partition, even across broker restarts.
//! Keyless records are spread round-robin.

#[derive(Debug)]
pub struct Topic {
    pub name: String,
    pub partitions: u32,
    next_partition: u32,
}

impl Topic {
    /// Create a topic; a topic always has at least one partition.
    pub fn new(name: &str, partitions: u32) -> Self {
        Self {
            name: name.to_string(),
            partitions: partitions.max(1),
            next_partition: 0,
        }
    }

    /// Pick the partition for a record.
    pub fn partition_for(&mut self, key: Option<&str>) -> u32 {
        match key {
            Some(key) => hash_key(key) % self.partitions,
            None => {
                let partition = self.next_partition % self.partitions;
                self.next_partition = self.next_partition.wrapping_add(1);
                partition
            }
        }
    }
}

/// 32-bit FNV-1a.
pub fn hash_key(key: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
