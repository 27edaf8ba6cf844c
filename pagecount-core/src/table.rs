//! The partitioned count table: a sharded key→count map persisted through
//! an append-only changelog.
//!
//! One shard per partition of the key space, resident in memory only while
//! this worker owns the partition. Every increment appends the new absolute
//! value to the changelog before it becomes visible, so replaying a shard's
//! changelog from the earliest retained record deterministically rebuilds
//! the shard. The changelog topic is partition-aligned with the
//! repartitioned input stream, which is what lets shards migrate together
//! with their partitions.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::log::{with_backoff, EventLog, TransportError};
use crate::partition::partition_for;
use crate::types::{Offset, PartitionId};

/// One changelog entry: the absolute count of `key` after a mutation.
/// The latest record per key is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogRecord {
    /// Page id the count belongs to
    pub key: String,
    /// Absolute count after the mutation
    pub value: u64,
}

impl ChangelogRecord {
    fn to_bytes(&self) -> Vec<u8> {
        // PANIC: a string and an integer always serialize
        rmp_serde::to_vec(self).expect("Error serializing changelog record")
    }
}

/// Errors raised by count table mutations
#[derive(Debug, Error)]
pub enum TableError {
    /// The shard for this key is not resident on this worker. Signals a
    /// stale partition assignment, never a hard failure.
    #[error("worker does not own shard {partition} required for key {key:?}")]
    NotOwner {
        /// Key whose shard is missing
        key: String,
        /// The shard the key hashes to
        partition: PartitionId,
    },
    /// The changelog append did not become durable, even after retries
    #[error("changelog append failed")]
    Changelog(#[from] TransportError),
}

/// Errors raised while rebuilding a shard from its changelog. Fatal for
/// that shard: mutating an unverified shard risks silent undercounting.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// The changelog could not be read
    #[error("changelog for shard {partition} is unreadable")]
    Unreadable {
        /// Shard being restored
        partition: PartitionId,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },
    /// A changelog record did not decode; the log is corrupt
    #[error("corrupt changelog record at offset {offset} of shard {partition}")]
    Corrupt {
        /// Shard being restored
        partition: PartitionId,
        /// Offset of the undecodable record
        offset: Offset,
        /// Decode failure
        #[source]
        source: rmp_serde::decode::Error,
    },
}

/// The partitioned, changelog-backed count table.
///
/// Holds the shards this worker currently owns. Ownership changes arrive
/// through [CountTable::restore] (gain) and [CountTable::evict] (loss),
/// driven by the worker's partition state machine.
pub struct CountTable {
    changelog: Arc<dyn EventLog>,
    shards: IndexMap<PartitionId, Shard>,
    partition_count: u32,
}

#[derive(Debug, Default)]
struct Shard {
    counts: IndexMap<String, u64>,
}

impl CountTable {
    /// Create an empty table persisting through the given changelog topic.
    /// The changelog's partition count fixes the shard count.
    pub fn new(changelog: Arc<dyn EventLog>) -> Self {
        let partition_count = changelog.partition_count();
        Self {
            changelog,
            shards: IndexMap::new(),
            partition_count,
        }
    }

    /// Current count for `key`, 0 if unseen. Purely an in-memory lookup,
    /// never blocks on the changelog; a non-resident shard reads as 0.
    pub fn get(&self, key: &str) -> u64 {
        let partition = partition_for(key, self.partition_count);
        self.shards
            .get(&partition)
            .and_then(|shard| shard.counts.get(key).copied())
            .unwrap_or(0)
    }

    /// Increment the count for `key`, returning the new value.
    ///
    /// The changelog append is the durability point: it completes before
    /// the new value becomes visible. Must only be called from within an
    /// aggregator processing scope, i.e. while advancing the corresponding
    /// input offset.
    pub fn increment(&mut self, key: &str) -> Result<u64, TableError> {
        let partition = partition_for(key, self.partition_count);
        let shard = self
            .shards
            .get_mut(&partition)
            .ok_or_else(|| TableError::NotOwner {
                key: key.to_owned(),
                partition,
            })?;
        let next = shard.counts.get(key).copied().unwrap_or(0) + 1;
        let record = ChangelogRecord {
            key: key.to_owned(),
            value: next,
        };
        let payload = record.to_bytes();
        with_backoff("changelog append", || {
            self.changelog.append(partition, &payload)
        })?;
        shard.counts.insert(key.to_owned(), next);
        Ok(next)
    }

    /// Rebuild the shard for `partition` by replaying its changelog from
    /// the earliest retained record, last write per key winning. Runs once
    /// per shard activation, before the shard is opened for mutation.
    pub fn restore(&mut self, partition: PartitionId) -> Result<(), RestoreError> {
        let read_failed = |source| RestoreError::Unreadable { partition, source };
        let mut shard = Shard::default();
        let mut offset = with_backoff("changelog bounds read", || self.changelog.earliest(partition))
            .map_err(read_failed)?;
        let mut replayed = 0u64;
        loop {
            let payload =
                match with_backoff("changelog read", || self.changelog.read(partition, offset))
                    .map_err(read_failed)?
                {
                    Some(payload) => payload,
                    None => break,
                };
            let record: ChangelogRecord =
                rmp_serde::from_slice(&payload).map_err(|source| RestoreError::Corrupt {
                    partition,
                    offset,
                    source,
                })?;
            shard.counts.insert(record.key, record.value);
            offset += 1;
            replayed += 1;
        }
        debug!(partition, replayed, keys = shard.counts.len(), "restored shard");
        self.shards.insert(partition, shard);
        Ok(())
    }

    /// Drop the in-memory shard for `partition` on ownership loss. The
    /// changelog remains the durable copy for the next owner to restore.
    pub fn evict(&mut self, partition: PartitionId) {
        self.shards.shift_remove(&partition);
    }

    /// Whether the shard for `partition` is resident
    pub fn owns(&self, partition: PartitionId) -> bool {
        self.shards.contains_key(&partition)
    }

    /// Number of shards the table holds state for
    pub fn shard_count(&self) -> u32 {
        self.partition_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;

    fn table_with_all_shards(partitions: u32) -> (CountTable, MemoryLog) {
        let changelog = MemoryLog::new("counts-changelog", partitions);
        let mut table = CountTable::new(Arc::new(changelog.clone()));
        for p in 0..partitions {
            table.restore(p).unwrap();
        }
        (table, changelog)
    }

    #[test]
    fn unseen_key_reads_zero() {
        let (table, _) = table_with_all_shards(4);
        assert_eq!(table.get("p1"), 0);
    }

    #[test]
    fn increment_counts_up() {
        let (mut table, _) = table_with_all_shards(4);
        assert_eq!(table.increment("p1").unwrap(), 1);
        assert_eq!(table.increment("p1").unwrap(), 2);
        assert_eq!(table.increment("p2").unwrap(), 1);
        assert_eq!(table.get("p1"), 2);
        assert_eq!(table.get("p2"), 1);
    }

    #[test]
    fn increment_without_shard_is_not_owner() {
        let changelog = MemoryLog::new("counts-changelog", 4);
        let mut table = CountTable::new(Arc::new(changelog));
        let err = table.increment("p1").unwrap_err();
        assert!(matches!(err, TableError::NotOwner { .. }));
        // and nothing was appended anywhere
    }

    #[test]
    fn every_increment_appends_its_changelog_record() {
        let (mut table, changelog) = table_with_all_shards(1);
        table.increment("p1").unwrap();
        table.increment("p1").unwrap();
        let records: Vec<ChangelogRecord> = (0..2)
            .map(|o| rmp_serde::from_slice(&changelog.read(0, o).unwrap().unwrap()).unwrap())
            .collect();
        assert_eq!(
            records,
            vec![
                ChangelogRecord {
                    key: "p1".into(),
                    value: 1
                },
                ChangelogRecord {
                    key: "p1".into(),
                    value: 2
                },
            ]
        );
    }

    #[test]
    fn restore_is_last_write_wins() {
        let changelog = MemoryLog::new("counts-changelog", 1);
        for value in [1u64, 2, 5] {
            let record = ChangelogRecord {
                key: "k".into(),
                value,
            };
            changelog.append(0, &record.to_bytes()).unwrap();
        }
        let mut table = CountTable::new(Arc::new(changelog));
        table.restore(0).unwrap();
        assert_eq!(table.get("k"), 5);
    }

    #[test]
    fn restore_of_empty_changelog_yields_empty_shard() {
        let changelog = MemoryLog::new("counts-changelog", 1);
        let mut table = CountTable::new(Arc::new(changelog));
        table.restore(0).unwrap();
        assert!(table.owns(0));
        assert_eq!(table.get("k"), 0);
    }

    #[test]
    fn corrupt_changelog_halts_activation() {
        let changelog = MemoryLog::new("counts-changelog", 1);
        changelog.append(0, b"\xc1 not msgpack").unwrap();
        let mut table = CountTable::new(Arc::new(changelog));
        let err = table.restore(0).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Corrupt {
                partition: 0,
                offset: 0,
                ..
            }
        ));
        // the shard never opened for mutation
        assert!(!table.owns(0));
    }

    #[test]
    fn evicted_shard_stays_durable() {
        let (mut table, changelog) = table_with_all_shards(1);
        table.increment("k").unwrap();
        table.evict(0);
        assert!(!table.owns(0));
        assert_eq!(table.get("k"), 0);

        // the next owner restores the evicted shard from the changelog
        let mut successor = CountTable::new(Arc::new(changelog));
        successor.restore(0).unwrap();
        assert_eq!(successor.get("k"), 1);
    }

    #[test]
    fn restore_replays_increment_history() {
        let (mut table, changelog) = table_with_all_shards(2);
        for _ in 0..3 {
            table.increment("p1").unwrap();
        }
        table.increment("p2").unwrap();

        let mut rebuilt = CountTable::new(Arc::new(changelog));
        for p in 0..2 {
            rebuilt.restore(p).unwrap();
        }
        assert_eq!(rebuilt.get("p1"), 3);
        assert_eq!(rebuilt.get("p2"), 1);
    }
}
