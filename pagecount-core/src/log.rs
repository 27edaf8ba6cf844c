//! The partitioned log abstraction behind which the message broker lives.
//!
//! Everything durable in this crate is an ordered, partitioned, append-only
//! byte log: the input topic, the repartitioned topic and the count table
//! changelog. [EventLog] is the seam a broker adapter implements;
//! [MemoryLog] is the in-process implementation the local runtime and the
//! tests run on.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::types::{Offset, PartitionId};

/// Errors raised by log operations.
///
/// [TransportError::Unavailable] is transient: callers retry it with
/// backoff, see [with_backoff]. An unknown partition is a topology mismatch
/// and no amount of retrying fixes it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The addressed partition does not exist on this topic
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),
    /// The log store did not acknowledge the operation
    #[error("log store unavailable")]
    Unavailable,
}

/// An ordered, partitioned, append-only byte log.
///
/// Partition counts are fixed at topology-definition time. Offsets are
/// dense and ascending within a partition. The committed offset is the
/// consumer position: the offset of the *next* record to consume, stored
/// durably alongside the log the way a broker stores group offsets.
pub trait EventLog: Send + Sync + 'static {
    /// Number of partitions, fixed for the lifetime of the topic
    fn partition_count(&self) -> u32;

    /// Append a payload to `partition`, returning the offset it was
    /// assigned. The record is durable once this returns `Ok`.
    fn append(&self, partition: PartitionId, payload: &[u8]) -> Result<Offset, TransportError>;

    /// Read the record at `offset`, `None` once past the end of the
    /// partition
    fn read(
        &self,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Earliest retained offset. Retention and compaction may move this
    /// forward; replay always starts here.
    fn earliest(&self, partition: PartitionId) -> Result<Offset, TransportError>;

    /// The offset the next append will be assigned (exclusive end)
    fn next_offset(&self, partition: PartitionId) -> Result<Offset, TransportError>;

    /// Durably record the consumer position for `partition`
    fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), TransportError>;

    /// Last committed consumer position, `None` if nothing was ever
    /// committed
    fn committed(&self, partition: PartitionId) -> Result<Option<Offset>, TransportError>;
}

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

/// Run `op`, retrying transient failures with capped exponential backoff
/// and jitter. Permanent errors and exhausted retries are returned to the
/// caller, which decides whether they are fatal for its scope.
pub fn with_backoff<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..RETRY_ATTEMPTS {
        match op() {
            Ok(x) => return Ok(x),
            Err(e @ TransportError::UnknownPartition(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, attempt, "{what} failed, backing off");
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                std::thread::sleep(delay + Duration::from_millis(jitter));
                delay *= 2;
            }
        }
    }
    op()
}

/// In-process [EventLog] over plain vectors.
///
/// Clones share the underlying topic, so a clone is a cheap handle the same
/// way a broker client is. Used by the local runtime and as the test
/// substrate; durability here means "survives as long as any handle does",
/// which is exactly what crash-recovery tests need to simulate a broker
/// outliving a worker.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    inner: Arc<MemoryTopic>,
}

#[derive(Debug)]
struct MemoryTopic {
    name: String,
    partitions: Vec<Mutex<MemoryPartition>>,
}

#[derive(Debug, Default)]
struct MemoryPartition {
    records: Vec<Arc<[u8]>>,
    committed: Option<Offset>,
}

impl MemoryLog {
    /// Create a topic with the given name and partition count
    pub fn new(name: impl Into<String>, partition_count: u32) -> Self {
        let partitions = (0..partition_count)
            .map(|_| Mutex::new(MemoryPartition::default()))
            .collect();
        Self {
            inner: Arc::new(MemoryTopic {
                name: name.into(),
                partitions,
            }),
        }
    }

    /// Topic name this log was created with
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn partition(&self, partition: PartitionId) -> Result<MutexGuard<'_, MemoryPartition>, TransportError> {
        let slot = self
            .inner
            .partitions
            .get(partition as usize)
            .ok_or(TransportError::UnknownPartition(partition))?;
        // PANIC: a poisoned partition means a writer panicked mid-append
        Ok(slot.lock().expect("Memory log partition poisoned"))
    }
}

impl EventLog for MemoryLog {
    fn partition_count(&self) -> u32 {
        self.inner.partitions.len() as u32
    }

    fn append(&self, partition: PartitionId, payload: &[u8]) -> Result<Offset, TransportError> {
        let mut part = self.partition(partition)?;
        part.records.push(Arc::from(payload));
        Ok(part.records.len() as Offset - 1)
    }

    fn read(
        &self,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let part = self.partition(partition)?;
        Ok(part.records.get(offset as usize).map(|r| r.to_vec()))
    }

    fn earliest(&self, _partition: PartitionId) -> Result<Offset, TransportError> {
        // the in-memory log never compacts or expires records
        Ok(0)
    }

    fn next_offset(&self, partition: PartitionId) -> Result<Offset, TransportError> {
        Ok(self.partition(partition)?.records.len() as Offset)
    }

    fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), TransportError> {
        self.partition(partition)?.committed = Some(offset);
        Ok(())
    }

    fn committed(&self, partition: PartitionId) -> Result<Option<Offset>, TransportError> {
        Ok(self.partition(partition)?.committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyLog;

    #[test]
    fn append_assigns_dense_offsets() {
        let log = MemoryLog::new("t", 2);
        assert_eq!(log.append(0, b"a").unwrap(), 0);
        assert_eq!(log.append(0, b"b").unwrap(), 1);
        // partitions are independent
        assert_eq!(log.append(1, b"c").unwrap(), 0);
    }

    #[test]
    fn read_past_end_is_none() {
        let log = MemoryLog::new("t", 1);
        log.append(0, b"a").unwrap();
        assert_eq!(log.read(0, 0).unwrap(), Some(b"a".to_vec()));
        assert_eq!(log.read(0, 1).unwrap(), None);
    }

    #[test]
    fn unknown_partition_rejected() {
        let log = MemoryLog::new("t", 1);
        assert_eq!(
            log.append(3, b"a").unwrap_err(),
            TransportError::UnknownPartition(3)
        );
        assert_eq!(
            log.read(3, 0).unwrap_err(),
            TransportError::UnknownPartition(3)
        );
    }

    #[test]
    fn clones_share_the_topic() {
        let log = MemoryLog::new("t", 1);
        let handle = log.clone();
        log.append(0, b"a").unwrap();
        assert_eq!(handle.read(0, 0).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn committed_offset_survives_per_partition() {
        let log = MemoryLog::new("t", 2);
        assert_eq!(log.committed(0).unwrap(), None);
        log.commit(0, 5).unwrap();
        assert_eq!(log.committed(0).unwrap(), Some(5));
        assert_eq!(log.committed(1).unwrap(), None);
    }

    #[test]
    fn backoff_retries_transient_failures() {
        let flaky = FlakyLog::new(MemoryLog::new("t", 1), 2);
        let offset = with_backoff("append", || flaky.append(0, b"a")).unwrap();
        assert_eq!(offset, 0);
        // two failures, then success on the third call
        assert_eq!(flaky.calls(), 3);
    }

    #[test]
    fn backoff_does_not_retry_unknown_partition() {
        let flaky = FlakyLog::new(MemoryLog::new("t", 1), 99);
        let err = with_backoff("append", || flaky.append(7, b"a")).unwrap_err();
        assert_eq!(err, TransportError::UnknownPartition(7));
        assert_eq!(flaky.calls(), 1);
    }
}
