//! Shared helpers for tests: fault-injecting log wrappers and logging
//! setup.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::log::{EventLog, MemoryLog, TransportError};
use crate::types::{Offset, PartitionId};

/// Install a test-writer subscriber once; later calls are no-ops
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// An [EventLog] which reports the store unavailable for the first
/// `fail_first` operations on valid partitions, then behaves normally.
/// Topology errors pass through untouched.
#[derive(Debug, Clone)]
pub(crate) struct FlakyLog {
    inner: MemoryLog,
    remaining_failures: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
}

impl FlakyLog {
    pub(crate) fn new(inner: MemoryLog, fail_first: u32) -> Self {
        Self {
            inner,
            remaining_failures: Arc::new(AtomicU32::new(fail_first)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Operations attempted so far, across all clones
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self, partition: PartitionId) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if partition >= self.inner.partition_count() {
            // let the inner log report the topology error
            return Ok(());
        }
        let tripped = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if tripped {
            Err(TransportError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl EventLog for FlakyLog {
    fn partition_count(&self) -> u32 {
        self.inner.partition_count()
    }

    fn append(&self, partition: PartitionId, payload: &[u8]) -> Result<Offset, TransportError> {
        self.trip(partition)?;
        self.inner.append(partition, payload)
    }

    fn read(
        &self,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.trip(partition)?;
        self.inner.read(partition, offset)
    }

    fn earliest(&self, partition: PartitionId) -> Result<Offset, TransportError> {
        self.trip(partition)?;
        self.inner.earliest(partition)
    }

    fn next_offset(&self, partition: PartitionId) -> Result<Offset, TransportError> {
        self.trip(partition)?;
        self.inner.next_offset(partition)
    }

    fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), TransportError> {
        self.trip(partition)?;
        self.inner.commit(partition, offset)
    }

    fn committed(&self, partition: PartitionId) -> Result<Option<Offset>, TransportError> {
        self.trip(partition)?;
        self.inner.committed(partition)
    }
}

/// An [EventLog] whose offset commits claim success but never reach the
/// store. Simulates the crash window between a durable changelog append
/// and the offset commit becoming durable.
#[derive(Debug, Clone)]
pub(crate) struct VolatileCommits {
    inner: MemoryLog,
}

impl VolatileCommits {
    pub(crate) fn new(inner: MemoryLog) -> Self {
        Self { inner }
    }
}

impl EventLog for VolatileCommits {
    fn partition_count(&self) -> u32 {
        self.inner.partition_count()
    }

    fn append(&self, partition: PartitionId, payload: &[u8]) -> Result<Offset, TransportError> {
        self.inner.append(partition, payload)
    }

    fn read(
        &self,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.inner.read(partition, offset)
    }

    fn earliest(&self, partition: PartitionId) -> Result<Offset, TransportError> {
        self.inner.earliest(partition)
    }

    fn next_offset(&self, partition: PartitionId) -> Result<Offset, TransportError> {
        self.inner.next_offset(partition)
    }

    fn commit(&self, _partition: PartitionId, _offset: Offset) -> Result<(), TransportError> {
        // acknowledged, never persisted
        Ok(())
    }

    fn committed(&self, partition: PartitionId) -> Result<Option<Offset>, TransportError> {
        self.inner.committed(partition)
    }
}
