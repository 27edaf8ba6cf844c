//! The aggregation worker: one partition state machine per owned
//! partition, driven by a scheduler loop.
//!
//! Each partition on a worker moves through an explicit lifecycle,
//! `Unassigned → Restoring → Active → (Revoked → Unassigned)`. The
//! scheduler services the coordinator's control channel first, then gives
//! every active partition one turn; within a partition processing is
//! strictly sequential, across partitions there is no ordering.
//!
//! Counting one event is one commit unit: the changelog append inside
//! [CountTable::increment] is the durability point and the input offset
//! commit follows it. A crash between the two re-applies the event on
//! recovery, at most one overcount per key per crash window, never an
//! undercount.

use std::sync::Arc;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use tracing::{error, info, span, trace, warn, Level};

use crate::coordinator::WorkerCommand;
use crate::log::{with_backoff, EventLog};
use crate::record::PageView;
use crate::table::{CountTable, TableError};
use crate::types::{Offset, PartitionId, WorkerId};

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Lifecycle of one partition on one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPhase {
    /// Not owned: no events consumed, no table shard resident
    Unassigned,
    /// Ownership gained, table shard rebuilding from its changelog;
    /// consumption for this partition is paused
    Restoring,
    /// Consuming events and applying mutations in commit units
    Active,
    /// Ownership being released; no further mutations once entered
    Revoked,
}

struct PartitionLoop {
    phase: PartitionPhase,
    /// next input offset to consume
    next_offset: Offset,
    /// an offset whose commit has not yet reached the store; the partition
    /// reads no further events until it does
    dirty_commit: Option<Offset>,
}

/// A worker process: owns a [CountTable] plus the consumption loops of all
/// partitions currently assigned to it.
pub struct Worker {
    id: WorkerId,
    table: CountTable,
    source: Arc<dyn EventLog>,
    control: flume::Receiver<WorkerCommand>,
    partitions: IndexMap<PartitionId, PartitionLoop>,
    shutdown: bool,
}

impl Worker {
    /// Create a worker consuming the repartitioned stream in `source` and
    /// counting into `table`. Commands on `control` drive ownership.
    pub fn new(
        id: WorkerId,
        table: CountTable,
        source: Arc<dyn EventLog>,
        control: flume::Receiver<WorkerCommand>,
    ) -> Self {
        Self {
            id,
            table,
            source,
            control,
            partitions: IndexMap::new(),
            shutdown: false,
        }
    }

    /// Run the scheduler until shutdown is requested
    pub fn run(mut self) {
        let worker_span = span!(Level::INFO, "worker", worker_id = self.id);
        let _guard = worker_span.enter();
        info!("worker running");
        while !self.shutdown {
            if !self.step() {
                // nothing to do, park briefly instead of spinning
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        info!("worker stopped");
    }

    /// One scheduler pass: service control, then give every owned
    /// partition one turn. Returns whether any work happened.
    pub fn step(&mut self) -> bool {
        let mut worked = false;
        while let Ok(command) = self.control.try_recv() {
            self.handle_command(command);
            worked = true;
        }
        if self.shutdown {
            return worked;
        }
        let owned: Vec<PartitionId> = self.partitions.keys().copied().collect();
        for partition in owned {
            worked |= match self.phase(partition) {
                PartitionPhase::Restoring => self.activate(partition),
                PartitionPhase::Active => self.process_one(partition),
                _ => false,
            };
        }
        worked
    }

    /// Current phase of `partition` on this worker
    pub fn phase(&self, partition: PartitionId) -> PartitionPhase {
        self.partitions
            .get(&partition)
            .map(|l| l.phase)
            .unwrap_or(PartitionPhase::Unassigned)
    }

    /// Partitions this worker currently holds in any owned phase
    pub fn owned_partitions(&self) -> IndexSet<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    /// Current count for `key`, 0 if its shard is not resident here
    pub fn count(&self, key: &str) -> u64 {
        self.table.get(key)
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Assign(partition) => {
                if self.partitions.contains_key(&partition) {
                    warn!(partition, "assigned a partition this worker already owns");
                    return;
                }
                info!(partition, "partition assigned, restoring");
                self.partitions.insert(
                    partition,
                    PartitionLoop {
                        phase: PartitionPhase::Restoring,
                        next_offset: 0,
                        dirty_commit: None,
                    },
                );
            }
            WorkerCommand::Revoke { partition, ack } => {
                self.release(partition);
                // the coordinator may have stopped waiting, fine
                let _ = ack.send(());
            }
            WorkerCommand::Query { key, reply } => {
                let _ = reply.send(self.table.get(&key));
            }
            WorkerCommand::Shutdown => {
                info!("shutdown requested");
                self.shutdown = true;
            }
        }
    }

    /// Release ownership of `partition`: complete the in-flight commit
    /// unit if any, then evict the shard.
    fn release(&mut self, partition: PartitionId) {
        let Some(partition_loop) = self.partitions.get_mut(&partition) else {
            warn!(partition, "revoked a partition this worker does not own");
            return;
        };
        partition_loop.phase = PartitionPhase::Revoked;
        if let Some(pending) = partition_loop.dirty_commit {
            // the mutation is already durable in the changelog; flush the
            // offset so the next owner does not re-apply it
            match with_backoff("offset commit", || self.source.commit(partition, pending)) {
                Ok(()) => partition_loop.dirty_commit = None,
                Err(e) => warn!(
                    partition,
                    error = %e,
                    "releasing with uncommitted offset, next owner re-applies one event"
                ),
            }
        }
        self.table.evict(partition);
        self.partitions.shift_remove(&partition);
        info!(partition, "partition revoked");
    }

    /// Move a restoring partition to active: rebuild its shard, then find
    /// the consumption position.
    fn activate(&mut self, partition: PartitionId) -> bool {
        // position first: it can fail transiently and retrying must not
        // repeat a completed restore
        let position = with_backoff("consume position read", || {
            match self.source.committed(partition)? {
                Some(committed) => Ok(committed),
                None => self.source.earliest(partition),
            }
        });
        let next_offset = match position {
            Ok(offset) => offset,
            Err(e) => {
                warn!(partition, error = %e, "consume position unavailable, staying in restore");
                return false;
            }
        };
        if let Err(e) = self.table.restore(partition) {
            // fatal for this shard: never open it for mutation unverified
            error!(partition, error = %e, "shard restore failed, partition stays unassigned");
            self.partitions.shift_remove(&partition);
            return true;
        }
        let partition_loop = self
            .partitions
            .get_mut(&partition)
            .expect("Restoring partition disappeared");
        partition_loop.phase = PartitionPhase::Active;
        partition_loop.next_offset = next_offset;
        info!(partition, next_offset, "partition active");
        true
    }

    /// Consume and count at most one event from `partition`
    fn process_one(&mut self, partition: PartitionId) -> bool {
        let Some(partition_loop) = self.partitions.get(&partition) else {
            return false;
        };
        // a prior commit unit is still open; do not read event N+1 until
        // event N's offset commit is durable
        if let Some(pending) = partition_loop.dirty_commit {
            match with_backoff("offset commit", || self.source.commit(partition, pending)) {
                Ok(()) => {
                    if let Some(l) = self.partitions.get_mut(&partition) {
                        l.dirty_commit = None;
                    }
                }
                Err(e) => {
                    warn!(partition, error = %e, "offset commit still failing");
                    return false;
                }
            }
        }
        let next_offset = match self.partitions.get(&partition) {
            Some(l) => l.next_offset,
            None => return false,
        };
        let payload = match with_backoff("source read", || self.source.read(partition, next_offset))
        {
            Ok(Some(payload)) => payload,
            Ok(None) => return false,
            Err(e) => {
                warn!(partition, error = %e, "source read stalled");
                return false;
            }
        };

        match PageView::from_bytes(&payload) {
            Ok(view) => match self.table.increment(&view.id) {
                Ok(count) => {
                    trace!(partition, offset = next_offset, id = %view.id, count, "counted page view")
                }
                Err(TableError::NotOwner { key, partition: shard }) => {
                    // stale assignment: stop mutating immediately
                    warn!(
                        partition,
                        key = %key,
                        shard,
                        "increment on unowned shard, dropping stale partition"
                    );
                    self.release_stale(partition);
                    return true;
                }
                Err(TableError::Changelog(e)) => {
                    // nothing became durable, the whole unit retries
                    warn!(partition, error = %e, "changelog append stalled, unit will retry");
                    return false;
                }
            },
            Err(e) => {
                // non-retriable, skip the event; dead-lettering is an
                // external collaborator's concern
                error!(partition, offset = next_offset, error = %e, "skipping malformed event");
            }
        }
        self.commit_offset(partition, next_offset + 1);
        true
    }

    /// Close the commit unit by advancing the durable consumer position.
    /// On failure the partition stops reading until the commit lands; the
    /// mutation itself is already durable.
    fn commit_offset(&mut self, partition: PartitionId, next_offset: Offset) {
        let result = with_backoff("offset commit", || self.source.commit(partition, next_offset));
        if let Some(partition_loop) = self.partitions.get_mut(&partition) {
            partition_loop.next_offset = next_offset;
            match result {
                Ok(()) => partition_loop.dirty_commit = None,
                Err(e) => {
                    warn!(partition, error = %e, "offset commit stalled, holding back next read");
                    partition_loop.dirty_commit = Some(next_offset);
                }
            }
        }
    }

    /// Forced local transition on stale ownership, no acknowledgement to
    /// send: the coordinator already moved on
    fn release_stale(&mut self, partition: PartitionId) {
        self.table.evict(partition);
        self.partitions.shift_remove(&partition);
    }

    #[cfg(test)]
    fn evict_shard_for_test(&mut self, partition: PartitionId) {
        self.table.evict(partition);
    }
}
