//! The rebalance coordinator: partition ownership across the worker pool.
//!
//! The coordinator owns the [PartitionAssignment](Coordinator::assignment)
//! and reacts to membership changes. Its one hard guarantee is the
//! revoke-before-assign handshake: a partition is never offered to its new
//! owner before the old owner acknowledged releasing it, so no two workers
//! ever hold the same shard. Because a stream partition and its table shard
//! share an id, a single assignment keeps them co-located by construction.
//!
//! The coordinator degrades rather than aborts: an unacknowledged
//! revocation parks that partition (fewer active partitions) and the rest
//! of the cluster keeps processing.

mod messages;

use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::partition::divide_partitions;
use crate::types::{PartitionId, WorkerId};

pub use self::messages::{MembershipChange, WorkerCommand};
use self::messages::CoordinatorRequest;

const DEFAULT_REVOKE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised when a membership change cannot be applied
#[derive(Debug, Error)]
pub enum RebalanceError {
    /// Joining worker id is already a member
    #[error("worker {0} is already a member")]
    AlreadyJoined(WorkerId),
    /// Leaving/crashed worker id is not a member
    #[error("worker {0} is not a member")]
    UnknownWorker(WorkerId),
    /// The coordinator loop has shut down
    #[error("coordinator is not running")]
    NotRunning,
}

/// Maintains membership and the partition→worker assignment.
///
/// This is the synchronous core; production code runs it on its own thread
/// via [Coordinator::spawn] and talks to it through a [CoordinatorHandle].
pub struct Coordinator {
    partition_count: u32,
    members: IndexMap<WorkerId, flume::Sender<WorkerCommand>>,
    assignment: IndexMap<PartitionId, WorkerId>,
    revoke_ack_timeout: Duration,
}

impl Coordinator {
    /// Create a coordinator for a topology of `partition_count` partitions
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            members: IndexMap::new(),
            assignment: IndexMap::new(),
            revoke_ack_timeout: DEFAULT_REVOKE_ACK_TIMEOUT,
        }
    }

    /// How long to wait for a revocation acknowledgement before parking the
    /// partition instead of reassigning it
    pub fn set_revoke_ack_timeout(&mut self, timeout: Duration) {
        self.revoke_ack_timeout = timeout;
    }

    /// The current partition→worker assignment. Identical for a stream
    /// partition and its co-located table shard.
    pub fn assignment(&self) -> &IndexMap<PartitionId, WorkerId> {
        &self.assignment
    }

    /// Apply a membership change and rebalance partition ownership.
    ///
    /// Blocks until every live worker losing a partition has acknowledged
    /// the revocation (or the ack timeout passed) and all resulting
    /// assignments are sent.
    pub fn apply(&mut self, change: MembershipChange) -> Result<(), RebalanceError> {
        // channel of a gracefully leaving worker, kept around so its
        // partitions are still revoked through the handshake
        let mut departing: Option<(WorkerId, flume::Sender<WorkerCommand>)> = None;
        match change {
            MembershipChange::Join { worker, control } => {
                if self.members.contains_key(&worker) {
                    return Err(RebalanceError::AlreadyJoined(worker));
                }
                info!(worker, "worker joined");
                self.members.insert(worker, control);
            }
            MembershipChange::Leave(worker) => {
                let control = self
                    .members
                    .shift_remove(&worker)
                    .ok_or(RebalanceError::UnknownWorker(worker))?;
                info!(worker, "worker leaving");
                departing = Some((worker, control));
            }
            MembershipChange::Crashed(worker) => {
                self.members
                    .shift_remove(&worker)
                    .ok_or(RebalanceError::UnknownWorker(worker))?;
                warn!(worker, "worker crash detected");
            }
        }
        self.rebalance(departing);
        Ok(())
    }

    /// Recompute the assignment for the current membership and migrate
    /// ownership, revoking before assigning per partition.
    fn rebalance(&mut self, departing: Option<(WorkerId, flume::Sender<WorkerCommand>)>) {
        let workers: IndexSet<WorkerId> = self.members.keys().copied().collect();
        let target = divide_partitions(self.partition_count, &workers);
        info!(
            workers = workers.len(),
            partitions = self.partition_count,
            "rebalancing"
        );

        // phase one: revoke every moved partition from its current owner
        let mut pending: Vec<(PartitionId, flume::Receiver<()>)> = Vec::new();
        for (partition, old_owner) in self.assignment.iter() {
            if target.get(partition) == Some(old_owner) {
                continue;
            }
            let control = self.members.get(old_owner).or_else(|| {
                departing
                    .as_ref()
                    .filter(|(id, _)| id == old_owner)
                    .map(|(_, control)| control)
            });
            let Some(control) = control else {
                // crash-detected owner: no process left to release the shard
                continue;
            };
            let (ack_tx, ack_rx) = flume::bounded(1);
            match control.send(WorkerCommand::Revoke {
                partition: *partition,
                ack: ack_tx,
            }) {
                Ok(()) => pending.push((*partition, ack_rx)),
                // a closed channel means the worker is gone, same as a crash
                Err(_) => warn!(partition, worker = old_owner, "revoke target is gone"),
            }
        }

        // partitions whose revocation went unacknowledged stay with their
        // old owner and are not reassigned this round
        let mut parked: IndexSet<PartitionId> = IndexSet::new();
        for (partition, ack_rx) in pending {
            match ack_rx.recv_timeout(self.revoke_ack_timeout) {
                Ok(()) => (),
                Err(flume::RecvTimeoutError::Disconnected) => {
                    warn!(partition, "worker died during revocation, treating as released");
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    error!(
                        partition,
                        "revocation unacknowledged, parking partition until the next rebalance"
                    );
                    parked.insert(partition);
                }
            }
        }

        // phase two: hand every released partition to its new owner
        let mut next: IndexMap<PartitionId, WorkerId> = IndexMap::new();
        for partition in 0..self.partition_count {
            let old = self.assignment.get(&partition).copied();
            if parked.contains(&partition) {
                if let Some(old_owner) = old {
                    next.insert(partition, old_owner);
                }
                continue;
            }
            let Some(new_owner) = target.get(&partition).copied() else {
                // degraded: no workers to own this partition
                continue;
            };
            if old == Some(new_owner) {
                next.insert(partition, new_owner);
                continue;
            }
            let Some(control) = self.members.get(&new_owner) else {
                continue;
            };
            if control.send(WorkerCommand::Assign(partition)).is_ok() {
                next.insert(partition, new_owner);
            } else {
                warn!(partition, worker = new_owner, "assign target is gone");
            }
        }
        self.assignment = next;
    }

    /// Run the coordinator on its own thread, returning a cloneable handle
    /// for membership requests
    pub fn spawn(partition_count: u32) -> (CoordinatorHandle, std::thread::JoinHandle<()>) {
        let (requests_tx, requests_rx) = flume::bounded(16);
        let coordinator = Coordinator::new(partition_count);
        let thread = std::thread::spawn(move || coordinator_loop(requests_rx, coordinator));
        (
            CoordinatorHandle {
                requests: requests_tx,
            },
            thread,
        )
    }
}

fn coordinator_loop(requests: flume::Receiver<CoordinatorRequest>, mut coordinator: Coordinator) {
    info!("rebalance coordinator running");
    while let Ok(request) = requests.recv() {
        match request {
            CoordinatorRequest::Membership { change, callback } => {
                let result = coordinator.apply(change);
                // requester may have given up waiting, that is fine
                let _ = callback.send(result);
            }
            CoordinatorRequest::Assignment { callback } => {
                let _ = callback.send(coordinator.assignment.clone());
            }
        }
    }
    info!("rebalance coordinator stopped");
}

/// Client for a spawned [Coordinator]. Cheap to clone; all clones talk to
/// the same coordinator loop.
#[derive(Clone)]
pub struct CoordinatorHandle {
    requests: flume::Sender<CoordinatorRequest>,
}

impl CoordinatorHandle {
    /// Register a worker and rebalance. Returns once the worker received
    /// its initial assignments.
    pub fn worker_join(
        &self,
        worker: WorkerId,
        control: flume::Sender<WorkerCommand>,
    ) -> Result<(), RebalanceError> {
        self.membership(MembershipChange::Join { worker, control })
    }

    /// Deregister a live worker gracefully, revoking its partitions first
    pub fn worker_leave(&self, worker: WorkerId) -> Result<(), RebalanceError> {
        self.membership(MembershipChange::Leave(worker))
    }

    /// Report a worker as crash-detected; its partitions are reassigned
    /// without a revocation handshake
    pub fn worker_crashed(&self, worker: WorkerId) -> Result<(), RebalanceError> {
        self.membership(MembershipChange::Crashed(worker))
    }

    /// Snapshot of the current partition assignment
    pub fn assignment(&self) -> Result<IndexMap<PartitionId, WorkerId>, RebalanceError> {
        let (callback, reply) = tokio::sync::oneshot::channel();
        self.requests
            .send(CoordinatorRequest::Assignment { callback })
            .map_err(|_| RebalanceError::NotRunning)?;
        reply.blocking_recv().map_err(|_| RebalanceError::NotRunning)
    }

    fn membership(&self, change: MembershipChange) -> Result<(), RebalanceError> {
        let (callback, reply) = tokio::sync::oneshot::channel();
        self.requests
            .send(CoordinatorRequest::Membership { change, callback })
            .map_err(|_| RebalanceError::NotRunning)?;
        reply
            .blocking_recv()
            .map_err(|_| RebalanceError::NotRunning)?
    }
}
