//! Typed messages exchanged between the coordinator and workers

use indexmap::IndexMap;
use tokio::sync::oneshot;

use crate::types::{PartitionId, WorkerId};

use super::RebalanceError;

/// Commands the coordinator sends down a worker's control channel.
///
/// A worker services its control channel before touching any partition, so
/// ownership changes always take effect ahead of further consumption.
pub enum WorkerCommand {
    /// Gain ownership of a partition: restore its table shard from the
    /// changelog, then start consuming
    Assign(PartitionId),
    /// Lose ownership: complete any in-flight commit unit, evict the
    /// shard, then acknowledge. The coordinator holds back reassignment
    /// until the acknowledgement arrives.
    Revoke {
        /// Partition being taken away
        partition: PartitionId,
        /// Acknowledged once the shard is released
        ack: flume::Sender<()>,
    },
    /// Interactive count lookup; non-resident shards answer 0
    Query {
        /// Page id to look up
        key: String,
        /// Receives the current count
        reply: flume::Sender<u64>,
    },
    /// Finish in-flight work and stop consuming
    Shutdown,
}

/// A change to cluster membership, the only trigger for rebalancing
pub enum MembershipChange {
    /// A worker process came up and can take partitions
    Join {
        /// Id of the joining worker
        worker: WorkerId,
        /// Control channel into the worker's scheduler
        control: flume::Sender<WorkerCommand>,
    },
    /// A worker leaves gracefully: it is still running and will
    /// acknowledge revocations before its partitions move
    Leave(WorkerId),
    /// A worker was detected dead. Nothing is revoked from it, there is no
    /// process left to write.
    Crashed(WorkerId),
}

/// Requests accepted by the spawned coordinator loop
pub(crate) enum CoordinatorRequest {
    /// Apply a membership change and rebalance
    Membership {
        change: MembershipChange,
        callback: oneshot::Sender<Result<(), RebalanceError>>,
    },
    /// Snapshot the current partition assignment
    Assignment {
        callback: oneshot::Sender<IndexMap<PartitionId, WorkerId>>,
    },
}
