//! Identifier types shared across the crate.

/// Uniquely identifies a worker process in the cluster
pub type WorkerId = u64;

/// Identifies one partition of a topic. Stream partitions and count table
/// shards share this id, which is what makes them co-locatable.
pub type PartitionId = u32;

/// Position of a record within a log partition
pub type Offset = u64;
