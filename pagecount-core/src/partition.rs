//! Partitioning functions: routing keys to partitions and dividing
//! partitions over workers.
//!
//! Both functions here are deterministic on their inputs. The cluster has
//! no other source of placement truth, so determinism is what keeps a
//! stream partition and its table shard on the same worker without any
//! coordination beyond membership.

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;

use crate::types::{PartitionId, WorkerId};

/// Map a page id to its partition.
///
/// Identical ids map to the identical partition for the lifetime of the
/// cluster: seahash is stable across processes and restarts, unlike the
/// standard library's default hasher. Changing `partition_count` changes
/// the mapping and requires a full state rebuild.
///
/// **PANIC:** if `partition_count` is zero
pub fn partition_for(id: &str, partition_count: u32) -> PartitionId {
    let hash = seahash::hash(id.as_bytes());
    (hash % u64::from(partition_count)) as PartitionId
}

/// Divide all partitions over the given workers.
///
/// Partitions are dealt in ascending order over the sorted worker set, so
/// every caller computes the same assignment for the same membership. The
/// input stream partition and the table shard share their id and therefore
/// always land on the same worker. An empty worker set yields an empty
/// assignment, the degraded no-owners state.
pub fn divide_partitions(
    partition_count: u32,
    workers: &IndexSet<WorkerId>,
) -> IndexMap<PartitionId, WorkerId> {
    if workers.is_empty() {
        return IndexMap::new();
    }
    let sorted: Vec<WorkerId> = workers.iter().copied().sorted_unstable().collect();
    (0..partition_count)
        .map(|partition| (partition, sorted[partition as usize % sorted.len()]))
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn same_id_same_partition() {
        let first = partition_for("page-42", 8);
        for _ in 0..100 {
            assert_eq!(partition_for("page-42", 8), first);
        }
    }

    #[test]
    fn all_partitions_in_range() {
        for i in 0..1000 {
            let id = format!("page-{i}");
            assert!(partition_for(&id, 8) < 8);
        }
    }

    #[test]
    fn division_ignores_membership_order() {
        let a: IndexSet<WorkerId> = [3, 1, 2].into_iter().collect();
        let b: IndexSet<WorkerId> = [1, 2, 3].into_iter().collect();
        assert_eq!(divide_partitions(16, &a), divide_partitions(16, &b));
    }

    #[test]
    fn division_covers_every_partition() {
        let workers: IndexSet<WorkerId> = [0, 1, 2].into_iter().collect();
        let assignment = divide_partitions(8, &workers);
        assert_eq!(assignment.len(), 8);
        for worker in assignment.values() {
            assert!(workers.contains(worker));
        }
    }

    #[test]
    fn empty_membership_is_degraded_not_fatal() {
        let assignment = divide_partitions(8, &IndexSet::new());
        assert!(assignment.is_empty());
    }

    #[test]
    fn single_worker_owns_everything() {
        let workers: IndexSet<WorkerId> = [7].into_iter().collect();
        let assignment = divide_partitions(4, &workers);
        assert!(assignment.values().all(|w| *w == 7));
    }

    proptest! {
        /// `partition_for` is a pure function of the id: recomputing in a
        /// "restarted" process (a fresh call here) must agree.
        #[test]
        fn partition_stability(id in "\\PC{1,64}", count in 1u32..64) {
            let p = partition_for(&id, count);
            prop_assert!(p < count);
            prop_assert_eq!(partition_for(&id, count), p);
        }
    }
}
