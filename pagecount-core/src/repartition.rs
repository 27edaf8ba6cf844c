//! Repartitioning: republishing input events keyed by page id.
//!
//! The input topic arrives partitioned however the producers felt like.
//! Counting shards by page id, so before aggregation every event is copied
//! into an intermediate topic whose partition is a pure function of the id.
//! Only from that topic onwards does the co-location invariant hold.

use std::sync::Arc;

use tracing::{error, trace};

use crate::log::{with_backoff, EventLog, TransportError};
use crate::partition::partition_for;
use crate::record::PageView;
use crate::types::{Offset, PartitionId};

/// Copies events from the input topic into the id-keyed intermediate topic.
///
/// Consumption is sequential per input partition, which preserves event
/// order within an output partition for events that share an input
/// partition. No ordering is guaranteed across partitions. Routing is a
/// pure function of the event id, so re-publishing after a failed attempt
/// is idempotent with respect to placement.
pub struct Repartitioner {
    input: Arc<dyn EventLog>,
    output: Arc<dyn EventLog>,
    /// next input offset per input partition, None until recovered from
    /// the committed position
    cursors: Vec<Option<Offset>>,
}

impl Repartitioner {
    /// Create a repartitioner copying `input` into `output`
    pub fn new(input: Arc<dyn EventLog>, output: Arc<dyn EventLog>) -> Self {
        let cursors = vec![None; input.partition_count() as usize];
        Self {
            input,
            output,
            cursors,
        }
    }

    /// The output partition for a page id: `stable_hash(id) mod
    /// partition_count`. Pure, stable across calls and restarts.
    pub fn target_partition(&self, id: &str) -> PartitionId {
        partition_for(id, self.output.partition_count())
    }

    /// Forward at most one event from every input partition. Returns the
    /// number of events moved; 0 means the input is drained.
    pub fn step(&mut self) -> usize {
        let mut moved = 0;
        for partition in 0..self.cursors.len() as u32 {
            match self.forward_one(partition) {
                Ok(true) => moved += 1,
                Ok(false) => (),
                // retries exhausted, leave the cursor, next step retries
                // the same event
                Err(e) => error!(partition, error = %e, "repartition stalled"),
            }
        }
        moved
    }

    fn forward_one(&mut self, partition: PartitionId) -> Result<bool, TransportError> {
        let offset = match self.cursors[partition as usize] {
            Some(offset) => offset,
            None => {
                let recovered = with_backoff("committed offset read", || {
                    self.input.committed(partition)
                })?
                .unwrap_or(0);
                self.cursors[partition as usize] = Some(recovered);
                recovered
            }
        };

        let payload = match with_backoff("input read", || self.input.read(partition, offset))? {
            Some(payload) => payload,
            None => return Ok(false),
        };

        match PageView::from_bytes(&payload) {
            Ok(view) => {
                let target = self.target_partition(&view.id);
                // the original payload is forwarded untouched; decoding
                // only determines the route
                with_backoff("repartition publish", || {
                    self.output.append(target, &payload)
                })?;
                trace!(partition, offset, target, id = %view.id, "repartitioned event");
            }
            Err(e) => {
                // non-retriable: drop the event, dead-lettering is the
                // operator's collaborator, not ours
                error!(partition, offset, error = %e, "skipping malformed input event");
            }
        }

        with_backoff("input offset commit", || {
            self.input.commit(partition, offset + 1)
        })?;
        self.cursors[partition as usize] = Some(offset + 1);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::testing::FlakyLog;

    fn setup(input_parts: u32, output_parts: u32) -> (MemoryLog, MemoryLog, Repartitioner) {
        let input = MemoryLog::new("views", input_parts);
        let output = MemoryLog::new("views-repartition", output_parts);
        let repartitioner =
            Repartitioner::new(Arc::new(input.clone()), Arc::new(output.clone()));
        (input, output, repartitioner)
    }

    fn drain(repartitioner: &mut Repartitioner) {
        while repartitioner.step() > 0 {}
    }

    #[test]
    fn routes_by_id_not_input_partition() {
        let (input, output, mut repartitioner) = setup(2, 4);
        // the same page id lands on both input partitions
        input.append(0, &PageView::new("p1", "u1").to_bytes()).unwrap();
        input.append(1, &PageView::new("p1", "u2").to_bytes()).unwrap();
        drain(&mut repartitioner);

        let target = repartitioner.target_partition("p1");
        assert_eq!(output.next_offset(target).unwrap(), 2);
        for p in (0..4).filter(|p| *p != target) {
            assert_eq!(output.next_offset(p).unwrap(), 0);
        }
    }

    #[test]
    fn preserves_order_within_a_partition() {
        let (input, output, mut repartitioner) = setup(1, 1);
        for user in ["u1", "u2", "u3"] {
            input.append(0, &PageView::new("p1", user).to_bytes()).unwrap();
        }
        drain(&mut repartitioner);

        let users: Vec<String> = (0..3)
            .map(|o| {
                PageView::from_bytes(&output.read(0, o).unwrap().unwrap())
                    .unwrap()
                    .user
            })
            .collect();
        assert_eq!(users, ["u1", "u2", "u3"]);
    }

    #[test]
    fn commits_input_offsets_as_it_goes() {
        let (input, _, mut repartitioner) = setup(1, 1);
        input.append(0, &PageView::new("p1", "u1").to_bytes()).unwrap();
        input.append(0, &PageView::new("p2", "u1").to_bytes()).unwrap();
        drain(&mut repartitioner);
        assert_eq!(input.committed(0).unwrap(), Some(2));
    }

    #[test]
    fn resumes_from_committed_offset() {
        let (input, output, _) = setup(1, 1);
        input.append(0, &PageView::new("p1", "u1").to_bytes()).unwrap();
        input.append(0, &PageView::new("p1", "u2").to_bytes()).unwrap();
        input.commit(0, 1).unwrap();

        // a freshly started repartitioner must not re-publish event 0
        let mut restarted =
            Repartitioner::new(Arc::new(input.clone()), Arc::new(output.clone()));
        drain(&mut restarted);
        assert_eq!(output.next_offset(0).unwrap(), 1);
        let forwarded = PageView::from_bytes(&output.read(0, 0).unwrap().unwrap()).unwrap();
        assert_eq!(forwarded.user, "u2");
    }

    #[test]
    fn skips_malformed_events_and_moves_on() {
        let (input, output, mut repartitioner) = setup(1, 1);
        input.append(0, b"{\"id\": 12}").unwrap();
        input.append(0, &PageView::new("p1", "u1").to_bytes()).unwrap();
        drain(&mut repartitioner);

        assert_eq!(output.next_offset(0).unwrap(), 1);
        assert_eq!(input.committed(0).unwrap(), Some(2));
    }

    #[test]
    fn publish_failure_is_retried_with_the_same_event() {
        let input = MemoryLog::new("views", 1);
        let output = FlakyLog::new(MemoryLog::new("views-repartition", 1), 2);
        input.append(0, &PageView::new("p1", "u1").to_bytes()).unwrap();

        let mut repartitioner =
            Repartitioner::new(Arc::new(input.clone()), Arc::new(output.clone()));
        drain(&mut repartitioner);

        // retried transparently within the step, exactly one copy published
        assert_eq!(output.next_offset(0).unwrap(), 1);
        assert_eq!(input.committed(0).unwrap(), Some(1));
    }

    #[test]
    fn target_is_stable_across_restarts() {
        let (_, _, repartitioner) = setup(1, 8);
        let first = repartitioner.target_partition("p1");
        let (_, _, restarted) = setup(1, 8);
        assert_eq!(restarted.target_partition("p1"), first);
    }
}
