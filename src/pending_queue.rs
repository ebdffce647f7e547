use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::buffers::slot_pool::SlotIndex;
use crate::fabric::{DataDesc, FabricAddr, FabricError};
use crate::request::RequestKey;
use crate::tag::Tag;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PendingOp {
    Send { dest: FabricAddr },
    Recv { src: FabricAddr, ignore: u64 },
}

/// Everything needed to repeat a post that the fabric did not accept, without going back to
///  the caller
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct PendingEntry {
    pub request: RequestKey,
    /// slot in the owning sender's pending entry pool, if the owner has one
    pub pending_slot: Option<SlotIndex>,
    pub tag: Tag,
    pub data: DataDesc,
    pub op: PendingOp,
}

/// Posts that failed with a transient error, in submission order. The queue is shared by all
///  communicators of an engine since they share one endpoint and its resource limits.
#[derive(Default)]
pub(crate) struct PendingQueue {
    entries: VecDeque<PendingEntry>,
}

impl PendingQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enqueue(&mut self, entry: PendingEntry) {
        debug!("deferring post for {:?}, {} entries queued before it", entry.request, self.entries.len());
        self.entries.push_back(entry);
    }

    /// Retries queued posts oldest first, until the queue is empty or the fabric reports a
    ///  transient failure again. Later entries are never attempted while an earlier one is
    ///  blocked, so no stream's messages are reordered.
    ///
    /// Entries that were posted (`Ok`) or failed permanently (`Err` with the provider code) are
    ///  removed from the queue and handed to `on_done`. Returns the number of removed entries.
    pub fn drain_once(
        &mut self,
        mut repost: impl FnMut(&PendingEntry) -> Result<(), FabricError>,
        mut on_done: impl FnMut(PendingEntry, Result<(), i32>),
    ) -> usize {
        let mut num_done = 0;

        while let Some(head) = self.entries.front() {
            let result = match repost(head) {
                Ok(()) => Ok(()),
                Err(FabricError::Again) => {
                    trace!("repost of {:?} deferred again, {} entries remain queued", head.request, self.entries.len());
                    break;
                }
                Err(FabricError::Failed(code)) => Err(code),
            };

            if let Some(entry) = self.entries.pop_front() {
                trace!("pending entry for {:?} done: {:?}", entry.request, result);
                on_done(entry, result);
                num_done += 1;
            }
        }

        num_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommKey;
    use rstest::rstest;

    fn entry(n: u32) -> PendingEntry {
        PendingEntry {
            request: RequestKey { comm: CommKey::from_raw(0), slot: SlotIndex::from_raw(n) },
            pending_slot: None,
            tag: Tag::from_raw(1),
            data: unsafe { DataDesc::from_raw_parts(std::ptr::null_mut(), 0) },
            op: PendingOp::Send { dest: FabricAddr::from_raw(0) },
        }
    }

    fn slot_of(e: &PendingEntry) -> u32 {
        e.request.slot.to_raw()
    }

    /// `script` holds the provider's answers for consecutive repost attempts
    #[rstest]
    #[case::empty(0, vec![], vec![], vec![], 0)]
    #[case::all_succeed(3, vec![Ok(()), Ok(()), Ok(())], vec![0, 1, 2], vec![(0, Ok(())), (1, Ok(())), (2, Ok(()))], 0)]
    #[case::head_blocked(3, vec![Err(FabricError::Again)], vec![0], vec![], 3)]
    #[case::second_blocked(3, vec![Ok(()), Err(FabricError::Again)], vec![0, 1], vec![(0, Ok(()))], 2)]
    #[case::permanent_failure_is_dequeued(3, vec![Err(FabricError::Failed(5)), Ok(()), Err(FabricError::Again)], vec![0, 1, 2], vec![(0, Err(5)), (1, Ok(()))], 1)]
    fn test_drain_once(
        #[case] num_entries: u32,
        #[case] script: Vec<Result<(), FabricError>>,
        #[case] expected_attempts: Vec<u32>,
        #[case] expected_done: Vec<(u32, Result<(), i32>)>,
        #[case] expected_remaining: usize,
    ) {
        let mut queue = PendingQueue::default();
        for n in 0..num_entries {
            queue.enqueue(entry(n));
        }

        let mut script = script.into_iter();
        let mut attempts = Vec::new();
        let mut done = Vec::new();

        let num_done = queue.drain_once(
            |e| {
                attempts.push(slot_of(e));
                script.next().expect("unexpected repost attempt")
            },
            |e, result| done.push((slot_of(&e), result)),
        );

        assert_eq!(attempts, expected_attempts);
        assert_eq!(num_done, expected_done.len());
        assert_eq!(done, expected_done);
        assert_eq!(queue.len(), expected_remaining);
    }

    #[test]
    fn test_fifo_across_drains() {
        let mut queue = PendingQueue::default();
        for n in 0..4 {
            queue.enqueue(entry(n));
        }

        let mut order = Vec::new();
        let mut budget = 1;
        while !queue.is_empty() {
            let mut remaining = budget;
            queue.drain_once(
                |_| if remaining > 0 { remaining -= 1; Ok(()) } else { Err(FabricError::Again) },
                |e, _| order.push(slot_of(&e)),
            );
            budget += 1;
        }

        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
