use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use kestrel_mem::GraphicsAllocation;

use crate::flush_stamp::FlushStamp;
use crate::stream::StreamLocation;
use crate::submit::BatchBuffer;

/// One recorded, not-yet-submitted flush.
///
/// Produced by the receiver in batched dispatch mode; consumed by
/// `flush_batched_submissions`, which chains consecutive buffers into a
/// single hardware submission.
pub struct CommandBuffer {
    pub batch: BatchBuffer,
    /// Allocations this flush made resident; released only after the buffer
    /// reaches hardware.
    pub surfaces: Vec<Arc<GraphicsAllocation>>,
    pub task_count: u32,
    pub flush_stamp: FlushStamp,
    /// Ordering pipe control that becomes redundant once a successor is
    /// chained behind this buffer; the drain may noop it.
    pub erasable_pipe_control: Option<StreamLocation>,
    /// Tag-update pipe control; preserved by the drain (only its dc-flush
    /// bit may be patched).
    pub epilogue_pipe_control: Option<StreamLocation>,
    /// End marker, overwritten with a batch-buffer start when a successor
    /// is chained.
    pub end_marker: StreamLocation,
}

/// FIFO of recorded command buffers awaiting a coalesced submission.
///
/// The aggregator never touches hardware itself: it hands out packages of
/// consecutive buffers whose combined unique-surface footprint fits a memory
/// budget, and takes failed packages back so residency bookkeeping survives
/// a retry.
pub struct SubmissionAggregator {
    queue: VecDeque<CommandBuffer>,
    recorded_surface_bytes: usize,
}

impl SubmissionAggregator {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            recorded_surface_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Rough footprint of everything recorded, used as an implicit-flush
    /// trigger. Counts each surface once per recording.
    pub fn recorded_surface_bytes(&self) -> usize {
        self.recorded_surface_bytes
    }

    pub fn record(&mut self, buffer: CommandBuffer) {
        self.recorded_surface_bytes += buffer
            .surfaces
            .iter()
            .map(|s| s.size())
            .sum::<usize>();
        self.queue.push_back(buffer);
    }

    /// Take the next run of buffers to chain into one submission.
    ///
    /// Buffers are taken in FIFO order while the package's unique-surface
    /// footprint stays within `budget_bytes` and the package holds at most
    /// `max_buffers` (the longest chain the submitter can execute); the first
    /// buffer is always taken even if it alone exceeds the budget. Returns
    /// `None` when the queue is empty.
    pub fn pop_package(
        &mut self,
        budget_bytes: usize,
        max_buffers: usize,
    ) -> Option<Vec<CommandBuffer>> {
        let first = self.queue.pop_front()?;
        let mut seen: BTreeSet<u64> = BTreeSet::new();
        let mut footprint = 0usize;
        let mut account = |buffer: &CommandBuffer, seen: &mut BTreeSet<u64>| {
            buffer
                .surfaces
                .iter()
                .filter(|s| seen.insert(s.id()))
                .map(|s| s.size())
                .sum::<usize>()
        };

        footprint += account(&first, &mut seen);
        self.recorded_surface_bytes = self
            .recorded_surface_bytes
            .saturating_sub(first.surfaces.iter().map(|s| s.size()).sum());
        let mut package = vec![first];

        while let Some(next) = self.queue.front() {
            if package.len() >= max_buffers.max(1) {
                break;
            }
            let added = account(next, &mut seen);
            if footprint + added > budget_bytes {
                break;
            }
            footprint += added;
            let next = match self.queue.pop_front() {
                Some(buffer) => buffer,
                None => break,
            };
            self.recorded_surface_bytes = self
                .recorded_surface_bytes
                .saturating_sub(next.surfaces.iter().map(|s| s.size()).sum());
            package.push(next);
        }
        Some(package)
    }

    /// Put a package back at the head of the queue after a failed
    /// submission, preserving FIFO order.
    pub fn reinsert_front(&mut self, package: Vec<CommandBuffer>) {
        for buffer in package.into_iter().rev() {
            self.recorded_surface_bytes += buffer
                .surfaces
                .iter()
                .map(|s| s.size())
                .sum::<usize>();
            self.queue.push_front(buffer);
        }
    }
}

impl Default for SubmissionAggregator {
    fn default() -> Self {
        Self::new()
    }
}
