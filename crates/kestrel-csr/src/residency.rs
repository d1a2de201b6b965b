use std::sync::Arc;

use kestrel_mem::{ContextId, GraphicsAllocation};

/// Per-submission residency bookkeeping for one execution context.
///
/// Collects the set of allocations the next submission must make resident,
/// and releases them once that submission's flush has been handed to
/// hardware. Residency state on the allocations themselves is keyed by
/// context id, so independent receivers never interfere.
pub struct ResidencyTracker {
    context_id: ContextId,
    resident: Vec<Arc<GraphicsAllocation>>,
    /// Total bytes newly made resident since the last submission; feeds the
    /// implicit-flush budget check.
    pending_bytes: usize,
    /// Set when an allocation that was never used before shows up; batched
    /// mode uses this as an implicit-flush trigger.
    new_resources: bool,
}

impl ResidencyTracker {
    pub fn new(context_id: ContextId) -> Self {
        Self {
            context_id,
            resident: Vec::with_capacity(20),
            pending_bytes: 0,
            new_resources: false,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn pending(&self) -> &[Arc<GraphicsAllocation>] {
        &self.resident
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// True once an allocation never seen before was made resident; cleared
    /// by [`take_new_resources`](Self::take_new_resources).
    pub fn take_new_resources(&mut self) -> bool {
        std::mem::take(&mut self.new_resources)
    }

    /// Mark `allocation` resident for the pending submission
    /// (`pending_task_count` = the task count the submission will carry).
    ///
    /// Idempotent: a second call for the same pending task count only
    /// refreshes the stamp.
    pub fn make_resident(
        &mut self,
        allocation: &Arc<GraphicsAllocation>,
        pending_task_count: u32,
    ) {
        if allocation.is_residency_task_count_below(pending_task_count, self.context_id) {
            if allocation.task_count(self.context_id).is_none() {
                self.new_resources = true;
            }
            if !allocation.is_resident(self.context_id) {
                self.pending_bytes += allocation.size();
            }
            self.resident.push(Arc::clone(allocation));
            allocation.update_task_count(pending_task_count, self.context_id);
        }
        allocation.update_residency_task_count(pending_task_count, self.context_id);
    }

    /// Hand the pending set to a submission. The tracker is left empty; the
    /// caller owns releasing the pack after the flush (or re-inserting it if
    /// the flush failed).
    pub fn take_pending(&mut self) -> Vec<Arc<GraphicsAllocation>> {
        self.pending_bytes = 0;
        std::mem::take(&mut self.resident)
    }

    /// Put a pack back after a failed submission so residency bookkeeping
    /// survives for a retry.
    pub fn restore_pending(&mut self, pack: Vec<Arc<GraphicsAllocation>>) {
        for allocation in &pack {
            self.pending_bytes += allocation.size();
        }
        self.resident = pack;
    }

    /// Release residency for every allocation in `pack`, preserving their
    /// task-count stamps so waiters can still validate completion.
    pub fn make_pack_non_resident(&self, pack: &[Arc<GraphicsAllocation>]) {
        for allocation in pack {
            allocation.release_residency(self.context_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_mem::{
        AllocationProperties, AllocationType, MemoryManager, SystemMemoryManager,
    };

    fn buffer(mm: &SystemMemoryManager, size: usize) -> Arc<GraphicsAllocation> {
        mm.allocate_graphics_memory_with_properties(AllocationProperties::new(
            0,
            size,
            AllocationType::Buffer,
        ))
        .unwrap()
    }

    #[test]
    fn make_resident_is_idempotent_per_task_count() {
        let mm = SystemMemoryManager::new();
        let mut tracker = ResidencyTracker::new(0);
        let a = buffer(&mm, 4096);

        tracker.make_resident(&a, 1);
        tracker.make_resident(&a, 1);
        assert_eq!(tracker.pending().len(), 1);
        assert_eq!(a.residency_task_count(0), Some(1));

        // A later submission re-registers the allocation at the new count.
        let pack = tracker.take_pending();
        tracker.make_pack_non_resident(&pack);
        tracker.make_resident(&a, 2);
        assert_eq!(a.residency_task_count(0), Some(2));
    }

    #[test]
    fn non_resident_pack_keeps_stamps() {
        let mm = SystemMemoryManager::new();
        let mut tracker = ResidencyTracker::new(7);
        let a = buffer(&mm, 4096);

        tracker.make_resident(&a, 3);
        let pack = tracker.take_pending();
        tracker.make_pack_non_resident(&pack);

        assert!(!a.is_resident(7));
        assert_eq!(a.residency_task_count(7), Some(3));
    }

    #[test]
    fn new_resources_flag_fires_once_per_new_allocation() {
        let mm = SystemMemoryManager::new();
        let mut tracker = ResidencyTracker::new(0);
        let a = buffer(&mm, 4096);

        tracker.make_resident(&a, 1);
        assert!(tracker.take_new_resources());
        assert!(!tracker.take_new_resources());

        let pack = tracker.take_pending();
        tracker.make_pack_non_resident(&pack);
        tracker.make_resident(&a, 2);
        assert!(!tracker.take_new_resources());
    }

    #[test]
    fn restore_pending_supports_retry_after_failed_flush() {
        let mm = SystemMemoryManager::new();
        let mut tracker = ResidencyTracker::new(0);
        let a = buffer(&mm, 4096);
        tracker.make_resident(&a, 1);

        let pack = tracker.take_pending();
        assert_eq!(tracker.pending().len(), 0);
        tracker.restore_pending(pack);
        assert_eq!(tracker.pending().len(), 1);
        assert!(a.is_resident(0));
    }

    #[test]
    fn pending_bytes_counts_only_newly_resident() {
        let mm = SystemMemoryManager::new();
        let mut tracker = ResidencyTracker::new(0);
        let a = buffer(&mm, 4096);

        tracker.make_resident(&a, 1);
        assert_eq!(tracker.pending_bytes(), 4096);
        tracker.make_resident(&a, 1);
        assert_eq!(tracker.pending_bytes(), 4096);
    }
}
