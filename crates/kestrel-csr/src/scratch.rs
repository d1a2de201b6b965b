use std::sync::Arc;

use thiserror::Error;

use kestrel_mem::{
    align_up, AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager,
    PAGE_SIZE_64K,
};

use crate::reuse::ReusePool;

/// Fixed offset added to the scratch base pointer when the address-avoids-zero
/// convention is active: the VFE scratch pointer is then interpreted relative
/// to the general-state base, which is programmed to sit exactly this far
/// below the slot0 allocation.
pub const SCRATCH_SPACE_OFFSET: u64 = 4096;

#[derive(Debug, Error)]
#[error("out of device memory allocating scratch space")]
pub struct ScratchOutOfMemory;

/// Which dependent state a scratch-space change invalidated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScratchDirty {
    pub state_base_address: bool,
    pub vfe_state: bool,
}

impl ScratchDirty {
    pub fn any(&self) -> bool {
        self.state_base_address || self.vfe_state
    }
}

/// Owns the per-thread scratch (slot0) and private-scratch (slot1) GPU
/// allocations and grows them on demand.
///
/// Backing sizes are monotonically non-decreasing within a context lifetime:
/// a smaller request never shrinks or reallocates, so monotonically
/// decreasing workloads cause neither allocation churn nor state
/// reprogramming. Growth swaps in a new allocation, parks the old one for
/// deferred reclamation, and reports both dependent state groups dirty.
pub struct ScratchSpaceController {
    memory: Arc<dyn MemoryManager>,
    root_device_index: u32,
    /// Number of hardware threads the per-thread sizes are scaled by.
    thread_count: u32,
    use_base_offset: bool,
    per_thread_slot0: u32,
    per_thread_slot1: u32,
    slot0: Option<Arc<GraphicsAllocation>>,
    slot1: Option<Arc<GraphicsAllocation>>,
}

impl ScratchSpaceController {
    pub fn new(
        memory: Arc<dyn MemoryManager>,
        root_device_index: u32,
        thread_count: u32,
        use_base_offset: bool,
    ) -> Self {
        Self {
            memory,
            root_device_index,
            thread_count: thread_count.max(1),
            use_base_offset,
            per_thread_slot0: 0,
            per_thread_slot1: 0,
            slot0: None,
            slot1: None,
        }
    }

    pub fn slot0_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.slot0.as_ref()
    }

    pub fn slot1_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.slot1.as_ref()
    }

    pub fn per_thread_slot0_size(&self) -> u32 {
        self.per_thread_slot0
    }

    pub fn per_thread_slot1_size(&self) -> u32 {
        self.per_thread_slot1
    }

    fn backing_size(&self, per_thread: u32) -> usize {
        align_up(per_thread as u64 * self.thread_count as u64, PAGE_SIZE_64K) as usize
    }

    /// Ensure the controller backs at least the given per-thread sizes.
    ///
    /// Returns which dependent state groups must be re-emitted. Requests at
    /// or below the current backing are a no-op with nothing dirty. On
    /// allocation failure nothing is mutated.
    ///
    /// `current_task_count` stamps retired allocations: in-flight work up to
    /// that task count may still reference the old backing.
    pub fn set_required_scratch_space(
        &mut self,
        required_slot0_size: u32,
        required_slot1_size: u32,
        current_task_count: u32,
        reuse: &mut ReusePool,
    ) -> Result<ScratchDirty, ScratchOutOfMemory> {
        let grow_slot0 = required_slot0_size > self.per_thread_slot0;
        let grow_slot1 = required_slot1_size > self.per_thread_slot1;
        if !grow_slot0 && !grow_slot1 {
            return Ok(ScratchDirty::default());
        }

        // Allocate everything first so a failure leaves the controller
        // untouched.
        let new_slot0 = if grow_slot0 {
            Some(self.allocate(AllocationType::Scratch, self.backing_size(required_slot0_size))?)
        } else {
            None
        };
        let new_slot1 = if grow_slot1 {
            Some(self.allocate(
                AllocationType::PrivateScratch,
                self.backing_size(required_slot1_size),
            )?)
        } else {
            None
        };

        if let Some(allocation) = new_slot0 {
            if let Some(old) = self.slot0.replace(allocation) {
                reuse.store(old, current_task_count);
            }
            self.per_thread_slot0 = required_slot0_size;
        }
        if let Some(allocation) = new_slot1 {
            if let Some(old) = self.slot1.replace(allocation) {
                reuse.store(old, current_task_count);
            }
            self.per_thread_slot1 = required_slot1_size;
        }

        Ok(ScratchDirty {
            state_base_address: true,
            vfe_state: true,
        })
    }

    fn allocate(
        &self,
        allocation_type: AllocationType,
        size: usize,
    ) -> Result<Arc<GraphicsAllocation>, ScratchOutOfMemory> {
        self.memory
            .allocate_graphics_memory_with_properties(AllocationProperties::new(
                self.root_device_index,
                size,
                allocation_type,
            ))
            .ok_or(ScratchOutOfMemory)
    }

    /// GPU address programmed as the VFE scratch-space base pointer.
    ///
    /// Under the base-offset convention this is a fixed offset relative to
    /// the general-state base; otherwise it is the slot0 address itself.
    /// Zero when no slot0 scratch exists.
    pub fn scratch_patch_address(&self) -> u64 {
        match (&self.slot0, self.use_base_offset) {
            (Some(_), true) => SCRATCH_SPACE_OFFSET,
            (Some(allocation), false) => allocation.gpu_address(),
            (None, _) => 0,
        }
    }

    /// General-state heap base to program in state-base-address: positioned
    /// so `general_state_base + scratch_patch_address == slot0 address`.
    pub fn general_state_base(&self) -> u64 {
        match (&self.slot0, self.use_base_offset) {
            (Some(allocation), true) => allocation.gpu_address() - SCRATCH_SPACE_OFFSET,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_mem::SystemMemoryManager;

    fn controller(mm: &Arc<SystemMemoryManager>) -> ScratchSpaceController {
        let memory: Arc<dyn MemoryManager> = Arc::clone(mm) as _;
        ScratchSpaceController::new(memory, 0, 64, true)
    }

    #[test]
    fn growth_reallocates_and_marks_both_dirty() {
        let mm = Arc::new(SystemMemoryManager::new());
        let mut reuse = ReusePool::new();
        let mut scratch = controller(&mm);

        let dirty = scratch
            .set_required_scratch_space(1024, 0, 0, &mut reuse)
            .unwrap();
        assert!(dirty.state_base_address);
        assert!(dirty.vfe_state);
        let first_size = scratch.slot0_allocation().unwrap().size();
        assert_eq!(first_size % PAGE_SIZE_64K as usize, 0);

        let dirty = scratch
            .set_required_scratch_space(2048, 0, 3, &mut reuse)
            .unwrap();
        assert!(dirty.any());
        assert!(scratch.slot0_allocation().unwrap().size() >= 2048 * 64);
        // Old backing parked until task count 3 completes.
        assert_eq!(reuse.len(), 1);
    }

    #[test]
    fn shrink_request_is_a_no_op() {
        let mm = Arc::new(SystemMemoryManager::new());
        let mut reuse = ReusePool::new();
        let mut scratch = controller(&mm);

        scratch
            .set_required_scratch_space(4096, 0, 0, &mut reuse)
            .unwrap();
        let backing = scratch.slot0_allocation().unwrap().id();

        let dirty = scratch
            .set_required_scratch_space(1024, 0, 1, &mut reuse)
            .unwrap();
        assert!(!dirty.any());
        assert_eq!(scratch.slot0_allocation().unwrap().id(), backing);
        assert_eq!(scratch.per_thread_slot0_size(), 4096);
        assert!(reuse.is_empty());
    }

    #[test]
    fn slot1_only_request_does_not_allocate_slot0() {
        let mm = Arc::new(SystemMemoryManager::new());
        let mut reuse = ReusePool::new();
        let mut scratch = controller(&mm);

        let dirty = scratch
            .set_required_scratch_space(0, 2048, 0, &mut reuse)
            .unwrap();
        assert!(dirty.any());
        assert!(scratch.slot0_allocation().is_none());
        assert!(scratch.slot1_allocation().is_some());
        assert_eq!(scratch.scratch_patch_address(), 0);
    }

    #[test]
    fn slots_grow_independently() {
        let mm = Arc::new(SystemMemoryManager::new());
        let mut reuse = ReusePool::new();
        let mut scratch = controller(&mm);

        scratch
            .set_required_scratch_space(1024, 1024, 0, &mut reuse)
            .unwrap();
        let slot0_id = scratch.slot0_allocation().unwrap().id();

        scratch
            .set_required_scratch_space(1024, 4096, 1, &mut reuse)
            .unwrap();
        assert_eq!(scratch.slot0_allocation().unwrap().id(), slot0_id);
        assert_eq!(scratch.per_thread_slot1_size(), 4096);
    }

    #[test]
    fn patch_address_follows_base_offset_convention() {
        let mm = Arc::new(SystemMemoryManager::new());
        let mut reuse = ReusePool::new();
        let mut scratch = controller(&mm);

        scratch
            .set_required_scratch_space(1024, 0, 0, &mut reuse)
            .unwrap();
        let slot0_address = scratch.slot0_allocation().unwrap().gpu_address();
        assert_eq!(scratch.scratch_patch_address(), SCRATCH_SPACE_OFFSET);
        assert_eq!(
            scratch.general_state_base() + scratch.scratch_patch_address(),
            slot0_address
        );
    }

    #[test]
    fn allocation_failure_leaves_state_untouched() {
        struct Oom;
        impl MemoryManager for Oom {
            fn allocate_graphics_memory_with_properties(
                &self,
                _properties: AllocationProperties,
            ) -> Option<Arc<GraphicsAllocation>> {
                None
            }
            fn free_graphics_memory(&self, _allocation: Arc<GraphicsAllocation>) {}
            fn internal_heap_base_address(&self, _r: u32, _l: bool) -> u64 {
                0
            }
        }

        let mut reuse = ReusePool::new();
        let mut scratch = ScratchSpaceController::new(Arc::new(Oom), 0, 64, true);
        assert!(scratch
            .set_required_scratch_space(1024, 0, 0, &mut reuse)
            .is_err());
        assert!(scratch.slot0_allocation().is_none());
        assert_eq!(scratch.per_thread_slot0_size(), 0);
    }
}
