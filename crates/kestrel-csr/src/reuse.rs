use std::sync::Arc;

use kestrel_mem::{AllocationType, GraphicsAllocation, MemoryManager};

/// Deferred-reclamation pool for allocations the GPU may still be reading.
///
/// Retired command-buffer backings and scratch allocations are parked here
/// stamped with the task count that must complete before they can be reused
/// or freed. `obtain_reusable` hands back a fit candidate once its stamp is
/// at or below the completed task count.
pub struct ReusePool {
    entries: Vec<Entry>,
}

struct Entry {
    allocation: Arc<GraphicsAllocation>,
    /// Task count that must be complete before the allocation is idle.
    ready_task_count: u32,
}

impl ReusePool {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park `allocation` until `ready_task_count` completes.
    pub fn store(&mut self, allocation: Arc<GraphicsAllocation>, ready_task_count: u32) {
        self.entries.push(Entry {
            allocation,
            ready_task_count,
        });
    }

    /// Take a parked allocation of `allocation_type` with at least
    /// `min_size` bytes whose stamp is satisfied by `completed_task_count`.
    pub fn obtain_reusable(
        &mut self,
        min_size: usize,
        allocation_type: AllocationType,
        completed_task_count: u32,
    ) -> Option<Arc<GraphicsAllocation>> {
        let index = self.entries.iter().position(|e| {
            e.ready_task_count <= completed_task_count
                && e.allocation.allocation_type() == allocation_type
                && e.allocation.size() >= min_size
        })?;
        Some(self.entries.swap_remove(index).allocation)
    }

    /// Free every parked allocation whose stamp is satisfied by
    /// `completed_task_count`.
    pub fn clean(&mut self, completed_task_count: u32, memory: &dyn MemoryManager) {
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].ready_task_count <= completed_task_count {
                let entry = self.entries.swap_remove(index);
                memory.free_graphics_memory(entry.allocation);
            } else {
                index += 1;
            }
        }
    }

    /// Free everything regardless of stamps (context teardown).
    pub fn clean_all(&mut self, memory: &dyn MemoryManager) {
        for entry in self.entries.drain(..) {
            memory.free_graphics_memory(entry.allocation);
        }
    }
}

impl Default for ReusePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_mem::{AllocationProperties, SystemMemoryManager};

    fn alloc(mm: &SystemMemoryManager, size: usize) -> Arc<GraphicsAllocation> {
        mm.allocate_graphics_memory_with_properties(AllocationProperties::new(
            0,
            size,
            AllocationType::CommandBuffer,
        ))
        .unwrap()
    }

    #[test]
    fn reuse_waits_for_task_count() {
        let mm = SystemMemoryManager::new();
        let mut pool = ReusePool::new();
        pool.store(alloc(&mm, 4096), 5);

        assert!(pool
            .obtain_reusable(4096, AllocationType::CommandBuffer, 4)
            .is_none());
        assert!(pool
            .obtain_reusable(4096, AllocationType::CommandBuffer, 5)
            .is_some());
        assert!(pool.is_empty());
    }

    #[test]
    fn reuse_respects_size_and_type() {
        let mm = SystemMemoryManager::new();
        let mut pool = ReusePool::new();
        pool.store(alloc(&mm, 4096), 0);

        assert!(pool
            .obtain_reusable(8192, AllocationType::CommandBuffer, 1)
            .is_none());
        assert!(pool
            .obtain_reusable(1024, AllocationType::Scratch, 1)
            .is_none());
        assert!(pool
            .obtain_reusable(1024, AllocationType::CommandBuffer, 1)
            .is_some());
    }

    #[test]
    fn clean_frees_only_completed_entries() {
        let mm = SystemMemoryManager::new();
        let mut pool = ReusePool::new();
        pool.store(alloc(&mm, 4096), 2);
        pool.store(alloc(&mm, 4096), 7);

        pool.clean(3, &mm);
        assert_eq!(pool.len(), 1);
        assert_eq!(mm.freed_allocation_count(), 1);

        pool.clean_all(&mm);
        assert!(pool.is_empty());
        assert_eq!(mm.freed_allocation_count(), 2);
    }
}
