use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::align::{align_up, PAGE_SIZE};
use crate::allocation::{AllocationType, CpuBacking, GraphicsAllocation};

/// Request describing one graphics allocation.
#[derive(Clone, Copy, Debug)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: usize,
    pub allocation_type: AllocationType,
    /// Whether the CPU needs to read/write the contents (command buffers,
    /// tag/fence words). Device-only allocations skip the host backing.
    pub cpu_visible: bool,
    pub alignment: u64,
}

impl AllocationProperties {
    pub fn new(root_device_index: u32, size: usize, allocation_type: AllocationType) -> Self {
        let cpu_visible = matches!(
            allocation_type,
            AllocationType::CommandBuffer
                | AllocationType::Tag
                | AllocationType::WorkPartition
        );
        Self {
            root_device_index,
            size,
            allocation_type,
            cpu_visible,
            alignment: PAGE_SIZE,
        }
    }
}

/// Owner of graphics memory. May return `None` on out-of-memory; the
/// submission engine propagates that as an allocation-failure error before
/// emitting any commands.
pub trait MemoryManager: Send + Sync {
    fn allocate_graphics_memory_with_properties(
        &self,
        properties: AllocationProperties,
    ) -> Option<Arc<GraphicsAllocation>>;

    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>);

    /// Base GPU address of the internal heap (instruction/dynamic state) for
    /// a root device.
    fn internal_heap_base_address(&self, root_device_index: u32, local_memory: bool) -> u64;
}

/// Host implementation of [`MemoryManager`].
///
/// GPU virtual addresses are bump-assigned from a private address space, so
/// every live allocation has a unique, non-overlapping range. Contents live in
/// process memory for everything CPU-visible.
pub struct SystemMemoryManager {
    next_id: AtomicU64,
    next_gpu_address: AtomicU64,
    live: Mutex<HashMap<u64, Arc<GraphicsAllocation>>>,
    freed_count: AtomicU64,
}

/// Keep address 0 unused; some state commands treat 0 as "not programmed".
const GPU_ADDRESS_SPACE_BASE: u64 = 0x0001_0000;

const INTERNAL_HEAP_BASE_SYSTEM: u64 = 0x8000_0000_0000;
const INTERNAL_HEAP_BASE_LOCAL: u64 = 0xA000_0000_0000;

impl SystemMemoryManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_gpu_address: AtomicU64::new(GPU_ADDRESS_SPACE_BASE),
            live: Mutex::new(HashMap::new()),
            freed_count: AtomicU64::new(0),
        }
    }

    /// Number of currently live allocations.
    pub fn live_allocation_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Number of allocations freed over the manager's lifetime.
    pub fn freed_allocation_count(&self) -> u64 {
        self.freed_count.load(Ordering::Relaxed)
    }
}

impl Default for SystemMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager for SystemMemoryManager {
    fn allocate_graphics_memory_with_properties(
        &self,
        properties: AllocationProperties,
    ) -> Option<Arc<GraphicsAllocation>> {
        if properties.size == 0 {
            return None;
        }
        let size = align_up(properties.size as u64, properties.alignment.max(1)) as usize;
        let gpu_address = self
            .next_gpu_address
            .fetch_add(align_up(size as u64, PAGE_SIZE), Ordering::Relaxed);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cpu = properties.cpu_visible.then(|| CpuBacking::new(size));
        let allocation = Arc::new(GraphicsAllocation::new(
            id,
            gpu_address,
            size,
            properties.allocation_type,
            cpu,
        ));
        self.live
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&allocation));
        Some(allocation)
    }

    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>) {
        if self.live.lock().unwrap().remove(&allocation.id()).is_some() {
            self.freed_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn internal_heap_base_address(&self, _root_device_index: u32, local_memory: bool) -> u64 {
        if local_memory {
            INTERNAL_HEAP_BASE_LOCAL
        } else {
            INTERNAL_HEAP_BASE_SYSTEM
        }
    }
}
