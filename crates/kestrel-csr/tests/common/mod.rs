#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kestrel_csr::cmd::{CommandEncoder, SoftEncoder};
use kestrel_csr::{BatchBuffer, LinearStream, SoftSubmitter, SubmitError, Submitter};
use kestrel_mem::{
    AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, SystemMemoryManager,
};

/// Executing submitter with one-shot failure injection.
pub struct FailingSubmitter {
    inner: SoftSubmitter,
    fail_next: bool,
}

impl FailingSubmitter {
    pub fn new(tile_count: u32) -> Self {
        Self {
            inner: SoftSubmitter::new(tile_count),
            fail_next: false,
        }
    }

    pub fn fail_next_submit(&mut self) {
        self.fail_next = true;
    }

    pub fn submit_count(&self) -> u32 {
        self.inner.submit_count()
    }
}

impl Submitter for FailingSubmitter {
    fn submit(
        &mut self,
        batch: &BatchBuffer,
        surfaces: &[Arc<GraphicsAllocation>],
    ) -> Result<(), SubmitError> {
        if self.fail_next {
            self.fail_next = false;
            return Err(SubmitError::Rejected);
        }
        self.inner.submit(batch, surfaces)
    }

    fn is_gpu_hung(&self) -> bool {
        self.inner.is_gpu_hung()
    }
}

/// Accepts every submission without executing anything, so the hardware tag
/// never advances. Used to exercise timeout and hang paths.
pub struct NullSubmitter {
    pub submit_count: u32,
    pub gpu_hung: bool,
}

impl NullSubmitter {
    pub fn new() -> Self {
        Self {
            submit_count: 0,
            gpu_hung: false,
        }
    }
}

impl Submitter for NullSubmitter {
    fn submit(
        &mut self,
        _batch: &BatchBuffer,
        _surfaces: &[Arc<GraphicsAllocation>],
    ) -> Result<(), SubmitError> {
        self.submit_count += 1;
        Ok(())
    }

    fn is_gpu_hung(&self) -> bool {
        self.gpu_hung
    }
}

/// Memory manager with an allocation quota, for out-of-memory paths.
pub struct QuotaMemoryManager {
    inner: SystemMemoryManager,
    remaining: AtomicUsize,
}

impl QuotaMemoryManager {
    pub fn new(quota: usize) -> Self {
        Self {
            inner: SystemMemoryManager::new(),
            remaining: AtomicUsize::new(quota),
        }
    }
}

impl MemoryManager for QuotaMemoryManager {
    fn allocate_graphics_memory_with_properties(
        &self,
        properties: AllocationProperties,
    ) -> Option<Arc<GraphicsAllocation>> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_err()
        {
            return None;
        }
        self.inner.allocate_graphics_memory_with_properties(properties)
    }

    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>) {
        self.inner.free_graphics_memory(allocation);
    }

    fn internal_heap_base_address(&self, root_device_index: u32, local_memory: bool) -> u64 {
        self.inner
            .internal_heap_base_address(root_device_index, local_memory)
    }
}

/// Encode a small register write to stand in for real workload commands.
pub fn sample_workload(value: u32) -> Vec<u8> {
    let mm = SystemMemoryManager::new();
    let backing = mm
        .allocate_graphics_memory_with_properties(AllocationProperties::new(
            0,
            4096,
            AllocationType::CommandBuffer,
        ))
        .unwrap();
    let mut stream = LinearStream::new(backing);
    SoftEncoder::new().load_register_imm(&mut stream, 0x2600, value);
    stream.snapshot_used()
}
