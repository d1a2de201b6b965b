use std::collections::HashMap;
use std::sync::Mutex;

/// Identifies one execution context (one engine/tile-group owner of a
/// command-stream receiver). Residency state on an allocation is keyed by
/// context id so the same allocation can be tracked independently by several
/// receivers at once.
pub type ContextId = u32;

/// Classifies what an allocation backs. The submission engine uses this only
/// for bookkeeping and diagnostics; it never interprets contents based on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationType {
    Buffer,
    CommandBuffer,
    Scratch,
    PrivateScratch,
    Tag,
    GlobalFence,
    WorkPartition,
    Preemption,
}

/// CPU-visible backing for an allocation.
///
/// Command buffers are written through this on the CPU side, and the tag
/// allocation is polled through it while waiting for completion. Interior
/// mutability keeps the surrounding [`GraphicsAllocation`] shareable via
/// `Arc` the way command submission needs it.
#[derive(Debug)]
pub struct CpuBacking {
    bytes: Mutex<Vec<u8>>,
}

impl CpuBacking {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; size]),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the backing at `offset`. Panics on out-of-range
    /// writes; callers size their streams before emitting.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Zero-fill `len` bytes at `offset` (used to noop superseded commands).
    pub fn fill_zero(&self, offset: usize, len: usize) {
        let mut bytes = self.bytes.lock().unwrap();
        bytes[offset..offset + len].fill(0);
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let bytes = self.bytes.lock().unwrap();
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[offset..offset + 4]);
        u32::from_le_bytes(word)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Snapshot the whole backing (used by stream decoding).
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ContextUsage {
    resident: bool,
    /// Last task count this allocation was used in (None = never used).
    task_count: Option<u32>,
    /// Task count stamp preserved across residency release so waiters can
    /// still validate completion.
    residency_task_count: Option<u32>,
}

/// An opaque handle to a GPU-visible memory range.
///
/// Created and destroyed by a [`crate::MemoryManager`]; the submission engine
/// holds `Arc`s and records usage. The GPU virtual address is stable for the
/// allocation's lifetime.
#[derive(Debug)]
pub struct GraphicsAllocation {
    id: u64,
    gpu_address: u64,
    size: usize,
    allocation_type: AllocationType,
    cpu: Option<CpuBacking>,
    usage: Mutex<HashMap<ContextId, ContextUsage>>,
}

impl GraphicsAllocation {
    pub fn new(
        id: u64,
        gpu_address: u64,
        size: usize,
        allocation_type: AllocationType,
        cpu: Option<CpuBacking>,
    ) -> Self {
        Self {
            id,
            gpu_address,
            size,
            allocation_type,
            cpu,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    /// CPU-visible backing, if this allocation has one.
    pub fn cpu(&self) -> Option<&CpuBacking> {
        self.cpu.as_ref()
    }

    /// Whether `gpu_address` falls inside this allocation's range.
    pub fn contains_gpu_address(&self, gpu_address: u64) -> bool {
        gpu_address >= self.gpu_address && gpu_address < self.gpu_address + self.size as u64
    }

    pub fn is_resident(&self, context: ContextId) -> bool {
        self.usage
            .lock()
            .unwrap()
            .get(&context)
            .map(|u| u.resident)
            .unwrap_or(false)
    }

    pub fn task_count(&self, context: ContextId) -> Option<u32> {
        self.usage
            .lock()
            .unwrap()
            .get(&context)
            .and_then(|u| u.task_count)
    }

    pub fn residency_task_count(&self, context: ContextId) -> Option<u32> {
        self.usage
            .lock()
            .unwrap()
            .get(&context)
            .and_then(|u| u.residency_task_count)
    }

    /// True when the allocation's residency stamp for `context` is below
    /// `task_count` (including "never made resident").
    pub fn is_residency_task_count_below(&self, task_count: u32, context: ContextId) -> bool {
        match self.residency_task_count(context) {
            Some(stamp) => stamp < task_count,
            None => true,
        }
    }

    pub fn update_task_count(&self, task_count: u32, context: ContextId) {
        let mut usage = self.usage.lock().unwrap();
        usage.entry(context).or_default().task_count = Some(task_count);
    }

    /// Marks the allocation resident for `context` and stamps it with the
    /// pending task count. Idempotent.
    pub fn update_residency_task_count(&self, task_count: u32, context: ContextId) {
        let mut usage = self.usage.lock().unwrap();
        let entry = usage.entry(context).or_default();
        entry.residency_task_count = Some(task_count);
        entry.resident = true;
    }

    /// Drops residency for `context` but keeps the task-count stamp so a
    /// waiter can still validate completion afterwards.
    pub fn release_residency(&self, context: ContextId) {
        let mut usage = self.usage.lock().unwrap();
        if let Some(entry) = usage.get_mut(&context) {
            entry.resident = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn alloc() -> GraphicsAllocation {
        GraphicsAllocation::new(1, 0x10000, 4096, AllocationType::Buffer, None)
    }

    #[test]
    fn residency_is_keyed_by_context() {
        let a = alloc();
        a.update_residency_task_count(5, 0);
        assert!(a.is_resident(0));
        assert!(!a.is_resident(1));

        a.update_residency_task_count(9, 1);
        a.release_residency(0);
        assert!(!a.is_resident(0));
        assert!(a.is_resident(1));
        // Stamp survives the release.
        assert_eq!(a.residency_task_count(0), Some(5));
        assert_eq!(a.residency_task_count(1), Some(9));
    }

    #[test]
    fn residency_task_count_below_treats_unused_as_below() {
        let a = alloc();
        assert!(a.is_residency_task_count_below(1, 0));
        a.update_residency_task_count(3, 0);
        assert!(!a.is_residency_task_count_below(3, 0));
        assert!(a.is_residency_task_count_below(4, 0));
    }

    #[test]
    fn cpu_backing_round_trips_words() {
        let backing = CpuBacking::new(64);
        backing.write_u32(8, 0xDEAD_BEEF);
        assert_eq!(backing.read_u32(8), 0xDEAD_BEEF);
        backing.fill_zero(8, 4);
        assert_eq!(backing.read_u32(8), 0);
    }

    #[test]
    fn contains_gpu_address_checks_range() {
        let a = alloc();
        assert!(a.contains_gpu_address(0x10000));
        assert!(a.contains_gpu_address(0x10FFF));
        assert!(!a.contains_gpu_address(0x11000));
        assert!(!a.contains_gpu_address(0xFFFF));
    }
}
