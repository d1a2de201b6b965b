use std::sync::Arc;

use kestrel_mem::{align_up, GraphicsAllocation, CACHE_LINE_SIZE};

/// A patchable position inside a recorded command stream.
///
/// Batched submission needs to rewrite commands after they were recorded
/// (chain a batch-buffer start over an end marker, noop a superseded pipe
/// control, toggle the epilogue's dc-flush bit), so locations carry the
/// backing allocation rather than a raw pointer.
#[derive(Clone, Debug)]
pub struct StreamLocation {
    allocation: Arc<GraphicsAllocation>,
    offset: usize,
}

impl StreamLocation {
    pub fn new(allocation: Arc<GraphicsAllocation>, offset: usize) -> Self {
        Self { allocation, offset }
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address() + self.offset as u64
    }

    pub fn write_bytes(&self, data: &[u8]) {
        self.allocation
            .cpu()
            .expect("patch target must be CPU-visible")
            .write_bytes(self.offset, data);
    }

    pub fn fill_zero(&self, len: usize) {
        self.allocation
            .cpu()
            .expect("patch target must be CPU-visible")
            .fill_zero(self.offset, len);
    }

    pub fn read_u32_at(&self, relative: usize) -> u32 {
        self.allocation
            .cpu()
            .expect("patch target must be CPU-visible")
            .read_u32(self.offset + relative)
    }

    pub fn write_u32_at(&self, relative: usize, value: u32) {
        self.allocation
            .cpu()
            .expect("patch target must be CPU-visible")
            .write_u32(self.offset + relative, value);
    }
}

/// Append-only command stream over a CPU-visible graphics allocation.
///
/// Tracks a cursor the way a linear allocator does; the backing store can be
/// swapped when it runs out of room (the old allocation is retired by the
/// caller once the GPU is done with it).
pub struct LinearStream {
    allocation: Arc<GraphicsAllocation>,
    max_size: usize,
    used: usize,
}

impl LinearStream {
    pub fn new(allocation: Arc<GraphicsAllocation>) -> Self {
        let max_size = allocation.size();
        Self {
            allocation,
            max_size,
            used: 0,
        }
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available_space(&self) -> usize {
        self.max_size - self.used
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// GPU address of the current cursor.
    pub fn cursor_gpu_address(&self) -> u64 {
        self.allocation.gpu_address() + self.used as u64
    }

    /// Location of the current cursor, for later patching.
    pub fn cursor_location(&self) -> StreamLocation {
        StreamLocation::new(Arc::clone(&self.allocation), self.used)
    }

    /// Append raw bytes, returning the offset they were written at.
    ///
    /// Panics if the stream has no room; callers reserve worst-case space
    /// before emitting (see `required_stream_size` in the receiver).
    pub fn write(&mut self, data: &[u8]) -> usize {
        assert!(
            data.len() <= self.available_space(),
            "command stream overflow: need {} bytes, have {}",
            data.len(),
            self.available_space()
        );
        let offset = self.used;
        self.allocation
            .cpu()
            .expect("linear stream backing must be CPU-visible")
            .write_bytes(offset, data);
        self.used += data.len();
        offset
    }

    /// Zero-pad with `len` bytes.
    pub fn write_noop(&mut self, len: usize) -> usize {
        let offset = self.used;
        if len > 0 {
            assert!(len <= self.available_space(), "command stream overflow");
            self.allocation
                .cpu()
                .expect("linear stream backing must be CPU-visible")
                .fill_zero(offset, len);
            self.used += len;
        }
        offset
    }

    /// Pad the stream out to the next cache-line boundary.
    pub fn align_to_cache_line(&mut self) {
        let aligned = align_up(self.used as u64, CACHE_LINE_SIZE) as usize;
        self.write_noop(aligned - self.used);
    }

    /// Swap in a fresh backing store, returning the old allocation for
    /// deferred reclamation. The cursor resets to zero.
    pub fn replace_allocation(&mut self, allocation: Arc<GraphicsAllocation>) -> Arc<GraphicsAllocation> {
        let max_size = allocation.size();
        let old = std::mem::replace(&mut self.allocation, allocation);
        self.max_size = max_size;
        self.used = 0;
        old
    }

    /// Snapshot of the written portion of the stream.
    pub fn snapshot_used(&self) -> Vec<u8> {
        let mut bytes = self
            .allocation
            .cpu()
            .expect("linear stream backing must be CPU-visible")
            .snapshot();
        bytes.truncate(self.used);
        bytes
    }
}
