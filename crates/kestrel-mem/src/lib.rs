//! GPU memory model used by the kestrel command-stream engine.
//!
//! [`GraphicsAllocation`] is an opaque, reference-counted handle to a
//! GPU-visible memory range. Allocations are created and destroyed by a
//! [`MemoryManager`]; the submission engine only records usage on them
//! (per-context residency and task-count stamps).
//!
//! [`SystemMemoryManager`] backs everything with process memory and a
//! bump-assigned GPU address space. It is the host-side implementation used by
//! the software submitter and by tests; a real driver would plug its own
//! [`MemoryManager`] in at the same seam.

#![forbid(unsafe_code)]

mod align;
mod allocation;
mod manager;

pub use align::{align_up, CACHE_LINE_SIZE, PAGE_SIZE, PAGE_SIZE_64K};
pub use allocation::{AllocationType, ContextId, CpuBacking, GraphicsAllocation};
pub use manager::{AllocationProperties, MemoryManager, SystemMemoryManager};
