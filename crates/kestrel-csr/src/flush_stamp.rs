use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared hardware-submission ordinal.
///
/// Increments once per real hardware flush call, which is coarser than the
/// logical task count when submissions are batched: several recorded command
/// buffers collapse into one stamp increment. Clones share the same counter,
/// so every waiter that recorded a stamp reference before a batched drain
/// observes the drain's stamp value afterwards.
#[derive(Clone, Debug, Default)]
pub struct FlushStamp {
    stamp: Arc<AtomicU64>,
}

impl FlushStamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u64) {
        self.stamp.store(value, Ordering::Release);
    }

    /// Increment by one and return the new value.
    pub fn advance(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::AcqRel) + 1
    }
}
