/// Smallest page granularity used for GPU allocations.
pub const PAGE_SIZE: u64 = 4096;

/// Large-page granularity used for command-buffer backing stores.
pub const PAGE_SIZE_64K: u64 = 64 * 1024;

/// Cache-line granularity command streams are padded to before submission.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    // `value + alignment - 1` can overflow for pathological inputs, so use a
    // checked path and fall back to saturating behaviour.
    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(4095, PAGE_SIZE), 4096);
        assert_eq!(align_up(4096, PAGE_SIZE), 4096);
        assert_eq!(align_up(1, PAGE_SIZE_64K), PAGE_SIZE_64K);
    }
}
