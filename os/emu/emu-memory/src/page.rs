//! Host page arithmetic.

/// Host page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2(`PAGE_SIZE`)
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Round `bytes` up to the next page boundary, `None` on overflow.
#[inline]
#[must_use]
pub const fn align_up(bytes: usize) -> Option<usize> {
    match bytes.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Round `bytes` down to a page boundary.
#[inline]
#[must_use]
pub const fn align_down(bytes: usize) -> usize {
    bytes & !(PAGE_SIZE - 1)
}

/// Number of pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
