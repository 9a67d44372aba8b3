use crate::Access;
use crate::page::{self, PAGE_SIZE};
use crate::table::SegmentId;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use std::io;

/// Where in the host address space a segment may be placed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Placement {
    /// Below 4 GiB, so the base fits a 32-bit descriptor.
    #[default]
    Low32,
    /// Anywhere; only usable without hardware descriptors.
    Anywhere,
}

impl Placement {
    #[cfg(target_arch = "x86_64")]
    const fn mmap_flags(self) -> libc::c_int {
        match self {
            Self::Low32 => libc::MAP_32BIT,
            Self::Anywhere => 0,
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    const fn mmap_flags(self) -> libc::c_int {
        let _ = self;
        0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("failed to reserve {bytes:#x} bytes of address space: {source}")]
    OutOfMemory {
        bytes: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to commit {bytes:#x} bytes: {source}")]
    Commit {
        bytes: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to change protection: {0}")]
    Protect(#[source] io::Error),
    #[error("{requested:#x} bytes exceed the reservation of {reserved:#x} bytes")]
    ReservationExceeded { requested: usize, reserved: usize },
    #[error("cannot shrink segment from {current:#x} to {requested:#x} bytes")]
    ShrinkRejected { current: usize, requested: usize },
    #[error("range {offset:#x}+{size:#x} outside segment of {limit:#x} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        limit: usize,
    },
    #[error("segment is mapped {0} and cannot be written")]
    NotWritable(Access),
    #[error("segment is mapped {0} and cannot be read")]
    NotReadable(Access),
    #[error("only an empty segment can skip {0:#x} bytes")]
    SkipAfterCommit(usize),
}

/// Protection applied to part of a segment, overriding its access.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct RangeAccess {
    start: usize,
    end: usize,
    access: Access,
}

/// One guest segment backed by a reserved host mapping.
///
/// Size, access and the shared flag change through `&self` so that one
/// segment can be referenced from several descriptors at once.
pub struct Segment {
    id: SegmentId,
    base: NonNull<u8>,
    reserved: usize,
    size: Cell<usize>,
    paged_size: Cell<usize>,
    skipped: Cell<usize>,
    access: Cell<Access>,
    ranges: RefCell<Vec<RangeAccess>>,
    shared: Cell<bool>,
}

impl Segment {
    /// Reserve `reservation` bytes and commit the first `initial_size` bytes
    /// with `access`.
    pub fn allocate(
        id: SegmentId,
        access: Access,
        initial_size: usize,
        reservation: usize,
        placement: Placement,
    ) -> Result<Self, SegmentError> {
        let requested = reservation.max(initial_size).max(PAGE_SIZE);
        let reserved = page::align_up(requested).ok_or(SegmentError::ReservationExceeded {
            requested,
            reserved: 0,
        })?;

        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANONYMOUS
            | libc::MAP_NORESERVE
            | placement.mmap_flags();
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                reserved,
                libc::PROT_NONE,
                flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(SegmentError::OutOfMemory {
                bytes: reserved,
                source: io::Error::last_os_error(),
            });
        }
        let Some(base) = NonNull::new(addr.cast::<u8>()) else {
            return Err(SegmentError::OutOfMemory {
                bytes: reserved,
                source: io::Error::from(io::ErrorKind::AddrNotAvailable),
            });
        };

        let segment = Self {
            id,
            base,
            reserved,
            size: Cell::new(0),
            paged_size: Cell::new(0),
            skipped: Cell::new(0),
            access: Cell::new(access),
            ranges: RefCell::new(Vec::new()),
            shared: Cell::new(false),
        };
        segment.grow(access, initial_size)?;

        log::debug!(
            target: "segment",
            "segment {id}: reserved {reserved:#x} bytes at {:#x}, committed {initial_size:#x} {access}",
            segment.linear_base()
        );
        Ok(segment)
    }

    /// Commit more of the reservation. `new_size` must not be smaller than the
    /// current size.
    pub fn grow(&self, access: Access, new_size: usize) -> Result<(), SegmentError> {
        let current = self.size.get();
        if new_size < current {
            return Err(SegmentError::ShrinkRejected {
                current,
                requested: new_size,
            });
        }

        let new_paged = page::align_up(new_size)
            .filter(|&p| p <= self.reserved)
            .ok_or(SegmentError::ReservationExceeded {
                requested: new_size,
                reserved: self.reserved,
            })?;

        let paged = self.paged_size.get();
        if new_paged > paged {
            let bytes = new_paged - paged;
            let addr = unsafe {
                libc::mmap(
                    self.base.as_ptr().add(paged).cast(),
                    bytes,
                    access.host_protection(),
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(SegmentError::Commit {
                    bytes,
                    source: io::Error::last_os_error(),
                });
            }
            self.paged_size.set(new_paged);
        }
        self.size.set(new_size);

        if access != self.access.get() {
            self.change_access(access)?;
        }
        Ok(())
    }

    /// Leave the first `bytes` (rounded up to pages) of an empty segment
    /// inaccessible. They count towards the size but are never committed.
    pub fn skip(&self, bytes: usize) -> Result<(), SegmentError> {
        if self.paged_size.get() != 0 {
            return Err(SegmentError::SkipAfterCommit(bytes));
        }
        let skipped = page::align_up(bytes)
            .filter(|&p| p <= self.reserved)
            .ok_or(SegmentError::ReservationExceeded {
                requested: bytes,
                reserved: self.reserved,
            })?;
        self.skipped.set(skipped);
        self.paged_size.set(skipped);
        self.size.set(skipped);
        Ok(())
    }

    /// Re-protect every committed page.
    pub fn change_access(&self, access: Access) -> Result<(), SegmentError> {
        let skipped = self.skipped.get();
        let committed = self.paged_size.get() - skipped;
        if committed > 0 {
            self.mprotect(skipped, committed, access)?;
        }
        self.ranges.borrow_mut().clear();
        self.access.set(access);
        Ok(())
    }

    /// Re-protect the pages covering `[offset, offset + size)` only. The rest
    /// of the segment keeps its access.
    pub fn change_range_access(&self, offset: usize, size: usize, access: Access) -> Result<(), SegmentError> {
        let out_of_bounds = SegmentError::OutOfBounds {
            offset,
            size,
            limit: self.paged_size.get(),
        };
        let start = page::align_down(offset);
        let Some(end) = offset.checked_add(size).and_then(page::align_up) else {
            return Err(out_of_bounds);
        };
        if start < self.skipped.get() || end > self.paged_size.get() {
            return Err(out_of_bounds);
        }
        if end > start {
            self.mprotect(start, end - start, access)?;
            self.ranges.borrow_mut().push(RangeAccess { start, end, access });
        }
        Ok(())
    }

    fn mprotect(&self, offset: usize, len: usize, access: Access) -> Result<(), SegmentError> {
        let rc = unsafe {
            libc::mprotect(self.base.as_ptr().add(offset).cast(), len, access.host_protection())
        };
        if rc != 0 {
            return Err(SegmentError::Protect(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// The access in effect for all of `[offset, offset + size)`: the
    /// segment's own access unless a range override covers part of it.
    #[must_use]
    pub fn access_at(&self, offset: usize, size: usize) -> Access {
        let end = offset.saturating_add(size.max(1));
        self.ranges
            .borrow()
            .iter()
            .rev()
            .find(|r| r.start < end && offset < r.end)
            .map_or(self.access.get(), |r| r.access)
    }

    /// Whether the host may write all of `[offset, offset + size)`.
    #[must_use]
    pub fn is_writable(&self, offset: usize, size: usize) -> bool {
        let end = offset.saturating_add(size.max(1));
        self.access.get().is_writable()
            && self
                .ranges
                .borrow()
                .iter()
                .filter(|r| r.start < end && offset < r.end)
                .all(|r| r.access.is_writable())
    }

    /// `true` iff `[offset, offset + size)` lies within the committed size
    /// and above any skipped prefix.
    #[inline]
    #[must_use]
    pub fn check_bounds(&self, offset: usize, size: usize) -> bool {
        offset >= self.skipped.get()
            && offset
                .checked_add(size)
                .is_some_and(|end| end <= self.size.get())
    }

    /// Host address of `offset`, after checking `[offset, offset + size)`.
    pub fn pointer(&self, offset: usize, size: usize) -> Result<NonNull<u8>, SegmentError> {
        if !self.check_bounds(offset, size) {
            return Err(SegmentError::OutOfBounds {
                offset,
                size,
                limit: self.size.get(),
            });
        }
        // SAFETY: offset ≤ size ≤ reserved, so the result stays inside the mapping.
        Ok(unsafe { self.base.add(offset) })
    }

    /// Copy `data` into the segment at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), SegmentError> {
        if !self.is_writable(offset, data.len()) {
            return Err(SegmentError::NotWritable(self.access_at(offset, data.len())));
        }
        let dst = self.pointer(offset, data.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Copy bytes out of the segment starting at `offset`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), SegmentError> {
        let access = self.access_at(offset, out.len());
        if !access.is_host_readable() {
            return Err(SegmentError::NotReadable(access));
        }
        let src = self.pointer(offset, out.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> SegmentId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Base address as an integer, for descriptors and diagnostics.
    #[inline]
    #[must_use]
    pub fn linear_base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Committed size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Inaccessible bytes at the bottom of the segment.
    #[inline]
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.get()
    }

    /// Committed size rounded up to whole pages.
    #[inline]
    #[must_use]
    pub fn paged_size(&self) -> usize {
        self.paged_size.get()
    }

    #[inline]
    #[must_use]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    #[inline]
    #[must_use]
    pub fn access(&self) -> Access {
        self.access.get()
    }

    /// Mark the segment as shared between guest processes.
    pub fn make_shared(&self) {
        self.shared.set(true);
    }

    #[inline]
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared.get()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.reserved) };
        if rc != 0 {
            log::warn!(
                target: "segment",
                "segment {}: munmap failed: {}",
                self.id,
                io::Error::last_os_error()
            );
        }
    }
}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.linear_base()))
            .field("size", &format_args!("{:#x}", self.size()))
            .field("reserved", &format_args!("{:#x}", self.reserved))
            .field("access", &self.access())
            .field("shared", &self.is_shared())
            .finish()
    }
}
