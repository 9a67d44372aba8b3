//! # Guest session
//!
//! Everything that belongs to the one guest running in this process: its
//! segments, the descriptor slots they are published in, and the images that
//! were loaded. Core operations take the session explicitly, so independent
//! sessions can coexist (tests create one per case).

use crate::config::Config;
use crate::descriptor::{DescriptorError, DescriptorTable, LDT_ENTRIES, SegmentDescriptor, SoftwareTable};
use crate::loader::{ImageKind, LoadInfo};
use core::cell::RefCell;
use core::ptr::NonNull;
use emu_memory::{Access, Segment, SegmentError, SegmentId, SegmentTable};
use emu_registers::Selector;
use std::rc::Rc;

/// Slot reserved for the guest's pointer segment. Guests address it through
/// the global-table selector `0x78` until it is migrated (see the trap
/// dispatcher), so ordinary allocations skip it.
pub const POINTER_SEGMENT_SLOT: u16 = 15;

/// Direction of a guest memory access.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RwOp {
    Read,
    Write,
}

/// A guest address that cannot be translated.
///
/// Collaborators turn this into the guest's own error convention; it never
/// terminates the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GuestFault {
    #[error("selector {selector:#06x} is not bound")]
    Unbound { selector: u16 },
    #[error("{selector:#06x}:{offset:#010x}+{size:#x} exceeds segment limit {limit:#x}")]
    OutOfBounds {
        selector: u16,
        offset: u32,
        size: usize,
        limit: usize,
    },
    #[error("selector {selector:#06x} does not allow writes")]
    ReadOnly { selector: u16 },
}

impl GuestFault {
    /// The error number reported to the guest.
    #[must_use]
    pub const fn errno(&self) -> crate::Errno {
        crate::Errno::EFAULT
    }
}

pub struct Session {
    config: Config,
    table: Rc<dyn DescriptorTable>,
    segments: RefCell<SegmentTable>,
    descriptors: RefCell<Vec<Option<Rc<SegmentDescriptor>>>>,
    images: RefCell<Vec<LoadInfo>>,
}

impl Session {
    #[must_use]
    pub fn new(config: Config, table: Rc<dyn DescriptorTable>) -> Self {
        let segments = SegmentTable::new(config.reservation, config.placement);
        log::debug!(target: "segment", "descriptor backend: {}", table.name());
        Self {
            config,
            table,
            segments: RefCell::new(segments),
            descriptors: RefCell::new(Vec::new()),
            images: RefCell::new(Vec::new()),
        }
    }

    /// Pick the descriptor backend the configuration asks for.
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        let table: Rc<dyn DescriptorTable> = if config.hardware_descriptors {
            hardware_table().unwrap_or_else(|| {
                log::warn!(target: "segment", "no hardware descriptor table, checking in software");
                Rc::new(SoftwareTable::new())
            })
        } else {
            Rc::new(SoftwareTable::new())
        };
        Self::new(config, table)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn descriptor_table(&self) -> &Rc<dyn DescriptorTable> {
        &self.table
    }

    /// Allocate a segment using the configured reservation policy.
    pub fn allocate_segment(&self, access: Access, size: usize) -> Result<Rc<Segment>, SegmentError> {
        self.segments.borrow_mut().allocate(access, size)
    }

    /// Allocate a segment committed read-write, reserving address space for
    /// what it will finally be (`declared`). Used while loading images.
    pub fn allocate_for_load(&self, declared: Access, size: usize) -> Result<Rc<Segment>, SegmentError> {
        let mut segments = self.segments.borrow_mut();
        let reservation = segments.policy().for_access(declared);
        segments.allocate_reserved(Access::ReadWrite, size, reservation)
    }

    #[must_use]
    pub fn segment(&self, id: SegmentId) -> Option<Rc<Segment>> {
        self.segments.borrow().get(id)
    }

    /// Number of live segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.borrow().len()
    }

    /// Publish `segment` in the lowest free slot.
    pub fn create_descriptor(&self, access: Access, segment: Rc<Segment>) -> Result<Selector, DescriptorError> {
        let slot = {
            let descriptors = self.descriptors.borrow();
            (0..LDT_ENTRIES)
                .filter(|&s| s != POINTER_SEGMENT_SLOT)
                .find(|&s| descriptors.get(usize::from(s)).is_none_or(Option::is_none))
                .ok_or(DescriptorError::TableFull)?
        };
        self.bind_at(slot, access, segment)
    }

    /// Publish `segment` in a specific slot, which must be free.
    pub fn bind_at(&self, slot: u16, access: Access, segment: Rc<Segment>) -> Result<Selector, DescriptorError> {
        if slot >= LDT_ENTRIES {
            return Err(DescriptorError::InvalidSlot(slot));
        }
        let index = usize::from(slot);
        if self.descriptors.borrow().get(index).is_some_and(Option::is_some) {
            return Err(DescriptorError::SlotInUse(slot));
        }

        let descriptor = SegmentDescriptor::new(slot, access, segment, self.table.clone())?;
        let selector = descriptor.selector();

        let mut descriptors = self.descriptors.borrow_mut();
        if descriptors.len() <= index {
            descriptors.resize_with(index + 1, || None);
        }
        descriptors[index] = Some(Rc::new(descriptor));
        Ok(selector)
    }

    /// The descriptor a selector names, if it is bound.
    #[must_use]
    pub fn descriptor(&self, selector: Selector) -> Option<Rc<SegmentDescriptor>> {
        if !selector.is_guest() {
            return None;
        }
        self.descriptors
            .borrow()
            .get(usize::from(selector.index()))
            .and_then(Clone::clone)
    }

    /// Unbind a selector. The hardware entry is cleared once the returned
    /// descriptor (if kept) is dropped.
    pub fn detach(&self, selector: Selector) -> Option<Rc<SegmentDescriptor>> {
        if !selector.is_guest() {
            return None;
        }
        self.descriptors
            .borrow_mut()
            .get_mut(usize::from(selector.index()))
            .and_then(Option::take)
    }

    /// Refresh every descriptor bound to `segment`, after it grew.
    pub fn refresh_descriptors(&self, segment: &Rc<Segment>) -> Result<(), DescriptorError> {
        let bound: Vec<_> = self
            .descriptors
            .borrow()
            .iter()
            .flatten()
            .filter(|d| Rc::ptr_eq(d.segment(), segment))
            .cloned()
            .collect();
        for descriptor in bound {
            descriptor.update_descriptors()?;
        }
        Ok(())
    }

    /// Number of bound selectors.
    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.borrow().iter().flatten().count()
    }

    /// Resolve `selector:offset` to a host pointer valid for `size` bytes.
    ///
    /// Fails iff the selector is unbound, the range leaves the committed part
    /// of the segment, or a write targets a non-writable descriptor.
    pub fn translate(&self, selector: Selector, offset: u32, size: usize, op: RwOp) -> Result<NonNull<u8>, GuestFault> {
        let raw = selector.to_u16();
        let descriptor = self.descriptor(selector).ok_or(GuestFault::Unbound { selector: raw })?;
        if op == RwOp::Write && !descriptor.access().is_writable() {
            return Err(GuestFault::ReadOnly { selector: raw });
        }
        let segment = descriptor.segment();
        let ptr = segment
            .pointer(offset as usize, size)
            .map_err(|_| GuestFault::OutOfBounds {
                selector: raw,
                offset,
                size,
                limit: segment.size(),
            })?;
        if op == RwOp::Write && !segment.is_writable(offset as usize, size) {
            return Err(GuestFault::ReadOnly { selector: raw });
        }
        Ok(ptr)
    }

    /// How many bytes starting at `selector:offset` can be read.
    #[must_use]
    pub fn readable_len(&self, selector: Selector, offset: u32) -> usize {
        self.descriptor(selector)
            .map_or(0, |d| d.segment().size().saturating_sub(offset as usize))
    }

    pub(crate) fn register_image(&self, info: LoadInfo) {
        self.images.borrow_mut().push(info);
    }

    /// The most recently loaded image of `kind`.
    #[must_use]
    pub fn image(&self, kind: ImageKind) -> Option<LoadInfo> {
        self.images.borrow().iter().rev().find(|i| i.kind == kind).cloned()
    }
}

#[cfg(all(feature = "ldt", target_os = "linux", target_arch = "x86_64"))]
fn hardware_table() -> Option<Rc<dyn DescriptorTable>> {
    Some(Rc::new(crate::descriptor::LinuxLdt))
}

#[cfg(not(all(feature = "ldt", target_os = "linux", target_arch = "x86_64")))]
fn hardware_table() -> Option<Rc<dyn DescriptorTable>> {
    None
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.table.name())
            .field("segments", &self.segment_count())
            .field("descriptors", &self.descriptor_count())
            .finish_non_exhaustive()
    }
}
