use super::{DescriptorError, DescriptorTable, UserDesc};
use core::cell::Cell;
use emu_memory::{Access, Segment};
use emu_registers::Selector;
use std::rc::Rc;

/// A guest segment published in one descriptor table slot.
///
/// Several descriptors may share a segment; the segment is unmapped when the
/// last of them is gone.
pub struct SegmentDescriptor {
    slot: u16,
    access: Cell<Access>,
    segment: Rc<Segment>,
    table: Rc<dyn DescriptorTable>,
}

impl SegmentDescriptor {
    /// Bind `segment` to `slot` and install the hardware entry.
    pub fn new(
        slot: u16,
        access: Access,
        segment: Rc<Segment>,
        table: Rc<dyn DescriptorTable>,
    ) -> Result<Self, DescriptorError> {
        let desc = Self {
            slot,
            access: Cell::new(access),
            segment,
            table,
        };
        desc.table.install(&desc.entry()?)?;
        Ok(desc)
    }

    /// Refresh base, limit and permissions after the segment grew or changed
    /// access. Must run before the guest executes another instruction.
    pub fn update_descriptors(&self) -> Result<(), DescriptorError> {
        self.table.install(&self.entry()?)
    }

    /// Change the access the guest sees through this descriptor.
    pub fn set_access(&self, access: Access) -> Result<(), DescriptorError> {
        self.access.set(access);
        self.update_descriptors()
    }

    /// The selector naming this descriptor.
    #[inline]
    #[must_use]
    pub const fn selector(&self) -> Selector {
        Selector::guest(self.slot)
    }

    #[inline]
    #[must_use]
    pub const fn slot(&self) -> u16 {
        self.slot
    }

    #[inline]
    #[must_use]
    pub fn access(&self) -> Access {
        self.access.get()
    }

    #[inline]
    #[must_use]
    pub const fn segment(&self) -> &Rc<Segment> {
        &self.segment
    }

    fn entry(&self) -> Result<UserDesc, DescriptorError> {
        // Software tables never load the base, so they only keep its low half.
        let base = if self.table.is_hardware() {
            self.segment.linear_base()
        } else {
            self.segment.linear_base() & 0xFFFF_FFFF
        };
        UserDesc::for_segment(
            self.slot,
            base,
            self.segment.size(),
            self.access.get(),
        )
    }
}

impl Drop for SegmentDescriptor {
    fn drop(&mut self) {
        if let Err(e) = self.table.remove(self.slot) {
            log::error!(target: "segment", "failed to clear descriptor {}: {e}", self.slot);
        }
    }
}

impl core::fmt::Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentDescriptor")
            .field("selector", &format_args!("{:#06x}", self.selector().to_u16()))
            .field("access", &self.access.get())
            .field("segment", &self.segment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SoftwareTable;
    use emu_memory::page::PAGE_SIZE;
    use emu_memory::{Placement, SegmentId};

    fn segment(size: usize) -> Rc<Segment> {
        Rc::new(
            Segment::allocate(SegmentId(0), Access::ReadWrite, size, 64 * PAGE_SIZE, Placement::Anywhere)
                .unwrap(),
        )
    }

    #[test]
    fn lifecycle_installs_and_clears() {
        let table = Rc::new(SoftwareTable::new());
        let d = SegmentDescriptor::new(2, Access::ReadWrite, segment(32), table.clone()).unwrap();
        assert_eq!(d.selector().to_u16(), 0x17);
        let entry = table.entry(2).unwrap();
        assert_eq!(entry.limit_bytes(), 32);
        assert_eq!(entry.base_addr as usize, d.segment().linear_base() & 0xFFFF_FFFF);
        drop(d);
        assert!(table.entry(2).is_none());
    }

    #[test]
    fn shared_segment_outlives_first_descriptor() {
        let table = Rc::new(SoftwareTable::new());
        let seg = segment(16);
        let a = SegmentDescriptor::new(1, Access::ReadWrite, seg.clone(), table.clone()).unwrap();
        let b = SegmentDescriptor::new(5, Access::ReadOnly, seg.clone(), table.clone()).unwrap();
        drop(seg);
        drop(a);
        assert!(table.entry(1).is_none());
        assert_eq!(b.segment().size(), 16);
        assert_eq!(Rc::strong_count(b.segment()), 1);
        assert!(table.entry(5).unwrap().flags.read_exec_only());
    }

    #[test]
    fn access_change_reaches_the_table() {
        let table = Rc::new(SoftwareTable::new());
        let d = SegmentDescriptor::new(3, Access::ReadWrite, segment(16), table.clone()).unwrap();
        d.set_access(Access::ExecRead).unwrap();
        assert_eq!(table.entry(3).unwrap().flags.contents(), crate::descriptor::CONTENTS_CODE);
    }
}
