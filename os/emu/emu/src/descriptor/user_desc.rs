use super::{CONTENTS_CODE, CONTENTS_DATA, DescriptorError};
use bitfield_struct::bitfield;
use emu_memory::Access;
use emu_memory::page::{PAGE_SIZE, pages_for};

/// Segments up to this size get a byte-granular limit.
const BYTE_GRANULAR_MAX: usize = 0x1_0000;

/// Flag word of the host `user_desc` record.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct UserDescFlags {
    /// 32-bit default operand size.
    pub seg_32bit: bool,
    /// 0 = data, 1 = expand-down data, 2 = code.
    #[bits(2)]
    pub contents: u8,
    /// Data: read-only. Code: execute-only.
    pub read_exec_only: bool,
    /// Limit is counted in 4 KiB pages.
    pub limit_in_pages: bool,
    pub seg_not_present: bool,
    pub useable: bool,
    /// Long-mode code segment; never set for guests.
    pub lm: bool,
    #[bits(24)]
    _reserved: u32,
}

/// Host `struct user_desc`, as consumed by `modify_ldt(2)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserDesc {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    pub flags: UserDescFlags,
}

const _: () = assert!(size_of::<UserDesc>() == 16);

impl UserDesc {
    /// Describe a segment of `size` bytes at `base` for slot `slot`.
    ///
    /// A limit of zero still admits one byte, so an empty segment is
    /// installed not-present.
    pub fn for_segment(
        slot: u16,
        base: usize,
        size: usize,
        access: Access,
    ) -> Result<Self, DescriptorError> {
        let base_addr = u32::try_from(base).map_err(|_| DescriptorError::BaseOutOfRange(base))?;

        let (limit, limit_in_pages) = if size > BYTE_GRANULAR_MAX {
            (pages_for(size) - 1, true)
        } else {
            (size.saturating_sub(1), false)
        };

        let flags = UserDescFlags::new()
            .with_seg_32bit(true)
            .with_contents(if access.is_code() {
                CONTENTS_CODE
            } else {
                CONTENTS_DATA
            })
            .with_read_exec_only(matches!(access, Access::ExecOnly | Access::ReadOnly))
            .with_limit_in_pages(limit_in_pages)
            .with_seg_not_present(size == 0 || matches!(access, Access::Invalid))
            .with_useable(true);

        Ok(Self {
            entry_number: u32::from(slot),
            base_addr,
            limit: u32::try_from(limit).unwrap_or(u32::MAX),
            flags,
        })
    }

    /// The "empty" entry that clears `slot`.
    #[must_use]
    pub fn empty(slot: u16) -> Self {
        Self {
            entry_number: u32::from(slot),
            base_addr: 0,
            limit: 0,
            flags: UserDescFlags::new()
                .with_read_exec_only(true)
                .with_seg_not_present(true),
        }
    }

    /// Whether this record clears its slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base_addr == 0
            && self.limit == 0
            && self.flags.contents() == 0
            && self.flags.read_exec_only()
            && !self.flags.seg_32bit()
            && !self.flags.limit_in_pages()
            && self.flags.seg_not_present()
            && !self.flags.useable()
    }

    /// Number of addressable bytes the CPU will allow.
    #[must_use]
    pub fn limit_bytes(&self) -> usize {
        if self.flags.seg_not_present() {
            return 0;
        }
        let units = self.limit as usize + 1;
        if self.flags.limit_in_pages() {
            units * PAGE_SIZE
        } else {
            units
        }
    }

    #[must_use]
    pub fn slot(&self) -> u16 {
        u16::try_from(self.entry_number).unwrap_or(u16::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_segments_are_byte_granular() {
        let d = UserDesc::for_segment(3, 0x4000_0000, 100, Access::ReadWrite).unwrap();
        assert_eq!(d.entry_number, 3);
        assert_eq!(d.limit, 99);
        assert!(!d.flags.limit_in_pages());
        assert_eq!(d.limit_bytes(), 100);
        assert_eq!(d.flags.contents(), CONTENTS_DATA);
        assert!(!d.flags.read_exec_only());
        assert!(d.flags.seg_32bit());
        assert!(d.flags.useable());
    }

    #[test]
    fn large_segments_use_pages() {
        let d = UserDesc::for_segment(0, 0x1000, 0x10_0001, Access::ReadWrite).unwrap();
        assert!(d.flags.limit_in_pages());
        assert_eq!(d.limit, 0x100);
        assert_eq!(d.limit_bytes(), 0x10_1000);
    }

    #[test]
    fn permissions_follow_access() {
        let code = UserDesc::for_segment(1, 0, 16, Access::ExecOnly).unwrap();
        assert_eq!(code.flags.contents(), CONTENTS_CODE);
        assert!(code.flags.read_exec_only());

        let rx = UserDesc::for_segment(1, 0, 16, Access::ExecRead).unwrap();
        assert!(!rx.flags.read_exec_only());

        let ro = UserDesc::for_segment(1, 0, 16, Access::ReadOnly).unwrap();
        assert_eq!(ro.flags.contents(), CONTENTS_DATA);
        assert!(ro.flags.read_exec_only());

        let none = UserDesc::for_segment(1, 0, 16, Access::Invalid).unwrap();
        assert!(none.flags.seg_not_present());
    }

    #[test]
    fn empty_segments_are_not_present() {
        let d = UserDesc::for_segment(4, 0x2000, 0, Access::ReadWrite).unwrap();
        assert!(d.flags.seg_not_present());
        assert_eq!(d.limit_bytes(), 0);
        assert!(!d.is_empty());

        let one = UserDesc::for_segment(4, 0x2000, 1, Access::ReadWrite).unwrap();
        assert!(!one.flags.seg_not_present());
        assert_eq!(one.limit_bytes(), 1);
    }

    #[test]
    fn base_must_fit_32_bits() {
        let high = 0x1_0000_0000_usize;
        assert!(matches!(
            UserDesc::for_segment(0, high, 16, Access::ReadWrite),
            Err(DescriptorError::BaseOutOfRange(_))
        ));
    }

    #[test]
    fn empty_entry_is_recognized() {
        assert!(UserDesc::empty(9).is_empty());
        assert!(!UserDesc::for_segment(9, 0, 1, Access::ReadWrite).unwrap().is_empty());
    }
}
