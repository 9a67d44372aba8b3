//! # Guest descriptor tables
//!
//! Guest segments are published to the CPU as local descriptor table (LDT)
//! entries, so ordinary `mov eax, [es:ebx]` instructions are bounds- and
//! permission-checked by hardware. Publishing goes through the
//! [`DescriptorTable`] trait:
//!
//! | Backend          | Effect                                                 |
//! |------------------|--------------------------------------------------------|
//! | [`LinuxLdt`]     | `modify_ldt(2)` on the current process                 |
//! | [`SoftwareTable`]| records entries only; software checks do all the work |
//!
//! Entries are described with the host's `user_desc` record ([`UserDesc`]).
//! A [`SegmentDescriptor`] owns one slot for as long as it lives: creating it
//! installs the entry, dropping it clears the entry again.

mod binding;
#[cfg(all(feature = "ldt", target_os = "linux", target_arch = "x86_64"))]
mod linux;
mod software;
mod user_desc;

pub use binding::SegmentDescriptor;
#[cfg(all(feature = "ldt", target_os = "linux", target_arch = "x86_64"))]
pub use linux::LinuxLdt;
pub use software::SoftwareTable;
pub use user_desc::{UserDesc, UserDescFlags};

use std::io;

/// Number of entries in a local descriptor table.
pub const LDT_ENTRIES: u16 = 8192;

/// `user_desc.contents` for data segments.
pub const CONTENTS_DATA: u8 = 0;

/// `user_desc.contents` for non-conforming code segments.
pub const CONTENTS_CODE: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor table rejected slot {slot}: {source}")]
    Rejected {
        slot: u16,
        #[source]
        source: io::Error,
    },
    #[error("descriptor table is full")]
    TableFull,
    #[error("descriptor slot {0} is already bound")]
    SlotInUse(u16),
    #[error("slot {0} is outside the descriptor table")]
    InvalidSlot(u16),
    #[error("segment base {0:#x} does not fit a 32-bit descriptor")]
    BaseOutOfRange(usize),
}

/// A table guest descriptors can be installed into.
pub trait DescriptorTable {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Install (or overwrite) the entry described by `desc`.
    fn install(&self, desc: &UserDesc) -> Result<(), DescriptorError>;

    /// Clear slot `slot`.
    fn remove(&self, slot: u16) -> Result<(), DescriptorError> {
        self.install(&UserDesc::empty(slot))
    }

    /// Whether installed entries are enforced by the CPU.
    fn is_hardware(&self) -> bool {
        false
    }
}
