//! # Guest segment memory
//!
//! Every guest segment is backed by one host mapping. The mapping reserves
//! the segment's maximum size up front with no access, then commits pages
//! from the bottom as the segment grows, so a segment never moves and its
//! base can be baked into a hardware descriptor.
//!
//! ```text
//! base                 size   paged_size                      reserved
//!  |<---- committed ---->|.......|<--------- PROT_NONE --------->|
//! ```
//!
//! A segment may start with a skipped prefix that counts towards its size
//! but is never committed, and parts of it may be re-protected separately
//! from the rest ([`Segment::change_range_access`]).
//!
//! | Access      | Host protection        |
//! |-------------|------------------------|
//! | `ReadWrite` | `PROT_READ│PROT_WRITE` |
//! | `ReadOnly`  | `PROT_READ`            |
//! | `ExecRead`  | `PROT_READ│PROT_EXEC`  |
//! | `ExecOnly`  | `PROT_READ│PROT_EXEC`  |
//! | `Invalid`   | `PROT_NONE`            |
//!
//! Execute-only is enforced by the guest's descriptor, not by the host
//! mapping: the trap handler has to read opcodes from code segments.

#![allow(unsafe_code)]

pub mod page;
mod segment;
mod table;

pub use segment::{Placement, Segment, SegmentError};
pub use table::{ReservationPolicy, SegmentId, SegmentTable};

/// Access mode of a guest segment.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Access {
    #[default]
    ReadWrite,
    ReadOnly,
    ExecRead,
    ExecOnly,
    Invalid,
}

impl Access {
    /// Host `mmap`/`mprotect` flags for this access mode.
    #[must_use]
    pub const fn host_protection(self) -> libc::c_int {
        match self {
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Self::ReadOnly => libc::PROT_READ,
            Self::ExecRead | Self::ExecOnly => libc::PROT_READ | libc::PROT_EXEC,
            Self::Invalid => libc::PROT_NONE,
        }
    }

    #[must_use]
    pub const fn is_code(self) -> bool {
        matches!(self, Self::ExecRead | Self::ExecOnly)
    }

    /// Whether the guest may write through a selector with this access.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }

    /// Whether the host mapping can be read.
    #[must_use]
    pub const fn is_host_readable(self) -> bool {
        !matches!(self, Self::Invalid)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReadWrite => "rw",
            Self::ReadOnly => "ro",
            Self::ExecRead => "rx",
            Self::ExecOnly => "x",
            Self::Invalid => "invalid",
        }
    }
}

impl core::fmt::Display for Access {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
