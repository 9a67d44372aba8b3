//! # Segment selectors
//!
//! ```text
//!  15            3 2  1  0
//! +----------------+--+----+
//! |   Index[12:0]  |TI| RPL|
//! +----------------+--+----+  (TI=0 → GDT, TI=1 → LDT; RPL=0..3)
//! ```
//!
//! Every guest segment lives in the local descriptor table and is addressed
//! with RPL 3, so the selector for table slot `n` is `(n << 3) | 4 | 3`.
//! Anything with `TI = 0` belongs to the host.

use crate::Rpl;
use bitfield_struct::bitfield;

/// Privilege level baked into every guest selector.
pub const GUEST_RPL: Rpl = Rpl::Ring3;

/// Which descriptor table a selector addresses.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Table {
    /// Global Descriptor Table
    Gdt = 0,
    /// Local Descriptor Table
    Ldt = 1,
}

impl Table {
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        if bits == 0 { Self::Gdt } else { Self::Ldt }
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Raw 16-bit selector encoding (index/TI/RPL).
#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct Selector {
    /// Requested Privilege Level (bits 0..1).
    #[bits(2)]
    pub rpl: Rpl,
    /// Table Indicator (bit 2): 0 = GDT, 1 = LDT.
    #[bits(1)]
    pub ti: Table,
    /// Descriptor index (bits 3..15).
    #[bits(13)]
    pub index: u16,
}

impl Selector {
    /// Create a raw selector (no semantic checks).
    #[inline]
    #[must_use]
    pub const fn new_with(index: u16, table: Table, rpl: Rpl) -> Self {
        Self::new().with_index(index).with_ti(table).with_rpl(rpl)
    }

    /// Selector naming guest descriptor slot `index`.
    #[inline]
    #[must_use]
    pub const fn guest(index: u16) -> Self {
        Self::new_with(index, Table::Ldt, GUEST_RPL)
    }

    /// Return the selector as a plain `u16`.
    #[inline]
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self.into_bits()
    }

    /// Whether the selector points into the guest's (local) table.
    #[inline]
    #[must_use]
    pub const fn is_guest(self) -> bool {
        matches!(self.ti(), Table::Ldt)
    }
}

impl core::fmt::LowerHex for Selector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.to_u16(), f)
    }
}

const _: () = {
    assert!(Selector::guest(0).to_u16() == 0x0007);
    assert!(Selector::guest(15).to_u16() == 0x007F);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_selector_layout() {
        let s = Selector::guest(5);
        assert_eq!(s.to_u16(), (5 << 3) | 4 | 3);
        assert_eq!(s.index(), 5);
        assert!(s.is_guest());
        assert_eq!(s.rpl(), Rpl::Ring3);
    }

    #[test]
    fn host_selectors_are_not_guest() {
        // 0x33 is the 64-bit user code selector on Linux.
        assert!(!Selector::from(0x33).is_guest());
        assert!(!Selector::from(0x78).is_guest());
        assert!(Selector::from(0x7C).is_guest());
    }

    #[test]
    fn slot_recovers_from_raw() {
        assert_eq!(Selector::from(0x7F).index(), 15);
    }
}
