//! Requested Privilege Level (RPL).
//!
//! RPL lives in the **low 2 bits of a segment selector**. Guest selectors
//! always carry RPL 3; the host runs its own code at the same CPL, so the
//! value only matters for the CPU's `max(CPL, RPL) ≤ DPL` check.

/// RPL mask in a 16-bit selector.
pub const RPL_MASK: u16 = 0b11;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Rpl {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

impl Rpl {
    /// Encode as the low two bits of a selector.
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Decode from the low two bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(value_low2: u8) -> Self {
        match value_low2 & 0b11 {
            0 => Self::Ring0,
            1 => Self::Ring1,
            2 => Self::Ring2,
            _ => Self::Ring3,
        }
    }

    /// Extract `RPL` from a 16-bit segment selector value.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_selector(selector: u16) -> Self {
        Self::from_bits((selector & RPL_MASK) as u8)
    }

    /// Return `selector` with its `RPL` bits replaced by `self`.
    #[inline]
    #[must_use]
    pub const fn apply_to_selector(self, selector: u16) -> u16 {
        (selector & !RPL_MASK) | self.into_bits() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpl_bits_roundtrip() {
        for b in 0u8..=3 {
            assert_eq!(Rpl::from_bits(b).into_bits(), b);
        }
    }

    #[test]
    fn apply_only_touches_low_bits() {
        let base: u16 = 0x1234 & !RPL_MASK;
        let user = Rpl::Ring3.apply_to_selector(base);
        assert_eq!(Rpl::from_selector(user), Rpl::Ring3);
        assert_eq!(user & !RPL_MASK, base);
    }
}
