use core::fmt;

/// A guest `selector:offset` address.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct FarPointer {
    pub selector: u16,
    pub offset: u32,
}

impl FarPointer {
    #[inline]
    #[must_use]
    pub const fn new(selector: u16, offset: u32) -> Self {
        Self { selector, offset }
    }

    /// A null far pointer has both parts zero.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.selector == 0 && self.offset == 0
    }

    /// Same selector, offset moved by `delta` (wrapping like the CPU does).
    #[inline]
    #[must_use]
    pub const fn add(self, delta: u32) -> Self {
        Self {
            selector: self.selector,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

impl fmt::Display for FarPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:08x}", self.selector, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_selector_colon_offset() {
        assert_eq!(FarPointer::new(0x17, 0x1234).to_string(), "0017:00001234");
    }

    #[test]
    fn add_wraps() {
        let p = FarPointer::new(7, u32::MAX).add(2);
        assert_eq!(p.offset, 1);
        assert_eq!(p.selector, 7);
        assert!(!p.is_null());
        assert!(FarPointer::default().is_null());
    }
}
