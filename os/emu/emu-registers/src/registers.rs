use crate::{Eflags, Selector};
use core::fmt;

/// The six IA-32 segment registers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SegmentRegister {
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

impl SegmentRegister {
    /// Data segment registers in the order they are reported in dumps.
    pub const DATA: [Self; 4] = [Self::Ds, Self::Es, Self::Fs, Self::Gs];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cs => "cs",
            Self::Ss => "ss",
            Self::Ds => "ds",
            Self::Es => "es",
            Self::Fs => "fs",
            Self::Gs => "gs",
        }
    }
}

impl fmt::Display for SegmentRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Suspended guest register file.
///
/// Filled from the host's signal context (plus the data segment registers
/// read from the CPU) when a trap arrives and written back before resuming.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: Eflags,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

impl Registers {
    #[inline]
    #[must_use]
    pub const fn segment(&self, reg: SegmentRegister) -> u16 {
        match reg {
            SegmentRegister::Cs => self.cs,
            SegmentRegister::Ss => self.ss,
            SegmentRegister::Ds => self.ds,
            SegmentRegister::Es => self.es,
            SegmentRegister::Fs => self.fs,
            SegmentRegister::Gs => self.gs,
        }
    }

    #[inline]
    #[must_use]
    pub const fn selector(&self, reg: SegmentRegister) -> Selector {
        Selector::from_bits(self.segment(reg))
    }

    #[inline]
    pub const fn set_segment(&mut self, reg: SegmentRegister, value: u16) {
        match reg {
            SegmentRegister::Cs => self.cs = value,
            SegmentRegister::Ss => self.ss = value,
            SegmentRegister::Ds => self.ds = value,
            SegmentRegister::Es => self.es = value,
            SegmentRegister::Fs => self.fs = value,
            SegmentRegister::Gs => self.gs = value,
        }
    }

    #[inline]
    #[must_use]
    pub const fn al(&self) -> u8 {
        self.eax.to_le_bytes()[0]
    }

    #[inline]
    #[must_use]
    pub const fn ah(&self) -> u8 {
        self.eax.to_le_bytes()[1]
    }

    #[inline]
    #[must_use]
    pub const fn cl(&self) -> u8 {
        self.ecx.to_le_bytes()[0]
    }

    #[inline]
    #[must_use]
    pub const fn ch(&self) -> u8 {
        self.ecx.to_le_bytes()[1]
    }

    #[inline]
    pub const fn set_al(&mut self, value: u8) {
        self.eax = (self.eax & !0xFF) | value as u32;
    }

    #[inline]
    pub const fn set_ah(&mut self, value: u8) {
        self.eax = (self.eax & !0xFF00) | ((value as u32) << 8);
    }

    #[inline]
    pub const fn set_ch(&mut self, value: u8) {
        self.ecx = (self.ecx & !0xFF00) | ((value as u32) << 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_registers_alias_their_parents() {
        let mut r = Registers {
            eax: 0x1234_5678,
            ecx: 0xAABB_CCDD,
            ..Registers::default()
        };
        assert_eq!(r.al(), 0x78);
        assert_eq!(r.ah(), 0x56);
        assert_eq!(r.cl(), 0xDD);
        assert_eq!(r.ch(), 0xCC);

        r.set_al(0x01);
        r.set_ah(0x02);
        r.set_ch(0x03);
        assert_eq!(r.eax, 0x1234_0201);
        assert_eq!(r.ecx, 0xAABB_03DD);
    }

    #[test]
    fn segment_accessors_cover_every_register() {
        let mut r = Registers::default();
        for (i, reg) in [
            SegmentRegister::Cs,
            SegmentRegister::Ss,
            SegmentRegister::Ds,
            SegmentRegister::Es,
            SegmentRegister::Fs,
            SegmentRegister::Gs,
        ]
        .into_iter()
        .enumerate()
        {
            let value = u16::try_from(i).unwrap() * 8 + 7;
            r.set_segment(reg, value);
            assert_eq!(r.segment(reg), value);
            assert_eq!(r.selector(reg).index(), u16::try_from(i).unwrap());
        }
    }
}
