//! # Guest context
//!
//! A [`GuestContext`] is a view over a suspended guest: the register file
//! captured when the trap arrived, and the session whose segments those
//! registers refer to. All guest memory access goes through
//! [`Session::translate`], so every access is bounds-checked in software even
//! when hardware descriptors are in use.

mod dump;

pub use dump::hexdump;

use crate::errno::Errno;
use crate::far_ptr::FarPointer;
use crate::session::{GuestFault, RwOp, Session};
use core::ptr::NonNull;
use emu_registers::{Registers, SegmentRegister, Selector};

/// Fixed-size little-endian values that can be copied in and out of guest
/// memory.
pub trait GuestValue: Copy {
    const SIZE: usize;

    fn from_le_slice(bytes: &[u8]) -> Self;

    fn write_le_slice(self, out: &mut [u8]);
}

macro_rules! guest_value {
    ($($t:ty),*) => {$(
        impl GuestValue for $t {
            const SIZE: usize = size_of::<$t>();

            #[inline]
            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; size_of::<$t>()];
                raw.copy_from_slice(&bytes[..size_of::<$t>()]);
                <$t>::from_le_bytes(raw)
            }

            #[inline]
            fn write_le_slice(self, out: &mut [u8]) {
                out[..size_of::<$t>()].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

guest_value!(u8, u16, u32, u64, i8, i16, i32, i64);

/// Mutable view of a suspended guest.
pub struct GuestContext<'a> {
    regs: &'a mut Registers,
    session: &'a Session,
}

impl<'a> GuestContext<'a> {
    pub const fn new(regs: &'a mut Registers, session: &'a Session) -> Self {
        Self { regs, session }
    }

    #[inline]
    #[must_use]
    pub const fn registers(&self) -> &Registers {
        self.regs
    }

    #[inline]
    pub const fn registers_mut(&mut self) -> &mut Registers {
        self.regs
    }

    #[inline]
    #[must_use]
    pub const fn session(&self) -> &'a Session {
        self.session
    }

    /// Resolve `reg:offset` to a host pointer valid for `size` bytes.
    pub fn translate(&self, reg: SegmentRegister, offset: u32, size: usize, op: RwOp) -> Result<NonNull<u8>, GuestFault> {
        self.session.translate(self.regs.selector(reg), offset, size, op)
    }

    /// Resolve a far pointer to a host pointer valid for `size` bytes.
    pub fn translate_far(&self, ptr: FarPointer, size: usize, op: RwOp) -> Result<NonNull<u8>, GuestFault> {
        self.session.translate(Selector::from(ptr.selector), ptr.offset, size, op)
    }

    /// Copy guest bytes at `ptr` into `out`.
    pub fn read_bytes(&self, ptr: FarPointer, out: &mut [u8]) -> Result<(), GuestFault> {
        let src = self.translate_far(ptr, out.len(), RwOp::Read)?;
        // SAFETY: translate checked the whole range against the committed size.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Copy `data` into guest memory at `ptr`.
    pub fn write_bytes(&mut self, ptr: FarPointer, data: &[u8]) -> Result<(), GuestFault> {
        let dst = self.translate_far(ptr, data.len(), RwOp::Write)?;
        // SAFETY: as above; the descriptor is writable, so is the mapping.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
        Ok(())
    }

    pub fn read<T: GuestValue>(&self, reg: SegmentRegister, offset: u32) -> Result<T, GuestFault> {
        self.read_far(self.far(reg, offset))
    }

    pub fn write<T: GuestValue>(&mut self, reg: SegmentRegister, offset: u32, value: T) -> Result<(), GuestFault> {
        self.write_far(self.far(reg, offset), value)
    }

    pub fn read_far<T: GuestValue>(&self, ptr: FarPointer) -> Result<T, GuestFault> {
        let mut raw = [0u8; 8];
        self.read_bytes(ptr, &mut raw[..T::SIZE])?;
        Ok(T::from_le_slice(&raw))
    }

    pub fn write_far<T: GuestValue>(&mut self, ptr: FarPointer, value: T) -> Result<(), GuestFault> {
        let mut raw = [0u8; 8];
        value.write_le_slice(&mut raw);
        self.write_bytes(ptr, &raw[..T::SIZE])
    }

    /// Read a NUL-terminated string of at most `max` bytes. Faults render as
    /// `<unreadable>`, since this is used for diagnostics.
    #[must_use]
    pub fn read_string(&self, ptr: FarPointer, max: usize) -> String {
        let selector = Selector::from(ptr.selector);
        let available = self.session.readable_len(selector, ptr.offset).min(max);
        let mut buf = vec![0u8; available];
        if available == 0 || self.read_bytes(ptr, &mut buf).is_err() {
            return "<unreadable>".to_owned();
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    /// Push a dword onto the guest stack (`SS:ESP`).
    pub fn push_stack(&mut self, value: u32) -> Result<(), GuestFault> {
        let esp = self.regs.esp.wrapping_sub(4);
        self.write(SegmentRegister::Ss, esp, value)?;
        self.regs.esp = esp;
        Ok(())
    }

    /// Push a word onto the guest stack.
    pub fn push_stack16(&mut self, value: u16) -> Result<(), GuestFault> {
        let esp = self.regs.esp.wrapping_sub(2);
        self.write(SegmentRegister::Ss, esp, value)?;
        self.regs.esp = esp;
        Ok(())
    }

    /// Pop a dword off the guest stack.
    pub fn pop_stack(&mut self) -> Result<u32, GuestFault> {
        let value = self.read(SegmentRegister::Ss, self.regs.esp)?;
        self.regs.esp = self.regs.esp.wrapping_add(4);
        Ok(value)
    }

    /// Pop a word off the guest stack.
    pub fn pop_stack16(&mut self) -> Result<u16, GuestFault> {
        let value = self.read(SegmentRegister::Ss, self.regs.esp)?;
        self.regs.esp = self.regs.esp.wrapping_add(2);
        Ok(value)
    }

    /// Push the complete register file onto the guest stack.
    ///
    /// Frame layout, from the highest address down: `eax ecx edx ebx esp ebp
    /// esi edi eflags cs eip ds es gs ss`. The saved `esp` is the value before
    /// the first push. `fs` is not part of the frame.
    pub fn save_context(&mut self) -> Result<(), GuestFault> {
        let r = *self.regs;
        let frame = [
            r.eax,
            r.ecx,
            r.edx,
            r.ebx,
            r.esp,
            r.ebp,
            r.esi,
            r.edi,
            r.eflags.into_bits(),
            u32::from(r.cs),
            r.eip,
            u32::from(r.ds),
            u32::from(r.es),
            u32::from(r.gs),
            u32::from(r.ss),
        ];
        for value in frame {
            if let Err(fault) = self.push_stack(value) {
                self.regs.esp = r.esp;
                return Err(fault);
            }
        }
        Ok(())
    }

    /// Inverse of [`save_context`](Self::save_context). The saved `esp` is
    /// skipped; the stack pointer ends up just above the frame.
    #[allow(clippy::cast_possible_truncation)]
    pub fn restore_context(&mut self) -> Result<(), GuestFault> {
        let start = self.regs.esp;
        let mut frame = [0u32; 15];
        for slot in frame.iter_mut().rev() {
            match self.pop_stack() {
                Ok(v) => *slot = v,
                Err(fault) => {
                    self.regs.esp = start;
                    return Err(fault);
                }
            }
        }
        let [eax, ecx, edx, ebx, _esp, ebp, esi, edi, eflags, cs, eip, ds, es, gs, ss] = frame;
        let r = &mut *self.regs;
        r.eax = eax;
        r.ecx = ecx;
        r.edx = edx;
        r.ebx = ebx;
        r.ebp = ebp;
        r.esi = esi;
        r.edi = edi;
        r.eflags = emu_registers::Eflags::from_bits(eflags);
        r.cs = cs as u16;
        r.eip = eip;
        r.ds = ds as u16;
        r.es = es as u16;
        r.gs = gs as u16;
        r.ss = ss as u16;
        Ok(())
    }

    /// Set the guest's return register.
    #[inline]
    pub const fn set_return(&mut self, value: u32) {
        self.regs.eax = value;
    }

    #[inline]
    pub fn set_carry(&mut self, carry: bool) {
        self.regs.eflags.set_cf_carry(carry);
    }

    /// Report `errno` the way guest syscall stubs expect: error number in the
    /// return register, carry set.
    pub fn set_syscall_error(&mut self, errno: Errno) {
        self.regs.eax = u32::from(errno.raw());
        self.set_carry(true);
    }

    /// Report success: zero return register, carry clear.
    pub fn set_syscall_ok(&mut self) {
        self.regs.eax = 0;
        self.set_carry(false);
    }

    /// Advance the instruction pointer past an instruction of `len` bytes.
    #[inline]
    pub const fn advance_ip(&mut self, len: u32) {
        self.regs.eip = self.regs.eip.wrapping_add(len);
    }

    #[inline]
    const fn far(&self, reg: SegmentRegister, offset: u32) -> FarPointer {
        FarPointer::new(self.regs.segment(reg), offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::descriptor::SoftwareTable;
    use emu_memory::page::PAGE_SIZE;
    use emu_memory::{Access, ReservationPolicy};
    use std::rc::Rc;

    fn session() -> Session {
        let config = Config::default()
            .with_software_segments()
            .with_reservation(ReservationPolicy {
                default: 4 * PAGE_SIZE,
                writable: 4 * PAGE_SIZE,
            });
        Session::new(config, Rc::new(SoftwareTable::new()))
    }

    fn stack(session: &Session, size: usize) -> Registers {
        let seg = session.allocate_segment(Access::ReadWrite, size).unwrap();
        let sel = session.create_descriptor(Access::ReadWrite, seg).unwrap();
        Registers {
            ss: sel.to_u16(),
            ds: sel.to_u16(),
            esp: u32::try_from(size).unwrap(),
            ..Registers::default()
        }
    }

    #[test]
    fn push_pop_roundtrip_both_widths() {
        let s = session();
        let mut regs = stack(&s, 64);
        let mut ctx = GuestContext::new(&mut regs, &s);
        ctx.push_stack(0xDEAD_BEEF).unwrap();
        ctx.push_stack16(0x1234).unwrap();
        assert_eq!(ctx.registers().esp, 58);
        assert_eq!(ctx.pop_stack16().unwrap(), 0x1234);
        assert_eq!(ctx.pop_stack().unwrap(), 0xDEAD_BEEF);
        assert_eq!(ctx.registers().esp, 64);
    }

    #[test]
    fn stack_overflow_faults_without_moving_esp() {
        let s = session();
        let mut regs = stack(&s, 64);
        regs.esp = 2;
        let mut ctx = GuestContext::new(&mut regs, &s);
        assert!(matches!(ctx.push_stack(1), Err(GuestFault::OutOfBounds { .. })));
        assert_eq!(ctx.registers().esp, 2);
    }

    #[test]
    fn save_restore_roundtrip() {
        let s = session();
        let mut regs = stack(&s, 256);
        regs.eax = 1;
        regs.ebx = 2;
        regs.ecx = 3;
        regs.edx = 4;
        regs.esi = 5;
        regs.edi = 6;
        regs.ebp = 7;
        regs.eip = 0x1000;
        regs.cs = 0x0F;
        regs.es = 0x1F;
        regs.gs = 0x27;
        regs.eflags = regs.eflags.with_cf_carry(true);
        let before = regs;

        let mut ctx = GuestContext::new(&mut regs, &s);
        ctx.save_context().unwrap();
        assert_eq!(ctx.registers().esp, 256 - 15 * 4);
        // The frame starts with eax at the highest address.
        assert_eq!(ctx.read::<u32>(SegmentRegister::Ss, 252).unwrap(), 1);
        assert_eq!(ctx.read::<u32>(SegmentRegister::Ss, 236).unwrap(), 256);
        assert_eq!(ctx.read::<u32>(SegmentRegister::Ss, 196).unwrap(), u32::from(before.ss));

        let r = ctx.registers_mut();
        r.eax = 0;
        r.eip = 0;
        r.cs = 0;
        r.eflags = emu_registers::Eflags::new();

        ctx.restore_context().unwrap();
        assert_eq!(regs, before);
    }

    #[test]
    fn syscall_error_convention() {
        let s = session();
        let mut regs = Registers::default();
        let mut ctx = GuestContext::new(&mut regs, &s);
        ctx.set_syscall_error(Errno::ENOSYS);
        assert_eq!(ctx.registers().eax, 89);
        assert!(ctx.registers().eflags.cf_carry());
        ctx.set_syscall_ok();
        assert_eq!(ctx.registers().eax, 0);
        assert!(!ctx.registers().eflags.cf_carry());
    }

    #[test]
    fn typed_access_and_strings() {
        let s = session();
        let mut regs = stack(&s, 64);
        let ds = regs.ds;
        let mut ctx = GuestContext::new(&mut regs, &s);
        ctx.write(SegmentRegister::Ds, 8, -2i16).unwrap();
        assert_eq!(ctx.read::<u16>(SegmentRegister::Ds, 8).unwrap(), 0xFFFE);
        ctx.write_bytes(FarPointer::new(ds, 16), b"hi there\0junk").unwrap();
        assert_eq!(ctx.read_string(FarPointer::new(ds, 16), 32), "hi there");
        assert_eq!(ctx.read_string(FarPointer::new(ds, 60), 32), "");
        assert_eq!(ctx.read_string(FarPointer::new(0x2B, 0), 32), "<unreadable>");
    }
}
