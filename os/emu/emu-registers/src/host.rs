use crate::{LoadRegister, StoreRegisterUnsafe};

/// The host CPU's `DS`, `ES`, `FS` and `GS` selectors.
///
/// The 64-bit host ignores these in its own code, and the kernel neither
/// saves nor restores them on signal delivery. Whatever the guest had loaded
/// is still live when a trap handler starts, and whatever is loaded when the
/// handler returns is what the guest continues with.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct DataSegments {
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

impl LoadRegister for DataSegments {
    #[inline(always)]
    fn load() -> Self {
        let (ds, es, fs, gs): (u16, u16, u16, u16);
        unsafe {
            core::arch::asm!(
                "mov {0:x}, ds",
                "mov {1:x}, es",
                "mov {2:x}, fs",
                "mov {3:x}, gs",
                out(reg) ds,
                out(reg) es,
                out(reg) fs,
                out(reg) gs,
                options(nomem, nostack, preserves_flags)
            );
        }
        Self { ds, es, fs, gs }
    }
}

impl StoreRegisterUnsafe for DataSegments {
    /// Loading `FS`/`GS` replaces their bases with the descriptor bases of the
    /// new selectors. Call this last, after every use of thread-local storage.
    #[inline(always)]
    unsafe fn store_unsafe(self) {
        unsafe {
            core::arch::asm!(
                "mov ds, {0:x}",
                "mov es, {1:x}",
                "mov fs, {2:x}",
                "mov gs, {3:x}",
                in(reg) self.ds,
                in(reg) self.es,
                in(reg) self.fs,
                in(reg) self.gs,
                options(nostack, preserves_flags)
            );
        }
    }
}
