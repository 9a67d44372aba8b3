//! Linux signal backend.
//!
//! The guest executes directly on the host CPU through descriptors in the
//! process's local descriptor table. Its syscall instruction and bad segment
//! loads raise `SIGSEGV`, whose handler runs on an alternate stack and hands
//! the interrupted registers to the [`TrapSink`].
//!
//! Entering the guest is a context switch through the same mechanism: the
//! backend sends itself `SIGUSR1` and the handler replaces the interrupted
//! host context with the guest's start-up registers.
//!
//! The kernel leaves `DS`, `ES`, `FS` and `GS` alone on signal delivery, so
//! both handlers read the guest's selectors off the CPU first and put the
//! host `FS`/`GS` bases back before running any code that may touch
//! thread-local storage. Loading the guest selectors again is the last thing
//! a handler does.

use super::{TrapBackend, TrapError, TrapInfo, TrapOutcome, TrapSink};
use emu_memory::page::PAGE_SIZE;
use emu_memory::{Access, Placement, Segment, SegmentId};
use emu_registers::{DataSegments, Eflags, LoadRegister, Registers, StoreRegisterUnsafe};
use libc::{c_int, c_void, siginfo_t, ucontext_t};
use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

const ALT_STACK_SIZE: usize = 8 * PAGE_SIZE;

const ARCH_SET_GS: u64 = 0x1001;
const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

/// `uc_flags`: the saved `SS` is valid and must be restored as is.
const UC_SIGCONTEXT_SS: libc::c_ulong = 0x2;
const UC_STRICT_RESTORE_SS: libc::c_ulong = 0x4;

static SINK: AtomicPtr<Box<dyn TrapSink>> = AtomicPtr::new(core::ptr::null_mut());
static START: AtomicPtr<Registers> = AtomicPtr::new(core::ptr::null_mut());
static HOST_FS_BASE: AtomicU64 = AtomicU64::new(0);
static HOST_GS_BASE: AtomicU64 = AtomicU64::new(0);

/// Runs the guest natively and receives its traps as signals.
///
/// There is one guest per process, so at most one backend may be entered.
pub struct SignalBackend {
    alt_stack: Option<Segment>,
}

impl SignalBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self { alt_stack: None }
    }

    fn install(&mut self) -> Result<(), TrapError> {
        save_host_bases()?;

        let stack = Segment::allocate(
            SegmentId(u16::MAX),
            Access::ReadWrite,
            ALT_STACK_SIZE,
            ALT_STACK_SIZE,
            Placement::Anywhere,
        )
        .map_err(|e| TrapError::Install(io::Error::other(e)))?;
        let alt = libc::stack_t {
            ss_sp: stack.base().as_ptr().cast(),
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        if unsafe { libc::sigaltstack(&alt, core::ptr::null_mut()) } != 0 {
            return Err(TrapError::Install(io::Error::last_os_error()));
        }
        self.alt_stack = Some(stack);

        unsafe {
            register(libc::SIGSEGV, on_fault, libc::SA_SIGINFO | libc::SA_ONSTACK)?;
            register(
                libc::SIGUSR1,
                on_enter,
                libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESETHAND,
            )?;
        }
        Ok(())
    }
}

impl Default for SignalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapBackend for SignalBackend {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn enter(&mut self, sink: Box<dyn TrapSink>, start: Registers) -> Result<Infallible, TrapError> {
        if !SINK.load(Ordering::Acquire).is_null() {
            return Err(TrapError::Install(io::Error::from(io::ErrorKind::AlreadyExists)));
        }
        self.install()?;

        SINK.store(Box::into_raw(Box::new(sink)), Ordering::Release);
        START.store(Box::into_raw(Box::new(start)), Ordering::Release);
        log::debug!(target: "trap", "entering guest");

        if unsafe { libc::raise(libc::SIGUSR1) } != 0 {
            return Err(TrapError::Install(io::Error::last_os_error()));
        }
        Err(TrapError::GuestReturned)
    }
}

impl Drop for SignalBackend {
    fn drop(&mut self) {
        if self.alt_stack.take().is_none() {
            return;
        }
        unsafe {
            libc::signal(libc::SIGUSR1, libc::SIG_DFL);
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            let disable = libc::stack_t {
                ss_sp: core::ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: 0,
            };
            libc::sigaltstack(&disable, core::ptr::null_mut());
        }
    }
}

type Handler = unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

#[allow(clippy::fn_to_numeric_cast_any)]
unsafe fn register(signal: c_int, handler: Handler, flags: c_int) -> Result<(), TrapError> {
    let mut sa: libc::sigaction = unsafe { core::mem::zeroed() };
    sa.sa_sigaction = handler as libc::sighandler_t;
    sa.sa_flags = flags;
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signal, &sa, core::ptr::null_mut()) != 0 {
            return Err(TrapError::Install(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// `SIGSEGV`: the guest trapped.
unsafe extern "C" fn on_fault(signal: c_int, _info: *mut siginfo_t, uctx: *mut c_void) {
    let guest = DataSegments::load();
    unsafe { restore_host_bases() };

    let uc = unsafe { &mut *uctx.cast::<ucontext_t>() };
    let mut regs = read_registers(uc, guest);
    let gregs = &uc.uc_mcontext.gregs;
    let info = TrapInfo {
        signal,
        trapno: greg_u64(gregs[greg(libc::REG_TRAPNO)]),
        error_code: greg_u64(gregs[greg(libc::REG_ERR)]),
        fault_address: greg_u64(gregs[greg(libc::REG_CR2)]),
    };

    let sink = SINK.load(Ordering::Acquire);
    let Some(sink) = (unsafe { sink.as_mut() }) else {
        log::error!(target: "trap", "signal {signal} without a trap sink");
        unsafe { libc::_exit(128 + signal) };
    };

    match sink.dispatch(&mut regs, &info) {
        TrapOutcome::Resume => {}
        TrapOutcome::Terminate(status) => {
            log::debug!(target: "trap", "guest exited with status {status}");
            std::process::exit(status);
        }
        TrapOutcome::Fatal(e) => {
            log::error!(target: "trap", "{e}");
            unsafe { libc::_exit(128 + signal) };
        }
    }

    write_registers(uc, &regs);
    unsafe { segments_of(&regs).store_unsafe() };
}

/// `SIGUSR1`: switch from the host to the guest.
unsafe extern "C" fn on_enter(_signal: c_int, _info: *mut siginfo_t, uctx: *mut c_void) {
    unsafe { restore_host_bases() };

    let start = START.swap(core::ptr::null_mut(), Ordering::AcqRel);
    if start.is_null() {
        return;
    }
    let regs = *unsafe { Box::from_raw(start) };

    let uc = unsafe { &mut *uctx.cast::<ucontext_t>() };
    clear_host_state(uc);
    write_registers(uc, &regs);
    uc.uc_flags |= UC_SIGCONTEXT_SS | UC_STRICT_RESTORE_SS;
    log::debug!(target: "trap", "guest starts at {:04x}:{:08x}", regs.cs, regs.eip);

    unsafe { segments_of(&regs).store_unsafe() };
}

fn read_registers(uc: &ucontext_t, segments: DataSegments) -> Registers {
    let g = &uc.uc_mcontext.gregs;
    let csgsfs = greg_u64(g[greg(libc::REG_CSGSFS)]);
    Registers {
        eax: low32(g[greg(libc::REG_RAX)]),
        ebx: low32(g[greg(libc::REG_RBX)]),
        ecx: low32(g[greg(libc::REG_RCX)]),
        edx: low32(g[greg(libc::REG_RDX)]),
        esi: low32(g[greg(libc::REG_RSI)]),
        edi: low32(g[greg(libc::REG_RDI)]),
        ebp: low32(g[greg(libc::REG_RBP)]),
        esp: low32(g[greg(libc::REG_RSP)]),
        eip: low32(g[greg(libc::REG_RIP)]),
        eflags: Eflags::from_bits(low32(g[greg(libc::REG_EFL)])),
        cs: field16(csgsfs, 0),
        ss: field16(csgsfs, 3),
        ds: segments.ds,
        es: segments.es,
        fs: segments.fs,
        gs: segments.gs,
    }
}

fn write_registers(uc: &mut ucontext_t, regs: &Registers) {
    let g = &mut uc.uc_mcontext.gregs;
    g[greg(libc::REG_RAX)] = i64::from(regs.eax);
    g[greg(libc::REG_RBX)] = i64::from(regs.ebx);
    g[greg(libc::REG_RCX)] = i64::from(regs.ecx);
    g[greg(libc::REG_RDX)] = i64::from(regs.edx);
    g[greg(libc::REG_RSI)] = i64::from(regs.esi);
    g[greg(libc::REG_RDI)] = i64::from(regs.edi);
    g[greg(libc::REG_RBP)] = i64::from(regs.ebp);
    g[greg(libc::REG_RSP)] = i64::from(regs.esp);
    g[greg(libc::REG_RIP)] = i64::from(regs.eip);
    g[greg(libc::REG_EFL)] = i64::from(regs.eflags.into_bits());

    let csgsfs = greg_u64(g[greg(libc::REG_CSGSFS)]);
    let csgsfs = (csgsfs & 0x0000_FFFF_FFFF_0000) | u64::from(regs.cs) | (u64::from(regs.ss) << 48);
    g[greg(libc::REG_CSGSFS)] = i64::from_ne_bytes(csgsfs.to_ne_bytes());
}

/// Zero the 64-bit registers the guest cannot see.
fn clear_host_state(uc: &mut ucontext_t) {
    let g = &mut uc.uc_mcontext.gregs;
    for reg in [
        libc::REG_R8,
        libc::REG_R9,
        libc::REG_R10,
        libc::REG_R11,
        libc::REG_R12,
        libc::REG_R13,
        libc::REG_R14,
        libc::REG_R15,
    ] {
        g[greg(reg)] = 0;
    }
}

const fn segments_of(regs: &Registers) -> DataSegments {
    DataSegments {
        ds: regs.ds,
        es: regs.es,
        fs: regs.fs,
        gs: regs.gs,
    }
}

#[allow(clippy::cast_sign_loss)]
const fn greg(index: c_int) -> usize {
    index as usize
}

const fn greg_u64(value: i64) -> u64 {
    u64::from_ne_bytes(value.to_ne_bytes())
}

#[allow(clippy::cast_possible_truncation)]
const fn low32(value: i64) -> u32 {
    greg_u64(value) as u32
}

#[allow(clippy::cast_possible_truncation)]
const fn field16(value: u64, index: u32) -> u16 {
    (value >> (index * 16)) as u16
}

fn save_host_bases() -> Result<(), TrapError> {
    for (code, slot) in [(ARCH_GET_FS, &HOST_FS_BASE), (ARCH_GET_GS, &HOST_GS_BASE)] {
        let mut base: u64 = 0;
        let rc = unsafe { libc::syscall(libc::SYS_arch_prctl, code, &raw mut base) };
        if rc != 0 {
            return Err(TrapError::Install(io::Error::last_os_error()));
        }
        slot.store(base, Ordering::Relaxed);
    }
    Ok(())
}

/// Put back the host's thread-local storage bases. Must not touch TLS
/// itself, hence the raw system call.
#[inline(always)]
unsafe fn restore_host_bases() {
    unsafe {
        arch_prctl(ARCH_SET_FS, HOST_FS_BASE.load(Ordering::Relaxed));
        arch_prctl(ARCH_SET_GS, HOST_GS_BASE.load(Ordering::Relaxed));
    }
}

#[inline(always)]
unsafe fn arch_prctl(code: u64, addr: u64) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "syscall",
            inlateout("rax") libc::SYS_arch_prctl => ret,
            in("rdi") code,
            in("rsi") addr,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack)
        );
    }
    ret
}
