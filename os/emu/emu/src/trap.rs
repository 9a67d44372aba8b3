//! # Traps
//!
//! The guest runs natively. Control comes back to the engine only through a
//! trap: the CPU faults on the guest's synthetic syscall instruction (`int
//! 0xF2`, which has no gate in the host's interrupt table) or on a segment
//! register load the host refuses. A trap moves the dispatcher from
//! [`TrapState::Native`] to [`TrapState::Trapped`]; [`TrapDispatcher::dispatch`]
//! decides what happens next and returns a [`TrapOutcome`].
//!
//! How traps are delivered is a backend concern ([`TrapBackend`]). The only
//! backend is the Linux signal backend, which needs hardware descriptors.
//!
//! | Condition                                   | Outcome                          |
//! |---------------------------------------------|----------------------------------|
//! | code selector is not a guest selector       | fatal, host defect               |
//! | data register holds `0x78`                  | migrate to `0x7C`, re-execute    |
//! | `CD F2` at `CS:EIP`                         | dispatch syscall, `EIP += 2`     |
//! | anything else                               | dump, debug hook, fatal          |

mod dispatch;

#[cfg(all(feature = "ldt", target_os = "linux", target_arch = "x86_64"))]
mod signal;

pub use dispatch::{DebugHook, TrapDispatcher};

#[cfg(all(feature = "ldt", target_os = "linux", target_arch = "x86_64"))]
pub use signal::SignalBackend;

use emu_registers::Registers;
use std::convert::Infallible;
use std::io;

/// The guest's syscall instruction, `int 0xF2`.
pub const SYSCALL_OPCODE: [u8; 2] = [0xCD, 0xF2];

/// Global-table selector guests use for the pointer segment before it is
/// migrated into the local table.
pub const MAGIC_PTR_SELECTOR: u16 = 0x78;

/// Execution mode of the guest thread.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum TrapState {
    #[default]
    Native,
    Trapped,
}

/// What the host knows about a trap besides the registers.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct TrapInfo {
    pub signal: i32,
    pub trapno: u64,
    pub error_code: u64,
    pub fault_address: u64,
}

/// Result of dispatching one trap.
#[derive(Debug)]
pub enum TrapOutcome {
    /// Return to the guest with the (possibly modified) registers.
    Resume,
    /// The guest asked to exit.
    Terminate(i32),
    /// Execution cannot continue.
    Fatal(TrapError),
}

#[derive(Debug, thiserror::Error)]
pub enum TrapError {
    #[error("trap with host code selector {cs:#06x}")]
    HostDefect { cs: u16 },
    #[error("unrecognized trap at {cs:04x}:{eip:08x}")]
    Unrecognized { cs: u16, eip: u32 },
    #[error("failed to install trap handlers")]
    Install(#[source] io::Error),
    #[error("trap backend {0} is not available on this host")]
    Unavailable(&'static str),
    #[error("control returned from the guest")]
    GuestReturned,
    #[error("message handler aborted: {0}")]
    Aborted(&'static str),
}

/// Receives traps from a backend.
pub trait TrapSink {
    fn dispatch(&mut self, regs: &mut Registers, info: &TrapInfo) -> TrapOutcome;
}

/// A way of running the guest and turning its traps into
/// [`TrapSink::dispatch`] calls.
pub trait TrapBackend {
    fn name(&self) -> &'static str;

    /// Switch to the guest. Returns only if the switch could not happen.
    fn enter(&mut self, sink: Box<dyn TrapSink>, start: Registers) -> Result<Infallible, TrapError>;
}
