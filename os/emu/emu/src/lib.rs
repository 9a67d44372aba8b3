//! # LMF execution engine
//!
//! Runs 32-bit segmented executables in the LMF container format directly on
//! an x86-64 Linux host. The pieces, from the bottom up:
//!
//! | Module         | Role                                                         |
//! |----------------|--------------------------------------------------------------|
//! | [`descriptor`] | publishes segments in a descriptor table (LDT or software)   |
//! | [`session`]    | the one guest: segments, selectors, loaded images            |
//! | [`loader`]     | container image → segments and descriptors                   |
//! | [`context`]    | register view of a suspended guest, stack and memory access  |
//! | [`msg`]        | scatter/gather message channel over guest chunk lists        |
//! | [`handler`]    | syscall semantics behind the [`MessageHandler`] interface   |
//! | [`trap`]       | trap decoding and the signal backend                         |
//! | [`startup`]    | initial stack frame and pointer segment                      |
//!
//! Guest memory is always reached through [`Session::translate`], which
//! bounds-checks in software regardless of the descriptor backend.

#![allow(unsafe_code)]

pub mod config;
pub mod context;
pub mod descriptor;
mod errno;
pub mod far_ptr;
pub mod handler;
pub mod loader;
pub mod msg;
pub mod session;
pub mod startup;
pub mod trap;

pub use config::{Config, ConfigError};
pub use context::{GuestContext, GuestValue};
pub use errno::Errno;
pub use far_ptr::FarPointer;
pub use handler::{Destination, Disposition, Message, MessageHandler, ProcHandler, Syscall};
pub use loader::{ImageKind, LoadError, LoadInfo, Loader};
pub use msg::MessageChannel;
pub use session::{GuestFault, RwOp, Session};
pub use trap::{TrapDispatcher, TrapError, TrapInfo, TrapOutcome, TrapState};

/// Anything that stops the engine before or while entering the guest.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration")]
    Config(#[from] ConfigError),
    #[error("loading image")]
    Load(#[from] LoadError),
    #[error("start-up")]
    Startup(#[from] startup::StartupError),
    #[error("start-up frame")]
    Frame(#[from] GuestFault),
    #[error("trap backend")]
    Trap(#[from] TrapError),
}
