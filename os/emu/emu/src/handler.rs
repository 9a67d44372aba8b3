//! # Collaborator interface
//!
//! The trap dispatcher decodes a syscall into a [`Message`] and hands it to a
//! [`MessageHandler`]. The handler reads the request through the channel,
//! writes the reply through the channel, and sets the guest return register
//! and carry flag through the context. Both views only live for the call.
//!
//! | Syscall (AL) | Meaning                    | EDX             |
//! |--------------|----------------------------|-----------------|
//! | 0            | [`Syscall::Send`]          | process id      |
//! | 11           | [`Syscall::SendFd`]        | file descriptor |

mod process;

pub use process::{ProcHandler, messages};

use crate::context::GuestContext;
use crate::msg::MessageChannel;
use crate::session::GuestFault;

/// Syscalls recognized by the dispatcher.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Syscall {
    /// Synchronous send to a process.
    Send = 0,
    /// Synchronous send to whoever serves a file descriptor.
    SendFd = 11,
}

impl Syscall {
    #[must_use]
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            0 => Some(Self::Send),
            11 => Some(Self::SendFd),
            _ => None,
        }
    }

    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }
}

/// Where a message is going. The guest passes both kinds in EDX.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Destination {
    ByProcess(i32),
    ByFileDescriptor(i32),
}

impl Destination {
    /// Decode EDX for the given syscall.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn decode(syscall: Syscall, edx: u32) -> Self {
        match syscall {
            Syscall::Send => Self::ByProcess(edx as i32),
            Syscall::SendFd => Self::ByFileDescriptor(edx as i32),
        }
    }
}

impl core::fmt::Display for Destination {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ByProcess(pid) => write!(f, "pid {pid}"),
            Self::ByFileDescriptor(fd) => write!(f, "fd {fd}"),
        }
    }
}

/// What the guest should do once the handler returns.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Disposition {
    /// Continue after the trapping instruction.
    Resume,
    /// The guest asked to exit with this status.
    Terminate(i32),
    /// The request hit a host limit the guest cannot recover from.
    Abort(&'static str),
}

/// One trapped message call.
pub struct Message<'m, 'a> {
    pub syscall: Syscall,
    pub destination: Destination,
    pub channel: &'m MessageChannel<'a>,
    pub context: &'m mut GuestContext<'a>,
}

/// Implements syscall semantics on top of the message channel.
///
/// A [`GuestFault`] returned from `handle` is reported to the guest as
/// `EFAULT` with carry set; it never reaches the host.
pub trait MessageHandler {
    fn handle(&mut self, msg: Message<'_, '_>) -> Result<Disposition, GuestFault>;
}

impl<F> MessageHandler for F
where
    F: FnMut(Message<'_, '_>) -> Result<Disposition, GuestFault>,
{
    fn handle(&mut self, msg: Message<'_, '_>) -> Result<Disposition, GuestFault> {
        self(msg)
    }
}
