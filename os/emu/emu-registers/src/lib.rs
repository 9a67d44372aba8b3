//! # Typed guest registers
//!
//! The guest runs 32-bit protected-mode code, so its register file is the
//! classic IA-32 set: eight 32-bit general registers, `EIP`, `EFLAGS` and six
//! 16-bit segment registers. This crate models that file ([`Registers`]),
//! the flag word ([`Eflags`]) and selectors ([`Selector`]), plus access to
//! the *host* data segment registers which the host kernel does not preserve
//! across signal delivery ([`DataSegments`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod eflags;
mod registers;
mod rpl;
mod selector;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
mod host;

pub use eflags::Eflags;
pub use registers::{Registers, SegmentRegister};
pub use rpl::{RPL_MASK, Rpl};
pub use selector::{GUEST_RPL, Selector, Table};

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use host::DataSegments;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, reloading `FS` replaces the base used for thread-local
    /// storage; nothing may touch TLS afterwards until it is restored.
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// Reading the register has no side effects.
    fn load() -> Self;
}

pub trait StoreRegister {
    /// Writing the register cannot break the host.
    fn store(self);
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}

impl<T> StoreRegisterUnsafe for T
where
    T: StoreRegister,
{
    #[inline]
    unsafe fn store_unsafe(self) {
        <Self as StoreRegister>::store(self);
    }
}
