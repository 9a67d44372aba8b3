//! Guest start-up state.
//!
//! Before the first instruction runs, the engine lays out what the guest's
//! C runtime expects to find: the argument and environment strings with the
//! classic `argc`/`argv`/`envp` frame on the stack, and the pointer segment
//! behind selector `0x78`.

use crate::context::GuestContext;
use crate::descriptor::DescriptorError;
use crate::far_ptr::FarPointer;
use crate::session::{GuestFault, POINTER_SEGMENT_SLOT, Session};
use emu_memory::{Access, SegmentError};
use emu_registers::Selector;

/// Bytes of per-process data behind the pointer record.
pub const POINTER_DATA_SIZE: usize = 0x200;

/// Offset of the per-process data within the pointer segment.
const POINTER_DATA_OFFSET: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Copy `args` and `env` onto the guest stack and push the start-up frame.
///
/// Afterwards `SS:ESP` points at `argc`, followed by the `argv` pointers, a
/// null pointer, the `envp` pointers and another null pointer. Pointers are
/// offsets into the stack segment.
pub fn push_startup_frame<A, E>(ctx: &mut GuestContext<'_>, args: &[A], env: &[E]) -> Result<(), GuestFault>
where
    A: AsRef<[u8]>,
    E: AsRef<[u8]>,
{
    let argv = args
        .iter()
        .map(|a| push_string(ctx, a.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    let envp = env
        .iter()
        .map(|e| push_string(ctx, e.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let regs = ctx.registers_mut();
    regs.esp &= !3;

    ctx.push_stack(0)?;
    for &ptr in envp.iter().rev() {
        ctx.push_stack(ptr)?;
    }
    ctx.push_stack(0)?;
    for &ptr in argv.iter().rev() {
        ctx.push_stack(ptr)?;
    }
    ctx.push_stack(u32::try_from(argv.len()).unwrap_or(u32::MAX))?;

    log::debug!(
        target: "loader",
        "start-up frame: {} args, {} env, esp {:#x}",
        argv.len(),
        envp.len(),
        ctx.registers().esp
    );
    Ok(())
}

/// Push a NUL-terminated copy of `bytes`; returns its stack offset.
fn push_string(ctx: &mut GuestContext<'_>, bytes: &[u8]) -> Result<u32, GuestFault> {
    let len = u32::try_from(bytes.len() + 1).unwrap_or(u32::MAX);
    let r = ctx.registers();
    let ss = r.ss;
    let Some(at) = r.esp.checked_sub(len) else {
        return Err(GuestFault::OutOfBounds {
            selector: ss,
            offset: 0,
            size: bytes.len() + 1,
            limit: r.esp as usize,
        });
    };

    let mut buf = Vec::with_capacity(bytes.len() + 1);
    buf.extend_from_slice(bytes);
    buf.push(0);
    ctx.write_bytes(FarPointer::new(ss, at), &buf)?;
    ctx.registers_mut().esp = at;
    Ok(at)
}

/// Create the pointer segment and bind it at [`POINTER_SEGMENT_SLOT`].
///
/// The segment starts with a far pointer (`offset u32`, `selector u32`) to
/// the zeroed per-process data that follows it.
pub fn install_pointer_segment(session: &Session) -> Result<Selector, StartupError> {
    let size = POINTER_DATA_OFFSET as usize + POINTER_DATA_SIZE;
    let segment = session.allocate_segment(Access::ReadWrite, size)?;
    let selector = Selector::guest(POINTER_SEGMENT_SLOT);

    let mut record = [0u8; 8];
    record[0..4].copy_from_slice(&POINTER_DATA_OFFSET.to_le_bytes());
    record[4..8].copy_from_slice(&u32::from(selector.to_u16()).to_le_bytes());
    segment.write_bytes(0, &record)?;

    let bound = session.bind_at(POINTER_SEGMENT_SLOT, Access::ReadWrite, segment)?;
    log::debug!(target: "segment", "pointer segment at {bound:#x}");
    Ok(bound)
}
