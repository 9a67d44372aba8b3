//! Minimal process-manager server.
//!
//! Answers the messages every guest sends during start-up and exit. The
//! request and reply layouts below are little-endian and packed.
//!
//! ```text
//! request   type u16 | subtype u16 | sel u16 | flags u16 | nbytes u32
//! reply     status u16 | sel u16 | nbytes u32 | addr u32
//! terminate type u16 | subtype u16 | status i32
//! ```

use super::{Destination, Disposition, Message, MessageHandler};
use crate::errno::Errno;
use crate::msg::MessageChannel;
use crate::session::{GuestFault, Session};
use emu_memory::{Access, SegmentError};
use emu_registers::Selector;

/// Message type and subtype values understood by [`ProcHandler`].
pub mod messages {
    /// Process id of the process manager.
    pub const PROC_PID: i32 = 1;

    pub const PROC_TERMINATE: u16 = 0x0005;
    pub const PROC_SEGMENT: u16 = 0x0008;

    pub const SEGMENT_ALLOC: u16 = 0;
    pub const SEGMENT_REALLOC: u16 = 2;

    /// Low bits of the segment request flags select the access mode.
    pub const SEGMENT_ACCESS_MASK: u16 = 0x3;

    pub const REQUEST_SIZE: usize = 12;
    pub const REPLY_SIZE: usize = 12;
}

use messages::{
    PROC_PID, PROC_SEGMENT, PROC_TERMINATE, REPLY_SIZE, SEGMENT_ACCESS_MASK, SEGMENT_ALLOC, SEGMENT_REALLOC,
};

/// Decoded segment request.
#[derive(Copy, Clone, Debug)]
struct SegmentRequest {
    subtype: u16,
    selector: u16,
    flags: u16,
    nbytes: u32,
}

impl SegmentRequest {
    fn read(channel: &MessageChannel<'_>) -> Result<Self, GuestFault> {
        Ok(Self {
            subtype: channel.read_value(2)?,
            selector: channel.read_value(4)?,
            flags: channel.read_value(6)?,
            nbytes: channel.read_value(8)?,
        })
    }

    const fn access(&self) -> Access {
        match self.flags & SEGMENT_ACCESS_MASK {
            0 => Access::ReadWrite,
            1 => Access::ReadOnly,
            2 => Access::ExecRead,
            _ => Access::ExecOnly,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct SegmentReply {
    status: u16,
    selector: u16,
    nbytes: u32,
    addr: u32,
}

impl SegmentReply {
    const fn failed(errno: Errno) -> Self {
        Self {
            status: errno.raw(),
            selector: 0,
            nbytes: 0,
            addr: 0,
        }
    }

    fn write(&self, channel: &MessageChannel<'_>) -> Result<(), GuestFault> {
        let mut raw = [0u8; REPLY_SIZE];
        raw[0..2].copy_from_slice(&self.status.to_le_bytes());
        raw[2..4].copy_from_slice(&self.selector.to_le_bytes());
        raw[4..8].copy_from_slice(&self.nbytes.to_le_bytes());
        raw[8..12].copy_from_slice(&self.addr.to_le_bytes());
        channel.write(0, &raw)?;
        Ok(())
    }
}

/// Serves process id 1 and everything sent to a file descriptor.
#[derive(Default, Debug)]
pub struct ProcHandler;

impl ProcHandler {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn segment(session: &Session, channel: &MessageChannel<'_>) -> Result<Disposition, GuestFault> {
        let request = SegmentRequest::read(channel)?;
        let reply = match request.subtype {
            SEGMENT_ALLOC => Self::segment_alloc(session, &request),
            SEGMENT_REALLOC => match Self::segment_realloc(session, &request) {
                Ok(reply) => reply,
                Err(reason) => return Ok(Disposition::Abort(reason)),
            },
            other => {
                log::warn!(target: "unhandled", "segment request subtype {other:#x}");
                SegmentReply::failed(Errno::ENOSYS)
            }
        };
        log::debug!(
            target: "msg_reply",
            "segment: status {} sel {:#06x} nbytes {:#x} addr {:#010x}",
            reply.status,
            reply.selector,
            reply.nbytes,
            reply.addr
        );
        reply.write(channel)?;
        Ok(Disposition::Resume)
    }

    fn segment_alloc(session: &Session, request: &SegmentRequest) -> SegmentReply {
        let access = request.access();
        let segment = match session.allocate_segment(access, request.nbytes as usize) {
            Ok(segment) => segment,
            Err(e) => {
                log::warn!(target: "segment", "segment alloc of {:#x} bytes: {e}", request.nbytes);
                return SegmentReply::failed(Errno::ENOMEM);
            }
        };
        let reply = SegmentReply {
            status: Errno::EOK.raw(),
            selector: 0,
            nbytes: size_u32(segment.size()),
            addr: addr_u32(segment.linear_base()),
        };
        match session.create_descriptor(access, segment) {
            Ok(selector) => SegmentReply {
                selector: selector.to_u16(),
                ..reply
            },
            Err(e) => {
                log::warn!(target: "segment", "segment alloc: {e}");
                SegmentReply::failed(Errno::ENOMEM)
            }
        }
    }

    /// Grow a segment in place. Growing past the reservation means the
    /// reservation policy is too small for this guest; that is fatal.
    fn segment_realloc(session: &Session, request: &SegmentRequest) -> Result<SegmentReply, &'static str> {
        let Some(descriptor) = session.descriptor(Selector::from(request.selector)) else {
            return Ok(SegmentReply::failed(Errno::EINVAL));
        };
        let segment = descriptor.segment();
        if segment.is_shared() {
            return Ok(SegmentReply::failed(Errno::EBUSY));
        }

        let wanted = request.nbytes as usize;
        if wanted > segment.size() {
            match segment.grow(segment.access(), wanted) {
                Ok(()) => {}
                Err(e @ SegmentError::ReservationExceeded { .. }) => {
                    log::error!(target: "segment", "segment realloc to {wanted:#x}: {e}");
                    return Err("segment reservation exceeded");
                }
                Err(e) => {
                    log::warn!(target: "segment", "segment realloc to {wanted:#x}: {e}");
                    return Ok(SegmentReply::failed(Errno::ENOMEM));
                }
            }
            if let Err(e) = session.refresh_descriptors(segment) {
                log::error!(target: "segment", "descriptor refresh after growth: {e}");
                return Ok(SegmentReply::failed(Errno::ENOMEM));
            }
        }

        Ok(SegmentReply {
            status: Errno::EOK.raw(),
            selector: request.selector,
            nbytes: size_u32(segment.size()),
            addr: addr_u32(segment.linear_base()),
        })
    }
}

impl MessageHandler for ProcHandler {
    fn handle(&mut self, msg: Message<'_, '_>) -> Result<Disposition, GuestFault> {
        match msg.destination {
            Destination::ByProcess(PROC_PID) | Destination::ByFileDescriptor(_) => {}
            Destination::ByProcess(pid) => {
                log::warn!(target: "unhandled", "message to unknown pid {pid}: {}", Errno::ESRCH);
                msg.context.set_return(u32::MAX);
                msg.context.set_carry(true);
                return Ok(Disposition::Resume);
            }
        }

        let channel = msg.channel;
        let kind: u16 = channel.read_value(0)?;
        let subtype: u16 = channel.read_value(2)?;
        log::debug!(
            target: "msg",
            "{} -> {}: type {kind:#06x}:{subtype:#x}, {} bytes",
            msg.syscall.number(),
            msg.destination,
            channel.send_len()
        );

        match kind {
            PROC_SEGMENT => Self::segment(msg.context.session(), channel),
            PROC_TERMINATE => {
                let status: i32 = channel.read_value(4)?;
                log::debug!(target: "msg", "terminate with status {status}");
                Ok(Disposition::Terminate(status))
            }
            _ => {
                log::warn!(target: "unhandled", "message {kind:#06x}:{subtype:#x} to {}", msg.destination);
                channel.write_status(Errno::ENOSYS)?;
                Ok(Disposition::Resume)
            }
        }
    }
}

fn size_u32(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

#[allow(clippy::cast_possible_truncation)]
const fn addr_u32(addr: usize) -> u32 {
    addr as u32
}
