//! # Message channel
//!
//! Every guest syscall is a synchronous message send. The guest passes two
//! chunk lists, one describing the request (send) and one the reply buffer
//! (receive). Each list entry is 12 packed bytes:
//!
//! ```text
//!  0            4        6        8            12
//! +------------+--------+--------+------------+
//! | offset u32 | sel u16| 0  u16 | length u32 |
//! +------------+--------+--------+------------+
//! ```
//!
//! A [`MessageChannel`] presents each list as one flat byte stream addressed by
//! logical offset. Reading past the end of the send stream yields `0xCC`
//! filler instead of an error, and writing past the end of the receive stream
//! is truncated and reported through the returned byte count: the wire format
//! has no total length, handlers find the real length in the payload itself.

use crate::context::{GuestValue, hexdump};
use crate::far_ptr::FarPointer;
use crate::session::{GuestFault, RwOp, Session};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use emu_registers::Selector;
use std::io::{self, Write};

/// Filler returned for bytes past the end of the send stream.
pub const PAD_BYTE: u8 = 0xCC;

/// Size of a chunk list entry in guest memory.
pub const CHUNK_ENTRY_SIZE: usize = 12;

/// Size of the scratch buffer that pads vectored transfers.
const SCRATCH_LEN: usize = 4096;

/// One decoded chunk list entry.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Chunk {
    pub ptr: FarPointer,
    pub len: u32,
}

/// A host memory span for vectored I/O.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct IoSpan {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

impl IoSpan {
    #[must_use]
    pub const fn as_iovec(&self) -> libc::iovec {
        libc::iovec {
            iov_base: self.ptr.as_ptr().cast(),
            iov_len: self.len,
        }
    }
}

/// Chunk list living in guest memory.
struct ChunkList {
    entries: NonNull<u8>,
    count: usize,
}

impl ChunkList {
    fn new(session: &Session, count: u8, at: FarPointer) -> Result<Self, GuestFault> {
        let count = usize::from(count);
        if count == 0 {
            return Ok(Self {
                entries: NonNull::dangling(),
                count,
            });
        }
        let entries = session.translate(
            Selector::from(at.selector),
            at.offset,
            count * CHUNK_ENTRY_SIZE,
            RwOp::Read,
        )?;
        Ok(Self { entries, count })
    }

    fn get(&self, index: usize) -> Chunk {
        debug_assert!(index < self.count);
        let mut raw = [0u8; CHUNK_ENTRY_SIZE];
        // SAFETY: the whole list was bounds-checked at construction.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.entries.as_ptr().add(index * CHUNK_ENTRY_SIZE),
                raw.as_mut_ptr(),
                CHUNK_ENTRY_SIZE,
            );
        }
        Chunk {
            ptr: FarPointer::new(
                u16::from_le_bytes([raw[4], raw[5]]),
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            ),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }

    fn iter(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.count).map(|i| self.get(i))
    }

    fn total(&self) -> usize {
        self.iter().map(|c| c.len as usize).sum()
    }
}

/// Scatter/gather view of one trapped message call.
///
/// Lives for exactly one trap; handlers must not keep it.
pub struct MessageChannel<'a> {
    session: &'a Session,
    send: ChunkList,
    recv: ChunkList,
    scratch: Box<UnsafeCell<[u8; SCRATCH_LEN]>>,
}

impl<'a> MessageChannel<'a> {
    /// Translate the two list headers. The list contents stay in guest memory.
    pub fn new(
        session: &'a Session,
        send_parts: u8,
        send_list: FarPointer,
        recv_parts: u8,
        recv_list: FarPointer,
    ) -> Result<Self, GuestFault> {
        Ok(Self {
            session,
            send: ChunkList::new(session, send_parts, send_list)?,
            recv: ChunkList::new(session, recv_parts, recv_list)?,
            scratch: Box::new(UnsafeCell::new([PAD_BYTE; SCRATCH_LEN])),
        })
    }

    /// Total bytes described by the send list.
    #[must_use]
    pub fn send_len(&self) -> usize {
        self.send.total()
    }

    /// Total bytes described by the receive list.
    #[must_use]
    pub fn recv_capacity(&self) -> usize {
        self.recv.total()
    }

    /// Entries of the send list.
    pub fn send_chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        self.send.iter()
    }

    /// Entries of the receive list.
    pub fn recv_chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        self.recv.iter()
    }

    /// Fill `dst` from the send stream starting at `offset`; bytes past the
    /// end of the stream read as [`PAD_BYTE`].
    pub fn read(&self, dst: &mut [u8], offset: usize) -> Result<(), GuestFault> {
        Self::gather(self.session, &self.send, dst, offset)
    }

    /// Like [`read`](Self::read), but from the receive stream (what was
    /// written so far).
    pub fn read_written(&self, dst: &mut [u8], offset: usize) -> Result<(), GuestFault> {
        Self::gather(self.session, &self.recv, dst, offset)
    }

    /// Copy `src` into the receive stream at `offset`. Returns the number of
    /// bytes that fit.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<usize, GuestFault> {
        let mut written = 0;
        walk(self.session, &self.recv, offset, src.len(), RwOp::Write, |ptr, pos, len| {
            // SAFETY: `ptr` is valid for `len` bytes, `pos + len <= src.len()`.
            unsafe { core::ptr::copy_nonoverlapping(src.as_ptr().add(pos), ptr.as_ptr(), len) };
            written += len;
        })?;
        Ok(written)
    }

    /// Read a little-endian value from the send stream.
    pub fn read_value<T: GuestValue>(&self, offset: usize) -> Result<T, GuestFault> {
        let mut raw = [0u8; 8];
        self.read(&mut raw[..T::SIZE], offset)?;
        Ok(T::from_le_slice(&raw))
    }

    /// Write a little-endian value into the receive stream.
    pub fn write_value<T: GuestValue>(&self, offset: usize, value: T) -> Result<usize, GuestFault> {
        let mut raw = [0u8; 8];
        value.write_le_slice(&mut raw);
        self.write(offset, &raw[..T::SIZE])
    }

    /// Hex dump of at most `max` bytes of the send stream, offsets relative
    /// to the start of the message.
    pub fn dump_send(&self, out: &mut dyn Write, max: usize) -> io::Result<()> {
        let len = self.send_len();
        let mut buf = vec![0u8; len.min(max)];
        match self.read(&mut buf, 0) {
            Ok(()) => {
                writeln!(out, "send: {len} bytes in {} parts", self.send.count)?;
                hexdump(out, 0, &buf)?;
                if len > buf.len() {
                    writeln!(out, "  ... {} more", len - buf.len())?;
                }
                Ok(())
            }
            Err(fault) => writeln!(out, "send: <unreadable: {fault}>"),
        }
    }

    /// Reply with nothing but a status word.
    pub fn write_status(&self, status: crate::Errno) -> Result<usize, GuestFault> {
        self.write_value(0, status.raw())
    }

    /// Host spans covering `size` bytes of the send stream from `offset`,
    /// padded with spans over a filler buffer. Suitable as a `writev` source.
    pub fn read_iovec(&self, offset: usize, size: usize) -> Result<Vec<IoSpan>, GuestFault> {
        // SAFETY: spans from a previous call are dead once the caller asks again.
        unsafe { (*self.scratch.get()).fill(PAD_BYTE) };
        self.spans(&self.send, offset, size, RwOp::Read)
    }

    /// Host spans covering `size` bytes of the receive stream from `offset`,
    /// padded with spans over a discard buffer. Suitable as a `readv` target.
    pub fn write_iovec(&self, offset: usize, size: usize) -> Result<Vec<IoSpan>, GuestFault> {
        self.spans(&self.recv, offset, size, RwOp::Write)
    }

    fn spans(&self, list: &ChunkList, offset: usize, size: usize, op: RwOp) -> Result<Vec<IoSpan>, GuestFault> {
        let mut spans = Vec::new();
        let covered = walk(self.session, list, offset, size, op, |ptr, _, len| {
            spans.push(IoSpan { ptr, len });
        })?;

        let scratch = NonNull::new(self.scratch.get().cast::<u8>()).unwrap_or(NonNull::dangling());
        let mut missing = size - covered;
        while missing > 0 {
            let len = missing.min(SCRATCH_LEN);
            spans.push(IoSpan { ptr: scratch, len });
            missing -= len;
        }
        Ok(spans)
    }

    fn gather(session: &Session, list: &ChunkList, dst: &mut [u8], offset: usize) -> Result<(), GuestFault> {
        let covered = walk(session, list, offset, dst.len(), RwOp::Read, |ptr, pos, len| {
            // SAFETY: `ptr` is valid for `len` bytes, `pos + len <= dst.len()`.
            unsafe { core::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_mut_ptr().add(pos), len) };
        })?;
        dst[covered..].fill(PAD_BYTE);
        Ok(())
    }
}

/// Visit the pieces of `[offset, offset + size)` that the chunk list covers.
///
/// `visit(host_ptr, position_in_request, len)` is called once per piece, in
/// order. Returns how many bytes were covered; pieces are contiguous from
/// the start of the request.
fn walk(
    session: &Session,
    list: &ChunkList,
    offset: usize,
    size: usize,
    op: RwOp,
    mut visit: impl FnMut(NonNull<u8>, usize, usize),
) -> Result<usize, GuestFault> {
    let mut skip = offset;
    let mut pos = 0;
    for chunk in list.iter() {
        if pos == size {
            break;
        }
        let chunk_len = chunk.len as usize;
        if skip >= chunk_len {
            skip -= chunk_len;
            continue;
        }
        let take = (chunk_len - skip).min(size - pos);
        let at = chunk.ptr.add(u32::try_from(skip).unwrap_or(u32::MAX));
        let ptr = session.translate(Selector::from(at.selector), at.offset, take, op)?;
        visit(ptr, pos, take);
        pos += take;
        skip = 0;
    }
    Ok(pos)
}
