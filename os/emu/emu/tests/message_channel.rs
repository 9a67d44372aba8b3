mod common;

use emu::msg::PAD_BYTE;
use emu::{FarPointer, GuestFault, MessageChannel};
use emu_memory::Access;

/// A data segment holding a send list at 0x000, a receive list at 0x100,
/// send data at 0x200.. and receive buffers at 0x800...
struct Fixture {
    session: emu::Session,
    ds: emu_registers::Selector,
}

impl Fixture {
    fn new() -> Self {
        let (session, _) = common::session();
        let ds = common::segment(&session, Access::ReadWrite, 0x1000);
        Self { session, ds }
    }

    fn send_list(&self) -> FarPointer {
        FarPointer::new(self.ds.to_u16(), 0)
    }

    fn recv_list(&self) -> FarPointer {
        FarPointer::new(self.ds.to_u16(), 0x100)
    }

    /// Send chunks of 3 and 5 bytes ("abc" + "defgh"), receive chunks of 4
    /// and 6 bytes.
    fn channel(&self) -> MessageChannel<'_> {
        common::write(&self.session, self.ds, 0x200, b"abc");
        common::write(&self.session, self.ds, 0x300, b"defgh");
        common::write_chunk_list(&self.session, self.send_list(), &[(self.ds, 0x200, 3), (self.ds, 0x300, 5)]);
        common::write_chunk_list(&self.session, self.recv_list(), &[(self.ds, 0x800, 4), (self.ds, 0x900, 6)]);
        MessageChannel::new(&self.session, 2, self.send_list(), 2, self.recv_list()).unwrap()
    }
}

#[test]
fn lengths_sum_chunks() {
    let f = Fixture::new();
    let channel = f.channel();
    assert_eq!(channel.send_len(), 8);
    assert_eq!(channel.recv_capacity(), 10);
    assert_eq!(channel.send_chunks().count(), 2);
}

#[test]
fn read_spans_chunk_boundaries() {
    let f = Fixture::new();
    let channel = f.channel();
    let mut buf = [0u8; 4];
    channel.read(&mut buf, 2).unwrap();
    assert_eq!(&buf, b"cdef");
}

#[test]
fn over_read_is_padded() {
    let f = Fixture::new();
    let channel = f.channel();
    let mut buf = [0u8; 8];
    channel.read(&mut buf, 5).unwrap();
    assert_eq!(&buf[..3], b"fgh");
    assert!(buf[3..].iter().all(|&b| b == PAD_BYTE));

    let mut past = [0u8; 4];
    channel.read(&mut past, 100).unwrap();
    assert_eq!(past, [PAD_BYTE; 4]);
}

#[test]
fn write_then_read_written() {
    let f = Fixture::new();
    let channel = f.channel();
    assert_eq!(channel.write(1, b"123456").unwrap(), 6);

    let mut back = [0u8; 6];
    channel.read_written(&mut back, 1).unwrap();
    assert_eq!(&back, b"123456");
    assert_eq!(common::read(&f.session, f.ds, 0x801, 3), b"123");
    assert_eq!(common::read(&f.session, f.ds, 0x900, 3), b"456");
}

#[test]
fn under_capacity_write_reports_short_count() {
    let f = Fixture::new();
    let channel = f.channel();
    assert_eq!(channel.write(8, b"xyzw").unwrap(), 2);
    assert_eq!(channel.write(20, b"x").unwrap(), 0);
}

#[test]
fn typed_values() {
    let f = Fixture::new();
    let channel = f.channel();
    let word: u16 = channel.read_value(0).unwrap();
    assert_eq!(word, u16::from_le_bytes(*b"ab"));

    channel.write_value(0, 0xDEAD_BEEFu32).unwrap();
    let mut back = [0u8; 4];
    channel.read_written(&mut back, 0).unwrap();
    assert_eq!(u32::from_le_bytes(back), 0xDEAD_BEEF);
}

#[test]
fn iovec_pads_with_scratch() {
    let f = Fixture::new();
    let channel = f.channel();

    let spans = channel.read_iovec(1, 12).unwrap();
    let lens: Vec<usize> = spans.iter().map(|s| s.len).collect();
    assert_eq!(lens, [2, 5, 5]);

    let mut gathered = Vec::new();
    for span in &spans {
        let bytes = unsafe { core::slice::from_raw_parts(span.ptr.as_ptr(), span.len) };
        gathered.extend_from_slice(bytes);
    }
    assert_eq!(&gathered[..7], b"bcdefgh");
    assert!(gathered[7..].iter().all(|&b| b == PAD_BYTE));

    let sinks = channel.write_iovec(0, 12).unwrap();
    let lens: Vec<usize> = sinks.iter().map(|s| s.len).collect();
    assert_eq!(lens, [4, 6, 2]);
}

#[test]
fn zero_parts_translate_nothing() {
    let f = Fixture::new();
    let bogus = FarPointer::new(0x1234, 0xFFFF_0000);
    let channel = MessageChannel::new(&f.session, 0, bogus, 0, bogus).unwrap();
    let mut buf = [0u8; 2];
    channel.read(&mut buf, 0).unwrap();
    assert_eq!(buf, [PAD_BYTE; 2]);
    assert_eq!(channel.write(0, b"x").unwrap(), 0);
}

#[test]
fn bad_list_pointer_faults() {
    let f = Fixture::new();
    let outside = FarPointer::new(f.ds.to_u16(), 0xFFC);
    let err = MessageChannel::new(&f.session, 1, outside, 0, outside).err();
    assert!(matches!(err, Some(GuestFault::OutOfBounds { .. })));
}

#[test]
fn chunk_outside_its_segment_faults_on_access() {
    let f = Fixture::new();
    common::write_chunk_list(&f.session, f.send_list(), &[(f.ds, 0xFF0, 0x100)]);
    let channel = MessageChannel::new(&f.session, 1, f.send_list(), 0, f.recv_list()).unwrap();
    let mut buf = [0u8; 4];
    assert!(channel.read(&mut buf, 0).is_ok());
    let mut big = [0u8; 0x20];
    assert!(matches!(channel.read(&mut big, 0), Err(GuestFault::OutOfBounds { .. })));
}

#[test]
fn writes_through_read_only_chunks_fault() {
    let f = Fixture::new();
    let ro = common::segment(&f.session, Access::ReadOnly, 0x100);
    common::write_chunk_list(&f.session, f.recv_list(), &[(ro, 0, 0x10)]);
    let channel = MessageChannel::new(&f.session, 0, f.send_list(), 1, f.recv_list()).unwrap();
    assert!(matches!(channel.write(0, b"x"), Err(GuestFault::ReadOnly { .. })));
}

#[test]
fn send_dump_shows_the_logical_stream() {
    let f = Fixture::new();
    let channel = f.channel();
    let mut out = Vec::new();
    channel.dump_send(&mut out, 6).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines[0], "send: 8 bytes in 2 parts");
    assert_eq!(lines[1], "  00000000: 61 62 63 64 65 66");
    assert_eq!(lines[2], "  ... 2 more");
}

#[test]
fn send_dump_reports_unreadable_chunks() {
    let f = Fixture::new();
    common::write_chunk_list(&f.session, f.send_list(), &[(f.ds, 0xFF0, 0x100)]);
    let channel = MessageChannel::new(&f.session, 1, f.send_list(), 0, f.recv_list()).unwrap();
    let mut out = Vec::new();
    channel.dump_send(&mut out, 64).unwrap();
    assert!(String::from_utf8(out).unwrap().starts_with("send: <unreadable"));
}
