#![allow(dead_code)]

use emu::descriptor::SoftwareTable;
use emu::{Config, FarPointer, Session};
use emu_image::{ImageWriter, SegmentKind};
use emu_memory::page::PAGE_SIZE;
use emu_memory::{Access, ReservationPolicy};
use emu_registers::{Registers, Selector};
use std::rc::Rc;

/// Session with software descriptors and small reservations.
pub fn session() -> (Session, Rc<SoftwareTable>) {
    let table = Rc::new(SoftwareTable::new());
    let config = Config::default()
        .with_software_segments()
        .with_reservation(ReservationPolicy {
            default: 16 * PAGE_SIZE,
            writable: 64 * PAGE_SIZE,
        });
    (Session::new(config, table.clone()), table)
}

pub fn segment(session: &Session, access: Access, size: usize) -> Selector {
    let segment = session.allocate_segment(access, size).unwrap();
    session.create_descriptor(access, segment).unwrap()
}

/// Write a chunk list at `at` describing `chunks` as `(selector, offset, len)`.
pub fn write_chunk_list(session: &Session, at: FarPointer, chunks: &[(Selector, u32, u32)]) {
    let descriptor = session.descriptor(Selector::from(at.selector)).unwrap();
    for (i, &(sel, offset, len)) in chunks.iter().enumerate() {
        let mut entry = [0u8; 12];
        entry[0..4].copy_from_slice(&offset.to_le_bytes());
        entry[4..6].copy_from_slice(&sel.to_u16().to_le_bytes());
        entry[8..12].copy_from_slice(&len.to_le_bytes());
        descriptor
            .segment()
            .write_bytes(at.offset as usize + i * 12, &entry)
            .unwrap();
    }
}

pub fn write(session: &Session, sel: Selector, offset: u32, data: &[u8]) {
    let descriptor = session.descriptor(sel).unwrap();
    descriptor.segment().write_bytes(offset as usize, data).unwrap();
}

pub fn read(session: &Session, sel: Selector, offset: u32, len: usize) -> Vec<u8> {
    let descriptor = session.descriptor(sel).unwrap();
    let mut out = vec![0; len];
    descriptor.segment().read_bytes(offset as usize, &mut out).unwrap();
    out
}

/// A guest with a code segment holding `code` and one data segment used for
/// `DS`, `ES` and `SS`.
pub fn guest(session: &Session, code: &[u8]) -> (Registers, Selector) {
    let text = session.allocate_segment(Access::ReadWrite, 0x100).unwrap();
    text.write_bytes(0, code).unwrap();
    text.change_access(Access::ExecRead).unwrap();
    let cs = session.create_descriptor(Access::ExecRead, text).unwrap();
    let ds = segment(session, Access::ReadWrite, 0x2000);
    let regs = Registers {
        cs: cs.to_u16(),
        ds: ds.to_u16(),
        es: ds.to_u16(),
        ss: ds.to_u16(),
        esp: 0x2000,
        ..Registers::default()
    };
    (regs, ds)
}

/// Code, data and stack segments with a load record for each.
pub fn three_segment_image() -> ImageWriter {
    let mut w = ImageWriter::new();
    let code = w.segment(SegmentKind::ExecRead, 0x40);
    let data = w.segment(SegmentKind::ReadWrite, 0x1800);
    let rodata = w.segment(SegmentKind::ReadOnly, 0x20);
    w.code(code, 0x10)
        .stack(data, 0x800)
        .heap(data, 0x400)
        .argv(data)
        .load(code, 0x10, &[0xCD, 0xF2, 0xC3])
        .load(data, 0x1000, b"hello, data")
        .rw_end()
        .load(rodata, 0, b"ro");
    w
}
