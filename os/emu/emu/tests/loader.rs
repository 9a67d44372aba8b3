mod common;

use emu::{GuestFault, ImageKind, LoadError, Loader, RwOp};
use emu_image::{ImageError, ImageWriter, RecordType, SegmentKind};
use emu_memory::Access;
use emu_registers::Selector;

#[test]
fn loads_segments_with_payloads_and_final_access() {
    let (session, _) = common::session();
    let blob = common::three_segment_image().finish();

    let info = Loader::new(&session).load(&blob, ImageKind::Main).unwrap();

    assert_eq!(info.selectors.len(), 3);
    assert_eq!(session.segment_count(), 3);
    assert_eq!(session.descriptor_count(), 3);

    let [code, data, rodata] = [info.selectors[0], info.selectors[1], info.selectors[2]];
    assert_eq!(common::read(&session, code, 0x10, 3), [0xCD, 0xF2, 0xC3]);
    assert_eq!(common::read(&session, data, 0x1000, 11), b"hello, data");
    assert_eq!(common::read(&session, rodata, 0, 2), b"ro");

    let access = |sel: Selector| session.descriptor(sel).unwrap().access();
    assert_eq!(access(code), Access::ExecRead);
    assert_eq!(access(data), Access::ReadWrite);
    assert_eq!(access(rodata), Access::ReadOnly);
    assert_eq!(session.descriptor(code).unwrap().segment().access(), Access::ExecRead);

    assert_eq!(info.entry.selector, code.to_u16());
    assert_eq!(info.entry.offset, 0x10);
    assert_eq!(session.image(ImageKind::Main), Some(info));
}

#[test]
fn startup_registers_follow_header() {
    let (session, _) = common::session();
    let blob = common::three_segment_image().finish();
    let info = Loader::new(&session).load(&blob, ImageKind::Main).unwrap();

    let regs = info.startup_registers();
    let data = info.selectors[1].to_u16();
    assert_eq!(regs.cs, info.selectors[0].to_u16());
    assert_eq!(regs.eip, 0x10);
    assert_eq!((regs.ds, regs.ss, regs.es, regs.fs, regs.gs), (data, data, data, data, data));
    assert_eq!(regs.esp, 0x1800);
    assert_eq!(regs.edx, 0x1000);
}

#[test]
fn system_library_and_main_get_distinct_selectors() {
    let (session, _) = common::session();
    let loader = Loader::new(&session);
    let slib = loader
        .load(&common::three_segment_image().finish(), ImageKind::SystemLibrary)
        .unwrap();
    let main = loader
        .load(&common::three_segment_image().finish(), ImageKind::Main)
        .unwrap();

    for sel in &main.selectors {
        assert!(!slib.selectors.contains(sel));
    }
    assert_eq!(session.image(ImageKind::SystemLibrary), Some(slib));
    assert_eq!(session.descriptor_count(), 6);
}

#[test]
fn ordinary_slots_skip_the_pointer_segment_slot() {
    let (session, _) = common::session();
    let mut w = ImageWriter::new();
    for _ in 0..20 {
        w.segment(SegmentKind::ReadWrite, 0x10);
    }
    let info = Loader::new(&session).load(&w.finish(), ImageKind::Main).unwrap();
    assert!(info.selectors.iter().all(|s| s.index() != 15));
}

#[test]
fn flat_image_shares_one_segment_laid_out_from_the_image_base() {
    let (session, _) = common::session();
    let mut w = common::three_segment_image();
    w.flat(0x10000);
    let info = Loader::new(&session).load(&w.finish(), ImageKind::Main).unwrap();

    assert_eq!(session.segment_count(), 1);
    assert_eq!(session.descriptor_count(), 3);
    let [code, data, rodata] = [info.selectors[0], info.selectors[1], info.selectors[2]];
    let access = |sel: Selector| session.descriptor(sel).unwrap().access();
    assert_eq!(access(code), Access::ExecRead);
    assert_eq!(access(data), Access::ReadWrite);
    assert_eq!(access(rodata), Access::ReadOnly);

    let segment = session.descriptor(data).unwrap().segment().clone();
    assert_eq!(segment.skipped(), 0xF000);
    assert_eq!(segment.size(), 0x14400);
    assert_eq!(segment.access_at(0x10000, 0x40), Access::ExecRead);
    assert_eq!(segment.access_at(0x13000, 0x20), Access::ReadOnly);

    assert_eq!(common::read(&session, data, 0x12000, 11), b"hello, data");
    assert_eq!(common::read(&session, rodata, 0x13000, 2), b"ro");
    assert_eq!(info.entry.selector, code.to_u16());
    assert_eq!(info.entry.offset, 0x10010);

    let regs = info.startup_registers();
    assert_eq!(regs.esp, 0x10000);
    assert_eq!(regs.edx, 0xF800);
}

#[test]
fn flat_image_protects_each_range() {
    let (session, _) = common::session();
    let mut w = common::three_segment_image();
    w.flat(0x10000);
    let info = Loader::new(&session).load(&w.finish(), ImageKind::Main).unwrap();
    let data = info.selectors[1];

    assert!(matches!(
        session.translate(data, 0x10010, 1, RwOp::Write),
        Err(GuestFault::ReadOnly { .. })
    ));
    assert!(session.translate(data, 0x13000, 1, RwOp::Write).is_err());
    assert!(session.translate(data, 0x12000, 4, RwOp::Write).is_ok());
    assert!(session.translate(data, 0xF800, 4, RwOp::Write).is_ok());
    assert!(session.translate(data, 0x14000, 0x400, RwOp::Write).is_ok());
    assert!(session.translate(data, 0x100, 1, RwOp::Read).is_err());
}

#[test]
fn flat_image_rejects_stack_at_the_image_base() {
    let (session, _) = common::session();
    let mut w = common::three_segment_image();
    w.flat(0x1000);

    let err = Loader::new(&session).load(&w.finish(), ImageKind::Main).unwrap_err();
    assert!(matches!(
        err,
        LoadError::StackDoesNotFit {
            stack: 0x1000,
            image_base: 0x1000
        }
    ));
    assert_nothing_left(&session);
}

fn assert_nothing_left(session: &emu::Session) {
    assert_eq!(session.descriptor_count(), 0);
    assert_eq!(session.segment_count(), 0);
    assert_eq!(session.image(ImageKind::Main), None);
}

#[test]
fn rejects_bad_version() {
    let (session, _) = common::session();
    let mut w = common::three_segment_image();
    w.header_mut().version = 300;

    let err = Loader::new(&session).load(&w.finish(), ImageKind::Main).unwrap_err();
    assert!(matches!(err, LoadError::Image(ImageError::BadVersion(300))));
    assert_nothing_left(&session);
}

#[test]
fn rejects_fixup_records() {
    let (session, table) = common::session();
    let mut w = common::three_segment_image();
    w.raw_record(RecordType::Fixup.into_bits(), &[0; 8]);

    let err = Loader::new(&session).load(&w.finish(), ImageKind::Main).unwrap_err();
    assert!(matches!(err, LoadError::Fixup(RecordType::Fixup)));
    assert_nothing_left(&session);
    assert!(table.is_empty());
}

#[test]
fn rejects_load_past_segment_end() {
    let (session, _) = common::session();
    let mut w = ImageWriter::new();
    let data = w.segment(SegmentKind::ReadWrite, 0x20);
    w.load(data, 0x1C, b"12345");

    let err = Loader::new(&session).load(&w.finish(), ImageKind::Main).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Overrun {
            segment: 0,
            offset: 0x1C,
            len: 5,
            size: 0x20
        }
    ));
    assert_nothing_left(&session);
}

#[test]
fn rejects_undeclared_entry_segment() {
    let (session, _) = common::session();
    let mut w = ImageWriter::new();
    w.segment(SegmentKind::ExecRead, 0x10);
    w.code(3, 0);

    let err = Loader::new(&session).load(&w.finish(), ImageKind::Main).unwrap_err();
    assert!(matches!(err, LoadError::BadSegmentIndex { field: "code", index: 3, count: 1 }));
    assert_nothing_left(&session);
}

#[test]
fn skips_comments() {
    let (session, _) = common::session();
    let mut w = common::three_segment_image();
    w.comment(b"built by hand");
    assert!(Loader::new(&session).load(&w.finish(), ImageKind::Main).is_ok());
}

#[test]
fn missing_file_is_reported() {
    let (session, _) = common::session();
    let err = Loader::new(&session)
        .load_file(std::path::Path::new("/nonexistent/image"), ImageKind::Main)
        .unwrap_err();
    assert!(matches!(err, LoadError::Io { .. }));
}
