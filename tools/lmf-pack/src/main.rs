use emu_image::{ImageWriter, SegmentKind};
use std::{env, fs};

/// Stack placed above the data in the data segment.
const STACK_SIZE: u32 = 0x4000;

fn main() -> std::io::Result<()> {
    // args: <out> <code.bin> <data.bin> [entry-offset]
    let mut args = env::args().skip(1);
    let out = args.next().expect("output image");
    let code = fs::read(args.next().expect("code file"))?;
    let data = fs::read(args.next().expect("data file"))?;
    let entry = args.next().map_or(0, |s| parse_offset(&s));

    let code_len = u32::try_from(code.len()).expect("code too large");
    let data_len = u32::try_from(data.len()).expect("data too large");
    // Keep the stack dword aligned.
    let data_size = data_len.next_multiple_of(4) + STACK_SIZE;

    let mut w = ImageWriter::new();
    let text = w.segment(SegmentKind::ExecRead, code_len.max(1));
    let rw = w.segment(SegmentKind::ReadWrite, data_size);
    w.code(text, entry)
        .stack(rw, STACK_SIZE)
        .heap(rw, 0)
        .argv(rw)
        .load(text, 0, &code)
        .load(rw, 0, &data)
        .rw_end();

    let image = w.finish();
    fs::write(&out, &image)?;
    println!(
        "{out}: code {code_len:#x} bytes, data {data_size:#x} bytes, entry {entry:#x}, {} bytes total",
        image.len()
    );
    Ok(())
}

fn parse_offset(s: &str) -> u32 {
    s.strip_prefix("0x")
        .map_or_else(|| s.parse(), |hex| u32::from_str_radix(hex, 16))
        .expect("entry offset")
}
