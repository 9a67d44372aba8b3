use super::GuestContext;
use crate::far_ptr::FarPointer;
use crate::trap::TrapInfo;
use emu_registers::{SegmentRegister, Selector};
use std::io::{self, Write};
use std::process::{Command, Stdio};

/// Bytes of code shown around the instruction pointer.
const CODE_BYTES: usize = 16;

/// Stack dwords shown by default.
pub const STACK_WORDS: usize = 16;

impl GuestContext<'_> {
    /// Write a human-readable snapshot of the guest to `out`.
    ///
    /// Best effort: unreadable memory is reported, never treated as an error.
    pub fn dump(&self, out: &mut dyn Write, trap: Option<&TrapInfo>) -> io::Result<()> {
        let r = self.registers();
        let cs = Selector::from(r.cs);
        let linear = self
            .session()
            .descriptor(cs)
            .map(|d| d.segment().linear_base() + r.eip as usize);

        match linear {
            Some(linear) => writeln!(out, "ip {} (linear {linear:#x})", FarPointer::new(r.cs, r.eip))?,
            None => writeln!(out, "ip {} (unmapped)", FarPointer::new(r.cs, r.eip))?,
        }
        writeln!(
            out,
            "eax {:08x}  ebx {:08x}  ecx {:08x}  edx {:08x}",
            r.eax, r.ebx, r.ecx, r.edx
        )?;
        writeln!(
            out,
            "esi {:08x}  edi {:08x}  ebp {:08x}  esp {:08x}",
            r.esi, r.edi, r.ebp, r.esp
        )?;
        writeln!(
            out,
            "eflags {:08x}{}",
            r.eflags.into_bits(),
            if r.eflags.cf_carry() { " CF" } else { "" }
        )?;

        for reg in [SegmentRegister::Cs, SegmentRegister::Ss]
            .into_iter()
            .chain(SegmentRegister::DATA)
        {
            self.dump_segment(out, reg)?;
        }

        if let Some(t) = trap {
            writeln!(
                out,
                "signal {}  trapno {:#x}  err {:#x}  addr {:#x}",
                t.signal, t.trapno, t.error_code, t.fault_address
            )?;
        }

        let code = self.snapshot(FarPointer::new(r.cs, r.eip), CODE_BYTES);
        writeln!(out, "code:")?;
        if code.is_empty() {
            writeln!(out, "  <unreadable>")?;
        } else {
            hexdump(out, r.eip, &code)?;
            if let Some(listing) = disassemble(r.eip, &code) {
                for line in listing.lines().take(4) {
                    writeln!(out, "  {line}")?;
                }
            }
        }

        self.dump_stack(out, STACK_WORDS)
    }

    /// Write `words` dwords from the top of the guest stack.
    pub fn dump_stack(&self, out: &mut dyn Write, words: usize) -> io::Result<()> {
        let r = self.registers();
        writeln!(out, "stack:")?;
        let bytes = self.snapshot(FarPointer::new(r.ss, r.esp), words * 4);
        if bytes.is_empty() {
            return writeln!(out, "  <unreadable>");
        }
        for (i, word) in bytes.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            #[allow(clippy::cast_possible_truncation)]
            let at = r.esp.wrapping_add((i * 4) as u32);
            writeln!(out, "  {at:08x}: {value:08x}")?;
        }
        Ok(())
    }

    fn dump_segment(&self, out: &mut dyn Write, reg: SegmentRegister) -> io::Result<()> {
        let value = self.registers().segment(reg);
        match self.session().descriptor(Selector::from(value)) {
            Some(d) => writeln!(
                out,
                "{reg} {value:04x}  base {:#x}  size {:#x}  {}",
                d.segment().linear_base(),
                d.segment().size(),
                d.access()
            ),
            None => writeln!(out, "{reg} {value:04x}"),
        }
    }

    fn snapshot(&self, at: FarPointer, max: usize) -> Vec<u8> {
        let len = self
            .session()
            .readable_len(Selector::from(at.selector), at.offset)
            .min(max);
        let mut buf = vec![0u8; len];
        if self.read_bytes(at, &mut buf).is_err() {
            buf.clear();
        }
        buf
    }
}

/// Classic 16-bytes-per-line hex dump, addresses starting at `base`.
pub fn hexdump(out: &mut dyn Write, base: u32, bytes: &[u8]) -> io::Result<()> {
    for (i, line) in bytes.chunks(16).enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let at = base.wrapping_add((i * 16) as u32);
        write!(out, "  {at:08x}:")?;
        for b in line {
            write!(out, " {b:02x}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Pipe `code` through `ndisasm` if it is installed.
fn disassemble(origin: u32, code: &[u8]) -> Option<String> {
    let mut child = Command::new("ndisasm")
        .args(["-b", "32", "-o", &format!("{origin:#x}"), "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    child.stdin.take()?.write_all(code).ok()?;
    let output = child.wait_with_output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}
