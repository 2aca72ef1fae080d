use std::io::Write;
use std::ops::Range;

use crate::error::{HtifError, Result};
use crate::memif::MemIf;

/// Bytes per signature line.
pub const SIGNATURE_LINE: usize = 16;

/// Read the signature range and write it as hex lines, 16 bytes per line,
/// most-significant byte first.
pub fn dump_signature(mem: &mut MemIf<'_>, range: Range<u64>, out: &mut dyn Write) -> Result<()> {
    let len = range.end.checked_sub(range.start).ok_or_else(|| {
        HtifError::precondition(format!(
            "signature range {:#x}..{:#x} is reversed",
            range.start, range.end
        ))
    })? as usize;
    if len % SIGNATURE_LINE != 0 {
        return Err(HtifError::precondition(format!(
            "signature length {len} is not a multiple of {SIGNATURE_LINE}"
        )));
    }
    let bytes = mem.read(range.start, len)?;
    out.write_all(format_signature(&bytes).as_bytes())?;
    out.flush()?;
    Ok(())
}

/// Render whole 16-byte lines; a ragged tail is ignored.
pub fn format_signature(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() / SIGNATURE_LINE * (2 * SIGNATURE_LINE + 1));
    for line in bytes.chunks_exact(SIGNATURE_LINE) {
        for byte in line.iter().rev() {
            text.push_str(&format!("{byte:02x}"));
        }
        text.push('\n');
    }
    text
}
