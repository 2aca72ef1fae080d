use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use tracing::{debug, info};
use xmas_elf::program::Type;
use xmas_elf::sections::{SectionData, ShType};
use xmas_elf::symbol_table::Entry;
use xmas_elf::ElfFile;

use crate::error::{HtifError, Result};
use crate::memif::MemIf;

/// Symbol marking the first byte of the signature region.
pub const BEGIN_SIGNATURE: &str = "begin_signature";
/// Symbol marking one past the last byte of the signature region.
pub const END_SIGNATURE: &str = "end_signature";

/// Result of loading an ELF image into target memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedProgram {
    pub entry: u64,
    /// Loadable segments written.
    pub segments: usize,
    /// Named symbols and their values.
    pub symbols: BTreeMap<String, u64>,
}

impl LoadedProgram {
    /// Signature region, when both marker symbols are present.
    pub fn signature_range(&self) -> Option<Range<u64>> {
        let begin = *self.symbols.get(BEGIN_SIGNATURE)?;
        let end = *self.symbols.get(END_SIGNATURE)?;
        (end > begin).then_some(begin..end)
    }
}

fn load_error(path: &str, reason: impl std::fmt::Display) -> HtifError {
    HtifError::Load(format!("{path}: {reason}"))
}

/// Load the ELF file at `path` into target memory.
pub fn load_elf_file(mem: &mut MemIf<'_>, path: impl AsRef<Path>) -> Result<LoadedProgram> {
    let path = path.as_ref();
    let image = std::fs::read(path).map_err(|e| load_error(&path.display().to_string(), e))?;
    info!(path = %path.display(), bytes = image.len(), "loading program");
    load_elf(mem, &image)
}

/// Load an in-memory ELF32/ELF64 image.
///
/// Every `PT_LOAD` segment with a non-zero memory size is written at its
/// physical address. The part of the segment beyond its file contents is
/// zeroed with a `None` write so zero-init elision can skip it.
pub fn load_elf(mem: &mut MemIf<'_>, image: &[u8]) -> Result<LoadedProgram> {
    let elf = ElfFile::new(image).map_err(|e| load_error("elf", e))?;
    let mut program = LoadedProgram {
        entry: elf.header.pt2.entry_point(),
        ..LoadedProgram::default()
    };

    for ph in elf.program_iter() {
        if !matches!(ph.get_type(), Ok(Type::Load)) || ph.mem_size() == 0 {
            continue;
        }
        let offset = ph.offset() as usize;
        let file_size = ph.file_size() as usize;
        let mem_size = ph.mem_size() as usize;
        let paddr = ph.physical_addr();
        if file_size > mem_size {
            return Err(load_error("elf", "segment file size exceeds memory size"));
        }
        let contents = offset
            .checked_add(file_size)
            .and_then(|end| image.get(offset..end))
            .ok_or_else(|| load_error("elf", "segment extends past end of file"))?;

        debug!(paddr, file_size, mem_size, "load segment");
        mem.write_bytes(paddr, contents)?;
        if mem_size > file_size {
            mem.write(paddr + file_size as u64, mem_size - file_size, None)?;
        }
        program.segments += 1;
    }

    program.symbols = symbols(&elf)?;
    Ok(program)
}

fn symbols(elf: &ElfFile<'_>) -> Result<BTreeMap<String, u64>> {
    let mut table = BTreeMap::new();
    for section in elf.section_iter() {
        if !matches!(section.get_type(), Ok(ShType::SymTab)) {
            continue;
        }
        let data = section.get_data(elf).map_err(|e| load_error("symtab", e))?;
        match data {
            SectionData::SymbolTable64(entries) => collect(elf, entries, &mut table),
            SectionData::SymbolTable32(entries) => collect(elf, entries, &mut table),
            _ => {}
        }
    }
    Ok(table)
}

fn collect<E: Entry>(elf: &ElfFile<'_>, entries: &[E], table: &mut BTreeMap<String, u64>) {
    for entry in entries {
        if let Ok(name) = entry.get_name(elf) {
            if !name.is_empty() {
                table.insert(name.to_string(), entry.value());
            }
        }
    }
}
