use bytes::Bytes;

use crate::error::{HtifError, Result};

/// Fixed-alignment block access to target memory.
///
/// This is the only memory primitive the rest of the engine relies on: the
/// wire protocol, the in-memory hex image and test doubles all implement it,
/// and [`MemIf`](crate::MemIf) builds byte-granular access on top.
pub trait ChunkTarget {
    /// Every chunk address and length is a multiple of this.
    fn chunk_align(&self) -> usize;

    /// Largest single chunk transfer.
    fn chunk_max_size(&self) -> usize;

    /// Read `len` bytes at `addr`.
    fn read_chunk(&mut self, addr: u64, len: usize) -> Result<Bytes>;

    /// Write `len` bytes at `addr`; `None` writes zeros.
    fn write_chunk(&mut self, addr: u64, len: usize, data: Option<&[u8]>) -> Result<()>;
}

impl<C: ChunkTarget + ?Sized> ChunkTarget for &mut C {
    fn chunk_align(&self) -> usize {
        (**self).chunk_align()
    }

    fn chunk_max_size(&self) -> usize {
        (**self).chunk_max_size()
    }

    fn read_chunk(&mut self, addr: u64, len: usize) -> Result<Bytes> {
        (**self).read_chunk(addr, len)
    }

    fn write_chunk(&mut self, addr: u64, len: usize, data: Option<&[u8]>) -> Result<()> {
        (**self).write_chunk(addr, len, data)
    }
}

/// Reject chunk requests that break the alignment contract.
///
/// Shared by every [`ChunkTarget`] so violations surface identically
/// regardless of backend.
pub fn check_chunk(
    align: usize,
    max_size: usize,
    addr: u64,
    len: usize,
    data: Option<&[u8]>,
) -> Result<()> {
    if addr % align as u64 != 0 {
        return Err(HtifError::MisalignedAddress { addr, align });
    }
    if len % align != 0 {
        return Err(HtifError::precondition(format!(
            "chunk length {len} is not a multiple of {align}"
        )));
    }
    if len > max_size {
        return Err(HtifError::precondition(format!(
            "chunk length {len} exceeds maximum {max_size}"
        )));
    }
    if let Some(bytes) = data {
        if bytes.len() != len {
            return Err(HtifError::precondition(format!(
                "chunk buffer holds {} bytes, expected {len}",
                bytes.len()
            )));
        }
    }
    Ok(())
}
