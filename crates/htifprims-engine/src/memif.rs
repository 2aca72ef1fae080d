use crate::chunk::ChunkTarget;
use crate::error::{HtifError, Result};

/// Byte-granular access to target memory over a chunk primitive.
///
/// Ranges that start or end inside a chunk are handled with one extra chunk
/// read (and, for writes, a read-modify-write of that chunk). The aligned
/// middle of a range moves in transfers of up to `chunk_max_size()` bytes.
/// Target memory is little-endian.
pub struct MemIf<'a> {
    target: &'a mut dyn ChunkTarget,
}

impl<'a> MemIf<'a> {
    pub fn new(target: &'a mut dyn ChunkTarget) -> Self {
        Self { target }
    }

    /// Reborrow for a shorter scope.
    pub fn reborrow(&mut self) -> MemIf<'_> {
        MemIf {
            target: &mut *self.target,
        }
    }

    pub fn chunk_align(&self) -> usize {
        self.target.chunk_align()
    }

    /// Read `len` bytes starting at `addr`.
    pub fn read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    /// Fill `dst` from target memory starting at `addr`.
    pub fn read_into(&mut self, addr: u64, dst: &mut [u8]) -> Result<()> {
        check_range(addr, dst.len())?;
        let align = self.target.chunk_align();
        let max = self.target.chunk_max_size();
        let mut addr = addr;
        let mut pos = 0usize;

        let lead = (addr % align as u64) as usize;
        if lead != 0 && !dst.is_empty() {
            let base = addr - lead as u64;
            let chunk = self.target.read_chunk(base, align)?;
            let n = (align - lead).min(dst.len());
            dst[..n].copy_from_slice(&chunk[lead..lead + n]);
            pos += n;
            addr += n as u64;
        }

        while dst.len() - pos >= align {
            let remaining = dst.len() - pos;
            let n = max.min(remaining - remaining % align);
            let chunk = self.target.read_chunk(addr, n)?;
            dst[pos..pos + n].copy_from_slice(&chunk);
            pos += n;
            addr += n as u64;
        }

        if pos < dst.len() {
            let chunk = self.target.read_chunk(addr, align)?;
            let n = dst.len() - pos;
            dst[pos..].copy_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Write `len` bytes at `addr`; `None` writes zeros.
    ///
    /// Zero-fill of aligned spans is passed to the chunk layer as `None`, so
    /// no zero buffer is materialized here.
    pub fn write(&mut self, addr: u64, len: usize, data: Option<&[u8]>) -> Result<()> {
        if let Some(bytes) = data {
            if bytes.len() != len {
                return Err(HtifError::precondition(format!(
                    "write of {len} bytes given a {}-byte buffer",
                    bytes.len()
                )));
            }
        }
        check_range(addr, len)?;
        let align = self.target.chunk_align();
        let max = self.target.chunk_max_size();
        let mut addr = addr;
        let mut pos = 0usize;

        let lead = (addr % align as u64) as usize;
        if lead != 0 && len > 0 {
            let base = addr - lead as u64;
            let n = (align - lead).min(len);
            self.patch_chunk(base, lead, data.map(|d| &d[..n]), n)?;
            pos += n;
            addr += n as u64;
        }

        while len - pos >= align {
            let remaining = len - pos;
            let n = max.min(remaining - remaining % align);
            self.target
                .write_chunk(addr, n, data.map(|d| &d[pos..pos + n]))?;
            pos += n;
            addr += n as u64;
        }

        if pos < len {
            let n = len - pos;
            self.patch_chunk(addr, 0, data.map(|d| &d[pos..]), n)?;
        }
        Ok(())
    }

    /// Write a byte slice at `addr`.
    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.write(addr, bytes.len(), Some(bytes))
    }

    /// Zero `len` bytes at `addr`.
    pub fn write_zeros(&mut self, addr: u64, len: usize) -> Result<()> {
        self.write(addr, len, None)
    }

    /// Read-modify-write `n` bytes at `offset` within the chunk at `base`.
    fn patch_chunk(
        &mut self,
        base: u64,
        offset: usize,
        data: Option<&[u8]>,
        n: usize,
    ) -> Result<()> {
        let align = self.target.chunk_align();
        let mut chunk = self.target.read_chunk(base, align)?.to_vec();
        match data {
            Some(bytes) => chunk[offset..offset + n].copy_from_slice(bytes),
            None => chunk[offset..offset + n].fill(0),
        }
        self.target.write_chunk(base, align, Some(&chunk))
    }
}

fn check_range(addr: u64, len: usize) -> Result<()> {
    if addr.checked_add(len as u64).is_none() {
        return Err(HtifError::precondition(format!(
            "range {addr:#x}+{len} wraps the address space"
        )));
    }
    Ok(())
}

fn check_natural(addr: u64, width: usize) -> Result<()> {
    if addr % width as u64 != 0 {
        return Err(HtifError::MisalignedAddress { addr, align: width });
    }
    Ok(())
}

macro_rules! typed_access {
    ($($read:ident, $write:ident => $ty:ty;)*) => {
        impl MemIf<'_> {
            $(
                #[doc = concat!("Read a naturally aligned `", stringify!($ty), "`.")]
                pub fn $read(&mut self, addr: u64) -> Result<$ty> {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    check_natural(addr, raw.len())?;
                    self.read_into(addr, &mut raw)?;
                    Ok(<$ty>::from_le_bytes(raw))
                }

                #[doc = concat!("Write a naturally aligned `", stringify!($ty), "`.")]
                pub fn $write(&mut self, addr: u64, value: $ty) -> Result<()> {
                    check_natural(addr, std::mem::size_of::<$ty>())?;
                    self.write_bytes(addr, &value.to_le_bytes())
                }
            )*
        }
    };
}

typed_access! {
    read_u8, write_u8 => u8;
    read_u16, write_u16 => u16;
    read_u32, write_u32 => u32;
    read_u64, write_u64 => u64;
    read_i8, write_i8 => i8;
    read_i16, write_i16 => i16;
    read_i32, write_i32 => i32;
    read_i64, write_i64 => i64;
}
