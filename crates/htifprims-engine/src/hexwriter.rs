use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::chunk::{check_chunk, ChunkTarget};
use crate::error::{HtifError, Result};

/// Sparse in-memory target image, one line per `width` bytes.
///
/// Lines never written read back as zeros. [`Display`](fmt::Display) renders
/// the touched lines in address order as `@<line index> <hex>` with each
/// line's bytes printed most-significant first, the format memory
/// initialisers for hardware simulators expect.
#[derive(Debug, Clone)]
pub struct HexImage {
    width: usize,
    lines: BTreeMap<u64, Vec<u8>>,
}

impl HexImage {
    /// `width` must be a power of two no smaller than 8.
    pub fn new(width: usize) -> Result<Self> {
        if width < 8 || !width.is_power_of_two() {
            return Err(HtifError::precondition(format!(
                "image width {width} must be a power of two >= 8"
            )));
        }
        Ok(Self {
            width,
            lines: BTreeMap::new(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of lines that have been written.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Bytes of line `index`, if it was ever written.
    pub fn line(&self, index: u64) -> Option<&[u8]> {
        self.lines.get(&index).map(Vec::as_slice)
    }
}

impl ChunkTarget for HexImage {
    fn chunk_align(&self) -> usize {
        self.width
    }

    fn chunk_max_size(&self) -> usize {
        // Lines are independent; cap single transfers to keep buffers sane.
        self.width * 1024
    }

    fn read_chunk(&mut self, addr: u64, len: usize) -> Result<Bytes> {
        check_chunk(self.width, self.chunk_max_size(), addr, len, None)?;
        let mut out = Vec::with_capacity(len);
        let first = addr / self.width as u64;
        for index in first..first + (len / self.width) as u64 {
            match self.lines.get(&index) {
                Some(line) => out.extend_from_slice(line),
                None => out.resize(out.len() + self.width, 0),
            }
        }
        Ok(Bytes::from(out))
    }

    fn write_chunk(&mut self, addr: u64, len: usize, data: Option<&[u8]>) -> Result<()> {
        check_chunk(self.width, self.chunk_max_size(), addr, len, data)?;
        let first = addr / self.width as u64;
        for (i, offset) in (0..len).step_by(self.width).enumerate() {
            let line = match data {
                Some(bytes) => bytes[offset..offset + self.width].to_vec(),
                None => vec![0u8; self.width],
            };
            self.lines.insert(first + i as u64, line);
        }
        Ok(())
    }
}

impl fmt::Display for HexImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, line) in &self.lines {
            write!(f, "@{index:x} ")?;
            for byte in line.iter().rev() {
                write!(f, "{byte:02x}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memif::MemIf;

    #[test]
    fn width_must_be_power_of_two() {
        assert!(HexImage::new(4).is_err());
        assert!(HexImage::new(24).is_err());
        assert!(HexImage::new(16).is_ok());
    }

    #[test]
    fn renders_msb_first_with_hex_index() {
        let mut image = HexImage::new(8).unwrap();
        let mut mem = MemIf::new(&mut image);
        mem.write_bytes(0x88, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
            .unwrap();
        assert_eq!(image.to_string(), "@11 0807060504030201\n");
    }

    #[test]
    fn unaligned_write_fills_partial_lines() {
        let mut image = HexImage::new(8).unwrap();
        let mut mem = MemIf::new(&mut image);
        mem.write_bytes(6, &[0xaa, 0xbb, 0xcc]).unwrap();
        assert_eq!(mem.read(4, 6).unwrap(), [0, 0, 0xaa, 0xbb, 0xcc, 0]);
        assert_eq!(image.line_count(), 2);
        assert_eq!(
            image.to_string(),
            "@0 bbaa000000000000\n@1 00000000000000cc\n"
        );
    }

    #[test]
    fn zero_fill_materializes_lines() {
        let mut image = HexImage::new(16).unwrap();
        MemIf::new(&mut image).write_zeros(32, 32).unwrap();
        assert_eq!(image.line(2), Some(&[0u8; 16][..]));
        assert_eq!(image.line(3), Some(&[0u8; 16][..]));
        assert_eq!(image.line(4), None);
    }
}
