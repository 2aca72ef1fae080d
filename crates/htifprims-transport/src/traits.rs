use std::io::{Read, Write};

use crate::error::{Result, TransportError};

/// Chunk alignment and maximum single-transfer size of a link.
///
/// Every memory transfer the engine issues is a whole number of `alignment`
/// bytes, starts on an `alignment` boundary, and never exceeds `max_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    alignment: usize,
    max_chunk: usize,
}

impl ChunkGeometry {
    /// Smallest supported alignment: one 64-bit register.
    pub const MIN_ALIGNMENT: usize = 8;

    /// Instruction-set simulator links (pipes, sockets).
    pub const SIMULATOR: ChunkGeometry = ChunkGeometry {
        alignment: 16,
        max_chunk: 1024,
    };

    /// Raw Ethernet links carry one 64-byte line per frame.
    pub const ETHERNET: ChunkGeometry = ChunkGeometry {
        alignment: 64,
        max_chunk: 64,
    };

    /// Slow serial lines move a single word at a time.
    pub const SERIAL: ChunkGeometry = ChunkGeometry {
        alignment: 8,
        max_chunk: 8,
    };

    /// Validate and build a geometry.
    ///
    /// `alignment` must be a power of two no smaller than
    /// [`Self::MIN_ALIGNMENT`]; `max_chunk` must be a non-zero multiple of it.
    pub fn new(alignment: usize, max_chunk: usize) -> Result<Self> {
        let ok = alignment >= Self::MIN_ALIGNMENT
            && alignment.is_power_of_two()
            && max_chunk >= alignment
            && max_chunk % alignment == 0;
        if !ok {
            return Err(TransportError::BadGeometry {
                alignment,
                max_chunk,
            });
        }
        Ok(Self {
            alignment,
            max_chunk,
        })
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// True if `value` sits on an alignment boundary.
    pub fn is_aligned(&self, value: u64) -> bool {
        value % self.alignment as u64 == 0
    }

    /// Round `addr` down to the enclosing chunk boundary.
    pub fn align_down(&self, addr: u64) -> u64 {
        addr & !(self.alignment as u64 - 1)
    }
}

impl Default for ChunkGeometry {
    fn default() -> Self {
        Self::SIMULATOR
    }
}

/// A duplex byte link to a target with a declared chunk geometry.
///
/// Backends only move bytes; framing, sequencing and validation live in the
/// packet and engine layers.
pub trait Transport: Read + Write {
    /// Alignment and maximum transfer size of this link.
    fn geometry(&self) -> ChunkGeometry;

    fn alignment_unit(&self) -> usize {
        self.geometry().alignment()
    }

    fn max_chunk_size(&self) -> usize {
        self.geometry().max_chunk()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn geometry(&self) -> ChunkGeometry {
        (**self).geometry()
    }
}

/// A connected link stream: a Unix socket, a tty, or a pair of pipe fds.
pub struct LinkStream {
    inner: LinkStreamInner,
}

enum LinkStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Serial(std::fs::File),
    Pipe {
        input: std::fs::File,
        output: std::fs::File,
    },
}

impl Read for LinkStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.read(buf),
            LinkStreamInner::Serial(file) => file.read(buf),
            LinkStreamInner::Pipe { input, .. } => input.read(buf),
        }
    }
}

impl Write for LinkStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.write(buf),
            LinkStreamInner::Serial(file) => file.write(buf),
            LinkStreamInner::Pipe { output, .. } => output.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.flush(),
            LinkStreamInner::Serial(file) => file.flush(),
            LinkStreamInner::Pipe { output, .. } => output.flush(),
        }
    }
}

impl LinkStream {
    /// Create a LinkStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: LinkStreamInner::Unix(stream),
        }
    }

    /// Create a LinkStream from an opened and configured tty.
    pub(crate) fn from_serial(file: std::fs::File) -> Self {
        Self {
            inner: LinkStreamInner::Serial(file),
        }
    }

    /// Create a LinkStream from separate input and output files.
    pub fn from_pipes(input: std::fs::File, output: std::fs::File) -> Self {
        Self {
            inner: LinkStreamInner::Pipe { input, output },
        }
    }

    /// Adopt two inherited file descriptors (e.g. handed down by a simulator).
    ///
    /// # Safety
    ///
    /// Both descriptors must be open, owned by nobody else, and remain valid
    /// for the lifetime of the returned stream, which closes them on drop.
    #[cfg(unix)]
    pub unsafe fn from_raw_fds(input: std::os::fd::RawFd, output: std::os::fd::RawFd) -> Self {
        use std::os::fd::FromRawFd;

        // SAFETY: ownership of both descriptors is transferred by the caller.
        let (input, output) = unsafe {
            (
                std::fs::File::from_raw_fd(input),
                std::fs::File::from_raw_fd(output),
            )
        };
        Self::from_pipes(input, output)
    }

    /// Link kind for diagnostics.
    pub fn kind(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            LinkStreamInner::Unix(_) => "unix",
            LinkStreamInner::Serial(_) => "serial",
            LinkStreamInner::Pipe { .. } => "pipe",
        }
    }
}

impl std::fmt::Debug for LinkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkStream")
            .field("type", &self.kind())
            .finish()
    }
}

/// Any byte stream paired with the chunk geometry its target expects.
#[derive(Debug)]
pub struct StreamTransport<S> {
    inner: S,
    geometry: ChunkGeometry,
}

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(inner: S, geometry: ChunkGeometry) -> Self {
        Self { inner, geometry }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consume the transport and return the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read> Read for StreamTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: Write> Write for StreamTransport<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_non_power_of_two() {
        let err = ChunkGeometry::new(24, 48).unwrap_err();
        assert!(matches!(err, TransportError::BadGeometry { .. }));
    }

    #[test]
    fn geometry_rejects_sub_register_alignment() {
        assert!(ChunkGeometry::new(4, 64).is_err());
    }

    #[test]
    fn geometry_rejects_ragged_max_chunk() {
        assert!(ChunkGeometry::new(16, 40).is_err());
        assert!(ChunkGeometry::new(16, 0).is_err());
    }

    #[test]
    fn geometry_alignment_helpers() {
        let geo = ChunkGeometry::new(16, 64).unwrap();
        assert!(geo.is_aligned(0x20));
        assert!(!geo.is_aligned(0x28));
        assert_eq!(geo.align_down(0x2f), 0x20);
    }

    #[test]
    #[cfg(unix)]
    fn stream_transport_passes_bytes_through() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut a = StreamTransport::new(LinkStream::from_unix(left), ChunkGeometry::SIMULATOR);
        let mut b = StreamTransport::new(LinkStream::from_unix(right), ChunkGeometry::SIMULATOR);

        a.write_all(b"tick").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();

        assert_eq!(&buf, b"tick");
        assert_eq!(a.alignment_unit(), 16);
        assert_eq!(b.max_chunk_size(), 1024);
    }

    #[test]
    fn boxed_transport_keeps_geometry() {
        let boxed: Box<dyn Transport> = Box::new(StreamTransport::new(
            std::io::Cursor::new(Vec::<u8>::new()),
            ChunkGeometry::ETHERNET,
        ));
        assert_eq!(boxed.alignment_unit(), 64);
        assert_eq!(boxed.max_chunk_size(), 64);
    }

    #[test]
    #[cfg(unix)]
    fn pipe_stream_reports_its_kind() {
        let dir = std::env::temp_dir().join(format!("htifprims-pipe-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pipe.bin");
        let input = std::fs::File::create(&path).unwrap();
        let output = std::fs::File::create(&path).unwrap();

        let link = LinkStream::from_pipes(input, output);
        assert_eq!(link.kind(), "pipe");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
