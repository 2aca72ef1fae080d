use bytes::{Buf, BufMut, Bytes, BytesMut};
use htifprims_transport::ChunkGeometry;

use crate::error::{PacketError, Result};

/// Packet header: one little-endian 64-bit word.
pub const HEADER_SIZE: usize = 8;

/// Largest `data_size` the 12-bit field can express.
pub const MAX_DATA_UNITS: u16 = 0x0fff;

/// Width of the address field.
pub const ADDRESS_BITS: u32 = 40;

/// Largest address the 40-bit field can express.
pub const MAX_ADDRESS: u64 = (1 << ADDRESS_BITS) - 1;

/// Wire command codes. Codes 6..=15 are unassigned and never decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ReadMem = 0,
    WriteMem = 1,
    ReadControlReg = 2,
    WriteControlReg = 3,
    Ack = 4,
    Nack = 5,
}

impl Command {
    /// Whether a packet with this command carries `data_size * unit` payload
    /// bytes. Read requests and NACKs are header-only.
    pub fn carries_payload(self) -> bool {
        !matches!(
            self,
            Command::ReadMem | Command::ReadControlReg | Command::Nack
        )
    }

    /// True for ACK and NACK.
    pub fn is_response(self) -> bool {
        matches!(self, Command::Ack | Command::Nack)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::ReadMem => "READ_MEM",
            Command::WriteMem => "WRITE_MEM",
            Command::ReadControlReg => "READ_CONTROL_REG",
            Command::WriteControlReg => "WRITE_CONTROL_REG",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = PacketError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Command::ReadMem),
            1 => Ok(Command::WriteMem),
            2 => Ok(Command::ReadControlReg),
            3 => Ok(Command::WriteControlReg),
            4 => Ok(Command::Ack),
            5 => Ok(Command::Nack),
            other => Err(PacketError::IllegalCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-width packet header.
///
/// Wire layout (one little-endian u64):
/// ```text
/// ┌──────────┬──────────────┬──────────┬───────────────┐
/// │ cmd      │ data_size    │ seqno    │ address       │
/// │ [3:0]    │ [15:4]       │ [23:16]  │ [63:24]       │
/// └──────────┴──────────────┴──────────┴───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: Command,
    /// Payload length in alignment units.
    pub data_size: u16,
    pub seqno: u8,
    /// Memory address in alignment units, or an encoded core/register pair.
    pub address: u64,
}

impl PacketHeader {
    pub fn new(command: Command, seqno: u8, data_size: u16, address: u64) -> Self {
        Self {
            command,
            data_size,
            seqno,
            address,
        }
    }

    /// Payload bytes implied by this header for a link with `unit`-byte units.
    pub fn payload_len(&self, unit: usize) -> usize {
        if self.command.carries_payload() {
            self.data_size as usize * unit
        } else {
            0
        }
    }

    /// Header plus payload size on the wire.
    pub fn packet_len(&self, unit: usize) -> usize {
        HEADER_SIZE + self.payload_len(unit)
    }

    /// Pack into the 64-bit wire word.
    pub fn to_word(&self) -> Result<u64> {
        if self.data_size > MAX_DATA_UNITS {
            return Err(PacketError::FieldOverflow {
                field: "data_size",
                value: self.data_size as u64,
                bits: 12,
            });
        }
        if self.address > MAX_ADDRESS {
            return Err(PacketError::FieldOverflow {
                field: "address",
                value: self.address,
                bits: ADDRESS_BITS,
            });
        }
        Ok(self.command as u64
            | (self.data_size as u64) << 4
            | (self.seqno as u64) << 16
            | self.address << 24)
    }

    /// Unpack a wire word, rejecting unassigned command codes.
    pub fn from_word(word: u64) -> Result<Self> {
        let command = Command::try_from((word & 0xf) as u8)?;
        Ok(Self {
            command,
            data_size: ((word >> 4) & 0x0fff) as u16,
            seqno: (word >> 16) as u8,
            address: word >> 24,
        })
    }
}

/// A header with its (possibly empty) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// A header-only packet (read requests, NACK).
    pub fn header_only(header: PacketHeader) -> Self {
        Self::new(header, Bytes::new())
    }

    /// The total wire size of this packet.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self, unit: usize) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        encode_packet(&self.header, &self.payload, unit, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode exactly one packet occupying all of `bytes`.
    pub fn decode(bytes: &[u8], unit: usize) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::TruncatedPacket {
                len: bytes.len(),
                need: HEADER_SIZE,
            });
        }
        let word = u64::from_le_bytes(header_bytes(bytes));
        let header = PacketHeader::from_word(word)?;
        let expected = header.payload_len(unit);
        let actual = bytes.len() - HEADER_SIZE;
        if actual != expected {
            return Err(PacketError::BadPayloadSize { expected, actual });
        }
        Ok(Self::new(
            header,
            Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        ))
    }
}

fn header_bytes(src: &[u8]) -> [u8; HEADER_SIZE] {
    let mut word = [0u8; HEADER_SIZE];
    word.copy_from_slice(&src[..HEADER_SIZE]);
    word
}

/// Encode a header and payload into the wire format.
///
/// The payload must be exactly `header.payload_len(unit)` bytes; there is no
/// padding between header and payload.
pub fn encode_packet(
    header: &PacketHeader,
    payload: &[u8],
    unit: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    let expected = header.payload_len(unit);
    if payload.len() != expected {
        return Err(PacketError::BadPayloadSize {
            expected,
            actual: payload.len(),
        });
    }
    let word = header.to_word()?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u64_le(word);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a packet from the front of a stream buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete packet yet.
/// On success, consumes the packet bytes from the buffer. An unassigned
/// command code fails as soon as the header is visible.
pub fn decode_packet(src: &mut BytesMut, config: &PacketConfig) -> Result<Option<Packet>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = PacketHeader::from_word(u64::from_le_bytes(header_bytes(src)))?;
    let payload_len = header.payload_len(config.unit);
    if payload_len > config.max_payload_size {
        return Err(PacketError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    Ok(Some(Packet { header, payload }))
}

/// Per-link codec settings.
#[derive(Debug, Clone)]
pub struct PacketConfig {
    /// Bytes per `data_size` unit (the link's alignment).
    pub unit: usize,
    /// Largest payload accepted from the wire.
    pub max_payload_size: usize,
}

impl PacketConfig {
    /// Settings matching a link's chunk geometry.
    pub fn for_geometry(geometry: ChunkGeometry) -> Self {
        Self {
            unit: geometry.alignment(),
            max_payload_size: geometry.max_chunk(),
        }
    }
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self::for_geometry(ChunkGeometry::default())
    }
}
