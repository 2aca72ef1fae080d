/// Errors that can occur while encoding, decoding or moving packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// Fewer bytes than a header (or than the header declares) were present.
    #[error("truncated packet ({len} bytes, need {need})")]
    TruncatedPacket { len: usize, need: usize },

    /// The 4-bit command field holds an unassigned code.
    #[error("illegal command {0}")]
    IllegalCommand(u8),

    /// A valid command arrived where the protocol does not allow it.
    #[error("unexpected {command} in {position} position")]
    UnexpectedCommand {
        command: &'static str,
        position: &'static str,
    },

    /// Payload length disagrees with `data_size * unit`.
    #[error("bad payload size ({actual} bytes, header declares {expected})")]
    BadPayloadSize { expected: usize, actual: usize },

    /// The declared payload exceeds what this link will ever carry.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A header field does not fit its wire width.
    #[error("{field} value {value:#x} does not fit in {bits} bits")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },

    /// The stream ended before a complete packet was received.
    #[error("connection closed (incomplete packet)")]
    ConnectionClosed,

    /// The link could not be configured.
    #[error("link setup failed: {0}")]
    Transport(#[from] htifprims_transport::TransportError),

    /// An I/O error occurred while reading or writing packets.
    #[error("packet I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PacketError>;
