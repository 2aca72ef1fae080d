//! HTIF packet framing and mailbox word layout.
//!
//! Every exchange with a target is one request packet followed by exactly one
//! response packet. A packet is:
//! - an 8-byte little-endian header word (command, data size, sequence
//!   number, address)
//! - `data_size` alignment units of payload, present only for writes and ACKs
//!
//! The alignment unit is a property of the link, so every decode takes a
//! [`PacketConfig`] derived from the link's chunk geometry.

pub mod codec;
pub mod error;
pub mod link;
pub mod mailbox;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_packet, encode_packet, Command, Packet, PacketConfig, PacketHeader, HEADER_SIZE,
    MAX_ADDRESS, MAX_DATA_UNITS,
};
pub use error::{PacketError, Result};
pub use link::PacketLink;
pub use mailbox::{MailboxWord, COMMAND_SLOTS, PAYLOAD_MASK};
