use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_packet, PacketConfig, PacketHeader};
use crate::error::{PacketError, Result};

/// Encode into `buf` and push every byte out, then flush.
pub(crate) fn write_packet_to<W: Write + ?Sized>(
    inner: &mut W,
    buf: &mut BytesMut,
    config: &PacketConfig,
    header: &PacketHeader,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > config.max_payload_size {
        return Err(PacketError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }

    buf.clear();
    encode_packet(header, payload, config.unit, buf)?;

    let mut offset = 0usize;
    while offset < buf.len() {
        match inner.write(&buf[offset..]) {
            Ok(0) => return Err(PacketError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(PacketError::Io(err)),
        }
    }

    loop {
        match inner.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(PacketError::Io(err)),
        }
    }
}
