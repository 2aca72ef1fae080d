use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_packet, Packet, PacketConfig, HEADER_SIZE};
use crate::error::{PacketError, Result};

/// Pull bytes from `inner` into `buf` until one packet decodes.
///
/// Each read asks for at most one header plus one maximal payload.
pub(crate) fn read_packet_from<R: Read + ?Sized>(
    inner: &mut R,
    buf: &mut BytesMut,
    config: &PacketConfig,
) -> Result<Packet> {
    let mut chunk = vec![0u8; HEADER_SIZE + config.max_payload_size];
    loop {
        if let Some(packet) = decode_packet(buf, config)? {
            return Ok(packet);
        }

        let read = match inner.read(&mut chunk) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(PacketError::Io(err)),
        };

        if read == 0 {
            return Err(PacketError::ConnectionClosed);
        }

        buf.extend_from_slice(&chunk[..read]);
    }
}
