use bytes::BytesMut;
use htifprims_transport::Transport;
use tracing::trace;

use crate::codec::{Packet, PacketConfig, PacketHeader, HEADER_SIZE};
use crate::error::Result;
use crate::reader::read_packet_from;
use crate::writer::write_packet_to;

/// Packet framing over a single duplex [`Transport`].
///
/// The link owns the whole transport and sizes its codec from the
/// transport's chunk geometry.
pub struct PacketLink<T> {
    transport: T,
    rx: BytesMut,
    tx: BytesMut,
    config: PacketConfig,
}

impl<T: Transport> PacketLink<T> {
    pub fn new(transport: T) -> Self {
        let config = PacketConfig::for_geometry(transport.geometry());
        let capacity = HEADER_SIZE + config.max_payload_size;
        Self {
            transport,
            rx: BytesMut::with_capacity(capacity),
            tx: BytesMut::with_capacity(capacity),
            config,
        }
    }

    /// Encode and send one packet.
    pub fn send(&mut self, header: &PacketHeader, payload: &[u8]) -> Result<()> {
        trace!(
            cmd = %header.command,
            seqno = header.seqno,
            data_size = header.data_size,
            addr = header.address,
            "tx packet"
        );
        write_packet_to(
            &mut self.transport,
            &mut self.tx,
            &self.config,
            header,
            payload,
        )
    }

    /// Block until one complete packet has arrived.
    pub fn recv(&mut self) -> Result<Packet> {
        let packet = read_packet_from(&mut self.transport, &mut self.rx, &self.config)?;
        trace!(
            cmd = %packet.header.command,
            seqno = packet.header.seqno,
            len = packet.payload.len(),
            "rx packet"
        );
        Ok(packet)
    }

    /// Bytes per `data_size` unit on this link.
    pub fn unit(&self) -> usize {
        self.config.unit
    }

    pub fn config(&self) -> &PacketConfig {
        &self.config
    }

    /// Borrow the underlying transport.
    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the underlying transport.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the link and return the transport. Buffered input is dropped.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for PacketLink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketLink")
            .field("transport", &self.transport)
            .field("unit", &self.config.unit)
            .field("buffered", &self.rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Command;
    use htifprims_transport::{ChunkGeometry, StreamTransport};

    #[test]
    #[cfg(unix)]
    fn request_and_response_over_socket_pair() {
        let (host, target) = std::os::unix::net::UnixStream::pair().unwrap();
        let geometry = ChunkGeometry::new(8, 64).unwrap();
        let mut host = PacketLink::new(StreamTransport::new(host, geometry));
        let mut target = PacketLink::new(StreamTransport::new(target, geometry));
        assert_eq!(host.unit(), 8);

        host.send(&PacketHeader::new(Command::ReadControlReg, 1, 1, 30), &[])
            .unwrap();
        let request = target.recv().unwrap();
        assert_eq!(request.header.command, Command::ReadControlReg);
        assert_eq!(request.header.address, 30);

        target
            .send(
                &PacketHeader::new(Command::Ack, 1, 1, 0),
                &0x42u64.to_le_bytes(),
            )
            .unwrap();
        let response = host.recv().unwrap();
        assert_eq!(response.header.command, Command::Ack);
        assert_eq!(response.payload.as_ref(), &0x42u64.to_le_bytes());
    }

    #[test]
    fn link_sizes_codec_from_geometry() {
        let link = PacketLink::new(StreamTransport::new(
            std::io::Cursor::new(Vec::<u8>::new()),
            ChunkGeometry::ETHERNET,
        ));
        assert_eq!(link.unit(), 64);
        assert_eq!(link.config().max_payload_size, 64);
    }
}
