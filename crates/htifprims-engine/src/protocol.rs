use bytes::Bytes;
use htifprims_packet::{Command, Packet, PacketError, PacketHeader, PacketLink};
use htifprims_transport::{ChunkGeometry, Transport};
use tracing::debug;

use crate::chunk::{check_chunk, ChunkTarget};
use crate::error::{HtifError, Result};

/// Per-core control register numbers.
pub mod cr {
    /// Inter-processor interrupt doorbell.
    pub const IPI: u16 = 9;
    /// Core identity as seen by software.
    pub const COREID: u16 = 10;
    /// Reset line; 1 holds the core in reset.
    pub const RESET: u16 = 29;
    /// Target -> host mailbox.
    pub const TOHOST: u16 = 30;
    /// Host -> target mailbox.
    pub const FROMHOST: u16 = 31;

    /// Global register: number of cores.
    pub const NUM_CORES: u16 = 0;
    /// Global register: memory size in MiB.
    pub const MEM_MB: u16 = 1;
}

/// Which register file a control-register access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Core {
    /// Target-wide registers (core count, memory size).
    Global,
    Id(u32),
}

impl Core {
    const SHIFT: u32 = 20;
    /// All-ones core field selects the global registers.
    const GLOBAL_FIELD: u64 = (1 << 20) - 1;

    /// Encode `self:register` into a packet address field.
    pub fn register_address(self, register: u16) -> Result<u64> {
        let core = match self {
            Core::Global => Self::GLOBAL_FIELD,
            Core::Id(id) if (id as u64) < Self::GLOBAL_FIELD => id as u64,
            Core::Id(id) => {
                return Err(HtifError::precondition(format!(
                    "core id {id} does not fit the 20-bit core field"
                )))
            }
        };
        Ok(core << Self::SHIFT | register as u64)
    }

    /// Inverse of [`Core::register_address`].
    pub fn from_register_address(address: u64) -> (Core, u16) {
        let core = (address >> Self::SHIFT) & Self::GLOBAL_FIELD;
        let register = (address & ((1 << Self::SHIFT) - 1)) as u16;
        if core == Self::GLOBAL_FIELD {
            (Core::Global, register)
        } else {
            (Core::Id(core as u32), register)
        }
    }
}

impl std::fmt::Display for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Core::Global => f.write_str("global"),
            Core::Id(id) => write!(f, "core{id}"),
        }
    }
}

/// Counters kept by a [`Protocol`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Completed request/response exchanges.
    pub exchanges: u64,
    /// Zero writes skipped because the target was assumed zeroed.
    pub elided_writes: u64,
}

/// Request/response sequencing over one transport.
///
/// Owns the sequence counter and the single outstanding-request slot: every
/// call sends one request and blocks for its matching response before
/// returning.
pub struct Protocol<T> {
    link: PacketLink<T>,
    geometry: ChunkGeometry,
    seqno: u8,
    started: bool,
    assume_zero_init: bool,
    zeros: Vec<u8>,
    stats: LinkStats,
}

impl<T: Transport> Protocol<T> {
    pub fn new(transport: T) -> Self {
        let geometry = transport.geometry();
        Self {
            link: PacketLink::new(transport),
            geometry,
            seqno: 1,
            started: false,
            assume_zero_init: false,
            zeros: vec![0u8; geometry.max_chunk()],
            stats: LinkStats::default(),
        }
    }

    /// Skip all-zero memory writes until the target is started.
    pub fn set_assume_zero_init(&mut self, enabled: bool) {
        self.assume_zero_init = enabled;
    }

    /// Record that the target has been brought out of reset at least once.
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Sequence number the next request will carry.
    pub fn next_seqno(&self) -> u8 {
        self.seqno
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &T {
        self.link.get_ref()
    }

    /// Mutably borrow the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        self.link.get_mut()
    }

    /// Consume the protocol and return the transport.
    pub fn into_transport(self) -> T {
        self.link.into_inner()
    }

    fn unit(&self) -> usize {
        self.geometry.alignment()
    }

    fn exchange(
        &mut self,
        command: Command,
        data_size: usize,
        address: u64,
        payload: &[u8],
    ) -> Result<Packet> {
        let seqno = self.seqno;
        let data_size = u16::try_from(data_size).map_err(|_| {
            HtifError::precondition(format!("data size {data_size} units is too large"))
        })?;
        let header = PacketHeader::new(command, seqno, data_size, address);
        self.link.send(&header, payload)?;

        let response = self.link.recv()?;
        match response.header.command {
            Command::Ack => {}
            Command::Nack => {
                debug!(seqno = response.header.seqno, "request nacked");
                return Err(HtifError::Nacked {
                    seqno: response.header.seqno,
                });
            }
            other => return Err(HtifError::IllegalResponse(other)),
        }
        if response.header.seqno != seqno {
            return Err(HtifError::BadSequenceNumber {
                expected: seqno,
                actual: response.header.seqno,
            });
        }

        self.seqno = seqno.wrapping_add(1);
        self.stats.exchanges += 1;
        Ok(response)
    }

    /// Read one control register.
    pub fn read_cr(&mut self, core: Core, register: u16) -> Result<u64> {
        let address = core.register_address(register)?;
        let response = self.exchange(Command::ReadControlReg, 1, address, &[])?;
        register_value(&response, self.unit())
    }

    /// Write one control register and return its previous value.
    pub fn write_cr(&mut self, core: Core, register: u16, value: u64) -> Result<u64> {
        let address = core.register_address(register)?;
        let mut payload = vec![0u8; self.unit()];
        payload[..8].copy_from_slice(&value.to_le_bytes());
        let response = self.exchange(Command::WriteControlReg, 1, address, &payload)?;
        register_value(&response, self.unit())
    }
}

/// Register reads and all writes are answered with exactly one unit.
fn expect_one_unit(response: &Packet, unit: usize) -> Result<()> {
    if response.payload.len() != unit {
        return Err(PacketError::BadPayloadSize {
            expected: unit,
            actual: response.payload.len(),
        }
        .into());
    }
    Ok(())
}

fn register_value(response: &Packet, unit: usize) -> Result<u64> {
    expect_one_unit(response, unit)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(&response.payload[..8]);
    Ok(u64::from_le_bytes(word))
}

impl<T: Transport> ChunkTarget for Protocol<T> {
    fn chunk_align(&self) -> usize {
        self.geometry.alignment()
    }

    fn chunk_max_size(&self) -> usize {
        self.geometry.max_chunk()
    }

    fn read_chunk(&mut self, addr: u64, len: usize) -> Result<Bytes> {
        check_chunk(self.chunk_align(), self.chunk_max_size(), addr, len, None)?;
        let unit = self.unit();
        let response = self.exchange(Command::ReadMem, len / unit, addr / unit as u64, &[])?;
        if response.payload.len() != len {
            return Err(PacketError::BadPayloadSize {
                expected: len,
                actual: response.payload.len(),
            }
            .into());
        }
        Ok(response.payload)
    }

    fn write_chunk(&mut self, addr: u64, len: usize, data: Option<&[u8]>) -> Result<()> {
        check_chunk(self.chunk_align(), self.chunk_max_size(), addr, len, data)?;

        if !self.started && self.assume_zero_init {
            let zero = data.map_or(true, |bytes| bytes.iter().all(|&b| b == 0));
            if zero {
                self.stats.elided_writes += 1;
                return Ok(());
            }
        }

        let unit = self.unit();
        let zeros = std::mem::take(&mut self.zeros);
        let payload = data.unwrap_or(&zeros[..len]);
        let result = self.exchange(Command::WriteMem, len / unit, addr / unit as u64, payload);
        self.zeros = zeros;
        expect_one_unit(&result?, unit)
    }
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for Protocol<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("link", &self.link)
            .field("seqno", &self.seqno)
            .field("started", &self.started)
            .field("assume_zero_init", &self.assume_zero_init)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_register_addressing() {
        assert_eq!(Core::Id(0).register_address(cr::TOHOST).unwrap(), 30);
        assert_eq!(
            Core::Id(3).register_address(cr::RESET).unwrap(),
            3 << 20 | 29
        );
        assert_eq!(
            Core::Global.register_address(cr::MEM_MB).unwrap(),
            0xfffff << 20 | 1
        );
        assert!(Core::Id(0xfffff).register_address(0).is_err());
    }

    #[test]
    fn register_address_round_trips() {
        for (core, reg) in [(Core::Id(7), cr::FROMHOST), (Core::Global, cr::NUM_CORES)] {
            let address = core.register_address(reg).unwrap();
            assert_eq!(Core::from_register_address(address), (core, reg));
        }
    }

    #[test]
    fn short_register_payload_is_rejected() {
        let packet = Packet::new(
            PacketHeader::new(Command::Ack, 1, 1, 0),
            vec![0u8; 8],
        );
        assert!(matches!(
            register_value(&packet, 16),
            Err(HtifError::Packet(PacketError::BadPayloadSize { .. }))
        ));
    }
}
