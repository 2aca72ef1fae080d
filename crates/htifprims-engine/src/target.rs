//! In-process software target.
//!
//! [`TargetModel`] answers wire requests the way a simulated core complex
//! would: flat little-endian memory, per-core control registers and a
//! scripted stream of tohost words per core. [`LoopbackTransport`] plugs it
//! straight into a [`Protocol`](crate::Protocol) for tests and self-checks.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};

use bytes::BytesMut;
use htifprims_packet::{
    decode_packet, encode_packet, Command, Packet, PacketConfig, PacketError, PacketHeader,
};
use htifprims_transport::{ChunkGeometry, Transport};
use tracing::trace;

use crate::protocol::{cr, Core};

/// A one-shot corruption applied to the next response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with the wrong sequence number.
    BadSeqno,
    /// Refuse the request.
    Nack,
    /// Answer with a request command instead of ACK/NACK.
    IllegalCommand,
    /// Acknowledge without the one-unit payload.
    EmptyAck,
}

/// What the model has observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelStats {
    pub requests: u64,
    pub mem_reads: u64,
    pub mem_writes: u64,
    /// FROMHOST writes of a nonzero value over an unconsumed nonzero value.
    pub fromhost_overwrites: u64,
}

#[derive(Debug, Default)]
struct CoreState {
    registers: BTreeMap<u16, u64>,
    script: VecDeque<u64>,
    received: Vec<u64>,
}

impl CoreState {
    fn reg(&self, register: u16) -> u64 {
        self.registers.get(&register).copied().unwrap_or(0)
    }
}

/// Software target that speaks the packet protocol.
#[derive(Debug)]
pub struct TargetModel {
    geometry: ChunkGeometry,
    memory: Vec<u8>,
    cores: Vec<CoreState>,
    faults: VecDeque<Fault>,
    stats: ModelStats,
    last_seqno: Option<u8>,
}

impl TargetModel {
    /// A target with `cores` cores and `mem_size` bytes of memory.
    pub fn new(geometry: ChunkGeometry, cores: u32, mem_size: usize) -> Self {
        Self {
            geometry,
            memory: vec![0u8; mem_size],
            cores: (0..cores).map(|_| CoreState::default()).collect(),
            faults: VecDeque::new(),
            stats: ModelStats::default(),
            last_seqno: None,
        }
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    pub fn num_cores(&self) -> u32 {
        self.cores.len() as u32
    }

    /// Memory size as reported by global register 1.
    pub fn mem_mb(&self) -> u64 {
        (self.memory.len() >> 20) as u64
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn stats(&self) -> ModelStats {
        self.stats
    }

    /// Queue mailbox words core `core` will post, in order.
    pub fn script(&mut self, core: u32, words: impl IntoIterator<Item = u64>) {
        if let Some(state) = self.cores.get_mut(core as usize) {
            state.script.extend(words);
        }
    }

    /// Responses core `core` has consumed from its fromhost register.
    pub fn received(&self, core: u32) -> &[u64] {
        self.cores
            .get(core as usize)
            .map(|state| state.received.as_slice())
            .unwrap_or(&[])
    }

    /// Current value of a core register.
    pub fn register(&self, core: u32, register: u16) -> u64 {
        self.cores
            .get(core as usize)
            .map_or(0, |state| state.reg(register))
    }

    /// Sequence number carried by the most recent request.
    pub fn last_seqno(&self) -> Option<u8> {
        self.last_seqno
    }

    /// Corrupt the next response.
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push_back(fault);
    }

    /// Handle every complete request in `inbox`, appending wire responses to
    /// `outbox`. Returns the number of requests handled.
    pub fn serve(
        &mut self,
        inbox: &mut BytesMut,
        outbox: &mut Vec<u8>,
    ) -> Result<usize, PacketError> {
        let config = PacketConfig::for_geometry(self.geometry);
        let mut handled = 0;
        while let Some(request) = decode_packet(inbox, &config)? {
            let response = self.handle(&request);
            let mut out = BytesMut::new();
            encode_packet(&response.header, &response.payload, config.unit, &mut out)?;
            outbox.extend_from_slice(&out);
            handled += 1;
        }
        Ok(handled)
    }

    /// Produce the response to one request.
    pub fn handle(&mut self, request: &Packet) -> Packet {
        self.stats.requests += 1;
        let header = request.header;
        self.last_seqno = Some(header.seqno);
        trace!(command = %header.command, seqno = header.seqno, address = header.address, "target request");

        let response = match header.command {
            Command::ReadMem => self.read_mem(&header),
            Command::WriteMem => self.write_mem(&header, &request.payload),
            Command::ReadControlReg => self.read_cr(&header),
            Command::WriteControlReg => self.write_cr(&header, &request.payload),
            Command::Ack | Command::Nack => None,
        };
        let mut response = response.unwrap_or_else(|| nack(header.seqno));

        match self.faults.pop_front() {
            Some(Fault::BadSeqno) => response.header.seqno = response.header.seqno.wrapping_add(1),
            Some(Fault::Nack) => response = nack(header.seqno),
            Some(Fault::IllegalCommand) => {
                response = Packet::header_only(PacketHeader::new(
                    Command::WriteMem,
                    header.seqno,
                    0,
                    0,
                ))
            }
            Some(Fault::EmptyAck) => response = ack(header.seqno, 0, Vec::new()),
            None => {}
        }
        response
    }

    fn unit(&self) -> usize {
        self.geometry.alignment()
    }

    fn span(&self, header: &PacketHeader) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(header.address).ok()?.checked_mul(self.unit())?;
        let end = start.checked_add(header.data_size as usize * self.unit())?;
        (end <= self.memory.len()).then_some(start..end)
    }

    fn read_mem(&mut self, header: &PacketHeader) -> Option<Packet> {
        let span = self.span(header)?;
        self.stats.mem_reads += 1;
        Some(ack(header.seqno, header.data_size, self.memory[span].to_vec()))
    }

    fn write_mem(&mut self, header: &PacketHeader, payload: &[u8]) -> Option<Packet> {
        let span = self.span(header).filter(|span| span.len() == payload.len())?;
        self.memory[span].copy_from_slice(payload);
        self.stats.mem_writes += 1;
        Some(ack(header.seqno, 1, vec![0u8; self.unit()]))
    }

    fn register_payload(&self, value: u64) -> Vec<u8> {
        let mut payload = vec![0u8; self.unit()];
        payload[..8].copy_from_slice(&value.to_le_bytes());
        payload
    }

    fn read_cr(&mut self, header: &PacketHeader) -> Option<Packet> {
        let value = match Core::from_register_address(header.address) {
            (Core::Global, cr::NUM_CORES) => self.num_cores() as u64,
            (Core::Global, cr::MEM_MB) => self.mem_mb(),
            (Core::Global, _) => return None,
            (Core::Id(id), register) => {
                let state = self.cores.get_mut(id as usize)?;
                if register == cr::TOHOST {
                    // The core consumes its last response before posting again.
                    let fromhost = state.reg(cr::FROMHOST);
                    if fromhost != 0 {
                        state.received.push(fromhost);
                        state.registers.insert(cr::FROMHOST, 0);
                    }
                    if state.reg(cr::TOHOST) == 0 && state.reg(cr::RESET) == 0 {
                        if let Some(word) = state.script.pop_front() {
                            state.registers.insert(cr::TOHOST, word);
                        }
                    }
                }
                state.reg(register)
            }
        };
        Some(ack(header.seqno, 1, self.register_payload(value)))
    }

    fn write_cr(&mut self, header: &PacketHeader, payload: &[u8]) -> Option<Packet> {
        let mut word = [0u8; 8];
        word.copy_from_slice(payload.get(..8)?);
        let value = u64::from_le_bytes(word);

        let (Core::Id(id), register) = Core::from_register_address(header.address) else {
            return None;
        };
        let state = self.cores.get_mut(id as usize)?;
        let previous = state.registers.insert(register, value).unwrap_or(0);
        if register == cr::FROMHOST && previous != 0 && value != 0 {
            self.stats.fromhost_overwrites += 1;
        }
        Some(ack(header.seqno, 1, self.register_payload(previous)))
    }
}

fn ack(seqno: u8, data_size: u16, payload: Vec<u8>) -> Packet {
    Packet::new(PacketHeader::new(Command::Ack, seqno, data_size, 0), payload)
}

fn nack(seqno: u8) -> Packet {
    Packet::header_only(PacketHeader::new(Command::Nack, seqno, 0, 0))
}

/// A [`Transport`] whose far end is a [`TargetModel`] in the same process.
#[derive(Debug)]
pub struct LoopbackTransport {
    model: TargetModel,
    inbox: BytesMut,
    outbox: Vec<u8>,
}

impl LoopbackTransport {
    pub fn new(model: TargetModel) -> Self {
        Self {
            model,
            inbox: BytesMut::new(),
            outbox: Vec::new(),
        }
    }

    pub fn model(&self) -> &TargetModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut TargetModel {
        &mut self.model
    }

    pub fn into_model(self) -> TargetModel {
        self.model
    }

    /// Request bytes received but not yet forming a whole packet.
    pub fn pending_request_bytes(&self) -> usize {
        self.inbox.len()
    }
}

impl Read for LoopbackTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.outbox.len());
        buf[..n].copy_from_slice(&self.outbox[..n]);
        self.outbox.drain(..n);
        Ok(n)
    }
}

impl Write for LoopbackTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbox.extend_from_slice(buf);
        self.model
            .serve(&mut self.inbox, &mut self.outbox)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn geometry(&self) -> ChunkGeometry {
        self.model.geometry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> TargetModel {
        TargetModel::new(ChunkGeometry::SERIAL, 2, 1 << 20)
    }

    fn cr_read(seqno: u8, core: Core, register: u16) -> Packet {
        let address = core.register_address(register).unwrap();
        Packet::header_only(PacketHeader::new(Command::ReadControlReg, seqno, 1, address))
    }

    fn cr_write(seqno: u8, core: Core, register: u16, value: u64) -> Packet {
        let address = core.register_address(register).unwrap();
        Packet::new(
            PacketHeader::new(Command::WriteControlReg, seqno, 1, address),
            value.to_le_bytes().to_vec(),
        )
    }

    fn value(packet: &Packet) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&packet.payload[..8]);
        u64::from_le_bytes(word)
    }

    #[test]
    fn global_registers_report_geometry() {
        let mut m = model();
        assert_eq!(value(&m.handle(&cr_read(1, Core::Global, cr::NUM_CORES))), 2);
        assert_eq!(value(&m.handle(&cr_read(2, Core::Global, cr::MEM_MB))), 1);
    }

    #[test]
    fn memory_reads_and_writes_in_units() {
        let mut m = model();
        let write = Packet::new(
            PacketHeader::new(Command::WriteMem, 1, 2, 4),
            (1u8..=16).collect::<Vec<_>>(),
        );
        let ack = m.handle(&write);
        assert_eq!(ack.header.command, Command::Ack);
        assert_eq!(ack.header.data_size, 1);
        assert_eq!(ack.payload.len(), m.geometry().alignment());
        assert_eq!(&m.memory()[32..48], &(1u8..=16).collect::<Vec<_>>()[..]);

        let read = m.handle(&Packet::header_only(PacketHeader::new(Command::ReadMem, 2, 1, 5)));
        assert_eq!(&read.payload[..], &[9, 10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(m.stats().mem_writes, 1);
    }

    #[test]
    fn out_of_range_access_is_nacked() {
        let mut m = model();
        let read = Packet::header_only(PacketHeader::new(Command::ReadMem, 7, 1, 1 << 20));
        let response = m.handle(&read);
        assert_eq!(response.header.command, Command::Nack);
        assert_eq!(response.header.seqno, 7);
    }

    #[test]
    fn tohost_posts_script_after_reply_is_consumed() {
        let mut m = model();
        m.script(0, [0x10, 0x08]);
        assert_eq!(value(&m.handle(&cr_read(1, Core::Id(0), cr::TOHOST))), 0x10);
        // Still pending until the host clears it.
        assert_eq!(value(&m.handle(&cr_read(2, Core::Id(0), cr::TOHOST))), 0x10);
        m.handle(&cr_write(3, Core::Id(0), cr::TOHOST, 0));
        m.handle(&cr_write(4, Core::Id(0), cr::FROMHOST, 1));
        assert_eq!(value(&m.handle(&cr_read(5, Core::Id(0), cr::TOHOST))), 0x08);
        assert_eq!(m.received(0), &[1]);
        assert_eq!(m.register(0, cr::FROMHOST), 0);
    }

    #[test]
    fn held_in_reset_posts_nothing() {
        let mut m = model();
        m.script(1, [0x10]);
        m.handle(&cr_write(1, Core::Id(1), cr::RESET, 1));
        assert_eq!(value(&m.handle(&cr_read(2, Core::Id(1), cr::TOHOST))), 0);
    }

    #[test]
    fn write_cr_returns_previous_and_counts_overwrites() {
        let mut m = model();
        assert_eq!(value(&m.handle(&cr_write(1, Core::Id(0), cr::FROMHOST, 5))), 0);
        assert_eq!(value(&m.handle(&cr_write(2, Core::Id(0), cr::FROMHOST, 6))), 5);
        assert_eq!(m.stats().fromhost_overwrites, 1);
    }

    #[test]
    fn faults_apply_once() {
        let mut m = model();
        m.inject(Fault::BadSeqno);
        assert_eq!(m.handle(&cr_read(9, Core::Global, 0)).header.seqno, 10);
        assert_eq!(m.handle(&cr_read(10, Core::Global, 0)).header.seqno, 10);
        m.inject(Fault::IllegalCommand);
        assert_eq!(m.handle(&cr_read(11, Core::Global, 0)).header.command, Command::WriteMem);
    }

    #[test]
    fn loopback_frames_split_writes() {
        let mut link = LoopbackTransport::new(model());
        let bytes = cr_read(1, Core::Global, cr::NUM_CORES).encode(8).unwrap();
        link.write_all(&bytes[..3]).unwrap();
        assert_eq!(link.pending_request_bytes(), 3);
        link.write_all(&bytes[3..]).unwrap();
        assert_eq!(link.pending_request_bytes(), 0);

        let mut response = [0u8; 16];
        link.read_exact(&mut response).unwrap();
        let packet = Packet::decode(&response, 8).unwrap();
        assert_eq!(value(&packet), 2);
        assert_eq!(link.read(&mut response).unwrap(), 0);
    }
}
