//! Session driver: program load, reset, mailbox polling and shutdown.

use std::fs::File;
use std::io::Write;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use htifprims_packet::MailboxWord;
use htifprims_transport::Transport;
use tracing::{debug, info, warn};

use crate::chunk::ChunkTarget;
use crate::config::HtifConfig;
#[cfg(unix)]
use crate::console::{Console, Terminal};
use crate::device::{Command, Device, DeviceContext, DeviceList, ExitStatus, ResponseQueues};
#[cfg(unix)]
use crate::disk::Disk;
use crate::error::{HtifError, Result};
use crate::loader::load_elf_file;
use crate::memif::MemIf;
use crate::protocol::{cr, Core, LinkStats, Protocol};
#[cfg(unix)]
use crate::rfb::Framebuffer;
use crate::signature::dump_signature;
#[cfg(unix)]
use crate::syscall::SyscallProxy;

/// One host-target session over a single transport.
pub struct Htif<T> {
    protocol: Protocol<T>,
    devices: DeviceList,
    config: HtifConfig,
    responses: ResponseQueues,
    exit: ExitStatus,
    cancel: Arc<AtomicBool>,
    started: bool,
    num_cores: Option<u32>,
    mem_mb: Option<u32>,
    signature: Option<Range<u64>>,
}

impl<T: Transport> Htif<T> {
    /// A session with no devices registered.
    pub fn new(transport: T, config: HtifConfig) -> Self {
        let mut protocol = Protocol::new(transport);
        protocol.set_assume_zero_init(config.assume_zero_init);
        Self {
            protocol,
            devices: DeviceList::new(),
            num_cores: config.num_cores,
            mem_mb: config.mem_mb,
            config,
            responses: ResponseQueues::default(),
            exit: ExitStatus::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            started: false,
            signature: None,
        }
    }

    /// Register the syscall proxy (device 0), the console (device 1) and
    /// whatever the configuration asks for.
    #[cfg(unix)]
    pub fn register_standard_devices(&mut self, terminal: impl Terminal + 'static) -> Result<()> {
        self.register_device(Box::new(SyscallProxy::new(self.config.chroot.clone())))?;
        self.register_device(Box::new(Console::new(terminal)))?;
        if let Some(path) = self.config.disk.clone() {
            self.register_device(Box::new(Disk::open(path)?))?;
        }
        if let Some(display) = self.config.rfb {
            self.register_device(Box::new(Framebuffer::new(display)))?;
        }
        Ok(())
    }

    /// Append a device; returns its id.
    pub fn register_device(&mut self, device: Box<dyn Device>) -> Result<u8> {
        self.devices.register(device)
    }

    pub fn devices(&self) -> &DeviceList {
        &self.devices
    }

    pub fn config(&self) -> &HtifConfig {
        &self.config
    }

    /// Flag that stops [`run`](Self::run) at the next poll iteration.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn stats(&self) -> LinkStats {
        self.protocol.stats()
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Signature region found when the program was loaded.
    pub fn signature_range(&self) -> Option<Range<u64>> {
        self.signature.clone()
    }

    pub fn transport(&self) -> &T {
        self.protocol.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.protocol.transport_mut()
    }

    pub fn into_transport(self) -> T {
        self.protocol.into_transport()
    }

    /// Byte-granular view of target memory.
    pub fn memif(&mut self) -> MemIf<'_> {
        MemIf::new(&mut self.protocol)
    }

    pub fn read_chunk(&mut self, addr: u64, len: usize) -> Result<Bytes> {
        self.protocol.read_chunk(addr, len)
    }

    pub fn write_chunk(&mut self, addr: u64, len: usize, data: Option<&[u8]>) -> Result<()> {
        self.protocol.write_chunk(addr, len, data)
    }

    pub fn read_cr(&mut self, core: u32, register: u16) -> Result<u64> {
        self.protocol.read_cr(Core::Id(core), register)
    }

    /// Write a core register, returning its previous value.
    pub fn write_cr(&mut self, core: u32, register: u16, value: u64) -> Result<u64> {
        self.protocol.write_cr(Core::Id(core), register, value)
    }

    /// Core count, from the configuration or global register 0.
    pub fn num_cores(&mut self) -> Result<u32> {
        if let Some(n) = self.num_cores {
            return Ok(n);
        }
        let n = self.protocol.read_cr(Core::Global, cr::NUM_CORES)? as u32;
        self.num_cores = Some(n);
        Ok(n)
    }

    /// Memory size in MiB, from the configuration or global register 1.
    pub fn mem_mb(&mut self) -> Result<u32> {
        if let Some(mb) = self.mem_mb {
            return Ok(mb);
        }
        let mb = self.protocol.read_cr(Core::Global, cr::MEM_MB)? as u32;
        self.mem_mb = Some(mb);
        Ok(mb)
    }

    /// Load the program and bring every core out of reset. Fails if the
    /// session was already started.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(HtifError::AlreadyStarted);
        }
        self.started = true;

        if let Some(path) = self.config.resolve_program()? {
            let program = load_elf_file(&mut MemIf::new(&mut self.protocol), &path)?;
            self.signature = program.signature_range();
            debug!(
                entry = program.entry,
                segments = program.segments,
                elided = self.protocol.stats().elided_writes,
                "program loaded"
            );
        }
        self.protocol.mark_started();
        self.reset()
    }

    /// Write the memory header and cycle every core through reset.
    fn reset(&mut self) -> Result<()> {
        let mem_mb = self.mem_mb()?;
        let cores = self.num_cores()?;
        self.responses = ResponseQueues::new(cores as usize);

        let mut header = vec![0u8; self.protocol.chunk_align()];
        header[..4].copy_from_slice(&mem_mb.to_le_bytes());
        header[4..8].copy_from_slice(&cores.to_le_bytes());
        self.protocol.write_chunk(0, header.len(), Some(&header))?;

        for core in 0..cores {
            let id = self.config.coremap.map(core, cores);
            if self.config.print_coremap {
                info!(core, id, "core map");
            }
            self.write_cr(core, cr::RESET, 1)?;
            self.write_cr(core, cr::COREID, id as u64)?;
            self.write_cr(core, cr::RESET, 0)?;
        }
        info!(cores, mem_mb, "target reset");
        Ok(())
    }

    /// Dump the signature, if any, and hold every core in reset.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(range) = self.signature.clone() {
            let mut out: Box<dyn Write> = match &self.config.signature {
                Some(path) if !self.config.signature_to_stdout() => Box::new(File::create(path)?),
                _ => Box::new(std::io::stdout()),
            };
            dump_signature(&mut MemIf::new(&mut self.protocol), range.clone(), &mut out)?;
            info!(start = range.start, end = range.end, "signature written");
        }
        for core in 0..self.num_cores()? {
            self.write_cr(core, cr::RESET, 1)?;
        }
        info!("target stopped");
        Ok(())
    }

    /// Start the target and service it until it reports completion.
    ///
    /// Returns the decoded exit code.
    pub fn run(&mut self) -> Result<u64> {
        self.start()?;
        let cores = self.num_cores()?;

        while !self.exit.is_done() {
            if self.cancel.load(Ordering::SeqCst) {
                info!("session cancelled");
                self.stop()?;
                return Err(HtifError::Cancelled);
            }
            for core in 0..cores {
                self.poll_tohost(core)?;
            }
            self.tick()?;
            for core in 0..cores {
                self.drain_fromhost(core)?;
            }
        }

        for core in 0..cores {
            while self.drain_fromhost(core)? {}
        }
        self.stop()?;

        let code = self.exit.code();
        if code == 0 {
            info!("target exited cleanly");
        } else {
            warn!(code, "target exited with failure");
        }
        Ok(code)
    }

    fn context(&mut self) -> (DeviceContext<'_>, &mut DeviceList) {
        (
            DeviceContext {
                mem: MemIf::new(&mut self.protocol),
                responses: &mut self.responses,
                exit: &mut self.exit,
            },
            &mut self.devices,
        )
    }

    fn poll_tohost(&mut self, core: u32) -> Result<()> {
        let tohost = self.read_cr(core, cr::TOHOST)?;
        if tohost == 0 {
            return Ok(());
        }
        self.write_cr(core, cr::TOHOST, 0)?;

        let cmd = Command::new(core, MailboxWord::from_raw(tohost));
        debug!(core, word = %cmd.word(), "tohost");
        let (mut ctx, devices) = self.context();
        devices.handle_command(cmd, &mut ctx)
    }

    fn tick(&mut self) -> Result<()> {
        let (mut ctx, devices) = self.context();
        devices.tick(&mut ctx)
    }

    /// Move one queued response into fromhost if the target has consumed the
    /// previous one. Returns whether a response was delivered.
    fn drain_fromhost(&mut self, core: u32) -> Result<bool> {
        let Some(word) = self.responses.front(core) else {
            return Ok(false);
        };
        if self.read_cr(core, cr::FROMHOST)? != 0 {
            return Ok(false);
        }
        self.write_cr(core, cr::FROMHOST, word.raw())?;
        if word.is_interrupt() {
            self.write_cr(core, cr::IPI, 1)?;
        }
        self.responses.pop(core);
        Ok(true)
    }
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for Htif<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Htif")
            .field("protocol", &self.protocol)
            .field("devices", &self.devices)
            .field("started", &self.started)
            .field("exit", &self.exit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::test_elf::{build, Segment};
    use crate::target::{LoopbackTransport, TargetModel};
    use htifprims_transport::ChunkGeometry;

    fn session(config: HtifConfig) -> Htif<LoopbackTransport> {
        let model = TargetModel::new(ChunkGeometry::SIMULATOR, 2, 1 << 20);
        Htif::new(LoopbackTransport::new(model), config)
    }

    #[test]
    fn start_writes_header_and_cycles_reset() {
        let mut htif = session(HtifConfig {
            coremap: crate::config::CoreMap::Reverse,
            ..HtifConfig::default()
        });
        htif.start().unwrap();

        let model = htif.transport().model();
        assert_eq!(&model.memory()[..8], &[1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(model.register(0, cr::COREID), 1);
        assert_eq!(model.register(1, cr::COREID), 0);
        assert_eq!(model.register(0, cr::RESET), 0);
        assert!(matches!(htif.start(), Err(HtifError::AlreadyStarted)));
    }

    #[test]
    fn stop_holds_cores_in_reset() {
        let mut htif = session(HtifConfig::default());
        htif.start().unwrap();
        htif.stop().unwrap();
        assert_eq!(htif.transport().model().register(1, cr::RESET), 1);
    }

    #[test]
    fn start_loads_program_with_zero_elision() {
        let path = std::env::temp_dir().join(format!("htifprims-start-{}.elf", std::process::id()));
        let elf = build(
            0x100,
            &[Segment {
                paddr: 0x100,
                data: vec![0x5a; 16],
                mem_size: 16 + 1024,
            }],
            &[("begin_signature", 0x100), ("end_signature", 0x110)],
        );
        std::fs::write(&path, elf).unwrap();

        let mut htif = session(HtifConfig::from_args([
            "+assume0init".to_string(),
            path.display().to_string(),
        ]));
        htif.start().unwrap();

        assert_eq!(htif.signature_range(), Some(0x100..0x110));
        assert_eq!(htif.stats().elided_writes, 1);
        let model = htif.transport().model();
        assert_eq!(&model.memory()[0x100..0x110], &[0x5a; 16]);
        // Program segment plus the reset header; the zero tail was skipped.
        assert_eq!(model.stats().mem_writes, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn run_stops_on_cancel() {
        let mut htif = session(HtifConfig::default());
        htif.cancel_handle().store(true, Ordering::SeqCst);
        assert!(matches!(htif.run(), Err(HtifError::Cancelled)));

        let model = htif.transport().model();
        assert_eq!(model.register(0, cr::RESET), 1);
        assert_eq!(model.register(1, cr::RESET), 1);
    }

    #[test]
    fn cancel_still_dumps_signature() {
        let dir = std::env::temp_dir().join(format!("htifprims-cancel-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let elf_path = dir.join("prog.elf");
        let sig_path = dir.join("prog.sig");
        let elf = build(
            0x200,
            &[Segment {
                paddr: 0x200,
                data: (1..=16).collect(),
                mem_size: 16,
            }],
            &[("begin_signature", 0x200), ("end_signature", 0x210)],
        );
        std::fs::write(&elf_path, elf).unwrap();

        let mut htif = session(HtifConfig::from_args([
            format!("+signature={}", sig_path.display()),
            elf_path.display().to_string(),
        ]));
        htif.cancel_handle().store(true, Ordering::SeqCst);
        assert!(matches!(htif.run(), Err(HtifError::Cancelled)));

        let dumped = std::fs::read_to_string(&sig_path).unwrap();
        assert_eq!(dumped, "100f0e0d0c0b0a090807060504030201\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
