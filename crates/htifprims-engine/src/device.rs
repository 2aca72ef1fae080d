//! Mailbox command routing.
//!
//! A [`DeviceList`] maps the device field of a tohost word to a registered
//! [`Device`]; each device maps the command field to a handler through its
//! [`CommandTable`]. Handlers never write fromhost themselves: replies go into
//! per-core [`ResponseQueues`] that the engine drains when the target's
//! inbound mailbox is empty.

use std::collections::VecDeque;

use htifprims_packet::{MailboxWord, COMMAND_SLOTS};
use tracing::debug;

use crate::error::{HtifError, Result};
use crate::memif::MemIf;

/// Size of the name buffer written by the identify command.
pub const IDENTITY_SIZE: usize = 64;

/// Command slot reserved for identify.
pub const IDENTIFY_COMMAND: u8 = (COMMAND_SLOTS - 1) as u8;

/// Most devices one list can hold.
pub const MAX_DEVICES: usize = 256;

/// One decoded tohost word, bound to the core that posted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    core: u32,
    word: MailboxWord,
}

impl Command {
    pub fn new(core: u32, word: MailboxWord) -> Self {
        Self { core, word }
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    pub fn word(&self) -> MailboxWord {
        self.word
    }

    pub fn device_id(&self) -> u8 {
        self.word.device()
    }

    pub fn command_id(&self) -> u8 {
        self.word.command()
    }

    /// Low 48 bits of the word.
    pub fn payload(&self) -> u64 {
        self.word.payload()
    }

    /// Queue a reply carrying `payload` for the posting core.
    pub fn respond(&self, ctx: &mut DeviceContext<'_>, payload: u64) {
        ctx.responses.push(self.core, self.word.with_payload(payload));
    }
}

/// Per-core FIFO of pending fromhost values.
#[derive(Debug, Default)]
pub struct ResponseQueues {
    queues: Vec<VecDeque<MailboxWord>>,
}

impl ResponseQueues {
    pub fn new(cores: usize) -> Self {
        Self {
            queues: vec![VecDeque::new(); cores],
        }
    }

    pub fn push(&mut self, core: u32, word: MailboxWord) {
        let core = core as usize;
        if core >= self.queues.len() {
            self.queues.resize_with(core + 1, VecDeque::new);
        }
        self.queues[core].push_back(word);
    }

    pub fn front(&self, core: u32) -> Option<MailboxWord> {
        self.queues
            .get(core as usize)
            .and_then(|q| q.front().copied())
    }

    pub fn pop(&mut self, core: u32) -> Option<MailboxWord> {
        self.queues
            .get_mut(core as usize)
            .and_then(VecDeque::pop_front)
    }

    pub fn len(&self, core: u32) -> usize {
        self.queues.get(core as usize).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}

/// Session completion reported by the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    raw: Option<u64>,
}

impl ExitStatus {
    /// Record a raw exit word (low bit set, code in the remaining bits).
    pub fn set_raw(&mut self, raw: u64) {
        self.raw = Some(raw | 1);
    }

    /// Record an exit code.
    pub fn set_code(&mut self, code: u64) {
        self.set_raw(code << 1 | 1);
    }

    pub fn is_done(&self) -> bool {
        self.raw.is_some()
    }

    /// Decoded code, 0 until done.
    pub fn code(&self) -> u64 {
        self.raw.map_or(0, |raw| raw >> 1)
    }
}

/// Everything a handler may touch besides its own state.
pub struct DeviceContext<'a> {
    pub mem: MemIf<'a>,
    pub responses: &'a mut ResponseQueues,
    pub exit: &'a mut ExitStatus,
}

/// Handler stored in a command slot.
pub type Handler<D> = fn(&mut D, Command, &mut DeviceContext<'_>) -> Result<()>;

enum Slot<D> {
    Empty,
    Handler(&'static str, Handler<D>),
}

impl<D> Clone for Slot<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Slot<D> {}

/// Where a command id leads within one device.
pub enum Route<D> {
    Handler(Handler<D>),
    Identify,
    Ignore,
}

impl<D> Clone for Route<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Route<D> {}

impl<D: Device> Route<D> {
    /// Run the routed handler against `device`.
    pub fn invoke(self, device: &mut D, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        match self {
            Route::Handler(handler) => handler(device, cmd, ctx),
            Route::Identify => identify(device, cmd, ctx),
            Route::Ignore => Ok(()),
        }
    }
}

/// Fixed-size command table for one device type.
///
/// Unset slots accept commands and do nothing. The last slot always answers
/// identify.
pub struct CommandTable<D> {
    slots: Vec<Slot<D>>,
}

impl<D> CommandTable<D> {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::Empty; COMMAND_SLOTS],
        }
    }

    /// Bind `handler` under `name` at `command`.
    ///
    /// Panics if `command` is out of range, is the identify slot, or `name`
    /// does not fit the identity buffer; tables are built from constants.
    pub fn register(mut self, command: u8, name: &'static str, handler: Handler<D>) -> Self {
        assert!(
            (command as usize) < COMMAND_SLOTS && command != IDENTIFY_COMMAND,
            "command slot {command} is not assignable"
        );
        assert!(name.len() < IDENTITY_SIZE, "command name {name:?} too long");
        self.slots[command as usize] = Slot::Handler(name, handler);
        self
    }

    /// Name registered at `command`, empty if unset.
    pub fn name(&self, command: u8) -> &'static str {
        match self.slots.get(command as usize) {
            Some(Slot::Handler(name, _)) => name,
            _ => "",
        }
    }

    /// Look up where `command` goes.
    pub fn route(&self, command: u8) -> Route<D> {
        if command == IDENTIFY_COMMAND {
            return Route::Identify;
        }
        match self.slots.get(command as usize) {
            Some(Slot::Handler(_, handler)) => Route::Handler(*handler),
            _ => Route::Ignore,
        }
    }
}

impl<D> Default for CommandTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the requested name into target memory and acknowledge.
///
/// Payload: `address * 128 + slot`. Slot 127 names the device itself.
fn identify<D: Device + ?Sized>(device: &D, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
    let slot = (cmd.payload() % COMMAND_SLOTS as u64) as u8;
    let addr = cmd.payload() / COMMAND_SLOTS as u64;
    if addr % IDENTITY_SIZE as u64 != 0 {
        return Err(HtifError::MisalignedAddress {
            addr,
            align: IDENTITY_SIZE,
        });
    }

    let name = if slot == IDENTIFY_COMMAND {
        device.identity()
    } else {
        device.command_name(slot).to_string()
    };
    if name.len() >= IDENTITY_SIZE {
        return Err(HtifError::precondition(format!(
            "identity {name:?} does not fit {IDENTITY_SIZE} bytes"
        )));
    }

    let mut buf = [0u8; IDENTITY_SIZE];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    debug!(device = cmd.device_id(), slot, %name, addr, "identify");
    ctx.mem.write_bytes(addr, &buf)?;
    cmd.respond(ctx, 1);
    Ok(())
}

/// A host-side handler for one class of target request.
pub trait Device: Send {
    /// Name reported for the identify slot.
    fn identity(&self) -> String;

    /// Name of the command at `command`, empty if unset.
    fn command_name(&self, command: u8) -> &'static str;

    /// Handle one command routed to this device.
    fn handle_command(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()>;

    /// Make progress once per poll iteration without a new command.
    fn tick(&mut self, _ctx: &mut DeviceContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Registered devices, indexed by registration order.
#[derive(Default)]
pub struct DeviceList {
    devices: Vec<Box<dyn Device>>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device; its id is its position.
    pub fn register(&mut self, device: Box<dyn Device>) -> Result<u8> {
        if self.devices.len() >= MAX_DEVICES {
            return Err(HtifError::TooManyDevices(MAX_DEVICES));
        }
        let id = self.devices.len() as u8;
        debug!(id, identity = %device.identity(), "registered device");
        self.devices.push(device);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: u8) -> Option<&dyn Device> {
        self.devices.get(id as usize).map(|d| d.as_ref())
    }

    /// Route a command to the device its word names.
    pub fn handle_command(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        let device = self
            .devices
            .get_mut(cmd.device_id() as usize)
            .ok_or(HtifError::UnknownDevice(cmd.device_id()))?;
        device.handle_command(cmd, ctx)
    }

    /// Tick every device in registration order.
    pub fn tick(&mut self, ctx: &mut DeviceContext<'_>) -> Result<()> {
        for device in &mut self.devices {
            device.tick(ctx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.devices.iter().map(|d| d.identity()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkTarget;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlatMemory(Vec<u8>);

    impl ChunkTarget for FlatMemory {
        fn chunk_align(&self) -> usize {
            8
        }

        fn chunk_max_size(&self) -> usize {
            64
        }

        fn read_chunk(&mut self, addr: u64, len: usize) -> Result<Bytes> {
            let a = addr as usize;
            Ok(Bytes::copy_from_slice(&self.0[a..a + len]))
        }

        fn write_chunk(&mut self, addr: u64, len: usize, data: Option<&[u8]>) -> Result<()> {
            let a = addr as usize;
            match data {
                Some(bytes) => self.0[a..a + len].copy_from_slice(bytes),
                None => self.0[a..a + len].fill(0),
            }
            Ok(())
        }
    }

    /// Records which commands reached it.
    struct Probe {
        name: &'static str,
        table: CommandTable<Probe>,
        seen: Vec<u8>,
        ticks: Arc<AtomicUsize>,
    }

    impl Probe {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                table: CommandTable::new()
                    .register(0, "ping", Probe::ping)
                    .register(3, "poke", Probe::poke),
                seen: Vec::new(),
                ticks: Arc::default(),
            }
        }

        fn ping(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
            self.seen.push(cmd.command_id());
            cmd.respond(ctx, cmd.payload() + self.name.len() as u64);
            Ok(())
        }

        fn poke(&mut self, cmd: Command, _ctx: &mut DeviceContext<'_>) -> Result<()> {
            self.seen.push(cmd.command_id());
            Ok(())
        }
    }

    impl Device for Probe {
        fn identity(&self) -> String {
            self.name.to_string()
        }

        fn command_name(&self, command: u8) -> &'static str {
            self.table.name(command)
        }

        fn handle_command(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
            self.table.route(cmd.command_id()).invoke(self, cmd, ctx)
        }

        fn tick(&mut self, _ctx: &mut DeviceContext<'_>) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn with_ctx<R>(f: impl FnOnce(&mut DeviceContext<'_>) -> R) -> (R, ResponseQueues, Vec<u8>) {
        let mut memory = FlatMemory(vec![0u8; 512]);
        let mut responses = ResponseQueues::new(2);
        let mut exit = ExitStatus::default();
        let result = {
            let mut ctx = DeviceContext {
                mem: MemIf::new(&mut memory),
                responses: &mut responses,
                exit: &mut exit,
            };
            f(&mut ctx)
        };
        (result, responses, memory.0)
    }

    fn word(device: u8, command: u8, payload: u64) -> MailboxWord {
        MailboxWord::new(device, command, payload).unwrap()
    }

    #[test]
    fn routes_to_exactly_one_device() {
        let mut list = DeviceList::new();
        list.register(Box::new(Probe::new("a"))).unwrap();
        list.register(Box::new(Probe::new("bb"))).unwrap();
        list.register(Box::new(Probe::new("ccc"))).unwrap();

        let (result, mut responses, _) = with_ctx(|ctx| {
            list.handle_command(Command::new(1, word(1, 0, 41)), ctx)
        });
        result.unwrap();

        assert_eq!(responses.len(0), 0);
        let reply = responses.pop(1).unwrap();
        // Only the second device adds 2.
        assert_eq!((reply.device(), reply.command(), reply.payload()), (1, 0, 43));
        assert!(responses.is_empty());
    }

    #[test]
    fn unset_slot_is_a_no_op() {
        let mut probe = Probe::new("p");
        let (result, responses, _) =
            with_ctx(|ctx| probe.handle_command(Command::new(0, word(0, 9, 0)), ctx));
        result.unwrap();
        assert!(probe.seen.is_empty());
        assert!(responses.is_empty());
    }

    #[test]
    fn unknown_device_is_an_error() {
        let mut list = DeviceList::new();
        list.register(Box::new(Probe::new("only"))).unwrap();
        let (result, _, _) =
            with_ctx(|ctx| list.handle_command(Command::new(0, word(4, 0, 0)), ctx));
        assert!(matches!(result, Err(HtifError::UnknownDevice(4))));
    }

    #[test]
    fn identify_writes_padded_names() {
        let mut probe = Probe::new("probe");
        let addr = 0x80u64;

        let (result, mut responses, memory) = with_ctx(|ctx| {
            probe.handle_command(
                Command::new(0, word(0, IDENTIFY_COMMAND, addr * 128 + 3)),
                ctx,
            )?;
            probe.handle_command(
                Command::new(0, word(0, IDENTIFY_COMMAND, (addr + 64) * 128 + 127)),
                ctx,
            )
        });
        result.unwrap();

        let slot3 = &memory[0x80..0x80 + IDENTITY_SIZE];
        assert_eq!(&slot3[..5], b"poke\0");
        assert!(slot3[4..].iter().all(|&b| b == 0));
        let ident = &memory[0xc0..0xc0 + IDENTITY_SIZE];
        assert_eq!(&ident[..6], b"probe\0");
        assert_eq!(responses.pop(0).unwrap().payload(), 1);
        assert_eq!(responses.pop(0).unwrap().payload(), 1);
    }

    #[test]
    fn identify_rejects_unaligned_buffer() {
        let mut probe = Probe::new("probe");
        let (result, _, _) = with_ctx(|ctx| {
            probe.handle_command(Command::new(0, word(0, IDENTIFY_COMMAND, 0x20 * 128)), ctx)
        });
        assert!(matches!(result, Err(HtifError::MisalignedAddress { .. })));
    }

    #[test]
    fn tick_reaches_every_device() {
        let a = Probe::new("a");
        let b = Probe::new("b");
        let (a_ticks, b_ticks) = (Arc::clone(&a.ticks), Arc::clone(&b.ticks));
        let mut list = DeviceList::new();
        list.register(Box::new(a)).unwrap();
        list.register(Box::new(b)).unwrap();

        let (result, _, _) = with_ctx(|ctx| list.tick(ctx));
        result.unwrap();
        assert_eq!(a_ticks.load(Ordering::SeqCst), 1);
        assert_eq!(b_ticks.load(Ordering::SeqCst), 1);

        let (result, _, _) = with_ctx(|ctx| list.tick(ctx));
        result.unwrap();
        assert_eq!(a_ticks.load(Ordering::SeqCst), 2);
        assert_eq!(b_ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exit_status_decodes_code() {
        let mut exit = ExitStatus::default();
        assert!(!exit.is_done());
        exit.set_raw(7);
        assert!(exit.is_done());
        assert_eq!(exit.code(), 3);
        exit.set_code(0);
        assert_eq!(exit.code(), 0);
    }

    #[test]
    #[should_panic(expected = "not assignable")]
    fn identify_slot_cannot_be_reassigned() {
        let _ = CommandTable::<Probe>::new().register(IDENTIFY_COMMAND, "x", Probe::poke);
    }
}
