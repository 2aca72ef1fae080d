//! Byte console device (`bcd`).

use std::collections::VecDeque;
use std::io::{Read, Write};

use tracing::debug;

use crate::device::{Command, CommandTable, Device, DeviceContext};
use crate::error::Result;

/// Character I/O behind the console device.
pub trait Terminal: Send {
    /// One input byte if one is available right now.
    fn poll_byte(&mut self) -> Result<Option<u8>>;

    fn write_byte(&mut self, byte: u8) -> Result<()>;
}

/// The process's stdin/stdout.
///
/// While alive, stdin is switched to non-canonical, no-echo mode when it is
/// a terminal; the previous mode is restored on drop.
pub struct StdTerminal {
    saved: Option<libc::termios>,
}

impl StdTerminal {
    pub fn new() -> Self {
        // SAFETY: tcgetattr/tcsetattr only read and write the termios struct
        // we own; fd 0 is valid for the process lifetime.
        let saved = unsafe {
            let mut tios: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut tios) == 0 {
                let mut raw = tios;
                raw.c_lflag &= !(libc::ICANON | libc::ECHO);
                (libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) == 0).then_some(tios)
            } else {
                None
            }
        };
        Self { saved }
    }
}

impl Default for StdTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StdTerminal {
    fn drop(&mut self) {
        if let Some(tios) = self.saved.take() {
            // SAFETY: restores the struct captured in `new`.
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &tios);
            }
        }
    }
}

impl Terminal for StdTerminal {
    fn poll_byte(&mut self) -> Result<Option<u8>> {
        let mut pfd = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ready < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if ready == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        match std::io::stdin().read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        let mut out = std::io::stdout();
        out.write_all(&[byte])?;
        out.flush()?;
        Ok(())
    }
}

/// Console device: `read` blocks the target until a key arrives, `write`
/// prints one byte.
pub struct Console<T: Terminal> {
    table: CommandTable<Console<T>>,
    terminal: T,
    pending: VecDeque<Command>,
}

impl<T: Terminal> Console<T> {
    pub fn new(terminal: T) -> Self {
        Self {
            table: CommandTable::new()
                .register(0, "read", Self::handle_read)
                .register(1, "write", Self::handle_write),
            terminal,
            pending: VecDeque::new(),
        }
    }

    /// Reads waiting for input.
    pub fn pending_reads(&self) -> usize {
        self.pending.len()
    }

    pub fn terminal(&self) -> &T {
        &self.terminal
    }

    fn handle_read(&mut self, cmd: Command, _ctx: &mut DeviceContext<'_>) -> Result<()> {
        debug!(core = cmd.core(), "console read queued");
        self.pending.push_back(cmd);
        Ok(())
    }

    fn handle_write(&mut self, cmd: Command, _ctx: &mut DeviceContext<'_>) -> Result<()> {
        self.terminal.write_byte(cmd.payload() as u8)
    }
}

impl<T: Terminal> Device for Console<T> {
    fn identity(&self) -> String {
        "bcd".to_string()
    }

    fn command_name(&self, command: u8) -> &'static str {
        self.table.name(command)
    }

    fn handle_command(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        self.table.route(cmd.command_id()).invoke(self, cmd, ctx)
    }

    fn tick(&mut self, ctx: &mut DeviceContext<'_>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Some(byte) = self.terminal.poll_byte()? {
            if let Some(cmd) = self.pending.pop_front() {
                cmd.respond(ctx, 0x100 | byte as u64);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ExitStatus, ResponseQueues};
    use crate::hexwriter::HexImage;
    use crate::memif::MemIf;
    use htifprims_packet::MailboxWord;

    #[derive(Default)]
    struct ScriptedTerminal {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl Terminal for ScriptedTerminal {
        fn poll_byte(&mut self) -> Result<Option<u8>> {
            Ok(self.input.pop_front())
        }

        fn write_byte(&mut self, byte: u8) -> Result<()> {
            self.output.push(byte);
            Ok(())
        }
    }

    fn run<R>(
        responses: &mut ResponseQueues,
        f: impl FnOnce(&mut DeviceContext<'_>) -> R,
    ) -> R {
        let mut image = HexImage::new(8).unwrap();
        let mut exit = ExitStatus::default();
        let mut ctx = DeviceContext {
            mem: MemIf::new(&mut image),
            responses,
            exit: &mut exit,
        };
        f(&mut ctx)
    }

    fn cmd(core: u32, command: u8, payload: u64) -> Command {
        Command::new(core, MailboxWord::new(1, command, payload).unwrap())
    }

    #[test]
    fn write_prints_low_byte() {
        let mut console = Console::new(ScriptedTerminal::default());
        let mut responses = ResponseQueues::new(1);
        run(&mut responses, |ctx| {
            console.handle_command(cmd(0, 1, 0x1_0048), ctx)?;
            console.handle_command(cmd(0, 1, b'i' as u64), ctx)
        })
        .unwrap();
        assert_eq!(console.terminal().output, b"Hi");
        assert!(responses.is_empty());
    }

    #[test]
    fn reads_wait_for_input_in_order() {
        let mut console = Console::new(ScriptedTerminal::default());
        let mut responses = ResponseQueues::new(2);
        run(&mut responses, |ctx| {
            console.handle_command(cmd(1, 0, 0), ctx)?;
            console.handle_command(cmd(0, 0, 0), ctx)?;
            console.tick(ctx)
        })
        .unwrap();
        assert!(responses.is_empty());
        assert_eq!(console.pending_reads(), 2);

        console.terminal.input.extend([b'a', b'b']);
        run(&mut responses, |ctx| {
            console.tick(ctx)?;
            console.tick(ctx)
        })
        .unwrap();

        let first = responses.pop(1).unwrap();
        assert_eq!((first.device(), first.command()), (1, 0));
        assert_eq!(first.payload(), 0x100 | b'a' as u64);
        assert_eq!(responses.pop(0).unwrap().payload(), 0x100 | b'b' as u64);
        assert_eq!(console.pending_reads(), 0);
    }

    #[test]
    fn input_without_reader_stays_buffered() {
        let mut console = Console::new(ScriptedTerminal::default());
        console.terminal.input.push_back(b'x');
        let mut responses = ResponseQueues::new(1);
        run(&mut responses, |ctx| console.tick(ctx)).unwrap();
        assert_eq!(console.terminal().input.len(), 1);
        assert_eq!(console.identity(), "bcd");
        assert_eq!(console.command_name(0), "read");
    }
}
