//! Remote framebuffer device.
//!
//! Exposes a 16 bpp framebuffer in target memory to one RFB 3.3 viewer.
//! The listener is opened by `configure`; the viewer is accepted and served
//! from `tick()` so a slow or absent viewer never stalls the target.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use crate::device::{Command, CommandTable, Device, DeviceContext};
use crate::error::{HtifError, Result};

/// TCP port of display 0.
pub const BASE_PORT: u16 = 5900;

const VERSION: &[u8; 12] = b"RFB 003.003\n";
const DESKTOP_NAME: &str = "RISC-V";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const MSG_SET_PIXEL_FORMAT: u8 = 0;
const MSG_SET_ENCODINGS: u8 = 2;
const MSG_FB_UPDATE_REQUEST: u8 = 3;
const MSG_KEY_EVENT: u8 = 4;
const MSG_POINTER_EVENT: u8 = 5;
const MSG_CLIENT_CUT_TEXT: u8 = 6;

/// 16 bpp little-endian true colour, red 5 / green 6 / blue 5 from the low
/// bits up.
pub fn pixel_format() -> [u8; 16] {
    let (red, green, blue) = (5u8, 6u8, 5u8);
    let mut fmt = [0u8; 16];
    fmt[0] = 16;
    fmt[1] = red + green + blue;
    fmt[2] = 0;
    fmt[3] = 1;
    fmt[4..6].copy_from_slice(&((1u16 << red) - 1).to_be_bytes());
    fmt[6..8].copy_from_slice(&((1u16 << green) - 1).to_be_bytes());
    fmt[8..10].copy_from_slice(&((1u16 << blue) - 1).to_be_bytes());
    fmt[10] = 0;
    fmt[11] = red;
    fmt[12] = red + green;
    fmt
}

struct Viewer {
    stream: TcpStream,
    inbox: Vec<u8>,
}

/// Framebuffer device (`rfb`).
pub struct Framebuffer {
    table: CommandTable<Framebuffer>,
    port: u16,
    listener: Option<TcpListener>,
    viewer: Option<Viewer>,
    addr: u64,
    width: u16,
    height: u16,
}

impl Framebuffer {
    /// Device for VNC display `display` (TCP port 5900 + display).
    pub fn new(display: u16) -> Self {
        Self::with_port(BASE_PORT.saturating_add(display))
    }

    /// Device listening on an explicit port; 0 picks an ephemeral one.
    pub fn with_port(port: u16) -> Self {
        Self {
            table: CommandTable::new()
                .register(0, "configure", Self::handle_configure)
                .register(1, "set_address", Self::handle_set_address),
            port,
            listener: None,
            viewer: None,
            addr: 0,
            width: 0,
            height: 0,
        }
    }

    /// Address the listener is bound to, once configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn has_viewer(&self) -> bool {
        self.viewer.is_some()
    }

    fn handle_configure(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        if self.width != 0 || self.height != 0 {
            return Err(HtifError::device("rfb", "configuration may only be set once"));
        }
        let payload = cmd.payload();
        let bpp = (payload >> 32) as u16;
        if bpp != 16 {
            return Err(HtifError::device("rfb", format!("requires 16 bpp, got {bpp}")));
        }
        self.width = payload as u16;
        self.height = (payload >> 16) as u16;

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .map_err(|e| HtifError::device("rfb", format!("bind port {}: {e}", self.port)))?;
        listener.set_nonblocking(true)?;
        info!(
            width = self.width,
            height = self.height,
            addr = ?listener.local_addr().ok(),
            "framebuffer listening"
        );
        self.listener = Some(listener);
        cmd.respond(ctx, 1);
        Ok(())
    }

    fn handle_set_address(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        self.addr = cmd.payload();
        debug!(addr = self.addr, "framebuffer base set");
        cmd.respond(ctx, 1);
        Ok(())
    }

    fn accept(&mut self) -> Result<()> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        self.handshake(&stream)
            .map_err(|e| HtifError::device("rfb", format!("handshake with {peer}: {e}")))?;
        stream.set_nonblocking(true)?;
        info!(%peer, "framebuffer viewer connected");
        self.viewer = Some(Viewer {
            stream,
            inbox: Vec::new(),
        });
        Ok(())
    }

    fn handshake(&self, mut stream: &TcpStream) -> std::io::Result<()> {
        stream.write_all(VERSION)?;
        let mut version = [0u8; 12];
        stream.read_exact(&mut version)?;
        if &version != VERSION {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "unsupported client version",
            ));
        }
        // Security type 1: none.
        stream.write_all(&1u32.to_be_bytes())?;
        let mut client_init = [0u8; 1];
        stream.read_exact(&mut client_init)?;

        let mut init = Vec::with_capacity(24 + DESKTOP_NAME.len());
        init.extend_from_slice(&self.width.to_be_bytes());
        init.extend_from_slice(&self.height.to_be_bytes());
        init.extend_from_slice(&pixel_format());
        init.extend_from_slice(&(DESKTOP_NAME.len() as u32).to_be_bytes());
        init.extend_from_slice(DESKTOP_NAME.as_bytes());
        stream.write_all(&init)
    }

    /// Drain whatever the viewer has sent without blocking. Returns false if
    /// the viewer went away.
    fn fill_inbox(viewer: &mut Viewer) -> Result<bool> {
        let mut buf = [0u8; 2048];
        loop {
            match viewer.stream.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => viewer.inbox.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn update(&self, ctx: &mut DeviceContext<'_>) -> Result<Vec<u8>> {
        let len = self.width as usize * self.height as usize * 2;
        let pixels = ctx.mem.read(self.addr, len)?;
        let mut out = Vec::with_capacity(16 + len);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&self.width.to_be_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&pixels);
        Ok(out)
    }

    /// Handle every complete message in the inbox.
    fn serve(&mut self, ctx: &mut DeviceContext<'_>) -> Result<()> {
        loop {
            let Some(viewer) = &self.viewer else {
                return Ok(());
            };
            let Some(len) = message_len(&viewer.inbox)? else {
                return Ok(());
            };
            let message: Vec<u8> = viewer.inbox[..len].to_vec();

            let reply = match message[0] {
                MSG_SET_PIXEL_FORMAT => {
                    if message[4..20] != pixel_format() {
                        return Err(HtifError::device("rfb", "viewer requested another pixel format"));
                    }
                    None
                }
                MSG_FB_UPDATE_REQUEST => Some(self.update(ctx)?),
                _ => None,
            };

            if let Some(viewer) = &mut self.viewer {
                viewer.inbox.drain(..len);
                if let Some(reply) = reply {
                    viewer.stream.set_nonblocking(false)?;
                    let written = viewer.stream.write_all(&reply);
                    viewer.stream.set_nonblocking(true)?;
                    written?;
                }
            }
        }
    }
}

/// Length of the first complete client message in `buf`, if any.
fn message_len(buf: &[u8]) -> Result<Option<usize>> {
    let Some(&kind) = buf.first() else {
        return Ok(None);
    };
    let need = match kind {
        MSG_SET_PIXEL_FORMAT => 20,
        MSG_SET_ENCODINGS => {
            if buf.len() < 4 {
                return Ok(None);
            }
            4 + 4 * u16::from_be_bytes([buf[2], buf[3]]) as usize
        }
        MSG_FB_UPDATE_REQUEST => 10,
        MSG_KEY_EVENT => 8,
        MSG_POINTER_EVENT => 6,
        MSG_CLIENT_CUT_TEXT => {
            if buf.len() < 8 {
                return Ok(None);
            }
            8 + u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize
        }
        other => {
            return Err(HtifError::device(
                "rfb",
                format!("unknown client message type {other}"),
            ))
        }
    };
    Ok((buf.len() >= need).then_some(need))
}

impl Device for Framebuffer {
    fn identity(&self) -> String {
        "rfb".to_string()
    }

    fn command_name(&self, command: u8) -> &'static str {
        self.table.name(command)
    }

    fn handle_command(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        self.table.route(cmd.command_id()).invoke(self, cmd, ctx)
    }

    fn tick(&mut self, ctx: &mut DeviceContext<'_>) -> Result<()> {
        if self.viewer.is_none() {
            self.accept()?;
        }
        let Some(viewer) = &mut self.viewer else {
            return Ok(());
        };
        if !Self::fill_inbox(viewer)? {
            info!("framebuffer viewer disconnected");
            self.viewer = None;
            return Ok(());
        }
        if self.addr == 0 || self.width == 0 || self.height == 0 {
            return Ok(());
        }
        self.serve(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ExitStatus, ResponseQueues};
    use crate::hexwriter::HexImage;
    use crate::memif::MemIf;
    use htifprims_packet::MailboxWord;

    fn cmd(command: u8, payload: u64) -> Command {
        Command::new(0, MailboxWord::new(2, command, payload).unwrap())
    }

    fn with_ctx<R>(image: &mut HexImage, f: impl FnOnce(&mut DeviceContext<'_>) -> R) -> R {
        let mut responses = ResponseQueues::new(1);
        let mut exit = ExitStatus::default();
        let mut ctx = DeviceContext {
            mem: MemIf::new(image),
            responses: &mut responses,
            exit: &mut exit,
        };
        f(&mut ctx)
    }

    #[test]
    fn message_lengths() {
        assert_eq!(message_len(&[]).unwrap(), None);
        assert_eq!(message_len(&[3; 9]).unwrap(), None);
        assert_eq!(message_len(&[3; 10]).unwrap(), Some(10));
        assert_eq!(message_len(&[2, 0, 0, 2, 0, 0, 0, 0]).unwrap(), None);
        assert_eq!(message_len(&[2, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap(), Some(12));
        assert!(message_len(&[9]).is_err());
    }

    #[test]
    fn configure_validates_depth_and_runs_once() {
        let mut image = HexImage::new(8).unwrap();
        let mut fb = Framebuffer::with_port(0);
        let err = with_ctx(&mut image, |ctx| fb.handle_command(cmd(0, 8 << 32 | 2 << 16 | 4), ctx));
        assert!(matches!(err, Err(HtifError::Device { .. })));

        with_ctx(&mut image, |ctx| fb.handle_command(cmd(0, 16 << 32 | 2 << 16 | 4), ctx))
            .unwrap();
        assert_eq!(fb.dimensions(), (4, 2));
        assert!(fb.local_addr().is_some());

        let again = with_ctx(&mut image, |ctx| fb.handle_command(cmd(0, 16 << 32 | 2 << 16 | 4), ctx));
        assert!(again.is_err());
    }

    #[test]
    fn serves_handshake_and_raw_update() {
        let mut image = HexImage::new(8).unwrap();
        let base = 0x1000u64;
        let pixels: Vec<u8> = (0u8..16).collect();
        MemIf::new(&mut image).write_bytes(base, &pixels).unwrap();

        let mut fb = Framebuffer::with_port(0);
        with_ctx(&mut image, |ctx| {
            fb.handle_command(cmd(0, 16 << 32 | 2 << 16 | 4), ctx)?;
            fb.handle_command(cmd(1, base), ctx)
        })
        .unwrap();
        let addr = fb.local_addr().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(VERSION).unwrap();
        client.write_all(&[1]).unwrap();

        for _ in 0..100 {
            with_ctx(&mut image, |ctx| fb.tick(ctx)).unwrap();
            if fb.has_viewer() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(fb.has_viewer());

        let mut version = [0u8; 12];
        client.read_exact(&mut version).unwrap();
        assert_eq!(&version, VERSION);
        let mut security = [0u8; 4];
        client.read_exact(&mut security).unwrap();
        assert_eq!(u32::from_be_bytes(security), 1);
        let mut init = [0u8; 24 + 6];
        client.read_exact(&mut init).unwrap();
        assert_eq!(&init[..4], &[0, 4, 0, 2]);
        assert_eq!(&init[4..20], &pixel_format());
        assert_eq!(&init[24..], b"RISC-V");

        let mut request = vec![MSG_SET_PIXEL_FORMAT, 0, 0, 0];
        request.extend_from_slice(&pixel_format());
        request.extend_from_slice(&[MSG_FB_UPDATE_REQUEST, 0, 0, 0, 0, 0, 0, 4, 0, 2]);
        client.write_all(&request).unwrap();

        let mut update = [0u8; 16 + 16];
        let mut got = 0;
        for _ in 0..100 {
            with_ctx(&mut image, |ctx| fb.tick(ctx)).unwrap();
            client
                .set_read_timeout(Some(Duration::from_millis(20)))
                .unwrap();
            match client.read(&mut update[got..]) {
                Ok(n) => got += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => panic!("read failed: {e}"),
            }
            if got == update.len() {
                break;
            }
        }
        assert_eq!(got, update.len());
        assert_eq!(&update[..4], &[0, 0, 0, 1]);
        assert_eq!(&update[8..12], &[0, 4, 0, 2]);
        assert_eq!(&update[16..], &pixels[..]);
    }
}
