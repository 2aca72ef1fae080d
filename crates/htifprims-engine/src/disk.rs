use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::debug;

use crate::device::{Command, CommandTable, Device, DeviceContext};
use crate::error::{HtifError, Result};
use crate::memif::MemIf;

/// Transfer descriptor the target places in memory before a disk command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskRequest {
    /// Target memory address of the data buffer.
    pub addr: u64,
    /// Byte offset into the disk image.
    pub offset: u64,
    pub size: u64,
    /// Echoed back as the completion payload.
    pub tag: u64,
}

impl DiskRequest {
    pub const SIZE: usize = 32;

    /// Fetch the descriptor at `at`.
    pub fn read_from(mem: &mut MemIf<'_>, at: u64) -> Result<Self> {
        Ok(Self {
            addr: mem.read_u64(at)?,
            offset: mem.read_u64(at + 8)?,
            size: mem.read_u64(at + 16)?,
            tag: mem.read_u64(at + 24)?,
        })
    }
}

/// Block storage backed by a host file.
pub struct Disk {
    table: CommandTable<Disk>,
    file: File,
    size: u64,
}

impl Disk {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| HtifError::device("disk", format!("open {}: {e}", path.display())))?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            table: CommandTable::new()
                .register(0, "read", Self::handle_read)
                .register(1, "write", Self::handle_write),
            file,
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn request(&self, cmd: Command, mem: &mut MemIf<'_>) -> Result<DiskRequest> {
        let req = DiskRequest::read_from(mem, cmd.payload())?;
        let in_range = req
            .offset
            .checked_add(req.size)
            .is_some_and(|end| end <= self.size);
        if !in_range {
            return Err(HtifError::device(
                "disk",
                format!(
                    "request {}+{} outside {}-byte image",
                    req.offset, req.size, self.size
                ),
            ));
        }
        Ok(req)
    }

    fn handle_read(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        let req = self.request(cmd, &mut ctx.mem)?;
        debug!(?req, "disk read");
        let mut buf = vec![0u8; req.size as usize];
        self.file.read_exact_at(&mut buf, req.offset)?;
        ctx.mem.write_bytes(req.addr, &buf)?;
        cmd.respond(ctx, req.tag);
        Ok(())
    }

    fn handle_write(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        let req = self.request(cmd, &mut ctx.mem)?;
        debug!(?req, "disk write");
        let buf = ctx.mem.read(req.addr, req.size as usize)?;
        self.file.write_all_at(&buf, req.offset)?;
        cmd.respond(ctx, req.tag);
        Ok(())
    }
}

impl Device for Disk {
    fn identity(&self) -> String {
        format!("disk size={}", self.size)
    }

    fn command_name(&self, command: u8) -> &'static str {
        self.table.name(command)
    }

    fn handle_command(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        self.table.route(cmd.command_id()).invoke(self, cmd, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ExitStatus, ResponseQueues};
    use crate::hexwriter::HexImage;
    use htifprims_packet::MailboxWord;

    const DESC: u64 = 0x40;
    const BUF: u64 = 0x100;

    fn image_file(tag: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("htifprims-disk-{tag}-{}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn post(image: &mut HexImage, req: DiskRequest) {
        let mut mem = MemIf::new(image);
        for (i, word) in [req.addr, req.offset, req.size, req.tag].into_iter().enumerate() {
            mem.write_u64(DESC + 8 * i as u64, word).unwrap();
        }
    }

    fn issue(disk: &mut Disk, image: &mut HexImage, command: u8) -> (Result<()>, ResponseQueues) {
        let mut responses = ResponseQueues::new(1);
        let mut exit = ExitStatus::default();
        let result = {
            let mut ctx = DeviceContext {
                mem: MemIf::new(image),
                responses: &mut responses,
                exit: &mut exit,
            };
            let word = MailboxWord::new(3, command, DESC).unwrap();
            disk.handle_command(Command::new(0, word), &mut ctx)
        };
        (result, responses)
    }

    #[test]
    fn read_then_write_round_trip_through_memory() {
        let path = image_file("rw", &[0xabu8; 512]);
        let mut disk = Disk::open(&path).unwrap();
        assert_eq!(disk.identity(), "disk size=512");

        let mut image = HexImage::new(8).unwrap();
        post(&mut image, DiskRequest { addr: BUF, offset: 256, size: 16, tag: 77 });
        let (result, mut responses) = issue(&mut disk, &mut image, 0);
        result.unwrap();
        assert_eq!(responses.pop(0).unwrap().payload(), 77);
        assert_eq!(MemIf::new(&mut image).read(BUF, 16).unwrap(), vec![0xab; 16]);

        MemIf::new(&mut image).write_bytes(BUF, b"0123456789").unwrap();
        post(&mut image, DiskRequest { addr: BUF, offset: 3, size: 10, tag: 78 });
        let (result, mut responses) = issue(&mut disk, &mut image, 1);
        result.unwrap();
        assert_eq!(responses.pop(0).unwrap().payload(), 78);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[3..13], b"0123456789");
        assert_eq!(contents[13], 0xab);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn out_of_range_request_is_rejected() {
        let path = image_file("range", &[0u8; 64]);
        let mut disk = Disk::open(&path).unwrap();
        let mut image = HexImage::new(8).unwrap();
        post(&mut image, DiskRequest { addr: BUF, offset: 60, size: 8, tag: 1 });
        let (result, responses) = issue(&mut disk, &mut image, 0);
        assert!(matches!(result, Err(HtifError::Device { device: "disk", .. })));
        assert!(responses.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
