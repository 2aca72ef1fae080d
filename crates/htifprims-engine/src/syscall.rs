//! Proxied system calls (device 0).
//!
//! The target posts the address of a six-word block `[n, a0, a1, a2, a3, a4]`.
//! The host reads it, runs syscall `n`, and writes `[result, errno]` back over
//! the first two words before acknowledging. A payload with its low bit set
//! is not a block address but an exit word.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::device::{Command, CommandTable, Device, DeviceContext, ExitStatus};
use crate::error::{HtifError, Result};
use crate::memif::MemIf;

/// Syscall numbers understood by the proxy.
pub mod nr {
    pub const EXIT: u64 = 1;
    pub const READ: u64 = 3;
    pub const WRITE: u64 = 4;
    pub const OPEN: u64 = 5;
    pub const CLOSE: u64 = 6;
    pub const LINK: u64 = 9;
    pub const UNLINK: u64 = 10;
    pub const STAT: u64 = 18;
    pub const LSEEK: u64 = 19;
    pub const FSTAT: u64 = 28;
    pub const LSTAT: u64 = 84;
    pub const PREAD: u64 = 180;
    pub const PWRITE: u64 = 181;
}

/// Size of the marshalled stat record.
pub const TARGET_STAT_SIZE: usize = 128;

/// Words in a request block.
const BLOCK_WORDS: usize = 6;

/// Upper bound on one proxied transfer; longer requests fail with `ENOMEM`.
const MAX_TRANSFER: u64 = 64 << 20;

type Args = [u64; 5];
type SysResult = std::result::Result<u64, i32>;
type Errno<T> = std::result::Result<T, i32>;

/// Unwrap a host-side value or hand its errno back to the target.
macro_rules! or_errno {
    ($value:expr) => {
        match $value {
            Ok(value) => value,
            Err(errno) => return Ok(Err(errno)),
        }
    };
}
type SyscallFn = fn(&mut SyscallProxy, &mut MemIf<'_>, Args) -> Result<SysResult>;

enum Descriptor {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

/// Host-side file descriptor table seen by the target.
struct FdTable {
    entries: Vec<Option<Descriptor>>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            entries: vec![
                Some(Descriptor::Stdin),
                Some(Descriptor::Stdout),
                Some(Descriptor::Stderr),
            ],
        }
    }

    fn get(&mut self, fd: u64) -> std::result::Result<&mut Descriptor, i32> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.entries.get_mut(i))
            .and_then(Option::as_mut)
            .ok_or(libc::EBADF)
    }

    fn insert(&mut self, file: File) -> u64 {
        let slot = self.entries.iter().position(Option::is_none);
        let fd = match slot {
            Some(i) => {
                self.entries[i] = Some(Descriptor::File(file));
                i
            }
            None => {
                self.entries.push(Some(Descriptor::File(file)));
                self.entries.len() - 1
            }
        };
        fd as u64
    }

    fn remove(&mut self, fd: u64) -> std::result::Result<(), i32> {
        let slot = usize::try_from(fd)
            .ok()
            .and_then(|i| self.entries.get_mut(i))
            .ok_or(libc::EBADF)?;
        slot.take().map(|_| ()).ok_or(libc::EBADF)
    }
}

/// The syscall proxy device.
pub struct SyscallProxy {
    table: CommandTable<SyscallProxy>,
    fds: FdTable,
    chroot: Option<PathBuf>,
}

impl SyscallProxy {
    pub fn new(chroot: Option<PathBuf>) -> Self {
        Self {
            table: CommandTable::new().register(0, "syscall", SyscallProxy::handle_syscall),
            fds: FdTable::new(),
            chroot,
        }
    }

    fn handle_syscall(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        let payload = cmd.payload();
        if payload & 1 == 1 {
            ctx.exit.set_raw(payload);
            let code = ctx.exit.code();
            if code == 0 {
                info!(core = cmd.core(), "target passed");
            } else {
                warn!(core = cmd.core(), "*** FAILED *** (tohost = {code})");
            }
        } else {
            self.dispatch(&mut ctx.mem, payload, ctx.exit)?;
        }
        cmd.respond(ctx, 1);
        Ok(())
    }

    /// Run the syscall described by the block at `addr`.
    pub fn dispatch(
        &mut self,
        mem: &mut MemIf<'_>,
        addr: u64,
        exit: &mut ExitStatus,
    ) -> Result<()> {
        let mut raw = [0u8; BLOCK_WORDS * 8];
        mem.read_into(addr, &mut raw)?;
        let mut words = [0u64; BLOCK_WORDS];
        for (word, bytes) in words.iter_mut().zip(raw.chunks_exact(8)) {
            let mut le = [0u8; 8];
            le.copy_from_slice(bytes);
            *word = u64::from_le_bytes(le);
        }
        let n = words[0];
        let args: Args = [words[1], words[2], words[3], words[4], words[5]];

        if n == nr::EXIT {
            debug!(code = args[0], "exit syscall");
            exit.set_code(args[0]);
            return Ok(());
        }

        let handler = lookup(n).ok_or(HtifError::UnknownSyscall(n))?;
        let outcome = handler(self, mem, args)?;
        debug!(n, ?args, ?outcome, "syscall");

        let (result, errno) = match outcome {
            Ok(value) => (value, 0u64),
            Err(errno) => (u64::MAX, errno as u64),
        };
        let mut reply = [0u8; 16];
        reply[..8].copy_from_slice(&result.to_le_bytes());
        reply[8..].copy_from_slice(&errno.to_le_bytes());
        mem.write_bytes(addr, &reply)
    }

    fn host_path(&self, mem: &mut MemIf<'_>, addr: u64, len: u64) -> Result<Errno<PathBuf>> {
        if len > libc::PATH_MAX as u64 {
            return Ok(Err(libc::ENAMETOOLONG));
        }
        let raw = mem.read(addr, len as usize)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let name = String::from_utf8_lossy(&raw[..end]).into_owned();
        Ok(Ok(self.translate(Path::new(&name))))
    }

    /// Resolve a target path under the configured root.
    pub fn translate(&self, path: &Path) -> PathBuf {
        match &self.chroot {
            Some(root) if path.is_absolute() => {
                root.join(path.strip_prefix("/").unwrap_or(path))
            }
            _ => path.to_path_buf(),
        }
    }

    fn sys_read(&mut self, mem: &mut MemIf<'_>, [fd, buf, len, ..]: Args) -> Result<SysResult> {
        let mut data = vec![0u8; or_errno!(bounded(len))];
        let n = match self.fds.get(fd) {
            Ok(Descriptor::Stdin) => std::io::stdin().read(&mut data),
            Ok(Descriptor::File(file)) => file.read(&mut data),
            Ok(_) => return Ok(Err(libc::EBADF)),
            Err(errno) => return Ok(Err(errno)),
        };
        finish_read(mem, buf, &data, n)
    }

    fn sys_pread(&mut self, mem: &mut MemIf<'_>, [fd, buf, len, off, _]: Args) -> Result<SysResult> {
        let mut data = vec![0u8; or_errno!(bounded(len))];
        let n = match self.fds.get(fd) {
            Ok(Descriptor::File(file)) => file.read_at(&mut data, off),
            Ok(_) => return Ok(Err(libc::ESPIPE)),
            Err(errno) => return Ok(Err(errno)),
        };
        finish_read(mem, buf, &data, n)
    }

    fn sys_write(&mut self, mem: &mut MemIf<'_>, [fd, buf, len, ..]: Args) -> Result<SysResult> {
        let data = or_errno!(read_buffer(mem, buf, len)?);
        let n = match self.fds.get(fd) {
            Ok(Descriptor::Stdout) => write_flushed(&mut std::io::stdout(), &data),
            Ok(Descriptor::Stderr) => write_flushed(&mut std::io::stderr(), &data),
            Ok(Descriptor::File(file)) => file.write(&data),
            Ok(Descriptor::Stdin) => return Ok(Err(libc::EBADF)),
            Err(errno) => return Ok(Err(errno)),
        };
        Ok(io_result(n.map(|n| n as u64)))
    }

    fn sys_pwrite(&mut self, mem: &mut MemIf<'_>, [fd, buf, len, off, _]: Args) -> Result<SysResult> {
        let data = or_errno!(read_buffer(mem, buf, len)?);
        let n = match self.fds.get(fd) {
            Ok(Descriptor::File(file)) => file.write_at(&data, off),
            Ok(_) => return Ok(Err(libc::ESPIPE)),
            Err(errno) => return Ok(Err(errno)),
        };
        Ok(io_result(n.map(|n| n as u64)))
    }

    fn sys_open(&mut self, mem: &mut MemIf<'_>, [name, len, flags, mode, _]: Args) -> Result<SysResult> {
        let path = or_errno!(self.host_path(mem, name, len)?);
        let flags = flags as i32;
        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        options
            .custom_flags(flags & !libc::O_ACCMODE)
            .mode(mode as u32);
        Ok(io_result(options.open(&path).map(|file| self.fds.insert(file))))
    }

    fn sys_close(&mut self, _mem: &mut MemIf<'_>, [fd, ..]: Args) -> Result<SysResult> {
        Ok(self.fds.remove(fd).map(|()| 0))
    }

    fn sys_lseek(&mut self, _mem: &mut MemIf<'_>, [fd, offset, whence, ..]: Args) -> Result<SysResult> {
        let pos = match whence as i32 {
            libc::SEEK_SET => SeekFrom::Start(offset),
            libc::SEEK_CUR => SeekFrom::Current(offset as i64),
            libc::SEEK_END => SeekFrom::End(offset as i64),
            _ => return Ok(Err(libc::EINVAL)),
        };
        match self.fds.get(fd) {
            Ok(Descriptor::File(file)) => Ok(io_result(file.seek(pos))),
            Ok(_) => Ok(Err(libc::ESPIPE)),
            Err(errno) => Ok(Err(errno)),
        }
    }

    fn sys_link(&mut self, mem: &mut MemIf<'_>, [old, old_len, new, new_len, _]: Args) -> Result<SysResult> {
        let old = or_errno!(self.host_path(mem, old, old_len)?);
        let new = or_errno!(self.host_path(mem, new, new_len)?);
        Ok(io_result(std::fs::hard_link(old, new).map(|()| 0)))
    }

    fn sys_unlink(&mut self, mem: &mut MemIf<'_>, [name, len, ..]: Args) -> Result<SysResult> {
        let path = or_errno!(self.host_path(mem, name, len)?);
        Ok(io_result(std::fs::remove_file(path).map(|()| 0)))
    }

    fn sys_stat(&mut self, mem: &mut MemIf<'_>, [name, len, buf, ..]: Args) -> Result<SysResult> {
        let path = or_errno!(self.host_path(mem, name, len)?);
        finish_stat(mem, buf, std::fs::metadata(path))
    }

    fn sys_lstat(&mut self, mem: &mut MemIf<'_>, [name, len, buf, ..]: Args) -> Result<SysResult> {
        let path = or_errno!(self.host_path(mem, name, len)?);
        finish_stat(mem, buf, std::fs::symlink_metadata(path))
    }

    fn sys_fstat(&mut self, mem: &mut MemIf<'_>, [fd, buf, ..]: Args) -> Result<SysResult> {
        let metadata = match self.fds.get(fd) {
            Ok(Descriptor::File(file)) => file.metadata(),
            Ok(Descriptor::Stdin) => stdio_metadata(std::io::stdin()),
            Ok(Descriptor::Stdout) => stdio_metadata(std::io::stdout()),
            Ok(Descriptor::Stderr) => stdio_metadata(std::io::stderr()),
            Err(errno) => return Ok(Err(errno)),
        };
        finish_stat(mem, buf, metadata)
    }
}

fn lookup(n: u64) -> Option<SyscallFn> {
    let handler: SyscallFn = match n {
        nr::READ => SyscallProxy::sys_read,
        nr::WRITE => SyscallProxy::sys_write,
        nr::OPEN => SyscallProxy::sys_open,
        nr::CLOSE => SyscallProxy::sys_close,
        nr::LINK => SyscallProxy::sys_link,
        nr::UNLINK => SyscallProxy::sys_unlink,
        nr::STAT => SyscallProxy::sys_stat,
        nr::LSEEK => SyscallProxy::sys_lseek,
        nr::FSTAT => SyscallProxy::sys_fstat,
        nr::LSTAT => SyscallProxy::sys_lstat,
        nr::PREAD => SyscallProxy::sys_pread,
        nr::PWRITE => SyscallProxy::sys_pwrite,
        _ => return None,
    };
    Some(handler)
}

fn bounded(len: u64) -> Errno<usize> {
    if len > MAX_TRANSFER {
        debug!(len, "proxied transfer too large");
        return Err(libc::ENOMEM);
    }
    Ok(len as usize)
}

fn read_buffer(mem: &mut MemIf<'_>, addr: u64, len: u64) -> Result<Errno<Vec<u8>>> {
    match bounded(len) {
        Ok(len) => Ok(Ok(mem.read(addr, len)?)),
        Err(errno) => Ok(Err(errno)),
    }
}

fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn io_result(result: std::io::Result<u64>) -> SysResult {
    result.map_err(|err| errno_of(&err))
}

fn write_flushed(out: &mut impl Write, data: &[u8]) -> std::io::Result<usize> {
    out.write_all(data)?;
    out.flush()?;
    Ok(data.len())
}

fn finish_read(
    mem: &mut MemIf<'_>,
    buf: u64,
    data: &[u8],
    n: std::io::Result<usize>,
) -> Result<SysResult> {
    match n {
        Ok(n) => {
            mem.write_bytes(buf, &data[..n])?;
            Ok(Ok(n as u64))
        }
        Err(err) => Ok(Err(errno_of(&err))),
    }
}

fn stdio_metadata(stream: impl std::os::fd::AsFd) -> std::io::Result<std::fs::Metadata> {
    let owned = stream.as_fd().try_clone_to_owned()?;
    File::from(owned).metadata()
}

fn finish_stat(
    mem: &mut MemIf<'_>,
    buf: u64,
    metadata: std::io::Result<std::fs::Metadata>,
) -> Result<SysResult> {
    match metadata {
        Ok(meta) => {
            mem.write_bytes(buf, &target_stat(&meta))?;
            Ok(Ok(0))
        }
        Err(err) => Ok(Err(errno_of(&err))),
    }
}

/// Marshal host metadata into the target's fixed 128-byte stat layout.
///
/// ```text
/// 0 dev u64   8 ino u64   16 mode u32  20 nlink u32  24 uid u32  28 gid u32
/// 32 rdev u64 40 pad      48 size i64  56 blksize i32 60 pad     64 blocks i64
/// 72 atime    80 atime_ns 88 mtime     96 mtime_ns  104 ctime   112 ctime_ns
/// 120 unused (8 bytes)
/// ```
pub fn target_stat(meta: &std::fs::Metadata) -> [u8; TARGET_STAT_SIZE] {
    let mut out = [0u8; TARGET_STAT_SIZE];
    let mut put = |offset: usize, bytes: &[u8]| {
        out[offset..offset + bytes.len()].copy_from_slice(bytes);
    };
    put(0, &meta.dev().to_le_bytes());
    put(8, &meta.ino().to_le_bytes());
    put(16, &meta.mode().to_le_bytes());
    put(20, &(meta.nlink() as u32).to_le_bytes());
    put(24, &meta.uid().to_le_bytes());
    put(28, &meta.gid().to_le_bytes());
    put(32, &meta.rdev().to_le_bytes());
    put(48, &(meta.size() as i64).to_le_bytes());
    put(56, &(meta.blksize() as i32).to_le_bytes());
    put(64, &(meta.blocks() as i64).to_le_bytes());
    put(72, &meta.atime().to_le_bytes());
    put(80, &meta.atime_nsec().to_le_bytes());
    put(88, &meta.mtime().to_le_bytes());
    put(96, &meta.mtime_nsec().to_le_bytes());
    put(104, &meta.ctime().to_le_bytes());
    put(112, &meta.ctime_nsec().to_le_bytes());
    out
}

impl Device for SyscallProxy {
    fn identity(&self) -> String {
        "syscall_proxy".to_string()
    }

    fn command_name(&self, command: u8) -> &'static str {
        self.table.name(command)
    }

    fn handle_command(&mut self, cmd: Command, ctx: &mut DeviceContext<'_>) -> Result<()> {
        self.table.route(cmd.command_id()).invoke(self, cmd, ctx)
    }
}
