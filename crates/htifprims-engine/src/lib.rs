//! Host side of the host-target interface.
//!
//! Drives a bare-metal target over a [`Transport`](htifprims_transport::Transport):
//! sequenced control-register and memory access, byte-granular memory on top
//! of fixed-size chunks, mailbox command dispatch to host devices, program
//! loading and the session run loop.

pub mod chunk;
pub mod config;
#[cfg(unix)]
pub mod console;
pub mod device;
#[cfg(unix)]
pub mod disk;
pub mod error;
pub mod hexwriter;
pub mod htif;
pub mod loader;
pub mod memif;
pub mod protocol;
pub mod rfb;
pub mod signature;
#[cfg(unix)]
pub mod syscall;
pub mod target;
pub mod tethered;

pub use chunk::{check_chunk, ChunkTarget};
pub use config::{CoreMap, HtifConfig, NO_PROGRAM};
#[cfg(unix)]
pub use console::{Console, StdTerminal, Terminal};
pub use device::{
    Command, CommandTable, Device, DeviceContext, DeviceList, ExitStatus, Handler,
    ResponseQueues, Route, IDENTIFY_COMMAND, IDENTITY_SIZE, MAX_DEVICES,
};
#[cfg(unix)]
pub use disk::{Disk, DiskRequest};
pub use error::{HtifError, Result};
pub use hexwriter::HexImage;
pub use htif::Htif;
pub use loader::{load_elf, load_elf_file, LoadedProgram, BEGIN_SIGNATURE, END_SIGNATURE};
pub use memif::MemIf;
pub use protocol::{cr, Core, LinkStats, Protocol};
pub use rfb::Framebuffer;
pub use signature::{dump_signature, format_signature};
#[cfg(unix)]
pub use syscall::SyscallProxy;
pub use target::{Fault, LoopbackTransport, ModelStats, TargetModel};
pub use tethered::{drive_model, step_model, Tethered};
