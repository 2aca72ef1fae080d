use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use htifprims_transport::ChunkGeometry;
#[cfg(unix)]
use htifprims_transport::SerialPort;

#[cfg(unix)]
use crate::exit::transport_error;
use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod elf2hex;
#[cfg(unix)]
pub mod run;
pub mod selftest;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a program onto a target and service it until it exits.
    #[cfg(unix)]
    Run(RunArgs),
    /// Convert an ELF image into a hex memory initialiser.
    Elf2hex(Elf2hexArgs),
    /// Exercise the protocol engine against the built-in target model.
    Selftest(SelftestArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        #[cfg(unix)]
        Command::Run(args) => run::run(args, format),
        Command::Elf2hex(args) => elf2hex::run(args),
        Command::Selftest(args) => selftest::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Chunk geometry presets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum GeometryPreset {
    /// 16-byte units, 1 KiB chunks.
    Simulator,
    /// 64-byte units and chunks.
    Ethernet,
    /// 8-byte units and chunks.
    Serial,
}

impl GeometryPreset {
    pub fn geometry(self) -> ChunkGeometry {
        match self {
            GeometryPreset::Simulator => ChunkGeometry::SIMULATOR,
            GeometryPreset::Ethernet => ChunkGeometry::ETHERNET,
            GeometryPreset::Serial => ChunkGeometry::SERIAL,
        }
    }
}

#[cfg(unix)]
#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("link").required(true).args(["unix", "serial", "fd"])))]
pub struct RunArgs {
    /// Unix socket exposed by a simulator.
    #[arg(long, value_name = "PATH")]
    pub unix: Option<PathBuf>,
    /// Bind the socket and wait for the simulator instead of connecting.
    #[arg(long, requires = "unix")]
    pub listen: bool,
    /// Serial line to a board.
    #[arg(long, value_name = "TTY")]
    pub serial: Option<PathBuf>,
    /// Inherited input and output descriptors.
    #[arg(long, value_name = "IN,OUT", value_delimiter = ',', num_args = 2)]
    pub fd: Option<Vec<i32>>,
    /// Line speed for --serial.
    #[arg(long, default_value_t = SerialPort::DEFAULT_BAUD)]
    pub baud: u32,
    /// Chunk geometry preset; defaults to serial for --serial, simulator otherwise.
    #[arg(long, value_enum)]
    pub geometry: Option<GeometryPreset>,
    /// Override the chunk alignment in bytes.
    #[arg(long, value_name = "BYTES")]
    pub align: Option<usize>,
    /// Override the largest chunk in bytes.
    #[arg(long, value_name = "BYTES")]
    pub max_chunk: Option<usize>,
    /// Print a session report after the target exits.
    #[arg(long)]
    pub report: bool,
    /// Host flags (+signature=, +disk=, +rfb, +chroot=, ...) then the
    /// program and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    pub args: Vec<String>,
}

#[cfg(unix)]
impl RunArgs {
    /// Geometry from the preset for this link, with explicit overrides.
    pub fn geometry(&self) -> CliResult<ChunkGeometry> {
        let base = self
            .geometry
            .unwrap_or(if self.serial.is_some() {
                GeometryPreset::Serial
            } else {
                GeometryPreset::Simulator
            })
            .geometry();
        let alignment = self.align.unwrap_or(base.alignment());
        let max_chunk = self.max_chunk.unwrap_or(base.max_chunk().max(alignment));
        ChunkGeometry::new(alignment, max_chunk)
            .map_err(|err| transport_error("invalid chunk geometry", err))
    }
}

#[derive(Args, Debug)]
pub struct Elf2hexArgs {
    /// Bytes per output line (a power of two, at least 8).
    pub width: usize,
    /// ELF image to convert.
    pub elf: PathBuf,
}

#[derive(Args, Debug)]
pub struct SelftestArgs {
    #[arg(long, value_enum, default_value = "simulator")]
    pub geometry: GeometryPreset,
    /// Cores in the model target.
    #[arg(long, default_value_t = 2)]
    pub cores: u32,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
