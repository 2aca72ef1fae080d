use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{HtifError, Result};

/// Program name meaning "do not load anything".
pub const NO_PROGRAM: &str = "none";

/// How logical core indices map to the ids written into COREID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoreMap {
    #[default]
    Identity,
    Reverse,
}

impl CoreMap {
    /// Id presented to core `index` of `count`.
    pub fn map(self, index: u32, count: u32) -> u32 {
        match self {
            CoreMap::Identity => index,
            CoreMap::Reverse => count - 1 - index,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtifConfig {
    /// Skip all-zero memory writes before the target is started.
    pub assume_zero_init: bool,
    /// Signature dump destination; `None` or `-` means stdout.
    pub signature: Option<PathBuf>,
    /// Root under which absolute syscall paths are resolved.
    pub chroot: Option<PathBuf>,
    /// Disk image file.
    pub disk: Option<PathBuf>,
    /// Framebuffer display number.
    pub rfb: Option<u16>,
    pub coremap: CoreMap,
    /// Log the core map at reset.
    pub print_coremap: bool,
    /// Core count; read from global register 0 when unset.
    pub num_cores: Option<u32>,
    /// Memory size in MiB; read from global register 1 when unset.
    pub mem_mb: Option<u32>,
    /// Program to load, as given on the command line.
    pub program: Option<String>,
    /// Full target argument vector; `target_args[0]` is the program.
    pub target_args: Vec<String>,
}

impl HtifConfig {
    /// Split a host argument vector.
    ///
    /// Leading arguments starting with `+` or `-` are host flags; the first
    /// other argument and everything after it belong to the target.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter().map(|a| a.as_ref().to_string()).peekable();

        while let Some(arg) = args.next_if(|a| is_host_flag(a)) {
            config.apply_flag(&arg);
        }
        config.target_args = args.collect();
        config.program = config.target_args.first().cloned();
        config
    }

    fn apply_flag(&mut self, flag: &str) {
        let (name, value) = match flag.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (flag, None),
        };
        match (name, value) {
            ("+signature", Some(path)) => self.signature = Some(PathBuf::from(path)),
            ("+disk", Some(path)) => self.disk = Some(PathBuf::from(path)),
            ("+chroot", Some(dir)) => self.chroot = Some(PathBuf::from(dir)),
            ("+rfb", None) => self.rfb = Some(0),
            ("+rfb", Some(display)) => match display.parse() {
                Ok(display) => self.rfb = Some(display),
                Err(_) => warn!(flag, "ignoring framebuffer flag with bad display number"),
            },
            ("+coremap-reverse", None) => self.coremap = CoreMap::Reverse,
            ("+print-coremap", None) => self.print_coremap = true,
            ("+assume0init", None) => self.assume_zero_init = true,
            _ => warn!(flag, "ignoring unknown host flag"),
        }
    }

    /// Locate the program file, or `None` when there is nothing to load.
    ///
    /// `$RISCV/target/bin/<program>` wins when it exists; otherwise the name
    /// is used as given and must exist.
    pub fn resolve_program(&self) -> Result<Option<PathBuf>> {
        self.resolve_program_in(std::env::var_os("RISCV").as_deref())
    }

    /// [`resolve_program`](Self::resolve_program) with an explicit toolchain
    /// root.
    pub fn resolve_program_in(&self, riscv: Option<&OsStr>) -> Result<Option<PathBuf>> {
        let Some(program) = self.program.as_deref() else {
            return Ok(None);
        };
        if program == NO_PROGRAM {
            return Ok(None);
        }
        if let Some(root) = riscv {
            let installed = Path::new(root).join("target").join("bin").join(program);
            if installed.exists() {
                return Ok(Some(installed));
            }
        }
        let direct = PathBuf::from(program);
        if direct.exists() {
            Ok(Some(direct))
        } else {
            Err(HtifError::Load(format!("could not open {program}")))
        }
    }

    /// Whether the signature should go to stdout rather than a file.
    pub fn signature_to_stdout(&self) -> bool {
        self.signature
            .as_deref()
            .map_or(true, |p| p.as_os_str() == "-")
    }
}

fn is_host_flag(arg: &str) -> bool {
    arg.starts_with('+') || arg.starts_with('-')
}
