use std::io::Write;

use htifprims_engine::{load_elf, HexImage, MemIf};
use tracing::debug;

use crate::cmd::Elf2hexArgs;
use crate::exit::{htif_error, io_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: Elf2hexArgs) -> CliResult<i32> {
    let mut image = HexImage::new(args.width)
        .map_err(|err| CliError::new(USAGE, format!("bad width: {err}")))?;
    let elf = std::fs::read(&args.elf)
        .map_err(|err| io_error(&format!("cannot read {}", args.elf.display()), err))?;

    let program = load_elf(&mut MemIf::new(&mut image), &elf)
        .map_err(|err| htif_error("conversion failed", err))?;
    debug!(
        entry = program.entry,
        segments = program.segments,
        lines = image.line_count(),
        "image built"
    );

    let mut out = std::io::stdout().lock();
    write!(out, "{image}")
        .and_then(|()| out.flush())
        .map_err(|err| io_error("write failed", err))?;
    Ok(SUCCESS)
}
