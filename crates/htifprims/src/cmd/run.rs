use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use htifprims_engine::{Htif, HtifConfig, StdTerminal};
use htifprims_transport::{LinkStream, SerialPort, StreamTransport, UnixDomainSocket};
use tracing::info;

use crate::cmd::RunArgs;
use crate::exit::{htif_error, transport_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::{print_report, DeviceRow, OutputFormat, SessionReport};

pub fn run(args: RunArgs, format: OutputFormat) -> CliResult<i32> {
    let geometry = args.geometry()?;
    let config = HtifConfig::from_args(&args.args);
    let stream = open_link(&args)?;
    let link = stream.kind();
    info!(link, alignment = geometry.alignment(), max_chunk = geometry.max_chunk(), "link open");

    let mut htif = Htif::new(StreamTransport::new(stream, geometry), config);
    htif.register_standard_devices(StdTerminal::new())
        .map_err(|err| htif_error("device setup failed", err))?;
    install_ctrlc_handler(htif.cancel_handle())?;

    let code = htif.run().map_err(|err| htif_error("session failed", err))?;

    if args.report {
        let stats = htif.stats();
        let devices = (0..htif.devices().len())
            .filter_map(|id| {
                let id = u8::try_from(id).ok()?;
                let device = htif.devices().get(id)?;
                Some(DeviceRow {
                    id,
                    identity: device.identity(),
                })
            })
            .collect();
        let report = SessionReport {
            schema_id: "https://schemas.3leaps.dev/htifprims/cli/v1/session.schema.json",
            link,
            exit_code: code,
            exchanges: stats.exchanges,
            elided_writes: stats.elided_writes,
            devices,
        };
        print_report(&report, format);
    }

    Ok(exit_code(code))
}

fn open_link(args: &RunArgs) -> CliResult<LinkStream> {
    if let Some(path) = &args.unix {
        if args.listen {
            let listener =
                UnixDomainSocket::bind(path).map_err(|err| transport_error("bind failed", err))?;
            info!(path = %path.display(), "waiting for simulator");
            return listener
                .accept()
                .map_err(|err| transport_error("accept failed", err));
        }
        return UnixDomainSocket::connect(path)
            .map_err(|err| transport_error("connect failed", err));
    }
    if let Some(path) = &args.serial {
        return SerialPort::open(path, args.baud)
            .map_err(|err| transport_error("serial open failed", err));
    }
    if let Some(fds) = &args.fd {
        let [input, output] = fds[..] else {
            return Err(CliError::new(USAGE, "--fd takes exactly two descriptors"));
        };
        if input < 0 || output < 0 || input == output {
            return Err(CliError::new(
                USAGE,
                format!("--fd {input},{output}: need two distinct open descriptors"),
            ));
        }
        // SAFETY: the descriptors were handed to this process for the link
        // and nothing else in the process uses them.
        return Ok(unsafe { LinkStream::from_raw_fds(input, output) });
    }
    Err(CliError::new(USAGE, "one of --unix, --serial or --fd is required"))
}

/// Target exit codes wider than a process status are reported as failure.
fn exit_code(code: u64) -> i32 {
    match u8::try_from(code) {
        Ok(code) => i32::from(code),
        Err(_) => crate::exit::FAILURE,
    }
}

fn install_ctrlc_handler(cancel: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_exit_codes_collapse_to_failure() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(3), 3);
        assert_eq!(exit_code(255), 255);
        assert_eq!(exit_code(256), crate::exit::FAILURE);
    }
}
