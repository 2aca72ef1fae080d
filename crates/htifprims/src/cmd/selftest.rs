use htifprims_engine::{
    cr, Fault, Htif, HtifConfig, HtifError, LoopbackTransport, TargetModel,
};
use htifprims_transport::ChunkGeometry;
use tracing::{debug, warn};

use crate::cmd::SelftestArgs;
use crate::exit::{CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{print_report, CheckResult, OutputFormat, SelftestReport};

const MODEL_MEMORY: usize = 1 << 20;

type Outcome = Result<String, String>;

pub fn run(args: SelftestArgs, format: OutputFormat) -> CliResult<i32> {
    if args.cores == 0 || args.cores > 64 {
        return Err(CliError::new(USAGE, "--cores must be between 1 and 64"));
    }
    let geometry = args.geometry.geometry();
    let checks = run_checks(geometry, args.cores);
    let passed = checks.iter().all(|c| c.passed);

    let report = SelftestReport {
        schema_id: "https://schemas.3leaps.dev/htifprims/cli/v1/selftest.schema.json",
        alignment: geometry.alignment(),
        max_chunk: geometry.max_chunk(),
        passed,
        checks,
    };
    print_report(&report, format);
    Ok(if passed { SUCCESS } else { FAILURE })
}

fn run_checks(geometry: ChunkGeometry, cores: u32) -> Vec<CheckResult> {
    let mut checks = vec![
        check("memory round trip", round_trip(geometry, cores)),
        check("zero-init elision", zero_elision(geometry, cores)),
        check("sequence numbers", sequence_numbers(geometry, cores)),
        check("sequence mismatch", sequence_mismatch(geometry, cores)),
        check("nack", nack(geometry, cores)),
    ];
    #[cfg(unix)]
    {
        checks.push(check("exit code", session::exit_code(geometry, cores)));
        checks.push(check("tethered session", session::tethered(geometry, cores)));
    }
    checks
}

fn check(name: &'static str, outcome: Outcome) -> CheckResult {
    match outcome {
        Ok(detail) => {
            debug!(check = name, %detail, "selftest check passed");
            CheckResult {
                name,
                passed: true,
                detail,
            }
        }
        Err(detail) => {
            warn!(check = name, %detail, "selftest check failed");
            CheckResult {
                name,
                passed: false,
                detail,
            }
        }
    }
}

fn loopback(geometry: ChunkGeometry, cores: u32, config: HtifConfig) -> Htif<LoopbackTransport> {
    let model = TargetModel::new(geometry, cores, MODEL_MEMORY);
    Htif::new(LoopbackTransport::new(model), config)
}

fn failed(context: &str, err: HtifError) -> String {
    format!("{context}: {err}")
}

fn round_trip(geometry: ChunkGeometry, cores: u32) -> Outcome {
    let mut htif = loopback(geometry, cores, HtifConfig::default());
    let addr = geometry.alignment() as u64 * 4 + 3;
    let len = geometry.max_chunk() * 3 + 5;
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();

    let mut mem = htif.memif();
    mem.write_bytes(addr, &data).map_err(|e| failed("write", e))?;
    let back = mem.read(addr, len).map_err(|e| failed("read", e))?;
    if back != data {
        return Err(format!("{len} bytes at {addr:#x} read back differently"));
    }
    let before = mem.read(addr - 1, 1).map_err(|e| failed("read", e))?;
    if before != [0] {
        return Err(format!("byte before {addr:#x} was clobbered"));
    }
    Ok(format!("{len} bytes at {addr:#x}"))
}

fn zero_elision(geometry: ChunkGeometry, cores: u32) -> Outcome {
    let config = HtifConfig {
        assume_zero_init: true,
        ..HtifConfig::default()
    };
    let mut htif = loopback(geometry, cores, config);
    let len = geometry.max_chunk() * 4;
    htif.memif()
        .write_zeros(0, len)
        .map_err(|e| failed("write", e))?;
    let writes = htif.transport().model().stats().mem_writes;
    if writes != 0 {
        return Err(format!("{writes} memory writes reached the target"));
    }
    Ok(format!("{} chunk writes skipped", htif.stats().elided_writes))
}

fn sequence_numbers(geometry: ChunkGeometry, cores: u32) -> Outcome {
    let mut htif = loopback(geometry, cores, HtifConfig::default());
    for n in 1..=300u32 {
        htif.read_cr(0, cr::COREID).map_err(|e| failed("read_cr", e))?;
        let expected = (n % 256) as u8;
        let seen = htif.transport().model().last_seqno();
        if seen != Some(expected) {
            return Err(format!("request {n} carried {seen:?}, expected {expected}"));
        }
    }
    Ok("300 requests in order".to_string())
}

fn sequence_mismatch(geometry: ChunkGeometry, cores: u32) -> Outcome {
    let mut htif = loopback(geometry, cores, HtifConfig::default());
    htif.transport_mut().model_mut().inject(Fault::BadSeqno);
    match htif.read_cr(0, cr::IPI) {
        Err(err @ HtifError::BadSequenceNumber { .. }) => Ok(err.to_string()),
        Err(err) => Err(format!("wrong error: {err}")),
        Ok(_) => Err("corrupted response was accepted".to_string()),
    }
}

fn nack(geometry: ChunkGeometry, cores: u32) -> Outcome {
    let mut htif = loopback(geometry, cores, HtifConfig::default());
    htif.transport_mut().model_mut().inject(Fault::Nack);
    match htif.read_cr(0, cr::IPI) {
        Err(err @ HtifError::Nacked { .. }) => Ok(err.to_string()),
        Err(err) => Err(format!("wrong error: {err}")),
        Ok(_) => Err("nack was ignored".to_string()),
    }
}

#[cfg(unix)]
mod session {
    use htifprims_engine::{drive_model, SyscallProxy, Tethered, IDENTIFY_COMMAND};
    use htifprims_packet::MailboxWord;

    use super::*;

    const EXIT_CODE: u64 = 3;
    const IDENTITY_ADDR: u64 = 0x1000;

    fn script(model: &mut TargetModel) -> Result<(), String> {
        let identify = MailboxWord::new(
            0,
            IDENTIFY_COMMAND,
            IDENTITY_ADDR * 128 + IDENTIFY_COMMAND as u64,
        )
        .map_err(|e| e.to_string())?;
        model.script(0, [identify.raw(), EXIT_CODE << 1 | 1]);
        Ok(())
    }

    fn verify(model: &TargetModel, code: u64) -> Outcome {
        if code != EXIT_CODE {
            return Err(format!("run returned {code}, expected {EXIT_CODE}"));
        }
        let at = IDENTITY_ADDR as usize;
        if &model.memory()[at..at + 14] != b"syscall_proxy\0" {
            return Err("identify did not name the syscall proxy".to_string());
        }
        let overwrites = model.stats().fromhost_overwrites;
        if overwrites != 0 {
            return Err(format!("{overwrites} unconsumed fromhost values overwritten"));
        }
        Ok(format!("exit code {code} after {} requests", model.stats().requests))
    }

    pub fn exit_code(geometry: ChunkGeometry, cores: u32) -> Outcome {
        let mut htif = loopback(geometry, cores, HtifConfig::default());
        htif.register_device(Box::new(SyscallProxy::new(None)))
            .map_err(|e| failed("register", e))?;
        script(htif.transport_mut().model_mut())?;
        let code = htif.run().map_err(|e| failed("run", e))?;
        verify(htif.transport().model(), code)
    }

    pub fn tethered(geometry: ChunkGeometry, cores: u32) -> Outcome {
        let mut model = TargetModel::new(geometry, cores, MODEL_MEMORY);
        script(&mut model)?;
        let tethered = Tethered::spawn(geometry, |port| {
            let mut htif = Htif::new(port, HtifConfig::default());
            htif.register_device(Box::new(SyscallProxy::new(None)))?;
            htif.run()
        })
        .map_err(|e| failed("spawn", e))?;
        drive_model(tethered.driver(), &mut model).map_err(|e| failed("drive", e))?;
        let code = tethered.join().map_err(|e| failed("session", e))?;
        verify(&model, code)
    }
}
