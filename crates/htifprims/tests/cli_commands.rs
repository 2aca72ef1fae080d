#![cfg(all(unix, feature = "cli"))]

use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use htifprims::engine::{cr, TargetModel};
use htifprims::ChunkGeometry;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "htifcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn htifprims() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_htifprims"));
    cmd.arg("--log-level").arg("error").stdin(Stdio::null());
    cmd
}

fn wait_with_deadline(mut child: Child, timeout: Duration) -> Output {
    let start = Instant::now();
    loop {
        if child.try_wait().expect("child should be waitable").is_some() {
            return child.wait_with_output().expect("output should be collectable");
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            panic!("htifprims did not exit within {timeout:?}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Serve one connection with a model target until the host hangs up.
fn serve_model(listener: UnixListener, mut model: TargetModel) -> thread::JoinHandle<TargetModel> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("host should connect");
        let mut inbox = BytesMut::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            inbox.extend_from_slice(&buf[..n]);
            let mut outbox = Vec::new();
            model
                .serve(&mut inbox, &mut outbox)
                .expect("host should send well-formed packets");
            if stream.write_all(&outbox).is_err() {
                break;
            }
        }
        model
    })
}

fn code(status: ExitStatus) -> i32 {
    status.code().expect("process should exit normally")
}

#[test]
fn version_prints_package_version() {
    let output = htifprims().arg("version").output().expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("htifprims {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn selftest_reports_json() {
    let output = htifprims()
        .args(["--format", "json", "selftest", "--geometry", "ethernet"])
        .output()
        .expect("selftest should run");
    assert_eq!(code(output.status), 0);

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report should be json");
    assert_eq!(report["passed"], true);
    assert_eq!(report["alignment"], 64);
    assert!(report["checks"]
        .as_array()
        .map(|checks| checks.iter().any(|c| c["name"] == "tethered session"))
        .unwrap_or(false));
}

#[test]
fn run_services_a_socket_target_until_exit() {
    let dir = unique_temp_dir("run");
    let sock = dir.join("sim.sock");
    let listener = UnixListener::bind(&sock).expect("socket should bind");

    let mut model = TargetModel::new(ChunkGeometry::SIMULATOR, 1, 1 << 20);
    model.script(0, [3 << 1 | 1]);
    let server = serve_model(listener, model);

    let child = htifprims()
        .args(["--format", "json", "run", "--report", "--unix"])
        .arg(&sock)
        .arg("none")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("run should start");
    let output = wait_with_deadline(child, Duration::from_secs(10));
    assert_eq!(code(output.status), 3, "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report should be json");
    assert_eq!(report["exit_code"], 3);
    assert_eq!(report["link"], "unix");
    assert_eq!(report["devices"][0]["identity"], "syscall_proxy");
    assert_eq!(report["devices"][1]["identity"], "bcd");

    let model = server.join().expect("server thread should finish");
    assert_eq!(model.register(0, cr::RESET), 1);
    assert_eq!(&model.memory()[..8], &[1, 0, 0, 0, 1, 0, 0, 0]);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_without_target_fails_to_connect() {
    let dir = unique_temp_dir("noconnect");
    let output = htifprims()
        .args(["run", "--unix"])
        .arg(dir.join("missing.sock"))
        .arg("none")
        .output()
        .expect("run should start");
    assert_eq!(code(output.status), 1);
    assert!(String::from_utf8_lossy(&output.stderr).contains("connect failed"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_rejects_bad_geometry() {
    let output = htifprims()
        .args(["run", "--unix", "/nonexistent.sock", "--align", "24", "none"])
        .output()
        .expect("run should start");
    assert_eq!(code(output.status), 64);
}

#[test]
fn elf2hex_prints_image_lines() {
    let dir = unique_temp_dir("elf2hex");
    let elf = dir.join("prog.elf");
    std::fs::write(&elf, minimal_elf(0x1000, &[0x13, 0, 0, 0, 0x6f, 0, 0, 0], 16))
        .expect("elf should be writable");

    let output = htifprims()
        .arg("elf2hex")
        .arg("16")
        .arg(&elf)
        .output()
        .expect("elf2hex should run");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "@100 00000000000000000000006f00000013\n"
    );

    let output = htifprims()
        .arg("elf2hex")
        .arg("12")
        .arg(&elf)
        .output()
        .expect("elf2hex should run");
    assert_eq!(code(output.status), 64);
    let _ = std::fs::remove_dir_all(&dir);
}

/// ELF64 executable with one load segment and a section header string table.
fn minimal_elf(paddr: u64, data: &[u8], mem_size: u64) -> Vec<u8> {
    let shstrtab = b"\0.shstrtab\0";
    let data_off = 64 + 56;
    let shstrtab_off = data_off + data.len();
    let shoff = (shstrtab_off + shstrtab.len() + 7) & !7;

    let mut out = vec![0u8; shoff + 2 * 64];
    out[..16].copy_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out[16..18].copy_from_slice(&2u16.to_le_bytes());
    out[18..20].copy_from_slice(&0xf3u16.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[24..32].copy_from_slice(&paddr.to_le_bytes());
    out[32..40].copy_from_slice(&64u64.to_le_bytes());
    out[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
    out[52..54].copy_from_slice(&64u16.to_le_bytes());
    out[54..56].copy_from_slice(&56u16.to_le_bytes());
    out[56..58].copy_from_slice(&1u16.to_le_bytes());
    out[58..60].copy_from_slice(&64u16.to_le_bytes());
    out[60..62].copy_from_slice(&2u16.to_le_bytes());
    out[62..64].copy_from_slice(&1u16.to_le_bytes());

    let ph = 64;
    out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
    out[ph + 4..ph + 8].copy_from_slice(&5u32.to_le_bytes());
    out[ph + 8..ph + 16].copy_from_slice(&(data_off as u64).to_le_bytes());
    out[ph + 16..ph + 24].copy_from_slice(&paddr.to_le_bytes());
    out[ph + 24..ph + 32].copy_from_slice(&paddr.to_le_bytes());
    out[ph + 32..ph + 40].copy_from_slice(&(data.len() as u64).to_le_bytes());
    out[ph + 40..ph + 48].copy_from_slice(&mem_size.to_le_bytes());
    out[ph + 48..ph + 56].copy_from_slice(&8u64.to_le_bytes());

    out[data_off..data_off + data.len()].copy_from_slice(data);
    out[shstrtab_off..shstrtab_off + shstrtab.len()].copy_from_slice(shstrtab);

    let sh = shoff + 64;
    out[sh..sh + 4].copy_from_slice(&1u32.to_le_bytes());
    out[sh + 4..sh + 8].copy_from_slice(&3u32.to_le_bytes());
    out[sh + 24..sh + 32].copy_from_slice(&(shstrtab_off as u64).to_le_bytes());
    out[sh + 32..sh + 40].copy_from_slice(&(shstrtab.len() as u64).to_le_bytes());
    out[sh + 48..sh + 56].copy_from_slice(&1u64.to_le_bytes());
    out
}
