use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::LinkStream;

/// Raw 8N1 serial line to a board's HTIF UART.
pub struct SerialPort;

impl SerialPort {
    /// Default line speed of the debug UART.
    pub const DEFAULT_BAUD: u32 = 9600;

    /// Open `path` and switch it to raw mode at `baud`.
    ///
    /// Reads block until at least one byte is available; pending input and
    /// output are flushed before the new settings take effect.
    pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<LinkStream> {
        let path = path.as_ref();
        let speed = baud_constant(baud)?;
        let open_err = |source| TransportError::Open {
            path: path.to_path_buf(),
            source,
        };

        debug!(?path, baud, "opening serial line");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .map_err(open_err)?;
        let fd = file.as_raw_fd();

        // SAFETY: termios is a plain C struct; all-zero is a valid starting point
        // that is fully overwritten by the fields set below.
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        tio.c_cflag = libc::CS8 | libc::CREAD | libc::CLOCAL;
        tio.c_iflag = libc::IGNPAR;
        tio.c_oflag = 0;
        tio.c_lflag = 0;
        tio.c_cc[libc::VTIME] = 0;
        tio.c_cc[libc::VMIN] = 1;

        // SAFETY: `fd` is an open descriptor owned by `file` for the duration of
        // these calls and `tio` is a valid, initialized termios.
        let rc = unsafe {
            if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
                -1
            } else if libc::tcflush(fd, libc::TCIOFLUSH) != 0 {
                -1
            } else {
                libc::tcsetattr(fd, libc::TCSANOW, &tio)
            }
        };
        if rc != 0 {
            return Err(open_err(std::io::Error::last_os_error()));
        }

        info!(?path, baud, "serial line configured");
        Ok(LinkStream::from_serial(file))
    }
}

fn baud_constant(baud: u32) -> Result<libc::speed_t> {
    let speed = match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        other => return Err(TransportError::BadBaud(other)),
    };
    Ok(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_rates_map_to_termios() {
        assert_eq!(baud_constant(9600).unwrap(), libc::B9600);
        assert_eq!(baud_constant(115200).unwrap(), libc::B115200);
    }

    #[test]
    fn odd_rates_are_rejected() {
        assert!(matches!(
            baud_constant(12345),
            Err(TransportError::BadBaud(12345))
        ));
    }

    #[test]
    fn regular_file_is_not_a_tty() {
        let dir = std::env::temp_dir().join(format!("htifprims-serial-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("not-a-tty");
        std::fs::write(&path, b"").unwrap();

        let result = SerialPort::open(&path, SerialPort::DEFAULT_BAUD);
        assert!(matches!(result, Err(TransportError::Open { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
