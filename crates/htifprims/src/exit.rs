use std::fmt;
use std::io;

use htifprims_engine::HtifError;
use htifprims_packet::PacketError;
use htifprims_transport::TransportError;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;
pub const INTERRUPTED: i32 = 130;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Open { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::BadGeometry { .. } | TransportError::BadBaud(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn packet_error(context: &str, err: PacketError) -> CliError {
    match err {
        PacketError::Io(source) => io_error(context, source),
        PacketError::Transport(err) => transport_error(context, err),
        PacketError::ConnectionClosed => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn htif_error(context: &str, err: HtifError) -> CliError {
    match err {
        HtifError::Transport(err) => transport_error(context, err),
        HtifError::Packet(err) => packet_error(context, err),
        HtifError::Io(source) => io_error(context, source),
        HtifError::BadSequenceNumber { .. }
        | HtifError::Nacked { .. }
        | HtifError::IllegalResponse(_)
        | HtifError::Load(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        HtifError::Cancelled => CliError::new(INTERRUPTED, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_mismatches_are_data_errors() {
        let err = htif_error("run", HtifError::BadSequenceNumber { expected: 1, actual: 2 });
        assert_eq!(err.code, DATA_INVALID);
        assert!(err.message.starts_with("run: bad sequence number"));
    }

    #[test]
    fn link_failures_keep_io_classification() {
        let closed = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err = htif_error("run", HtifError::Packet(PacketError::Io(closed)));
        assert_eq!(err.code, TRANSPORT_ERROR);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let err = transport_error(
            "open",
            TransportError::Open {
                path: "/dev/ttyUSB0".into(),
                source: denied,
            },
        );
        assert_eq!(err.code, PERMISSION_DENIED);
    }

    #[test]
    fn cancellation_maps_to_interrupted() {
        assert_eq!(htif_error("run", HtifError::Cancelled).code, INTERRUPTED);
        assert_eq!(
            transport_error("link", TransportError::BadBaud(12)).code,
            USAGE
        );
    }
}
