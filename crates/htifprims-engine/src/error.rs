use htifprims_packet::Command;

/// Errors that can occur while driving a target.
#[derive(Debug, thiserror::Error)]
pub enum HtifError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] htifprims_transport::TransportError),

    /// Packet framing or decoding error.
    #[error("packet error: {0}")]
    Packet(#[from] htifprims_packet::PacketError),

    /// A response carried a sequence number other than the outstanding one.
    #[error("bad sequence number (expected {expected}, got {actual})")]
    BadSequenceNumber { expected: u8, actual: u8 },

    /// The target rejected the request.
    #[error("request {seqno} was nacked")]
    Nacked { seqno: u8 },

    /// A request-only command arrived in response position.
    #[error("illegal response command {0}")]
    IllegalResponse(Command),

    /// An address is not aligned to the width being accessed.
    #[error("misaligned address {addr:#x} (alignment {align})")]
    MisalignedAddress { addr: u64, align: usize },

    /// A caller broke a local contract (chunk geometry, buffer length, ...).
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The syscall proxy has no handler for this number.
    #[error("unknown syscall {0}")]
    UnknownSyscall(u64),

    /// A mailbox word named a device that was never registered.
    #[error("no device registered at index {0}")]
    UnknownDevice(u8),

    /// The device list is full.
    #[error("device list full ({0} devices)")]
    TooManyDevices(usize),

    /// `start()` was called on an engine that already started.
    #[error("target already started")]
    AlreadyStarted,

    /// The session was cancelled between poll iterations.
    #[error("session cancelled")]
    Cancelled,

    /// The program image could not be loaded.
    #[error("program load failed: {0}")]
    Load(String),

    /// A device could not service a request.
    #[error("{device} device error: {message}")]
    Device {
        device: &'static str,
        message: String,
    },

    /// The engine thread of a tethered session panicked or vanished.
    #[error("engine thread failed: {0}")]
    EngineThread(String),

    /// Host-side I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HtifError {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub(crate) fn device(device: &'static str, message: impl Into<String>) -> Self {
        Self::Device {
            device,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HtifError>;
