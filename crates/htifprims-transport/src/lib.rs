//! Byte transports for the host-target interface.
//!
//! A target is reached over one of:
//! - a serial line (tty in raw 8N1 mode)
//! - a Unix domain socket exposed by a simulator
//! - a pair of inherited pipe descriptors
//! - an in-process [`handoff`] when a cycle-level simulator drives the clock
//!
//! This is the lowest layer of htifprims. Every link carries a
//! [`ChunkGeometry`] that the packet and engine layers honor.

pub mod error;
pub mod handoff;
pub mod traits;

#[cfg(unix)]
pub mod serial;
#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use handoff::{handoff, DriverPort, EnginePort};
pub use traits::{ChunkGeometry, LinkStream, StreamTransport, Transport};

#[cfg(unix)]
pub use serial::SerialPort;
#[cfg(unix)]
pub use uds::UnixDomainSocket;
