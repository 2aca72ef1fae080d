//! Host side of the host-target interface (HTIF).
//!
//! htifprims drives a bare-metal target (a simulator, an FPGA board or a
//! test chip) from the host: it loads programs into target memory, brings
//! cores out of reset, and services the target's requests for host
//! resources through a mailbox of control registers.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte links to the target (serial, Unix socket, pipes,
//!   simulator handoff) and their chunk geometry
//! - [`packet`]: request/response packet codec and mailbox word layout
//! - [`engine`]: protocol sequencing, byte-granular memory, devices, the
//!   syscall proxy and the session run loop

/// Re-export transport types.
pub mod transport {
    pub use htifprims_transport::*;
}

/// Re-export packet types.
pub mod packet {
    pub use htifprims_packet::*;
}

/// Re-export engine types.
pub mod engine {
    pub use htifprims_engine::*;
}

pub use htifprims_engine::{Htif, HtifConfig, HtifError};
pub use htifprims_transport::{ChunkGeometry, Transport};
