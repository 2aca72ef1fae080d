//! tohost/fromhost mailbox word layout.
//!
//! ```text
//! ┌───────────┬───────────┬─────────────┬───────────────────┐
//! │ device    │ interrupt │ command     │ payload           │
//! │ [63:56]   │ [55]      │ [54:48]     │ [47:0]            │
//! └───────────┴───────────┴─────────────┴───────────────────┘
//! ```
//!
//! Zero means "no message".

use crate::error::{PacketError, Result};

const DEVICE_SHIFT: u32 = 56;
const COMMAND_SHIFT: u32 = 48;
const COMMAND_MASK: u64 = 0x7f;
const INTERRUPT_BIT: u64 = 1 << 55;

/// Mask of the 48 payload bits.
pub const PAYLOAD_MASK: u64 = (1 << COMMAND_SHIFT) - 1;

/// Number of distinct command values a device can receive.
pub const COMMAND_SLOTS: usize = 128;

/// One 64-bit mailbox value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MailboxWord(u64);

impl MailboxWord {
    /// The "nothing pending" value.
    pub const EMPTY: MailboxWord = MailboxWord(0);

    /// Build a word, rejecting fields that do not fit.
    pub fn new(device: u8, command: u8, payload: u64) -> Result<Self> {
        if command as u64 > COMMAND_MASK {
            return Err(PacketError::FieldOverflow {
                field: "command",
                value: command as u64,
                bits: 7,
            });
        }
        if payload > PAYLOAD_MASK {
            return Err(PacketError::FieldOverflow {
                field: "payload",
                value: payload,
                bits: 48,
            });
        }
        Ok(Self(
            (device as u64) << DEVICE_SHIFT | (command as u64) << COMMAND_SHIFT | payload,
        ))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn device(self) -> u8 {
        (self.0 >> DEVICE_SHIFT) as u8
    }

    pub const fn command(self) -> u8 {
        ((self.0 >> COMMAND_SHIFT) & COMMAND_MASK) as u8
    }

    pub const fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    pub const fn is_interrupt(self) -> bool {
        self.0 & INTERRUPT_BIT != 0
    }

    /// Same word with the interrupt flag set.
    pub const fn with_interrupt(self) -> Self {
        Self(self.0 | INTERRUPT_BIT)
    }

    /// Same device, command and interrupt flag with a new payload.
    ///
    /// Payload bits above 47 are discarded.
    pub const fn with_payload(self, payload: u64) -> Self {
        Self((self.0 & !PAYLOAD_MASK) | (payload & PAYLOAD_MASK))
    }
}

impl From<u64> for MailboxWord {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<MailboxWord> for u64 {
    fn from(word: MailboxWord) -> Self {
        word.0
    }
}

impl std::fmt::Display for MailboxWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dev={} cmd={} payload={:#x}{}",
            self.device(),
            self.command(),
            self.payload(),
            if self.is_interrupt() { " irq" } else { "" }
        )
    }
}
