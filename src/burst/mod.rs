// Licensed under the Apache-2.0 license

//! Burst transaction model.
//!
//! A burst is one logical read, write, state-change or command transaction,
//! possibly split into multiple hardware-sized shots. The chunking itself is
//! generic ([`engine`]); everything hardware-specific happens in the
//! [`BurstShots`] callbacks each controller implements.

use bitflags::bitflags;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

mod engine;

pub use engine::{BurstShots, BurstTransfers};

/// What a burst does. Fixed for the whole burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstKind {
    Read,
    Write,
    StateChange,
    CommandExec,
}

bitflags! {
    /// Flag word steering pre/post-burst behaviour and per-shot framing.
    ///
    /// The low bits are shared wire-protocol concerns; bits 16 and up are
    /// interpreted by the JTAG controller only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BurstFlags: u32 {
        /// Drive an I2C START with the first shot.
        const START = 1 << 0;
        /// Drive an I2C STOP with the last shot.
        const STOP = 1 << 1;
        /// Suppress no-acknowledge error logging (ACK polling loops).
        const ACK_POLL = 1 << 2;
        /// Assert chip select before the first shot.
        const SELECT = 1 << 4;
        /// Release chip select after the last shot.
        const DESELECT = 1 << 5;
        /// Four-line data phase.
        const QUAD = 1 << 6;
        /// Bulk transfer on the dedicated data lines.
        const DATA_ACCESS = 1 << 7;
        /// Latch the transfer address before the first shot.
        const LOAD_ADDRESS = 1 << 8;
        /// Poll the device ready bit after the last shot.
        const WAIT_READY = 1 << 9;
        /// Shift through the instruction register instead of the data
        /// register.
        const SHIFT_IR = 1 << 16;
        /// Raw TAP access: the data stream carries no state framing.
        const RAW = 1 << 17;
        /// Least-significant bit first.
        const LSB_FIRST = 1 << 18;
        /// Leave the shift state with the final bit.
        const EXIT_SHIFT = 1 << 19;
        /// Synthesized raw-mode TMS fill is all-ones instead of all-zeroes.
        const TMS_HIGH_FILL = 1 << 20;
        /// Move the TAP to Test-Logic-Reset (state-change bursts).
        const TAP_RESET = 1 << 21;
        /// Move the TAP to Run-Test/Idle (state-change bursts).
        const TAP_IDLE = 1 << 22;
    }
}

/// One logical transfer request, as handed down from the transaction layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstHeader {
    pub kind: BurstKind,
    pub flags: BurstFlags,
    /// Payload length in bytes; zero for state changes.
    pub length: usize,
}

impl BurstHeader {
    pub fn new(kind: BurstKind, flags: BurstFlags, length: usize) -> Self {
        Self {
            kind,
            flags,
            length,
        }
    }

    pub fn read(flags: BurstFlags, length: usize) -> Self {
        Self::new(BurstKind::Read, flags, length)
    }

    pub fn write(flags: BurstFlags, length: usize) -> Self {
        Self::new(BurstKind::Write, flags, length)
    }

    pub fn state_change(flags: BurstFlags) -> Self {
        Self::new(BurstKind::StateChange, flags, 0)
    }

    pub fn command(flags: BurstFlags, length: usize) -> Self {
        Self::new(BurstKind::CommandExec, flags, length)
    }
}

/// Fixed-size head of a command-execution payload.
///
/// Parsed straight off the opaque byte payload; whatever follows the header
/// is forwarded to the controller untouched.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct CommandHeader {
    pub command_id: U32,
    pub argument: U32,
}

/// Per-shot view of the open burst handed to every controller callback.
///
/// Exists only for the duration of one engine call, which is what makes two
/// concurrently open bursts on one controller unrepresentable.
#[derive(Debug, Clone, Copy)]
pub struct ShotCtx {
    pub flags: BurstFlags,
    pub is_first_shot: bool,
    pub is_last_shot: bool,
}

impl ShotCtx {
    /// True when every bit of `mask` is set on the open burst.
    #[must_use]
    pub fn flags_set(&self, mask: BurstFlags) -> bool {
        self.flags.contains(mask)
    }
}

/// Chunking geometry a controller reports for a given flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstLimits {
    /// Largest write shot in bytes.
    pub max_bytes_per_write: usize,
    /// Largest read shot in bytes.
    pub max_bytes_per_read: usize,
    /// Write shots between two queue drains.
    pub write_queue_size: usize,
    /// Read requests kept in flight ahead of the consumer.
    pub read_queue_size: usize,
}
