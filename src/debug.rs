// Licensed under the Apache-2.0 license

//! Formatting helpers for driver diagnostics.
//!
//! Everything here returns owned strings; no static scratch, so the helpers
//! can be called from any context that holds the controller.

use core::fmt::Write as _;

use heapless::String;

use crate::burst::{BurstHeader, BurstKind};
use crate::jtag::JtagState;

/// Capacity of one formatted description.
pub const DESCRIPTION_LEN: usize = 64;

pub fn burst_kind_name(kind: BurstKind) -> &'static str {
    match kind {
        BurstKind::Read => "read",
        BurstKind::Write => "write",
        BurstKind::StateChange => "state-change",
        BurstKind::CommandExec => "command",
    }
}

/// One-line burst header summary, e.g. `write burst len=3 flags=0x3`.
pub fn describe_burst(header: &BurstHeader) -> String<DESCRIPTION_LEN> {
    let mut out = String::new();
    let _ = write!(
        out,
        "{} burst len={} flags={:#x}",
        burst_kind_name(header.kind),
        header.length,
        header.flags.bits()
    );
    out
}

pub fn jtag_state_name(state: JtagState) -> &'static str {
    match state {
        JtagState::Invalid => "invalid",
        JtagState::Idle => "idle",
        JtagState::ShiftDr => "shift-dr",
        JtagState::ShiftIr => "shift-ir",
        JtagState::Exit => "exit",
        JtagState::Reset => "reset",
    }
}
