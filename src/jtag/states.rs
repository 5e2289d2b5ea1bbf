// Licensed under the Apache-2.0 license

//! TAP state bookkeeping: the six-state subset and its transition table.
//!
//! Only the states the shifter actually parks in are modelled; the
//! intermediate TAP states (Select, Capture, Update...) exist solely inside
//! the TMS walks of [`TRANSITIONS`]. The table covers every (from, to)
//! pair; `None` entries are pairs that cannot be walked directly.

/// TAP position tracked by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JtagState {
    /// Unknown position: power-up, teardown, or after a raw transfer.
    Invalid,
    /// Run-Test/Idle.
    Idle,
    ShiftDr,
    ShiftIr,
    /// Exit1 of the register shifted last.
    Exit,
    /// Test-Logic-Reset.
    Reset,
}

impl JtagState {
    pub(crate) const COUNT: usize = 6;

    pub(crate) fn index(self) -> usize {
        match self {
            JtagState::Invalid => 0,
            JtagState::Idle => 1,
            JtagState::ShiftDr => 2,
            JtagState::ShiftIr => 3,
            JtagState::Exit => 4,
            JtagState::Reset => 5,
        }
    }
}

/// TMS pattern for one state walk; bit `len - 1` is driven first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmsPath {
    pub bits: u8,
    pub len: u8,
}

/// Five ones drive any TAP to Test-Logic-Reset, wherever it was.
pub const RESET_PATH: TmsPath = TmsPath { bits: 0x1F, len: 5 };

const fn path(bits: u8, len: u8) -> Option<TmsPath> {
    Some(TmsPath { bits, len })
}

/// Walks for every (from, to) pair, indexed by [`JtagState::index`].
///
/// The `Invalid` row is all `None`: leaving `Invalid` always goes through
/// the [`RESET_PATH`] prefix and continues from the `Reset` row. The
/// `Invalid` column and the unreachable `*→Exit` entries are `None` too;
/// `Exit` is only entered by the final bit of a shift.
pub(crate) const TRANSITIONS: [[Option<TmsPath>; JtagState::COUNT]; JtagState::COUNT] = [
    // from Invalid
    [None, None, None, None, None, None],
    // from Idle
    [
        None,
        path(0x00, 0),
        path(0x04, 3),
        path(0x0C, 4),
        None,
        path(0x07, 3),
    ],
    // from ShiftDr
    [
        None,
        path(0x06, 3),
        path(0x00, 0),
        path(0x3C, 6),
        path(0x01, 1),
        path(0x1F, 5),
    ],
    // from ShiftIr
    [
        None,
        path(0x06, 3),
        path(0x1C, 5),
        path(0x00, 0),
        path(0x01, 1),
        path(0x1F, 5),
    ],
    // from Exit
    [
        None,
        path(0x02, 2),
        path(0x0C, 4),
        path(0x1C, 5),
        path(0x00, 0),
        path(0x1F, 5),
    ],
    // from Reset
    [
        None,
        path(0x00, 1),
        path(0x04, 4),
        path(0x0C, 5),
        None,
        path(0x00, 0),
    ],
];
