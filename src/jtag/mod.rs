// Licensed under the Apache-2.0 license

//! JTAG TAP shifter.
//!
//! The hardware moves 16 TDI/TMS bit pairs per cycle: one data-register
//! write carries both halfwords, a count write triggers the shift, and the
//! captured TDO bits come back through the same data register. On top of
//! that sit the TAP state walks of [`states`] and two transfer modes:
//! state-scoped shifts through ShiftDR/ShiftIR, and raw mode where the
//! caller owns the TMS stream (or, for reads, has a constant fill
//! synthesized).

use embedded_hal::delay::DelayNs;
use fugit::{HertzU32, MillisDurationU32};

use crate::burst::{BurstFlags, BurstLimits, BurstShots, ShotCtx};
use crate::common::{poll_until, Logger, NoOpLogger};
use crate::error::{Error, Result};
use crate::regs::RegisterInterface;

mod states;

pub use states::{JtagState, TmsPath};

mod reg {
    pub const PRESCALER: u32 = 0x0;
    /// Busy flag on read.
    pub const CONTROL: u32 = 0x4;
    /// TDI low halfword + TMS high halfword on write; TDO on read.
    pub const DATA: u32 = 0x8;
    /// Bit count of the cycle; the write triggers the shift.
    pub const COUNT: u32 = 0xC;
}

mod sts {
    pub const BUSY: u32 = 1 << 31;
}

/// TDI/TMS bit pairs moved per hardware cycle.
const BITS_PER_CYCLE: usize = 16;
const TMS_SHIFT: u32 = 16;

/// Width of the prescaler field.
const PRESCALER_WIDTH: u32 = 4;
const PRESCALER_MAX: u32 = (1 << PRESCALER_WIDTH) - 1;

/// Raw transfers are bounded by the owned scratch.
pub const MAX_RAW_BITS: usize = 4096;
const SCRATCH_BYTES: usize = MAX_RAW_BITS / 8;

const SHIFT_TIMEOUT: MillisDurationU32 = MillisDurationU32::millis(100);

/// Board-declaration facts for the TAP attachment.
#[derive(Debug, Clone, Copy)]
pub struct JtagConfig {
    /// Base address of the register window.
    pub base: u32,
    /// Input clock ahead of the prescaler.
    pub clock: HertzU32,
}

/// Length unit of a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    Bits,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// Constant TMS level synthesized for raw reads without a caller stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmsFill {
    Low,
    High,
}

/// Register a state-scoped shift goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftRegister {
    Data,
    Instruction,
}

/// How the TDI stream is framed on the wire.
pub enum TransferMode<'a> {
    /// Walk to ShiftDR/ShiftIR first; optionally leave with the final bit.
    Shift { register: ShiftRegister, exit: bool },
    /// The caller owns the TMS stream. `None` is only valid for reads,
    /// which get a constant `fill` synthesized instead.
    Raw {
        tms: Option<&'a [u8]>,
        fill: TmsFill,
    },
}

/// One transfer request: length unit, bit order and mode are independent
/// axes.
pub struct JtagTransfer<'a> {
    pub length: usize,
    pub unit: LengthUnit,
    pub order: BitOrder,
    pub mode: TransferMode<'a>,
}

/// Owned raw-mode buffers: synthesized TMS and captured TDO.
///
/// Replaced on every raw transfer, cleared at teardown.
#[derive(Default)]
struct JtagScratch {
    tms: heapless::Vec<u8, SCRATCH_BYTES>,
    capture: heapless::Vec<u8, SCRATCH_BYTES>,
    valid_bits: usize,
}

impl JtagScratch {
    fn reset(&mut self) {
        self.tms.clear();
        self.capture.clear();
        self.valid_bits = 0;
    }
}

pub struct JtagController<R: RegisterInterface, D: DelayNs, L: Logger = NoOpLogger> {
    regs: R,
    delay: D,
    logger: L,
    config: JtagConfig,
    state: JtagState,
    scratch: JtagScratch,
}

impl<R: RegisterInterface, D: DelayNs, L: Logger> JtagController<R, D, L> {
    pub fn new(regs: R, delay: D, logger: L, config: JtagConfig) -> Self {
        Self {
            regs,
            delay,
            logger,
            config,
            state: JtagState::Invalid,
            scratch: JtagScratch::default(),
        }
    }

    pub fn state(&self) -> JtagState {
        self.state
    }

    /// Programs the largest prescaler output not exceeding `requested` and
    /// returns the achieved frequency.
    ///
    /// The divider space is CLK/2^(n+1); n grows until the halved clock
    /// divided by 2^n fits, capped by the prescaler field width.
    pub fn set_frequency(&mut self, requested: HertzU32) -> Result<HertzU32> {
        if requested.raw() == 0 {
            return Err(Error::InvalidArgument);
        }
        let half = self.config.clock.raw() / 2;
        let mut n = 0;
        while half / (1 << n) > requested.raw() && n < PRESCALER_MAX {
            n += 1;
        }
        self.regs.write(self.config.base + reg::PRESCALER, n);
        self.regs.reorder_barrier();
        Ok(HertzU32::from_raw(half >> n))
    }

    /// Walks the TAP to `target`.
    ///
    /// The first walk out of `Invalid` always starts with the five-one
    /// synchronizing reset, whatever the target; staying in the current
    /// state performs no register access.
    pub fn set_state(&mut self, target: JtagState) -> Result<()> {
        if target == JtagState::Invalid {
            return Err(Error::InvalidArgument);
        }
        if self.state == JtagState::Invalid {
            self.shift_tms(states::RESET_PATH)?;
            self.state = JtagState::Reset;
        }
        if self.state == target {
            return Ok(());
        }
        let path = states::TRANSITIONS[self.state.index()][target.index()]
            .ok_or(Error::InvalidArgument)?;
        if path.len > 0 {
            self.shift_tms(path)?;
        }
        self.state = target;
        Ok(())
    }

    /// Releases the scratch buffers and forgets the TAP position.
    pub fn teardown(&mut self) {
        self.scratch.reset();
        self.state = JtagState::Invalid;
    }

    /// TDO bits captured by the last raw transfer.
    pub fn last_capture(&self) -> (&[u8], usize) {
        (&self.scratch.capture, self.scratch.valid_bits)
    }

    /// Shifts `data` out and captures TDO into `read` when given.
    pub fn write(
        &mut self,
        transfer: &JtagTransfer<'_>,
        data: &[u8],
        read: Option<&mut [u8]>,
    ) -> Result<()> {
        let bits = match transfer.unit {
            LengthUnit::Bits => transfer.length,
            LengthUnit::Bytes => transfer.length * 8,
        };
        if bits == 0 || bits > data.len() * 8 {
            return Err(Error::InvalidArgument);
        }
        if let Some(buf) = &read {
            if buf.len() * 8 < bits {
                return Err(Error::InvalidArgument);
            }
        }
        match &transfer.mode {
            TransferMode::Shift { register, exit } => {
                let target = match register {
                    ShiftRegister::Data => JtagState::ShiftDr,
                    ShiftRegister::Instruction => JtagState::ShiftIr,
                };
                self.set_state(target)?;
                self.shift_payload(data, read, bits, transfer.order, *exit)?;
                if *exit {
                    self.state = JtagState::Exit;
                }
                Ok(())
            }
            TransferMode::Raw { tms, fill } => {
                self.raw_transfer(data, read, bits, transfer.order, *tms, *fill)
            }
        }
    }

    /// State-scoped shift: TMS stays low, except for the final bit when the
    /// transfer leaves the shift state.
    fn shift_payload(
        &mut self,
        data: &[u8],
        mut read: Option<&mut [u8]>,
        bits: usize,
        order: BitOrder,
        exit: bool,
    ) -> Result<()> {
        let mut done = 0;
        while done < bits {
            let chunk = (bits - done).min(BITS_PER_CYCLE);
            let tdi = gather_bits(data, done, chunk, order);
            let last = done + chunk == bits;
            let tms = if last && exit { 1 << (chunk - 1) } else { 0 };
            let tdo = self.run_cycle(tdi, tms, chunk)?;
            if let Some(buf) = read.as_deref_mut() {
                scatter_bits(buf, done, chunk, tdo, order);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Raw transfer: the TMS stream rides beside the data, bit for bit.
    ///
    /// With no caller stream, reads get a constant fill synthesized into
    /// the owned scratch; raw writes must bring their own TMS. The TAP
    /// position is unknown afterwards.
    fn raw_transfer(
        &mut self,
        data: &[u8],
        mut read: Option<&mut [u8]>,
        bits: usize,
        order: BitOrder,
        tms: Option<&[u8]>,
        fill: TmsFill,
    ) -> Result<()> {
        if bits > MAX_RAW_BITS {
            return Err(Error::InvalidArgument);
        }
        // Previous raw transfer's buffers die here.
        self.scratch.reset();

        let fill_byte = match fill {
            TmsFill::Low => 0x00,
            TmsFill::High => 0xFF,
        };
        match tms {
            Some(stream) => {
                if stream.len() * 8 < bits {
                    return Err(Error::InvalidArgument);
                }
            }
            None => {
                if read.is_none() {
                    return Err(Error::InvalidArgument);
                }
                for _ in 0..bits.div_ceil(8) {
                    self.scratch
                        .tms
                        .push(fill_byte)
                        .map_err(|_| Error::InvalidArgument)?;
                }
            }
        }

        let capturing = read.is_some();
        let mut done = 0;
        while done < bits {
            let chunk = (bits - done).min(BITS_PER_CYCLE);
            let tdi = gather_bits(data, done, chunk, order);
            let tms_bits = match tms {
                Some(stream) => gather_bits(stream, done, chunk, order),
                None => gather_bits(&self.scratch.tms, done, chunk, order),
            };
            let tdo = self.run_cycle(tdi, tms_bits, chunk)?;
            if let Some(buf) = read.as_deref_mut() {
                scatter_bits(buf, done, chunk, tdo, order);
            }
            done += chunk;
        }

        if capturing {
            if let Some(buf) = read.as_deref_mut() {
                let bytes = bits.div_ceil(8);
                for byte in buf.iter().take(bytes) {
                    self.scratch
                        .capture
                        .push(*byte)
                        .map_err(|_| Error::InvalidArgument)?;
                }
                self.scratch.valid_bits = bits;
            }
        }

        // Arbitrary TMS may have parked the TAP anywhere.
        self.state = JtagState::Invalid;
        Ok(())
    }

    /// Walks a TMS path with TDI held low. Paths fit one cycle by
    /// construction.
    fn shift_tms(&mut self, path: TmsPath) -> Result<()> {
        let mut tms = 0u32;
        for i in 0..path.len {
            let bit = (path.bits >> (path.len - 1 - i)) & 1;
            tms |= u32::from(bit) << i;
        }
        self.run_cycle(0, tms, usize::from(path.len))?;
        Ok(())
    }

    /// One hardware cycle: load the TDI/TMS pair word, trigger with the bit
    /// count, wait, pop TDO.
    fn run_cycle(&mut self, tdi: u32, tms: u32, bits: usize) -> Result<u32> {
        debug_assert!(bits >= 1 && bits <= BITS_PER_CYCLE);
        self.regs
            .write(self.config.base + reg::DATA, (tdi & 0xFFFF) | (tms << TMS_SHIFT));
        self.regs.reorder_b2b_barrier();
        self.regs.write(self.config.base + reg::COUNT, bits as u32);
        self.regs.reorder_barrier();
        let control_addr = self.config.base + reg::CONTROL;
        poll_until(&mut self.delay, SHIFT_TIMEOUT, || {
            (self.regs.read(control_addr) & sts::BUSY == 0).then_some(())
        })?;
        Ok(self.regs.read(self.config.base + reg::DATA) & 0xFFFF)
    }
}

/// Collects `count` bits of `data` starting at bit `offset` into
/// cycle order (bit 0 shifts first).
fn gather_bits(data: &[u8], offset: usize, count: usize, order: BitOrder) -> u32 {
    let mut word = 0u32;
    for i in 0..count {
        let global = offset + i;
        let byte = data.get(global / 8).copied().unwrap_or(0);
        let bit = match order {
            BitOrder::LsbFirst => (byte >> (global % 8)) & 1,
            BitOrder::MsbFirst => (byte >> (7 - global % 8)) & 1,
        };
        word |= u32::from(bit) << i;
    }
    word
}

/// Spreads `count` captured bits back into `buf` starting at bit `offset`.
fn scatter_bits(buf: &mut [u8], offset: usize, count: usize, word: u32, order: BitOrder) {
    for i in 0..count {
        let global = offset + i;
        let Some(byte) = buf.get_mut(global / 8) else {
            return;
        };
        let position = match order {
            BitOrder::LsbFirst => global % 8,
            BitOrder::MsbFirst => 7 - global % 8,
        };
        let mask = 1u8 << position;
        if word & (1 << i) != 0 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

impl<R: RegisterInterface, D: DelayNs, L: Logger> BurstShots for JtagController<R, D, L> {
    fn limits(&self, _flags: BurstFlags) -> BurstLimits {
        BurstLimits {
            max_bytes_per_write: 64,
            max_bytes_per_read: 64,
            write_queue_size: 1,
            read_queue_size: 1,
        }
    }

    fn handle_pre_burst_flags(&mut self, ctx: &ShotCtx) -> Result<()> {
        if ctx.flags_set(BurstFlags::TAP_RESET) {
            self.set_state(JtagState::Reset)?;
        }
        if ctx.flags_set(BurstFlags::TAP_IDLE) {
            self.set_state(JtagState::Idle)?;
        }
        Ok(())
    }

    fn handle_post_burst_flags(&mut self, _ctx: &ShotCtx) -> Result<()> {
        Ok(())
    }

    fn write_shot(&mut self, ctx: &ShotCtx, data: &[u8]) -> Result<()> {
        if ctx.flags_set(BurstFlags::RAW) {
            // Raw writes need an explicit TMS stream; that only fits the
            // direct transfer API.
            return Err(Error::InvalidOperation);
        }
        let order = burst_order(ctx.flags);
        let target = burst_register(ctx.flags);
        self.set_state(target)?;
        let exit = ctx.is_last_shot && ctx.flags_set(BurstFlags::EXIT_SHIFT);
        self.shift_payload(data, None, data.len() * 8, order, exit)?;
        if exit {
            self.state = JtagState::Exit;
        }
        Ok(())
    }

    fn request_read(&mut self, _ctx: &ShotCtx, _len: usize) -> Result<()> {
        // The shifter is synchronous; the shot itself does the work.
        Ok(())
    }

    fn read_shot(&mut self, ctx: &ShotCtx, buf: &mut [u8]) -> Result<()> {
        let order = burst_order(ctx.flags);
        let bits = buf.len() * 8;
        let tdi = [0u8; 64];
        let tdi = tdi.get(..buf.len()).ok_or(Error::InvalidArgument)?;
        if ctx.flags_set(BurstFlags::RAW) {
            let fill = if ctx.flags_set(BurstFlags::TMS_HIGH_FILL) {
                TmsFill::High
            } else {
                TmsFill::Low
            };
            return self.raw_transfer(tdi, Some(buf), bits, order, None, fill);
        }
        let target = burst_register(ctx.flags);
        self.set_state(target)?;
        let exit = ctx.is_last_shot && ctx.flags_set(BurstFlags::EXIT_SHIFT);
        self.shift_payload(tdi, Some(buf), bits, order, exit)?;
        if exit {
            self.state = JtagState::Exit;
        }
        Ok(())
    }

    fn wait_for_write_queue_empty(&mut self) -> Result<()> {
        // run_cycle already waited out the busy flag.
        Ok(())
    }

    fn burst_aborted(&mut self) {
        self.logger
            .warn(format_args!("jtag: burst aborted, tap position unknown"));
        self.state = JtagState::Invalid;
    }

    fn cleanup(&mut self) {
        self.teardown();
    }
}

fn burst_order(flags: BurstFlags) -> BitOrder {
    if flags.contains(BurstFlags::LSB_FIRST) {
        BitOrder::LsbFirst
    } else {
        BitOrder::MsbFirst
    }
}

fn burst_register(flags: BurstFlags) -> JtagState {
    if flags.contains(BurstFlags::SHIFT_IR) {
        JtagState::ShiftIr
    } else {
        JtagState::ShiftDr
    }
}
