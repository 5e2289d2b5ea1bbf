// Licensed under the Apache-2.0 license

//! Bit-banged dual/quad SPI over discrete GPIO lines.
//!
//! Two distinct access paths share the pins. Chip access clocks one bit at
//! a time on the single serial line, MSB first. Data access is quad-only:
//! four data lines driven as two pair registers move a nibble per clock.
//! The two paths are steered by the `QUAD` and `DATA_ACCESS` burst flags,
//! which must be set together or not at all; a lone flag is a caller error
//! and fails before any register is touched.

use crate::burst::{BurstFlags, BurstLimits, BurstShots, ShotCtx};
use crate::common::{Logger, NoOpLogger};
use crate::error::{Error, Result};
use crate::regs::RegisterInterface;

mod reg {
    /// Flash/chip-select latch.
    pub const FLASH_SELECT: u32 = 0x0;
    /// Serial clock and single data line; MISO on read.
    pub const CONTROL: u32 = 0x4;
    /// Quad lines IO0/IO1.
    pub const DATA_PAIR_LOW: u32 = 0x8;
    /// Quad lines IO2/IO3; a write here strobes the data-access clock.
    pub const DATA_PAIR_HIGH: u32 = 0xC;
}

mod line {
    pub const CLOCK: u32 = 1 << 0;
    pub const MOSI: u32 = 1 << 1;
    /// Input bit sampled from the control register.
    pub const MISO: u32 = 1 << 2;
    /// Two data-line bits in a pair register.
    pub const PAIR_MASK: u32 = 0b11 << 1;
    pub const PAIR_SHIFT: u32 = 1;
}

const SELECT_BIT: u32 = 1 << 0;

/// Latch-settling repeat counts for a chip-select transition.
const SELECT_SETTLE_WRITES: usize = 5;
const CONTROL_SETTLE_WRITES: usize = 10;

/// Board-declaration facts for the bit-banged attachment.
#[derive(Debug, Clone, Copy)]
pub struct SpiDualConfig {
    /// Base address of the GPIO register window.
    pub base: u32,
}

pub struct SpiDualController<R: RegisterInterface, L: Logger = NoOpLogger> {
    regs: R,
    logger: L,
    config: SpiDualConfig,
    chip_selected: bool,
}

impl<R: RegisterInterface, L: Logger> SpiDualController<R, L> {
    /// All timing on this path is settle-by-repetition, so no delay source
    /// is needed.
    pub fn new(regs: R, logger: L, config: SpiDualConfig) -> Self {
        Self {
            regs,
            logger,
            config,
            chip_selected: false,
        }
    }

    fn select_addr(&self) -> u32 {
        self.config.base + reg::FLASH_SELECT
    }

    fn control_addr(&self) -> u32 {
        self.config.base + reg::CONTROL
    }

    fn pair_low_addr(&self) -> u32 {
        self.config.base + reg::DATA_PAIR_LOW
    }

    fn pair_high_addr(&self) -> u32 {
        self.config.base + reg::DATA_PAIR_HIGH
    }

    /// QUAD and DATA_ACCESS come as a pair; anything else is a caller
    /// error that must fail before the wire moves.
    fn validate_flags(flags: BurstFlags) -> Result<()> {
        if flags.contains(BurstFlags::QUAD) != flags.contains(BurstFlags::DATA_ACCESS) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Drives the chip-select latch. The repeat counts are settling
    /// margins of the external latch; writes happen only on actual
    /// transitions.
    fn set_chip_select(&mut self, selected: bool) {
        if self.chip_selected == selected {
            return;
        }
        let select_value = if selected { SELECT_BIT } else { 0 };
        let select_addr = self.select_addr();
        for _ in 0..SELECT_SETTLE_WRITES {
            self.regs.write(select_addr, select_value);
            self.regs.reorder_b2b_barrier();
        }
        let control_addr = self.control_addr();
        for _ in 0..CONTROL_SETTLE_WRITES {
            self.regs.write(control_addr, 0);
            self.regs.reorder_b2b_barrier();
        }
        self.chip_selected = selected;
    }

    /// Clocks one byte out on the single serial line, MSB first.
    fn chip_write_byte(&mut self, byte: u8) {
        let control_addr = self.control_addr();
        for bit in (0..8).rev() {
            let mosi = if byte & (1 << bit) != 0 { line::MOSI } else { 0 };
            self.regs.write(control_addr, mosi);
            self.regs.reorder_b2b_barrier();
            self.regs.write(control_addr, mosi | line::CLOCK);
            self.regs.reorder_b2b_barrier();
            // Hold the high phase one extra write.
            self.regs.write(control_addr, mosi | line::CLOCK);
            self.regs.reorder_b2b_barrier();
            self.regs.write(control_addr, mosi);
            self.regs.reorder_b2b_barrier();
        }
    }

    /// Clocks one byte in on the single serial line, MSB first.
    fn chip_read_byte(&mut self) -> u8 {
        let control_addr = self.control_addr();
        let mut byte = 0u8;
        for _ in 0..8 {
            self.regs.write(control_addr, 0);
            self.regs.reorder_b2b_barrier();
            self.regs.write(control_addr, line::CLOCK);
            self.regs.reorder_b2b_barrier();
            let sampled = self.regs.read(control_addr) & line::MISO != 0;
            byte = (byte << 1) | u8::from(sampled);
            self.regs.write(control_addr, 0);
            self.regs.reorder_b2b_barrier();
        }
        byte
    }

    /// Moves two bytes out over the four data lines: one nibble per clock,
    /// split across the two pair registers, high nibble first.
    fn data_write_word(&mut self, low: u8, high: u8) {
        let word = (u16::from(high) << 8) | u16::from(low);
        let pair_low = self.pair_low_addr();
        let pair_high = self.pair_high_addr();
        for nibble_index in (0..4).rev() {
            let nibble = (word >> (4 * nibble_index)) & 0xF;
            let low_pair = u32::from(nibble & 0b11) << line::PAIR_SHIFT;
            let high_pair = u32::from((nibble >> 2) & 0b11) << line::PAIR_SHIFT;
            self.regs.write(pair_low, low_pair);
            self.regs.reorder_b2b_barrier();
            // The high-pair write carries the clock strobe.
            self.regs.write(pair_high, high_pair | line::CLOCK);
            self.regs.reorder_b2b_barrier();
        }
    }

    /// Moves two bytes in over the four data lines.
    fn data_read_word(&mut self) -> (u8, u8) {
        let pair_low = self.pair_low_addr();
        let pair_high = self.pair_high_addr();
        let mut word = 0u16;
        for _ in 0..4 {
            self.regs.write(pair_high, line::CLOCK);
            self.regs.reorder_b2b_barrier();
            let low_pair = (self.regs.read(pair_low) & line::PAIR_MASK) >> line::PAIR_SHIFT;
            let high_pair = (self.regs.read(pair_high) & line::PAIR_MASK) >> line::PAIR_SHIFT;
            word = (word << 4) | ((high_pair as u16) << 2) | low_pair as u16;
            self.regs.write(pair_high, 0);
            self.regs.reorder_b2b_barrier();
        }
        ((word & 0xFF) as u8, (word >> 8) as u8)
    }
}

impl<R: RegisterInterface, L: Logger> BurstShots for SpiDualController<R, L> {
    fn limits(&self, flags: BurstFlags) -> BurstLimits {
        // Data access moves 16 bits per shot, chip access one byte.
        let shot = if flags.contains(BurstFlags::DATA_ACCESS) {
            2
        } else {
            1
        };
        BurstLimits {
            max_bytes_per_write: shot,
            max_bytes_per_read: shot,
            write_queue_size: 1,
            read_queue_size: 1,
        }
    }

    fn handle_pre_burst_flags(&mut self, ctx: &ShotCtx) -> Result<()> {
        Self::validate_flags(ctx.flags)?;
        if ctx.flags_set(BurstFlags::SELECT) {
            self.set_chip_select(true);
        }
        Ok(())
    }

    fn handle_post_burst_flags(&mut self, ctx: &ShotCtx) -> Result<()> {
        Self::validate_flags(ctx.flags)?;
        if ctx.flags_set(BurstFlags::DESELECT) {
            self.set_chip_select(false);
        }
        Ok(())
    }

    fn write_shot(&mut self, ctx: &ShotCtx, data: &[u8]) -> Result<()> {
        Self::validate_flags(ctx.flags)?;
        if ctx.flags_set(BurstFlags::DATA_ACCESS) {
            let low = *data.first().ok_or(Error::InvalidArgument)?;
            let high = data.get(1).copied().unwrap_or(0);
            self.data_write_word(low, high);
        } else {
            let byte = *data.first().ok_or(Error::InvalidArgument)?;
            self.chip_write_byte(byte);
        }
        Ok(())
    }

    fn request_read(&mut self, ctx: &ShotCtx, _len: usize) -> Result<()> {
        // Bit-banged: nothing to queue, the read happens in the shot.
        Self::validate_flags(ctx.flags)
    }

    fn read_shot(&mut self, ctx: &ShotCtx, buf: &mut [u8]) -> Result<()> {
        Self::validate_flags(ctx.flags)?;
        if ctx.flags_set(BurstFlags::DATA_ACCESS) {
            let (low, high) = self.data_read_word();
            *buf.first_mut().ok_or(Error::InvalidArgument)? = low;
            if let Some(slot) = buf.get_mut(1) {
                *slot = high;
            }
        } else {
            let byte = self.chip_read_byte();
            *buf.first_mut().ok_or(Error::InvalidArgument)? = byte;
        }
        Ok(())
    }

    fn wait_for_write_queue_empty(&mut self) -> Result<()> {
        // Every bit is on the wire before the shot returns.
        Ok(())
    }

    fn burst_aborted(&mut self) {
        self.logger
            .warn(format_args!("spi-dual: burst aborted, releasing chip select"));
        self.set_chip_select(false);
    }

    fn cleanup(&mut self) {
        self.set_chip_select(false);
    }
}
