// Licensed under the Apache-2.0 license

//! Shared I2C master core.
//!
//! The register file is a single-byte-FIFO master: one data byte per
//! command, START/STOP qualifiers on the command word, acknowledge status
//! per transfer. Bank selection does not touch the wire; it reroutes the
//! register window by mixing select bits into every register address.

use embedded_hal::delay::DelayNs;
use fugit::{HertzU32, MillisDurationU32};

use crate::common::{poll_until, Logger, NoOpLogger};
use crate::error::{Error, Result};
use crate::regs::RegisterInterface;

/// Register offsets within the core window.
mod reg {
    pub const PRESCALE_LOW: u32 = 0x0;
    pub const PRESCALE_HIGH: u32 = 0x1;
    pub const CONTROL: u32 = 0x2;
    pub const DATA: u32 = 0x3;
    /// Command on write, status on read.
    pub const COMMAND: u32 = 0x4;
    pub const STATUS: u32 = 0x4;
}

mod ctl {
    pub const CORE_ENABLE: u32 = 1 << 7;
}

mod cmd {
    pub const START: u32 = 1 << 7;
    pub const STOP: u32 = 1 << 6;
    pub const READ: u32 = 1 << 5;
    pub const WRITE: u32 = 1 << 4;
    pub const NACK: u32 = 1 << 3;
}

mod sts {
    /// Set when the slave did not acknowledge the last byte.
    pub const NO_ACK: u32 = 1 << 7;
    pub const BUSY: u32 = 1 << 6;
    pub const TRANSFER_IN_PROGRESS: u32 = 1 << 1;
}

/// Banks addressable on one physical core.
pub const MAX_BUSSES: usize = 8;

/// Prescaler values at or above this bound do not fit the two prescale
/// registers and are rejected.
const PRESCALER_LIMIT: u32 = 0x1_0000;

const TRANSFER_TIMEOUT: MillisDurationU32 = MillisDurationU32::millis(100);

/// Derives the clock prescaler for `frequency` from the firmware clock.
pub fn bus_to_core(frequency: HertzU32, fw_clock: HertzU32) -> Result<u32> {
    if frequency.raw() == 0 {
        return Err(Error::InvalidArgument);
    }
    let divisor = fw_clock.raw() / (5 * frequency.raw());
    if divisor == 0 {
        return Err(Error::InvalidArgument);
    }
    let prescaler = divisor - 1;
    if prescaler >= PRESCALER_LIMIT {
        return Err(Error::InvalidArgument);
    }
    Ok(prescaler)
}

/// Inverse of [`bus_to_core`]: the bus frequency a prescaler value yields.
pub fn core_to_bus(prescaler: u32, fw_clock: HertzU32) -> HertzU32 {
    HertzU32::from_raw(fw_clock.raw() / (5 * (prescaler + 1)))
}

/// One addressable bank on a shared core. Read-only after init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cBusConfig {
    pub bank: u8,
    /// Bank-select bits mixed into every register address while active.
    pub activation_bits: u32,
    /// Additional address bit required on stores for this bank.
    pub write_enable_bit: u32,
    pub frequency: HertzU32,
}

/// Builder for [`I2cBusConfig`]; defaults to bank 0 at 100 kHz.
pub struct I2cBusConfigBuilder {
    bank: u8,
    activation_bits: u32,
    write_enable_bit: u32,
    frequency: HertzU32,
}

impl Default for I2cBusConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cBusConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bank: 0,
            activation_bits: 0,
            write_enable_bit: 0,
            frequency: HertzU32::kHz(100),
        }
    }

    #[must_use]
    pub fn bank(mut self, bank: u8) -> Self {
        self.bank = bank;
        self
    }

    #[must_use]
    pub fn activation_bits(mut self, bits: u32) -> Self {
        self.activation_bits = bits;
        self
    }

    #[must_use]
    pub fn write_enable_bit(mut self, bit: u32) -> Self {
        self.write_enable_bit = bit;
        self
    }

    #[must_use]
    pub fn frequency(mut self, frequency: HertzU32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn build(self) -> Result<I2cBusConfig> {
        if usize::from(self.bank) >= MAX_BUSSES {
            return Err(Error::InvalidArgument);
        }
        Ok(I2cBusConfig {
            bank: self.bank,
            activation_bits: self.activation_bits,
            write_enable_bit: self.write_enable_bit,
            frequency: self.frequency,
        })
    }
}

/// Board-declaration facts for one physical core.
#[derive(Debug, Clone, Copy)]
pub struct I2cCoreConfig {
    /// Base address of the register window.
    pub base: u32,
    /// Firmware clock feeding the prescaler.
    pub fw_clock: HertzU32,
}

/// One physical I2C master core, bound to its register window for the
/// lifetime of the peripheral.
pub struct I2cMasterCore<R: RegisterInterface, D: DelayNs, L: Logger = NoOpLogger> {
    pub(crate) regs: R,
    delay: D,
    logger: L,
    config: I2cCoreConfig,
    active_bus: Option<I2cBusConfig>,
}

impl<R: RegisterInterface, D: DelayNs, L: Logger> I2cMasterCore<R, D, L> {
    pub fn new(regs: R, delay: D, logger: L, config: I2cCoreConfig) -> Self {
        Self {
            regs,
            delay,
            logger,
            config,
            active_bus: None,
        }
    }

    /// Bank currently routed to the wire, if any.
    pub fn active_bank(&self) -> Option<u8> {
        self.active_bus.map(|bus| bus.bank)
    }

    fn addr(&self, offset: u32) -> u32 {
        let bank_bits = self.active_bus.map_or(0, |bus| bus.activation_bits);
        self.config.base + (offset | bank_bits)
    }

    fn read_reg(&mut self, offset: u32) -> u32 {
        let addr = self.addr(offset);
        self.regs.read(addr)
    }

    fn write_reg(&mut self, offset: u32, value: u32) {
        let write_bit = self.active_bus.map_or(0, |bus| bus.write_enable_bit);
        let addr = self.addr(offset) | write_bit;
        self.regs.write(addr, value);
    }

    /// Routes `bus` to the wire. Re-activating the already-active bank
    /// performs no register access; an actual switch runs the full
    /// disable/select/reprogram/enable sequence.
    pub fn activate_bus(&mut self, bus: &I2cBusConfig) -> Result<()> {
        if usize::from(bus.bank) >= MAX_BUSSES {
            return Err(Error::InvalidArgument);
        }
        if self.active_bus.map(|b| b.bank) == Some(bus.bank) {
            return Ok(());
        }
        self.disable_core();
        self.active_bus = Some(*bus);
        self.set_frequency(bus.frequency)?;
        self.enable_core()
    }

    /// Drops the bank association; the next activation reprograms from
    /// scratch.
    pub(crate) fn deactivate(&mut self) {
        self.active_bus = None;
    }

    fn disable_core(&mut self) {
        self.write_reg(reg::CONTROL, 0);
        self.regs.reorder_barrier();
    }

    fn enable_core(&mut self) -> Result<()> {
        self.write_reg(reg::CONTROL, ctl::CORE_ENABLE);
        self.regs.reorder_barrier();
        // A stuck slave can hold the bus busy across a reconfiguration;
        // force a STOP to release it before the first real transfer.
        if self.read_reg(reg::STATUS) & sts::BUSY != 0 {
            self.logger
                .warn(format_args!("i2c: bus busy after enable, issuing stop"));
            self.write_reg(reg::COMMAND, cmd::STOP);
            self.regs.reorder_barrier();
            let status_addr = self.addr(reg::STATUS);
            poll_until(&mut self.delay, TRANSFER_TIMEOUT, || {
                (self.regs.read(status_addr) & sts::BUSY == 0).then_some(())
            })?;
        }
        Ok(())
    }

    /// Reprograms the clock prescaler and verifies the write.
    fn set_frequency(&mut self, frequency: HertzU32) -> Result<()> {
        let prescaler = bus_to_core(frequency, self.config.fw_clock)?;
        let low = prescaler & 0xFF;
        let high = (prescaler >> 8) & 0xFF;
        self.write_reg(reg::PRESCALE_LOW, low);
        self.write_reg(reg::PRESCALE_HIGH, high);
        self.regs.reorder_barrier();
        if self.read_reg(reg::PRESCALE_LOW) != low || self.read_reg(reg::PRESCALE_HIGH) != high {
            self.logger
                .error(format_args!("i2c: prescaler readback mismatch"));
            return Err(Error::DeviceIo);
        }
        Ok(())
    }

    fn require_active(&self) -> Result<()> {
        if self.active_bus.is_none() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Writes one byte; START/STOP ride on the same command word.
    ///
    /// Returns [`Error::NoAck`] when the slave did not acknowledge, logged
    /// as an error unless `suppress_nack_log` (ACK polling) is set.
    pub(crate) fn write_byte(
        &mut self,
        byte: u8,
        start: bool,
        stop: bool,
        suppress_nack_log: bool,
    ) -> Result<()> {
        self.require_active()?;
        self.write_reg(reg::DATA, u32::from(byte));
        let mut command = cmd::WRITE;
        if start {
            command |= cmd::START;
        }
        if stop {
            command |= cmd::STOP;
        }
        self.write_reg(reg::COMMAND, command);
        self.regs.reorder_barrier();
        self.wait_transfer_done()?;
        if self.read_reg(reg::STATUS) & sts::NO_ACK != 0 {
            if !suppress_nack_log {
                self.logger
                    .error(format_args!("i2c: no acknowledge from slave"));
            }
            return Err(Error::NoAck);
        }
        Ok(())
    }

    /// Issues the read command for one byte; data is fetched separately by
    /// [`collect_byte`](Self::collect_byte).
    pub(crate) fn request_byte_read(&mut self, start: bool, stop: bool) -> Result<()> {
        self.require_active()?;
        let mut command = cmd::READ;
        if start {
            command |= cmd::START;
        }
        if stop {
            // Final byte: answer with NACK and release the bus.
            command |= cmd::STOP | cmd::NACK;
        }
        self.write_reg(reg::COMMAND, command);
        self.regs.reorder_barrier();
        Ok(())
    }

    /// Waits out the transfer started by the last read request and pops the
    /// received byte.
    pub(crate) fn collect_byte(&mut self) -> Result<u8> {
        self.require_active()?;
        self.wait_transfer_done()?;
        Ok((self.read_reg(reg::DATA) & 0xFF) as u8)
    }

    /// Best-effort STOP, used on abort paths to release the bus.
    pub(crate) fn abort_transfer(&mut self) {
        if self.active_bus.is_some() {
            self.write_reg(reg::COMMAND, cmd::STOP);
            self.regs.reorder_barrier();
        }
    }

    fn wait_transfer_done(&mut self) -> Result<()> {
        let status_addr = self.addr(reg::STATUS);
        poll_until(&mut self.delay, TRANSFER_TIMEOUT, || {
            (self.regs.read(status_addr) & sts::TRANSFER_IN_PROGRESS == 0).then_some(())
        })
    }
}
