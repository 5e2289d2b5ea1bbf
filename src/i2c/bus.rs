// Licensed under the Apache-2.0 license

//! Per-bank view over a shared I2C master core.
//!
//! Controllers for all banks of one core are constructed at probe time and
//! share the core through a `RefCell`; the caller's lock domain guarantees
//! only one of them runs at a time. Each burst call activates the bank at
//! `begin_transaction` and forwards every shot to the core.

use core::cell::{RefCell, RefMut};

use embedded_hal::delay::DelayNs;

use crate::burst::{BurstFlags, BurstLimits, BurstShots, ShotCtx};
use crate::common::{Logger, NoOpLogger};
use crate::error::{Error, Result};
use crate::i2c::core::{I2cBusConfig, I2cMasterCore};
use crate::regs::RegisterInterface;

pub struct I2cBusController<'c, R: RegisterInterface, D: DelayNs, L: Logger = NoOpLogger> {
    core: &'c RefCell<I2cMasterCore<R, D, L>>,
    config: I2cBusConfig,
    in_transaction: bool,
}

impl<'c, R: RegisterInterface, D: DelayNs, L: Logger> I2cBusController<'c, R, D, L> {
    pub fn new(core: &'c RefCell<I2cMasterCore<R, D, L>>, config: I2cBusConfig) -> Self {
        Self {
            core,
            config,
            in_transaction: false,
        }
    }

    pub fn config(&self) -> &I2cBusConfig {
        &self.config
    }

    /// The execution model is non-reentrant under the caller's lock; a
    /// borrow failure means that contract was broken.
    fn core_mut(&self) -> Result<RefMut<'c, I2cMasterCore<R, D, L>>> {
        self.core.try_borrow_mut().map_err(|_| Error::InvalidState)
    }

    /// Activates this controller's bank. Pairs with
    /// [`end_transaction`](Self::end_transaction).
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::InvalidState);
        }
        self.core_mut()?.activate_bus(&self.config)?;
        self.in_transaction = true;
        Ok(())
    }

    /// Closes the transaction. The core keeps the bank selected, so an
    /// immediate follow-up on the same bank skips the reprogramming cycle.
    pub fn end_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::InvalidState);
        }
        self.in_transaction = false;
        Ok(())
    }
}

impl<R: RegisterInterface, D: DelayNs, L: Logger> BurstShots for I2cBusController<'_, R, D, L> {
    fn limits(&self, _flags: BurstFlags) -> BurstLimits {
        // Single-byte hardware FIFO on both paths.
        BurstLimits {
            max_bytes_per_write: 1,
            max_bytes_per_read: 1,
            write_queue_size: 1,
            read_queue_size: 1,
        }
    }

    fn handle_pre_burst_flags(&mut self, _ctx: &ShotCtx) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::InvalidState);
        }
        // START and STOP ride on the first and last data bytes.
        Ok(())
    }

    fn handle_post_burst_flags(&mut self, _ctx: &ShotCtx) -> Result<()> {
        Ok(())
    }

    fn write_shot(&mut self, ctx: &ShotCtx, data: &[u8]) -> Result<()> {
        let byte = *data.first().ok_or(Error::InvalidArgument)?;
        let start = ctx.is_first_shot && ctx.flags_set(BurstFlags::START);
        let stop = ctx.is_last_shot && ctx.flags_set(BurstFlags::STOP);
        self.core_mut()?
            .write_byte(byte, start, stop, ctx.flags_set(BurstFlags::ACK_POLL))
    }

    fn request_read(&mut self, ctx: &ShotCtx, len: usize) -> Result<()> {
        if len != 1 {
            return Err(Error::InvalidArgument);
        }
        let start = ctx.is_first_shot && ctx.flags_set(BurstFlags::START);
        let stop = ctx.is_last_shot && ctx.flags_set(BurstFlags::STOP);
        self.core_mut()?.request_byte_read(start, stop)
    }

    fn read_shot(&mut self, _ctx: &ShotCtx, buf: &mut [u8]) -> Result<()> {
        let byte = self.core_mut()?.collect_byte()?;
        *buf.first_mut().ok_or(Error::InvalidArgument)? = byte;
        Ok(())
    }

    fn wait_for_write_queue_empty(&mut self) -> Result<()> {
        // Depth-1 FIFO: write_byte already waited for completion.
        Ok(())
    }

    fn burst_aborted(&mut self) {
        if let Ok(mut core) = self.core_mut() {
            core.abort_transfer();
        }
    }

    fn cleanup(&mut self) {
        self.in_transaction = false;
        if let Ok(mut core) = self.core_mut() {
            core.abort_transfer();
            core.deactivate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst::{BurstHeader, BurstTransfers};
    use crate::i2c::core::{I2cBusConfigBuilder, I2cCoreConfig};
    use crate::regs::mock::{Access, MockRegs, TestDelay};
    use fugit::HertzU32;

    const BASE: u32 = 0;
    const REG_DATA: u32 = 0x3;
    const REG_COMMAND: u32 = 0x4;

    const CMD_START: u32 = 1 << 7;
    const CMD_STOP: u32 = 1 << 6;
    const CMD_READ: u32 = 1 << 5;
    const CMD_WRITE: u32 = 1 << 4;
    const CMD_NACK: u32 = 1 << 3;

    type Core = RefCell<I2cMasterCore<MockRegs, TestDelay, NoOpLogger>>;

    fn shared_core() -> Core {
        let mut regs = MockRegs::new();
        regs.skip_mirror(BASE + REG_COMMAND);
        RefCell::new(I2cMasterCore::new(
            regs,
            TestDelay,
            NoOpLogger,
            I2cCoreConfig {
                base: BASE,
                fw_clock: HertzU32::MHz(62),
            },
        ))
    }

    fn bus_config() -> I2cBusConfig {
        I2cBusConfigBuilder::new()
            .bank(0)
            .frequency(HertzU32::kHz(100))
            .build()
            .unwrap()
    }

    #[test]
    fn three_byte_write_emits_start_data_stop_sequence() {
        let core = shared_core();
        let mut bus = I2cBusController::new(&core, bus_config());
        bus.begin_transaction().unwrap();
        core.borrow_mut().regs.clear_log();

        let header = BurstHeader::write(BurstFlags::START | BurstFlags::STOP, 3);
        let address_byte = 0x50 << 1;
        bus.write_burst(&header, &[address_byte, 0xDE, 0xAD]).unwrap();
        bus.end_transaction().unwrap();

        let regs = &core.borrow().regs;
        assert_eq!(
            regs.writes_to(BASE + REG_DATA),
            vec![u32::from(address_byte), 0xDE, 0xAD]
        );
        assert_eq!(
            regs.writes_to(BASE + REG_COMMAND),
            vec![CMD_WRITE | CMD_START, CMD_WRITE, CMD_WRITE | CMD_STOP]
        );
    }

    #[test]
    fn read_burst_nacks_and_stops_on_final_byte() {
        let core = shared_core();
        let mut bus = I2cBusController::new(&core, bus_config());
        bus.begin_transaction().unwrap();
        {
            let mut c = core.borrow_mut();
            c.regs.clear_log();
            c.regs.set_latch(BASE + 0x3, 0x5A);
        }

        let header = BurstHeader::read(BurstFlags::START | BurstFlags::STOP, 2);
        let mut buf = [0u8; 2];
        bus.read_burst(&header, &mut buf).unwrap();
        assert_eq!(buf, [0x5A, 0x5A]);

        let regs = &core.borrow().regs;
        assert_eq!(
            regs.writes_to(BASE + REG_COMMAND),
            vec![CMD_READ | CMD_START, CMD_READ | CMD_STOP | CMD_NACK]
        );
    }

    #[test]
    fn burst_without_transaction_is_invalid_state() {
        let core = shared_core();
        let mut bus = I2cBusController::new(&core, bus_config());
        let header = BurstHeader::write(BurstFlags::empty(), 1);
        assert_eq!(bus.write_burst(&header, &[0x00]), Err(Error::InvalidState));
    }

    #[test]
    fn two_bus_views_share_one_core() {
        let core = shared_core();
        let cfg_b = I2cBusConfigBuilder::new()
            .bank(1)
            .activation_bits(1 << 3)
            .frequency(HertzU32::kHz(400))
            .build()
            .unwrap();
        core.borrow_mut().regs.skip_mirror(BASE + (REG_COMMAND | (1 << 3)));

        let mut bus_a = I2cBusController::new(&core, bus_config());
        let mut bus_b = I2cBusController::new(&core, cfg_b);

        bus_a.begin_transaction().unwrap();
        bus_a.end_transaction().unwrap();
        assert_eq!(core.borrow().active_bank(), Some(0));

        bus_b.begin_transaction().unwrap();
        bus_b.end_transaction().unwrap();
        assert_eq!(core.borrow().active_bank(), Some(1));

        // Back on the first bank: a fresh activation cycle runs again.
        core.borrow_mut().regs.clear_log();
        bus_a.begin_transaction().unwrap();
        bus_a.end_transaction().unwrap();
        assert_eq!(core.borrow().active_bank(), Some(0));
        assert!(!core.borrow().regs.log.is_empty());
    }

    #[test]
    fn repeated_transactions_on_same_bank_skip_reactivation() {
        let core = shared_core();
        let mut bus = I2cBusController::new(&core, bus_config());
        bus.begin_transaction().unwrap();
        bus.end_transaction().unwrap();
        core.borrow_mut().regs.clear_log();

        bus.begin_transaction().unwrap();
        bus.end_transaction().unwrap();
        assert!(core.borrow().regs.log.is_empty());
    }

    #[test]
    fn nack_surfaces_from_write_burst() {
        let core = shared_core();
        let mut bus = I2cBusController::new(&core, bus_config());
        bus.begin_transaction().unwrap();
        {
            let mut c = core.borrow_mut();
            let status = BASE + REG_COMMAND;
            c.regs.push_read(status, 0); // transfer done
            c.regs.push_read(status, 1 << 7); // no acknowledge
        }

        let header = BurstHeader::write(BurstFlags::START, 1);
        assert_eq!(bus.write_burst(&header, &[0xA0]), Err(Error::NoAck));
        // The abort path released the bus with a STOP.
        let stops = core
            .borrow()
            .regs
            .log
            .iter()
            .filter(|a| matches!(a, Access::Write(addr, v) if *addr == BASE + REG_COMMAND && *v == CMD_STOP))
            .count();
        assert_eq!(stops, 1);
    }
}
