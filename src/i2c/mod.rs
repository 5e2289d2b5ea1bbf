// Licensed under the Apache-2.0 license

//! Multi-bank I2C master.
//!
//! One physical core serves up to eight banks ("busses"); every register
//! access mixes the active bank's select bits into the address byte. The
//! per-bank [`I2cBusController`] is the burst-facing view, multiplexing N
//! logical busses over the one shared [`I2cMasterCore`].

pub mod bus;
pub mod core;

pub use bus::I2cBusController;
pub use core::{
    bus_to_core, core_to_bus, I2cBusConfig, I2cBusConfigBuilder, I2cCoreConfig, I2cMasterCore,
    MAX_BUSSES,
};
