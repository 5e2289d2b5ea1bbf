// Licensed under the Apache-2.0 license

//! Burst-transaction peripheral framework.
//!
//! One generic chunked-transfer engine ([`burst`]) drives five register-level
//! hardware controllers: a multi-bank I2C master, a parallel-NOR flash
//! interface, two SPI variants and a JTAG TAP shifter. Everything below the
//! controllers is abstracted behind [`regs::RegisterInterface`]; everything
//! above them (PCI, DMA, interrupt dispatch, the ioctl surface) stays in the
//! surrounding driver.
//!
//! Mutual exclusion is the caller's job: each controller expects to be driven
//! through an exclusive `&mut` borrow for the whole duration of one burst.

// Prevent panic-prone patterns in production code only
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::indexing_slicing))]
#![cfg_attr(not(test), warn(clippy::expect_used))]
#![cfg_attr(not(test), no_std)]

pub mod bpi;
pub mod burst;
pub mod common;
pub mod debug;
pub mod error;
pub mod i2c;
pub mod jtag;
pub mod regs;
pub mod spi;

pub use burst::{BurstFlags, BurstHeader, BurstKind, BurstShots, BurstTransfers};
pub use error::{Error, Result};
pub use regs::RegisterInterface;
