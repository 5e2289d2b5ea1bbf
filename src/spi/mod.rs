// Licensed under the Apache-2.0 license

//! SPI controllers.
//!
//! Two unrelated attachments share this module: [`v2`] is a register-mapped
//! engine driven through one 32-bit control word, [`dual`] bit-bangs
//! discrete GPIO lines and adds a quad-line bulk data path.

pub mod dual;
pub mod v2;

pub use dual::{SpiDualConfig, SpiDualController};
pub use v2::{SpiV2Config, SpiV2Controller};
