// Licensed under the Apache-2.0 license

//! Error taxonomy shared by the burst engine and all controllers.
//!
//! Statuses propagate immediately and verbatim: every layer returns on the
//! first failure and the outermost burst call surfaces exactly what the
//! failing layer observed. The engine never retries; the single documented
//! retry (the BPI double bank-write) lives in the BPI controller itself.

/// Failure outcome of a burst or a controller operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed caller input: bad bank number, zero-length buffer,
    /// contradictory flag combination.
    InvalidArgument,
    /// The requested burst kind or command is not supported by this
    /// controller.
    InvalidOperation,
    /// A required precondition is missing, e.g. an I2C operation with no
    /// active bus.
    InvalidState,
    /// Observed hardware fault that survived any controller-specific retry.
    DeviceIo,
    /// A bounded poll exceeded its deadline.
    Timeout,
    /// The I2C slave did not acknowledge. A meaningful outcome of ACK
    /// polling, distinct from a generic failure.
    NoAck,
}

pub type Result<T> = core::result::Result<T, Error>;

impl embedded_hal::i2c::Error for Error {
    fn kind(&self) -> embedded_hal::i2c::ErrorKind {
        use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
        match self {
            Error::NoAck => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
            Error::DeviceIo => ErrorKind::Bus,
            _ => ErrorKind::Other,
        }
    }
}
