// Licensed under the Apache-2.0 license

//! Shared driver plumbing: logging and bounded polling.

use core::fmt;

use embedded_hal::delay::DelayNs;
use embedded_io::Write as _;
use fugit::MillisDurationU32;

use crate::error::{Error, Result};

/// Severity of a driver log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "E",
            LogLevel::Warn => "W",
            LogLevel::Info => "I",
            LogLevel::Debug => "D",
        }
    }
}

/// Diagnostic sink threaded through every controller.
///
/// Controllers default to [`NoOpLogger`]; boards that want driver logs route
/// a [`WriteLogger`] at a UART or any other byte sink.
pub trait Logger {
    fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>);

    fn error(&mut self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, args);
    }

    fn warn(&mut self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Warn, args);
    }

    fn info(&mut self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, args);
    }

    fn debug(&mut self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Debug, args);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&mut self, _level: LogLevel, _args: fmt::Arguments<'_>) {}
}

/// Routes log lines to an [`embedded_io::Write`] sink.
pub struct WriteLogger<W: embedded_io::Write> {
    sink: W,
    max_level: LogLevel,
}

impl<W: embedded_io::Write> WriteLogger<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            max_level: LogLevel::Info,
        }
    }

    /// Keeps lines up to and including `level`.
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.max_level = level;
        self
    }
}

impl<W: embedded_io::Write> Logger for WriteLogger<W> {
    fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>) {
        if level > self.max_level {
            return;
        }
        let _ = write!(self.sink, "[{}] {args}\r\n", level.tag());
    }
}

/// Spacing between poll iterations in the bounded wait loops.
pub(crate) const POLL_INTERVAL_US: u32 = 10;

/// Polls `ready` until it yields a value or `timeout` elapses.
///
/// Purely software-timed: the deadline is accumulated from the delays slept
/// between iterations, so the caller needs no clock source beyond `delay`.
pub(crate) fn poll_until<T, F>(
    delay: &mut impl DelayNs,
    timeout: MillisDurationU32,
    mut ready: F,
) -> Result<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline_us = u64::from(timeout.to_millis()) * 1_000;
    let mut waited_us = 0u64;
    loop {
        if let Some(value) = ready() {
            return Ok(value);
        }
        if waited_us >= deadline_us {
            return Err(Error::Timeout);
        }
        delay.delay_us(POLL_INTERVAL_US);
        waited_us += u64::from(POLL_INTERVAL_US);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::mock::TestDelay;

    #[test]
    fn poll_until_returns_first_ready_value() {
        let mut delay = TestDelay;
        let mut calls = 0;
        let result = poll_until(&mut delay, MillisDurationU32::millis(10), || {
            calls += 1;
            (calls == 3).then_some(0xABu32)
        });
        assert_eq!(result, Ok(0xAB));
        assert_eq!(calls, 3);
    }

    #[test]
    fn poll_until_times_out() {
        let mut delay = TestDelay;
        let result: Result<()> = poll_until(&mut delay, MillisDurationU32::millis(1), || None);
        assert_eq!(result, Err(Error::Timeout));
    }

    #[test]
    fn write_logger_filters_by_level() {
        struct Sink(Vec<u8>);
        impl embedded_io::ErrorType for Sink {
            type Error = core::convert::Infallible;
        }
        impl embedded_io::Write for Sink {
            fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
                self.0.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> core::result::Result<(), Self::Error> {
                Ok(())
            }
        }

        let mut logger = WriteLogger::new(Sink(Vec::new())).with_level(LogLevel::Warn);
        logger.debug(format_args!("dropped"));
        logger.error(format_args!("kept"));
        let text = String::from_utf8(logger.sink.0).unwrap();
        assert_eq!(text, "[E] kept\r\n");
    }
}
