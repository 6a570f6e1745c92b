//! Communication with the motion controller
//!
//! Two seams separate the driver from hardware:
//! - [`LineTransport`]: send one command line and wait for the controller's
//!   acknowledgement (or a timeout)
//! - [`ControlLines`]: the out-of-band halt/reset/ISP pins wired to the board,
//!   usable while a command is blocked on the line transport

pub mod serial;
pub mod simulated;

use async_trait::async_trait;
use motionkit_core::Result;
use std::fmt;
use std::time::Duration;

/// Line-oriented request/acknowledge channel to the controller
#[async_trait]
pub trait LineTransport: Send {
    /// Send one newline-free command line and wait up to `timeout` for the
    /// controller to acknowledge it.
    ///
    /// Returns the response text that preceded the acknowledgement. Error
    /// and alarm text is returned as-is; interpreting it is up to the caller.
    async fn send_line(&mut self, line: &str, timeout: Duration) -> Result<String>;

    /// Name of the underlying port, if any
    fn port_name(&self) -> Option<String> {
        None
    }

    /// Release the underlying port
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One of the board's out-of-band signal lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlLine {
    /// Immediately stops motion and puts the controller in alarm
    Halt,
    /// Holds the controller in reset
    Reset,
    /// Selects the bootloader on the next reset
    Isp,
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halt => write!(f, "halt"),
            Self::Reset => write!(f, "reset"),
            Self::Isp => write!(f, "isp"),
        }
    }
}

/// Out-of-band control pins.
///
/// `asserted = true` means the signal is active (the physical pins are
/// active-low; implementations handle the inversion).
pub trait ControlLines: Send + Sync {
    fn set_line(&self, line: ControlLine, asserted: bool) -> Result<()>;

    fn set_halt(&self, asserted: bool) -> Result<()> {
        self.set_line(ControlLine::Halt, asserted)
    }

    fn set_reset(&self, asserted: bool) -> Result<()> {
        self.set_line(ControlLine::Reset, asserted)
    }

    fn set_isp(&self, asserted: bool) -> Result<()> {
        self.set_line(ControlLine::Isp, asserted)
    }
}

/// Control lines for setups without wired pins
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpControlLines;

impl ControlLines for NoOpControlLines {
    fn set_line(&self, line: ControlLine, asserted: bool) -> Result<()> {
        tracing::debug!("No control lines wired, ignoring {} = {}", line, asserted);
        Ok(())
    }
}
