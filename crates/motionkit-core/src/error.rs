//! Error handling for MotionKit
//!
//! Provides the error types shared by the motion driver and the firmware
//! update engine:
//! - Controller errors (alarms and error responses reported by the board)
//! - Connection errors (serial transport and timeouts)
//! - Parse errors (unexpected response text)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Controller error type
///
/// Raised when the motion controller reports a problem with a command.
/// Recovery (reset-from-error and, for motion commands, re-homing) has
/// already been performed by the driver when one of these reaches a caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// The controller answered with an alarm marker (e.g. a limit switch hit)
    #[error("Controller alarm on `{command}`: {response}")]
    Alarm {
        /// The command line that triggered the alarm.
        command: String,
        /// The raw controller response.
        response: String,
    },

    /// The controller answered with an error marker
    #[error("Controller error on `{command}`: {response}")]
    Error {
        /// The command line that failed.
        command: String,
        /// The raw controller response.
        response: String,
    },

    /// A tip probe did not trigger within its travel
    #[error("Tip probe failed on `{command}`: {response}")]
    TipProbe {
        /// The probe command.
        command: String,
        /// The raw controller response.
        response: String,
    },

    /// The alarm raised by an intentional hard halt
    #[error("Controller halted: {response}")]
    Halted {
        /// The raw controller response.
        response: String,
    },

    /// An axis letter outside the known axis set
    #[error("Unknown axis: {axis}")]
    UnknownAxis {
        /// The offending axis text.
        axis: String,
    },

    /// A mount name other than `left` or `right`
    #[error("Unexpected mount: {mount}")]
    UnknownMount {
        /// The offending mount name.
        mount: String,
    },

    /// Generic controller error
    #[error("Controller error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

impl ControllerError {
    /// The raw controller response carried by this error, if any.
    pub fn response(&self) -> Option<&str> {
        match self {
            Self::Alarm { response, .. }
            | Self::Error { response, .. }
            | Self::TipProbe { response, .. }
            | Self::Halted { response } => Some(response),
            _ => None,
        }
    }
}

/// Connection error type
///
/// Represents errors related to the serial link with the controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// No acknowledgement arrived in time
    #[error("Timed out after {timeout_ms}ms waiting for `{command}`")]
    Timeout {
        /// The command that was not acknowledged.
        command: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The controller produced no response at all
    #[error("No response from controller to `{command}`")]
    NoResponse {
        /// The command that was sent.
        command: String,
    },

    /// The link is not open
    #[error("Not connected")]
    NotConnected,

    /// I/O error
    #[error("I/O error: {reason}")]
    Io {
        /// The reason for the I/O error.
        reason: String,
    },
}

/// Response parse error
///
/// The controller returned text that does not match the expected grammar.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Unexpected response from controller: {response}")]
pub struct ParseError {
    /// The response that could not be parsed.
    pub response: String,
}

impl ParseError {
    /// Create a parse error for the given response text
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

/// Main error type for MotionKit
///
/// A unified error type for the motion driver
#[derive(Error, Debug)]
pub enum Error {
    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Parse error
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::Timeout { .. }))
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a controller error
    pub fn is_controller_error(&self) -> bool {
        matches!(self, Error::Controller(_))
    }

    /// Check if this is a parse error
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Error::Parse(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
