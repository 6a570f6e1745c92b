//! Error types for hex parsing and firmware transfer
//!
//! - [`HexError`]: a hex file line that cannot be used, with its location
//! - [`BusError`]: the message bus refused a message
//! - [`UpdateError`]: a target's update flow failed

use crate::bus::{ErrorCode, NodeId};
use std::path::PathBuf;
use thiserror::Error;

/// A problem with a firmware hex file.
///
/// Both line errors carry the file name, the 1-based line number and the
/// offending line so a failure in a large image can be located.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HexError {
    /// The line does not follow the record grammar
    #[error("{filename}:{line_number}: malformed hex record ({reason}): {line}")]
    Malformed {
        filename: String,
        line_number: usize,
        line: String,
        reason: String,
    },

    /// The record's checksum byte does not match its contents
    #[error(
        "{filename}:{line_number}: checksum mismatch, expected {expected:#04x} found {actual:#04x}: {line}"
    )]
    Checksum {
        filename: String,
        line_number: usize,
        line: String,
        expected: u8,
        actual: u8,
    },

    /// The file could not be read
    #[error("Failed to read {filename}: {reason}")]
    Io { filename: String, reason: String },

    /// Chunks must hold at least one byte
    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,
}

/// The message bus could not deliver a message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("Message bus closed")]
    Closed,

    #[error("Failed to send to {node}: {reason}")]
    Send { node: NodeId, reason: String },
}

/// Failure of one target's update flow.
///
/// Any of these aborts the whole multi-target run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateError {
    /// A node did not acknowledge in time
    #[error("Timed out waiting for {node} to acknowledge {message}")]
    Timeout { node: NodeId, message: String },

    /// A node acknowledged with a failure code
    #[error("{node} rejected {message} with {code}")]
    ErrorResponse {
        node: NodeId,
        message: String,
        code: ErrorCode,
    },

    /// The firmware image for a target does not exist
    #[error("Firmware file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// The node has no bootloader to receive firmware
    #[error("{node} cannot be updated")]
    NotUpdatable { node: NodeId },

    #[error(transparent)]
    Hex(#[from] HexError),

    #[error(transparent)]
    Bus(#[from] BusError),

    /// A target task ended without reporting (panicked)
    #[error("Update task failed: {0}")]
    Task(String),
}

impl UpdateError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpdateError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_error_names_location() {
        let err = HexError::Checksum {
            filename: "head.hex".to_string(),
            line_number: 12,
            line: ":0100000001FF".to_string(),
            expected: 0xfe,
            actual: 0xff,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("head.hex:12:"));
        assert!(msg.contains("0xfe"));
        assert!(msg.contains(":0100000001FF"));
    }

    #[test]
    fn test_update_error_display() {
        let err = UpdateError::ErrorResponse {
            node: NodeId::HeadBootloader,
            message: "data at 0x08000000".to_string(),
            code: ErrorCode::BAD_CHECKSUM,
        };
        assert!(err.to_string().contains("head-bootloader"));
        assert!(!err.is_timeout());
    }
}
