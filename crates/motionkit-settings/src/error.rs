//! Error types for the settings crate.
//!
//! Configuration problems are reported with the key or file involved so a
//! bad value in a hand-edited robot config is easy to find.

use thiserror::Error;

/// Errors related to loading, saving and validating the robot configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file format is not supported.
    #[error("Config file must be .json or .toml: {0}")]
    UnsupportedFormat(String),

    /// The configuration file could not be read or written.
    #[error("Failed to access config file {path}: {reason}")]
    Io { path: String, reason: String },

    /// The configuration file is corrupted or malformed.
    #[error("Corrupted configuration: {0}")]
    Corrupted(String),

    /// A configuration value is out of valid range.
    #[error("Value out of range for '{key}': {value}")]
    ValueOutOfRange { key: String, value: String },

    /// Platform is not supported for config directory resolution.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl ConfigError {
    pub(crate) fn out_of_range(key: impl Into<String>, value: impl ToString) -> Self {
        Self::ValueOutOfRange {
            key: key.into(),
            value: value.to_string(),
        }
    }
}

impl From<ConfigError> for motionkit_core::Error {
    fn from(err: ConfigError) -> Self {
        motionkit_core::Error::other(err.to_string())
    }
}
