//! MotionKit Settings Crate
//!
//! Handles robot configuration: motor constants, homing maneuver tuning,
//! serial link timing and where the configuration file lives on disk.

pub mod config;
pub mod error;

pub use config::{
    AxisValues, ConnectionSettings, HomingSettings, MotionSettings, RobotConfig, TimingSettings,
};
pub use error::ConfigError;
