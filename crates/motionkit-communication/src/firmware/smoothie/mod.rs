//! Smoothieware motion controller
//!
//! - `command_builder`: GCODE vocabulary and line assembly
//! - `response_parser`: reply classification and query parsing
//! - `connection`: command/acknowledge exchange with wait-for-idle
//! - `run_control`: pause gate and hard halt
//! - `driver`: position/current bookkeeping, homing and recovery

pub mod command_builder;
pub mod connection;
pub mod driver;
pub mod response_parser;
pub mod run_control;

pub use command_builder::{CommandBuilder, GCode, GCODE_ROUNDING_PRECISION};
pub use connection::SmoothieConnection;
pub use driver::{DriverFuture, Mount, MoveOptions, SmoothieDriver};
pub use response_parser::{ControllerReply, SwitchState};
pub use run_control::RunControl;
