//! # MotionKit Core
//!
//! Core types and error taxonomy for MotionKit.
//! Provides the axis model, position tracking, homing flags and motor
//! current state shared by the motion driver and its callers.

pub mod data;
pub mod error;

pub use data::{Axis, AxisCurrentState, AxisMotorState, AxisPosition, AxisSet, HomingStatus};

pub use error::{ConnectionError, ControllerError, Error, ParseError, Result};
