//! # MotionKit Communication
//!
//! Line transports to the motion controller and the Smoothieware driver
//! built on top of them. The driver keeps the authoritative belief of axis
//! positions, manages per-axis motor current and recovers the controller
//! after alarms.

pub mod communication;
pub mod firmware;

pub use communication::{
    serial::{list_ports, SerialLineTransport, SerialPortInfo},
    simulated::{SentLine, SimulatedControlLines, SimulatedTransport},
    ControlLine, ControlLines, LineTransport, NoOpControlLines,
};

pub use firmware::smoothie::{
    CommandBuilder, ControllerReply, DriverFuture, GCode, Mount, MoveOptions, RunControl,
    SmoothieDriver, SwitchState,
};
