//! # MotionKit
//!
//! Low-level control for liquid-handling robots:
//! - A Smoothieware motion-controller driver with position tracking,
//!   dependency-ordered homing, backlash compensation and current management
//! - Intel HEX parsing and concurrent firmware updates of networked nodes
//!
//! ## Architecture
//!
//! MotionKit is organized as a workspace with multiple crates:
//!
//! 1. **motionkit-core** - Axes, positions, homing and current state, errors
//! 2. **motionkit-settings** - Robot configuration loading and validation
//! 3. **motionkit-communication** - Serial transport and the controller driver
//! 4. **motionkit-firmware** - Hex parsing, message bus and update engine
//! 5. **motionkit** - This facade and the `motionkit` command line tool

pub use motionkit_communication::firmware;
pub use motionkit_firmware as firmware_update;

pub use motionkit_core::{
    Axis, AxisCurrentState, AxisMotorState, AxisPosition, AxisSet, ConnectionError,
    ControllerError, Error, HomingStatus, ParseError, Result,
};

pub use motionkit_settings::{
    AxisValues, ConfigError, ConnectionSettings, HomingSettings, MotionSettings, RobotConfig,
    TimingSettings,
};

pub use motionkit_communication::{
    list_ports, ControlLine, ControlLines, LineTransport, Mount, MoveOptions, NoOpControlLines,
    SerialLineTransport, SerialPortInfo, SimulatedControlLines, SimulatedTransport,
    SmoothieDriver, SwitchState,
};

pub use motionkit_firmware::{
    check_firmware_updates, load_firmware_manifest, run_updates, Chunk, DeviceInfo,
    FirmwareUpdateType, HexError, HexRecord, HexRecordParser, HexRecordProcessor, MessageBus,
    NodeId, UpdateError, UpdatePhase, UpdateSettings, UpdateStatus, UpdateStream,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output with pretty formatting
/// - RUST_LOG environment variable support, INFO otherwise
pub fn init_logging() -> anyhow::Result<()> {
    init_logging_with_level(tracing::Level::INFO)
}

/// Initialize logging with `level` as the default directive
pub fn init_logging_with_level(level: tracing::Level) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
