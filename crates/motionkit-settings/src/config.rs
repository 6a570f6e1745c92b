//! Robot configuration
//!
//! Provides the configuration consumed by the motion driver, with file
//! handling and validation. Supports JSON and TOML file formats stored in
//! the platform-specific configuration directory.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (port, baud rate, acknowledgement timeouts)
//! - Motion settings (steps/mm, currents, speeds, homed position)
//! - Homing maneuver tuning (Y back-off and retract)
//! - Timing (settle and stabilize delays)

use crate::error::ConfigError;
use motionkit_core::{Axis, AxisPosition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest motor current (A) any axis may be configured to
pub const MAX_CURRENT_AMPS: f64 = 2.0;

/// File name of the robot configuration inside the config directory
pub const CONFIG_FILE_NAME: &str = "robot.toml";

/// One value per axis, written out by name in config files
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisValues {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl AxisValues {
    pub const fn new(x: f64, y: f64, z: f64, a: f64, b: f64, c: f64) -> Self {
        Self { x, y, z, a, b, c }
    }

    /// Value for one axis
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::A => self.a,
            Axis::B => self.b,
            Axis::C => self.c,
        }
    }

    /// Every axis as a map, in letter order
    pub fn to_map(&self) -> BTreeMap<Axis, f64> {
        Axis::ALL.iter().map(|&a| (a, self.get(a))).collect()
    }

    fn iter(&self) -> impl Iterator<Item = (Axis, f64)> + '_ {
        Axis::ALL.iter().map(move |&a| (a, self.get(a)))
    }
}

impl From<AxisValues> for AxisPosition {
    fn from(values: AxisValues) -> Self {
        AxisPosition::with_axes(values.x, values.y, values.z, values.a, values.b, values.c)
    }
}

/// Serial link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Serial port name; empty selects the first matching controller port
    pub port: String,
    /// Baud rate of the controller link
    pub baud_rate: u32,
    /// Time allowed for a queued command to be acknowledged
    pub ack_timeout_ms: u64,
    /// Time allowed for motion to finish (the wait-for-idle suffix)
    pub execute_timeout_ms: u64,
    /// Acknowledgement timeout for commands the controller only acks after
    /// execution (homing, probing)
    pub movement_timeout_ms: u64,
    /// Time allowed for the controller to answer after power-up or reset
    pub boot_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            ack_timeout_ms: 5_000,
            execute_timeout_ms: 12_000,
            movement_timeout_ms: 30_000,
            boot_timeout_ms: 20_000,
        }
    }
}

impl ConnectionSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn movement_timeout(&self) -> Duration {
        Duration::from_millis(self.movement_timeout_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
}

/// Motor and kinematics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionSettings {
    /// Microsteps per millimetre of travel
    pub steps_per_mm: AxisValues,
    /// Acceleration (mm/s²)
    pub acceleration: AxisValues,
    /// Per-axis maximum speed (mm/s)
    pub default_max_speed: AxisValues,
    /// Combined feed speed (mm/s)
    pub combined_speed: f64,
    /// Current (A) while an axis is moving or holding under load
    pub high_current: AxisValues,
    /// Current (A) while an axis is idle
    pub low_current: AxisValues,
    /// Coordinates reached by homing each axis
    pub homed_position: AxisValues,
    /// Over-travel applied to plunger moves in the positive direction
    pub plunger_backlash_mm: f64,
    /// Moves smaller than this are treated as already reached
    pub movement_tolerance_mm: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            steps_per_mm: AxisValues::new(80.0, 80.0, 400.0, 400.0, 768.0, 768.0),
            acceleration: AxisValues::new(3.0, 2.0, 15.0, 15.0, 2.0, 2.0),
            default_max_speed: AxisValues::new(600.0, 400.0, 125.0, 125.0, 40.0, 40.0),
            combined_speed: 400.0,
            high_current: AxisValues::new(1.25, 1.25, 0.5, 0.5, 0.05, 0.05),
            low_current: AxisValues::new(0.7, 0.7, 0.1, 0.1, 0.05, 0.05),
            homed_position: AxisValues::new(418.0, 353.0, 218.0, 218.0, 19.0, 19.0),
            plunger_backlash_mm: 0.3,
            movement_tolerance_mm: 1.0 / 160.0,
        }
    }
}

/// Tuning of the gantry homing maneuver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomingSettings {
    /// Distance Y backs off its switch before X homes
    pub y_switch_back_off_mm: f64,
    /// Distance Y comes back toward the switch after backing off
    pub y_switch_reverse_back_off_mm: f64,
    /// Y current (A) during the back-off
    pub y_backoff_low_current: f64,
    /// Y maximum speed (mm/s) during the back-off
    pub y_backoff_slow_speed: f64,
    /// Y maximum speed (mm/s) while retracting and re-homing Y
    pub y_retract_speed: f64,
    /// Distance Y retracts from its switch between homing passes
    pub y_retract_distance: f64,
    /// Maximum speed (mm/s) of the X and Y homing passes
    pub xy_homing_speed: f64,
}

impl Default for HomingSettings {
    fn default() -> Self {
        Self {
            y_switch_back_off_mm: 20.0,
            y_switch_reverse_back_off_mm: 10.0,
            y_backoff_low_current: 0.8,
            y_backoff_slow_speed: 50.0,
            y_retract_speed: 8.0,
            y_retract_distance: 3.0,
            xy_homing_speed: 80.0,
        }
    }
}

/// Host-side delays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Pause after every current change before the next command
    pub current_settle_ms: u64,
    /// Dwell before reading pipette memory
    pub pipette_read_delay_ms: u64,
    /// Pause before resetting the controller from an error
    pub stabilize_ms: u64,
    /// Length of each phase of the out-of-band halt and reset pulses
    pub halt_pulse_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            current_settle_ms: 50,
            pipette_read_delay_ms: 50,
            stabilize_ms: 100,
            halt_pulse_ms: 250,
        }
    }
}

impl TimingSettings {
    pub fn current_settle(&self) -> Duration {
        Duration::from_millis(self.current_settle_ms)
    }

    pub fn pipette_read_delay(&self) -> Duration {
        Duration::from_millis(self.pipette_read_delay_ms)
    }

    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }

    pub fn halt_pulse(&self) -> Duration {
        Duration::from_millis(self.halt_pulse_ms)
    }
}

/// Complete robot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub motion: MotionSettings,
    #[serde(default)]
    pub homing: HomingSettings,
    #[serde(default)]
    pub timing: TimingSettings,
}

impl RobotConfig {
    /// Create default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: Self = match extension(path) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| ConfigError::Corrupted(format!("Invalid JSON config: {}", e)))?,
            Some("toml") => toml::from_str(&content)
                .map_err(|e| ConfigError::Corrupted(format!("Invalid TOML config: {}", e)))?,
            _ => return Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        };

        config.validate()?;
        tracing::debug!("Loaded robot config from {}", path.display());
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        let content = match extension(path) {
            Some("json") => serde_json::to_string_pretty(self)
                .map_err(|e| ConfigError::Corrupted(format!("Failed to serialize config: {}", e)))?,
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| ConfigError::Corrupted(format!("Failed to serialize config: {}", e)))?,
            _ => return Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        };

        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    /// Load the config at `path`, or the defaults when no file exists there
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No robot config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Platform configuration directory for MotionKit
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join("motionkit"))
            .ok_or_else(|| {
                ConfigError::UnsupportedPlatform(
                    "no configuration or home directory available".to_string(),
                )
            })
    }

    /// Default location of the robot configuration file
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate connection settings
        let c = &self.connection;
        if c.baud_rate == 0 {
            return Err(ConfigError::out_of_range("connection.baud_rate", c.baud_rate));
        }
        for (key, value) in [
            ("connection.ack_timeout_ms", c.ack_timeout_ms),
            ("connection.execute_timeout_ms", c.execute_timeout_ms),
            ("connection.movement_timeout_ms", c.movement_timeout_ms),
            ("connection.boot_timeout_ms", c.boot_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::out_of_range(key, value));
            }
        }

        // Validate motion settings
        let m = &self.motion;
        for (name, table) in [
            ("motion.steps_per_mm", &m.steps_per_mm),
            ("motion.acceleration", &m.acceleration),
            ("motion.default_max_speed", &m.default_max_speed),
        ] {
            positive_axes(name, table)?;
        }
        for (name, table) in [
            ("motion.high_current", &m.high_current),
            ("motion.low_current", &m.low_current),
        ] {
            positive_axes(name, table)?;
            for (axis, amps) in table.iter() {
                if amps > MAX_CURRENT_AMPS {
                    return Err(ConfigError::out_of_range(axis_key(name, axis), amps));
                }
            }
        }
        if m.combined_speed <= 0.0 {
            return Err(ConfigError::out_of_range("motion.combined_speed", m.combined_speed));
        }
        if m.plunger_backlash_mm < 0.0 {
            return Err(ConfigError::out_of_range(
                "motion.plunger_backlash_mm",
                m.plunger_backlash_mm,
            ));
        }
        if m.movement_tolerance_mm <= 0.0 {
            return Err(ConfigError::out_of_range(
                "motion.movement_tolerance_mm",
                m.movement_tolerance_mm,
            ));
        }

        // Validate homing maneuver
        let h = &self.homing;
        for (key, value) in [
            ("homing.y_switch_back_off_mm", h.y_switch_back_off_mm),
            ("homing.y_backoff_slow_speed", h.y_backoff_slow_speed),
            ("homing.y_retract_speed", h.y_retract_speed),
            ("homing.y_retract_distance", h.y_retract_distance),
            ("homing.xy_homing_speed", h.xy_homing_speed),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::out_of_range(key, value));
            }
        }
        if h.y_switch_reverse_back_off_mm < 0.0
            || h.y_switch_reverse_back_off_mm >= h.y_switch_back_off_mm
        {
            return Err(ConfigError::out_of_range(
                "homing.y_switch_reverse_back_off_mm",
                h.y_switch_reverse_back_off_mm,
            ));
        }
        if h.y_backoff_low_current <= 0.0 || h.y_backoff_low_current > MAX_CURRENT_AMPS {
            return Err(ConfigError::out_of_range(
                "homing.y_backoff_low_current",
                h.y_backoff_low_current,
            ));
        }

        Ok(())
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn axis_key(table: &str, axis: Axis) -> String {
    format!("{}.{}", table, axis.letter().to_ascii_lowercase())
}

fn positive_axes(name: &str, table: &AxisValues) -> Result<(), ConfigError> {
    for (axis, value) in table.iter() {
        if value <= 0.0 {
            return Err(ConfigError::out_of_range(axis_key(name, axis), value));
        }
    }
    Ok(())
}
