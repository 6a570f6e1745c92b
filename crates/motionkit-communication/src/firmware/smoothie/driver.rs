//! Smoothieware motion driver
//!
//! Owns the authoritative belief of axis positions and per-axis motor
//! current, translates motion requests into GCODE lines and recovers the
//! controller after alarms.
//!
//! Commands go out through three layers:
//! - `send_plain`: one exchange, alarms/errors turned into [`ControllerError`]
//! - `send_checked`: as above, plus reset-from-error on failure
//! - `send_command`: as above, plus homing the implicated axis when a
//!   motion command failed
//!
//! Homing and the settings helpers only use the first two, so recovery
//! homing never recurses into itself.

mod homing;
mod motion;
mod pipette;

pub use motion::MoveOptions;
pub use pipette::Mount;

use super::command_builder::{CommandBuilder, GCode};
use super::connection::SmoothieConnection;
use super::response_parser::{self, ControllerReply, SwitchState};
use super::run_control::RunControl;
use crate::communication::{ControlLines, LineTransport};
use motionkit_core::{
    Axis, AxisCurrentState, AxisPosition, AxisSet, ControllerError, Error, HomingStatus, Result,
};
use motionkit_settings::RobotConfig;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by the closures run inside scoped overrides
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

const SEC_PER_MIN: f64 = 60.0;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SendOptions {
    ack_timeout: Duration,
    execute_timeout: Duration,
    quiet: bool,
    home_after_error: bool,
}

impl SendOptions {
    fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    fn execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// Don't log controller errors (expected failures such as probing an
    /// empty mount)
    fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    fn no_home_after_error(mut self) -> Self {
        self.home_after_error = false;
        self
    }
}

/// Result of one command after error recovery has run
#[derive(Debug)]
enum CommandOutcome {
    Done(String),
    NeedsHome { axes: AxisSet, error: ControllerError },
    Fatal(Error),
}

/// Driver for a Smoothieware board running the six-axis gantry
pub struct SmoothieDriver {
    connection: SmoothieConnection,
    run: RunControl,
    config: RobotConfig,
    position: AxisPosition,
    homed_position: AxisPosition,
    homing: HomingStatus,
    currents: AxisCurrentState,
    saved_currents: Option<AxisCurrentState>,
    combined_speed: f64,
    saved_combined_speed: Option<f64>,
    max_speeds: BTreeMap<Axis, f64>,
    saved_max_speeds: Option<BTreeMap<Axis, f64>>,
    acceleration: BTreeMap<Axis, f64>,
    saved_acceleration: Option<BTreeMap<Axis, f64>>,
    steps_per_mm: BTreeMap<Axis, f64>,
}

impl SmoothieDriver {
    /// Create a driver over an open transport.
    ///
    /// Nothing is sent until [`SmoothieDriver::setup`] or the first command.
    /// The believed position starts at the homed position.
    pub fn new(
        transport: Box<dyn LineTransport>,
        lines: Arc<dyn ControlLines>,
        config: RobotConfig,
    ) -> Self {
        let motion = &config.motion;
        let homed_position = AxisPosition::from(motion.homed_position);
        Self {
            connection: SmoothieConnection::new(transport),
            run: RunControl::new(lines, config.timing.halt_pulse()),
            position: homed_position.clone(),
            homed_position,
            homing: HomingStatus::unhomed(),
            currents: AxisCurrentState::new(motion.high_current.to_map(), motion.low_current.to_map()),
            saved_currents: None,
            combined_speed: motion.combined_speed,
            saved_combined_speed: None,
            max_speeds: motion.default_max_speed.to_map(),
            saved_max_speeds: None,
            acceleration: motion.acceleration.to_map(),
            saved_acceleration: None,
            steps_per_mm: motion.steps_per_mm.to_map(),
            config,
        }
    }

    /// Position the driver believes each axis is at
    pub fn position(&self) -> &AxisPosition {
        &self.position
    }

    /// Coordinates each axis takes after homing
    pub fn homed_position(&self) -> &AxisPosition {
        &self.homed_position
    }

    /// Which axes are known to be homed
    pub fn homing_status(&self) -> &HomingStatus {
        &self.homing
    }

    /// Current tables and which axes are active or engaged
    pub fn current_state(&self) -> &AxisCurrentState {
        &self.currents
    }

    /// Combined feed speed in mm/s
    pub fn combined_speed(&self) -> f64 {
        self.combined_speed
    }

    /// Per-axis maximum speeds in mm/s
    pub fn max_speeds(&self) -> &BTreeMap<Axis, f64> {
        &self.max_speeds
    }

    /// Per-axis acceleration in mm/s²
    pub fn acceleration(&self) -> &BTreeMap<Axis, f64> {
        &self.acceleration
    }

    /// Microsteps per millimetre last sent to the controller
    pub fn steps_per_mm(&self) -> &BTreeMap<Axis, f64> {
        &self.steps_per_mm
    }

    /// Configuration the driver was built with
    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    /// Name of the transport's port, if it has one
    pub fn port_name(&self) -> Option<String> {
        self.connection.port_name()
    }

    /// Handle for pausing or halting the driver from another task
    pub fn run_control(&self) -> RunControl {
        self.run.clone()
    }

    // ----- command layers -----

    fn opts(&self) -> SendOptions {
        SendOptions {
            ack_timeout: self.config.connection.ack_timeout(),
            execute_timeout: self.config.connection.execute_timeout(),
            quiet: false,
            home_after_error: true,
        }
    }

    fn movement_opts(&self) -> SendOptions {
        self.opts()
            .ack_timeout(self.config.connection.movement_timeout())
    }

    async fn send_plain(&mut self, command: &CommandBuilder, opts: SendOptions) -> Result<String> {
        let reply = self
            .connection
            .send_command(command, opts.ack_timeout, opts.execute_timeout)
            .await?;
        let (is_alarm, response) = match reply {
            ControllerReply::Ok(text) => return Ok(text),
            ControllerReply::Alarm(text) => (true, text),
            ControllerReply::Error(text) => (false, text),
        };
        let line = command.build();

        if self.run.is_halting() {
            if is_alarm {
                // the alarm raised by our own halt pulse
                self.run.clear_halting();
                return Err(ControllerError::Halted { response }.into());
            }
            return Err(ControllerError::Error {
                command: line,
                response,
            }
            .into());
        }

        let lower = response.to_lowercase();
        if lower.contains("instrument found") {
            tracing::info!("smoothie: {}", response);
        } else if lower.contains("alarm lock") || lower.contains("after halt you should home") {
            // answers to commands issued while unwinding from a halt
            tracing::debug!("Ignoring post-halt response to {}: {}", line, response);
            return Ok(response);
        } else if !opts.quiet {
            tracing::warn!("alarm/error: command={}, resp={}", line, response);
        }

        Err(if is_alarm {
            ControllerError::Alarm {
                command: line,
                response,
            }
        } else {
            ControllerError::Error {
                command: line,
                response,
            }
        }
        .into())
    }

    async fn transact(&mut self, command: &CommandBuilder, opts: SendOptions) -> CommandOutcome {
        let error = match self.send_plain(command, opts).await {
            Ok(text) => return CommandOutcome::Done(text),
            Err(Error::Controller(
                err @ (ControllerError::Alarm { .. } | ControllerError::Error { .. }),
            )) => err,
            Err(other) => return CommandOutcome::Fatal(other),
        };

        if let Err(reset_err) = self.reset_from_error().await {
            tracing::error!("Reset after controller error failed: {}", reset_err);
            return CommandOutcome::Fatal(reset_err);
        }

        let is_motion = command.contains(GCode::Move) || command.contains(GCode::Probe);
        if is_motion && opts.home_after_error {
            let axes = error
                .response()
                .and_then(response_parser::error_axis)
                .map(|axis| AxisSet::from([axis]))
                .unwrap_or_else(Axis::all_set);
            CommandOutcome::NeedsHome { axes, error }
        } else {
            CommandOutcome::Fatal(error.into())
        }
    }

    /// Send with reset-from-error on failure, never homing
    async fn send_checked(&mut self, command: CommandBuilder, opts: SendOptions) -> Result<String> {
        match self.transact(&command, opts.no_home_after_error()).await {
            CommandOutcome::Done(text) => Ok(text),
            CommandOutcome::NeedsHome { error, .. } => Err(error.into()),
            CommandOutcome::Fatal(err) => Err(err),
        }
    }

    /// Send with full recovery: reset, and home the implicated axis if a
    /// motion command failed. The error is returned after recovery.
    async fn send_command(&mut self, command: CommandBuilder, opts: SendOptions) -> Result<String> {
        match self.transact(&command, opts).await {
            CommandOutcome::Done(text) => Ok(text),
            CommandOutcome::Fatal(err) => Err(err),
            CommandOutcome::NeedsHome { axes, error } => {
                tracing::info!("Homing {} after alarm/error", Axis::set_to_string(&axes));
                if let Err(home_err) = self.home_sequence(&axes, &AxisSet::new()).await {
                    tracing::error!("Homing after alarm/error failed: {}", home_err);
                }
                Err(error.into())
            }
        }
    }

    // ----- controller state -----

    /// Clear the controller's error state and refresh the homing flags
    pub async fn reset_from_error(&mut self) -> Result<()> {
        // the controller ignores input for a moment after an error
        tokio::time::sleep(self.config.timing.stabilize()).await;
        tracing::debug!("reset_from_error");
        self.run.clear_halting();
        let opts = self.opts();
        self.send_plain(&CommandBuilder::new().add_gcode(GCode::ResetFromError), opts)
            .await?;
        self.update_homed_flags().await
    }

    /// Read the controller's homing flags (`G28.6`)
    pub async fn update_homed_flags(&mut self) -> Result<()> {
        let opts = self.opts();
        let response = self
            .send_plain(&CommandBuilder::new().add_gcode(GCode::HomingStatus), opts)
            .await?;
        let flags = response_parser::parse_homing_flags(&response)?;
        self.homing.update(&flags);
        Ok(())
    }

    /// Replace the believed position with the controller's (`M114.2`)
    pub async fn update_position(&mut self) -> Result<AxisPosition> {
        let opts = self.opts();
        let response = self
            .send_checked(CommandBuilder::new().add_gcode(GCode::CurrentPosition), opts)
            .await?;
        let values = response_parser::parse_position(&response)?;
        self.position.update(&values);
        Ok(self.position.clone())
    }

    /// Limit switch and probe state (`M119`)
    pub async fn switch_state(&mut self) -> Result<SwitchState> {
        let opts = self.opts();
        let response = self
            .send_checked(CommandBuilder::new().add_gcode(GCode::LimitSwitchStatus), opts)
            .await?;
        Ok(response_parser::parse_switch_values(&response)?)
    }

    /// Firmware build version, e.g. `edge-66ec883`
    pub async fn get_fw_version(&mut self) -> Result<String> {
        let opts = self.opts();
        let response = self
            .send_checked(CommandBuilder::new().add_gcode(GCode::Version), opts)
            .await?;
        Ok(response_parser::parse_fw_version(&response))
    }

    /// Bring the controller and the driver state to a known baseline
    pub async fn setup(&mut self) -> Result<()> {
        tracing::debug!("setup");
        if let Err(e) = self.wait_for_ack().await {
            if !e.is_connection_error() {
                return Err(e);
            }
            // possibly stuck in the bootloader
            tracing::warn!("Controller did not answer ({}), resetting", e);
            self.run.pulse_reset().await?;
            self.wait_for_ack().await?;
        }
        self.reset_from_error().await?;

        let steps = self.config.motion.steps_per_mm.to_map();
        self.update_steps_per_mm(&steps).await?;
        let opts = self.opts();
        self.send_checked(CommandBuilder::new().add_gcode(GCode::AbsoluteCoords), opts)
            .await?;

        let dwelling = self.currents.dwelling_table().clone();
        self.currents.save(&dwelling, false);
        self.update_position().await?;

        let max_speeds = self.config.motion.default_max_speed.to_map();
        self.set_axis_max_speed(&max_speeds).await?;
        self.set_speed(self.config.motion.combined_speed).await?;
        let acceleration = self.config.motion.acceleration.to_map();
        self.set_acceleration(&acceleration).await?;
        tracing::info!("Controller ready on {}", self.port_name().unwrap_or_default());
        Ok(())
    }

    /// Send an empty line; the controller acks once it has finished booting
    async fn wait_for_ack(&mut self) -> Result<()> {
        let timeout = self.config.connection.boot_timeout();
        self.connection.send_raw("", timeout).await.map(|_| ())
    }

    // ----- run control -----

    /// Block the next move or home until [`SmoothieDriver::resume`]
    pub fn pause(&self) {
        self.run.pause();
    }

    /// Let paused moves and homes continue
    pub fn resume(&self) {
        self.run.resume();
    }

    /// Stop all motion through the halt line.
    ///
    /// The returned future does not borrow the driver.
    pub fn hard_halt(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let run = self.run.clone();
        async move { run.hard_halt().await }
    }

    /// Halt, then reset the controller and reinitialize from configuration
    pub async fn kill(&mut self) -> Result<()> {
        tracing::info!("kill");
        self.run.hard_halt().await?;
        self.reset_from_error().await?;
        self.setup().await
    }

    // ----- current -----

    /// `M907` with every axis's current, followed by a controller-side dwell
    /// so the drivers settle before the rest of the line runs
    fn current_command(&self) -> CommandBuilder {
        CommandBuilder::new()
            .add_gcode(GCode::SetCurrent)
            .add_axes(&self.currents.currents(), None)
            .add_gcode(GCode::Dwell)
            .add_float("P", self.config.timing.current_settle().as_secs_f64(), None)
    }

    /// Push the saved currents to the board and wait for them to settle
    async fn apply_current(&mut self) -> Result<()> {
        let command = self.current_command();
        let opts = self.opts();
        self.send_checked(command, opts).await?;
        tokio::time::sleep(self.config.timing.current_settle()).await;
        Ok(())
    }

    /// Set explicit currents (A) and mark those axes active or dwelling
    pub async fn set_current(&mut self, settings: &BTreeMap<Axis, f64>, active: bool) -> Result<()> {
        self.currents.save(settings, active);
        self.apply_current().await
    }

    /// Drop axes to their dwelling current
    pub async fn dwell_axes(&mut self, axes: &AxisSet) -> Result<()> {
        if self.currents.dwell(axes) {
            self.apply_current().await?;
        }
        Ok(())
    }

    /// Raise axes to their active current
    pub async fn activate_axes(&mut self, axes: &AxisSet) -> Result<()> {
        if self.currents.activate(axes) {
            self.apply_current().await?;
        }
        Ok(())
    }

    /// Change the high-current table; takes effect with the next command
    pub fn set_active_current(&mut self, settings: &BTreeMap<Axis, f64>) {
        self.currents.set_active_current(settings);
    }

    /// Change the low-current table; takes effect with the next command
    pub fn set_dwelling_current(&mut self, settings: &BTreeMap<Axis, f64>) {
        self.currents.set_dwelling_current(settings);
    }

    /// Remember the current state for [`SmoothieDriver::pop_current`]
    pub fn push_current(&mut self) {
        self.saved_currents = Some(self.currents.clone());
    }

    /// Restore the state saved by [`SmoothieDriver::push_current`]. Without
    /// a saved state this does nothing.
    pub async fn pop_current(&mut self) -> Result<()> {
        match self.saved_currents.take() {
            Some(saved) => {
                self.currents = saved;
                self.apply_current().await
            }
            None => {
                tracing::debug!("pop_current without push_current");
                Ok(())
            }
        }
    }

    /// Run `op` with the current state restored afterwards, whether or not
    /// it succeeded. Scopes nest; each restores what it found on entry and
    /// leaves the [`SmoothieDriver::push_current`] slot alone.
    pub async fn with_current<T, F>(&mut self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut SmoothieDriver) -> DriverFuture<'a, T>,
    {
        let saved = self.currents.clone();
        let result = op(self).await;
        self.currents = saved;
        let restored = self.apply_current().await;
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Cut power to the given axes (`M18`)
    pub async fn disengage_axis(&mut self, axes: &AxisSet) -> Result<()> {
        if axes.is_empty() {
            return Ok(());
        }
        let command = CommandBuilder::new()
            .add_gcode(GCode::DisengageMotor)
            .add_element(Axis::set_to_string(axes));
        let opts = self.opts();
        self.send_checked(command, opts).await?;
        self.currents.set_engaged(axes, false);
        Ok(())
    }

    /// Axes whose motor drivers are powered
    pub fn engaged_axes(&self) -> AxisSet {
        Axis::ALL
            .iter()
            .copied()
            .filter(|&a| self.currents.is_engaged(a))
            .collect()
    }

    // ----- speed and acceleration -----

    fn speed_command(value: f64) -> CommandBuilder {
        CommandBuilder::new().add_int(GCode::SetSpeed.as_str(), (value * SEC_PER_MIN).round() as i64)
    }

    /// Set the combined feed speed (mm/s)
    pub async fn set_speed(&mut self, value: f64) -> Result<()> {
        self.combined_speed = value;
        let opts = self.opts();
        self.send_checked(Self::speed_command(value), opts).await?;
        Ok(())
    }

    /// Remember the combined speed for [`SmoothieDriver::pop_speed`]
    pub fn push_speed(&mut self) {
        self.saved_combined_speed = Some(self.combined_speed);
    }

    /// Restore the speed saved by [`SmoothieDriver::push_speed`], if any
    pub async fn pop_speed(&mut self) -> Result<()> {
        match self.saved_combined_speed.take() {
            Some(speed) => self.set_speed(speed).await,
            None => Ok(()),
        }
    }

    /// Run `op` at a temporary combined speed, restoring the speed found on
    /// entry afterwards
    pub async fn with_speed<T, F>(&mut self, speed: f64, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut SmoothieDriver) -> DriverFuture<'a, T>,
    {
        let saved = self.combined_speed;
        let result = match self.set_speed(speed).await {
            Ok(()) => op(self).await,
            Err(e) => Err(e),
        };
        let restored = self.set_speed(saved).await;
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Set per-axis maximum speeds (mm/s)
    pub async fn set_axis_max_speed(&mut self, settings: &BTreeMap<Axis, f64>) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        self.max_speeds.extend(settings);
        let command = CommandBuilder::new()
            .add_gcode(GCode::SetMaxSpeed)
            .add_axes(settings, None);
        let opts = self.opts();
        self.send_checked(command, opts).await?;
        Ok(())
    }

    /// Remember the per-axis maximum speeds for
    /// [`SmoothieDriver::pop_axis_max_speed`]
    pub fn push_axis_max_speed(&mut self) {
        self.saved_max_speeds = Some(self.max_speeds.clone());
    }

    /// Restore the speeds saved by [`SmoothieDriver::push_axis_max_speed`]
    pub async fn pop_axis_max_speed(&mut self) -> Result<()> {
        match self.saved_max_speeds.take() {
            Some(speeds) => self.set_axis_max_speed(&speeds).await,
            None => Ok(()),
        }
    }

    /// Run `op` with temporary per-axis maximum speeds, restoring the ones
    /// found on entry afterwards
    pub async fn with_axis_max_speed<T, F>(
        &mut self,
        speeds: BTreeMap<Axis, f64>,
        op: F,
    ) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut SmoothieDriver) -> DriverFuture<'a, T>,
    {
        let saved = self.max_speeds.clone();
        let result = match self.set_axis_max_speed(&speeds).await {
            Ok(()) => op(self).await,
            Err(e) => Err(e),
        };
        let restored = self.set_axis_max_speed(&saved).await;
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Set per-axis acceleration
    pub async fn set_acceleration(&mut self, settings: &BTreeMap<Axis, f64>) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        self.acceleration.extend(settings);
        let command = CommandBuilder::new()
            .add_gcode(GCode::Acceleration)
            .add_axes(settings, None);
        let opts = self.opts();
        self.send_checked(command, opts).await?;
        Ok(())
    }

    /// Remember the acceleration for [`SmoothieDriver::pop_acceleration`]
    pub fn push_acceleration(&mut self) {
        self.saved_acceleration = Some(self.acceleration.clone());
    }

    /// Restore the acceleration saved by [`SmoothieDriver::push_acceleration`]
    pub async fn pop_acceleration(&mut self) -> Result<()> {
        match self.saved_acceleration.take() {
            Some(acceleration) => self.set_acceleration(&acceleration).await,
            None => Ok(()),
        }
    }

    /// Set microsteps per millimetre (`M92`)
    pub async fn update_steps_per_mm(&mut self, settings: &BTreeMap<Axis, f64>) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        self.steps_per_mm.extend(settings);
        let command = CommandBuilder::new()
            .add_gcode(GCode::StepsPerMm)
            .add_axes(settings, None);
        let opts = self.opts();
        self.send_checked(command, opts).await?;
        Ok(())
    }

    /// Controller-side dwell (`G4 P<seconds>`)
    pub async fn delay(&mut self, seconds: f64) -> Result<()> {
        let command = CommandBuilder::new()
            .add_gcode(GCode::Dwell)
            .add_float("P", seconds, None);
        tracing::debug!("delay: {}", command);
        let opts = self
            .opts()
            .execute_timeout(Duration::from_secs_f64(seconds.max(0.0)) + Duration::from_secs(1));
        self.send_checked(command, opts).await?;
        Ok(())
    }

    /// Close the transport
    pub async fn disconnect(&mut self) -> Result<()> {
        self.connection.close().await
    }
}

impl std::fmt::Debug for SmoothieDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmoothieDriver")
            .field("port", &self.port_name())
            .field("position", &self.position)
            .field("homing", &self.homing)
            .field("run", &self.run)
            .finish()
    }
}
