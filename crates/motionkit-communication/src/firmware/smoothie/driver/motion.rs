//! Moves, probing and freeing stuck axes

use super::SmoothieDriver;
use crate::firmware::smoothie::command_builder::{CommandBuilder, GCode, GCODE_ROUNDING_PRECISION};
use motionkit_core::{Axis, AxisPosition, AxisSet, ControllerError, Error, Result};
use std::collections::BTreeMap;

const PROBE_FEEDRATE: i64 = 420;
const DEFAULT_UNSTICK_DISTANCE: f64 = 1.0;
const DEFAULT_UNSTICK_SPEED: f64 = 1.0;

/// Options for [`SmoothieDriver::move_to`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveOptions {
    /// Home any target axis whose homing flag is down before moving
    pub home_flagged_axes: bool,
    /// Combined speed (mm/s) for this move only
    pub speed: Option<f64>,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            home_flagged_axes: true,
            speed: None,
        }
    }
}

impl MoveOptions {
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn without_homing(mut self) -> Self {
        self.home_flagged_axes = false;
        self
    }
}

impl SmoothieDriver {
    /// Target axes that are further than the movement tolerance from where
    /// they are believed to be
    fn moving_axes(&self, target: &BTreeMap<Axis, f64>) -> BTreeMap<Axis, f64> {
        let tolerance = self.config.motion.movement_tolerance_mm;
        target
            .iter()
            .filter(|(&axis, &value)| (value - self.position.get(axis)).abs() >= tolerance)
            .map(|(&axis, &value)| (axis, value))
            .collect()
    }

    /// Move to absolute coordinates.
    ///
    /// Axes already within tolerance of their target are left out; if none
    /// remain, nothing is sent. Plungers moving up overshoot by the backlash
    /// distance and come back down so they always approach from one side.
    /// Moving axes run at their active current; plungers drop back to their
    /// dwelling current afterwards.
    pub async fn move_to(
        &mut self,
        target: &BTreeMap<Axis, f64>,
        options: MoveOptions,
    ) -> Result<AxisPosition> {
        self.run.wait_until_running().await;

        if options.home_flagged_axes {
            let flagged = self.homing.needing_home(target.keys());
            if !flagged.is_empty() && !self.moving_axes(target).is_empty() {
                tracing::info!("Homing {} before move", Axis::set_to_string(&flagged));
                self.home_sequence(&flagged, &AxisSet::new()).await?;
            }
        }

        let moving = self.moving_axes(target);
        if moving.is_empty() {
            tracing::debug!("move_to: already within tolerance");
            return Ok(self.position.clone());
        }

        let backlash = self.config.motion.plunger_backlash_mm;
        let mut first = moving.clone();
        let mut settle: BTreeMap<Axis, f64> = BTreeMap::new();
        for (&axis, &value) in &moving {
            if axis.is_plunger() && value > self.position.get(axis) {
                first.insert(axis, value + backlash);
                settle.insert(axis, value);
            }
        }

        let idle: AxisSet = Axis::ALL
            .iter()
            .copied()
            .filter(|a| !moving.contains_key(a))
            .collect();
        self.currents.dwell(&idle);
        self.currents.activate(moving.keys());

        let mut command = CommandBuilder::new();
        if let Some(speed) = options.speed {
            command = command.extend(Self::speed_command(speed));
        }
        command = command
            .extend(self.current_command())
            .add_gcode(GCode::Move)
            .add_axes(&first, Some(GCODE_ROUNDING_PRECISION));
        if !settle.is_empty() {
            command = command
                .add_gcode(GCode::Move)
                .add_axes(&settle, Some(GCODE_ROUNDING_PRECISION));
        }
        if options.speed.is_some() {
            command = command.extend(Self::speed_command(self.combined_speed));
        }

        tracing::debug!("move_to: {}", command);
        self.currents.set_engaged(moving.keys(), true);
        let opts = self.movement_opts();
        let result = self.send_command(command, opts).await;

        let plungers: AxisSet = moving.keys().copied().filter(|a| a.is_plunger()).collect();
        let rested = if self.currents.dwell(&plungers) {
            self.apply_current().await
        } else {
            Ok(())
        };
        result?;
        rested?;

        self.position.update(&moving);
        Ok(self.position.clone())
    }

    /// Move one axis by a relative distance until the probe triggers.
    ///
    /// A failed probe homes the axis and reports [`ControllerError::TipProbe`]
    /// when the controller blamed the probe. On success the position is
    /// re-read from the controller.
    pub async fn probe_axis(&mut self, axis: &str, distance: f64) -> Result<AxisPosition> {
        let axis: Axis = axis.parse()?;
        self.currents.set_engaged(&[axis], true);

        let command = CommandBuilder::new()
            .add_gcode(GCode::Probe)
            .add_int("F", PROBE_FEEDRATE)
            .add_float(&axis.to_string(), distance, Some(GCODE_ROUNDING_PRECISION));
        let line = command.build();
        let opts = self.movement_opts();

        match self.send_checked(command, opts).await {
            Ok(_) => {}
            Err(Error::Controller(err)) => {
                tracing::error!("Probe failed: {}", err);
                self.home_sequence(&AxisSet::from([axis]), &AxisSet::new())
                    .await?;
                let response = err.response().unwrap_or_default().to_string();
                if response.to_lowercase().contains("probe") {
                    return Err(ControllerError::TipProbe {
                        command: line,
                        response,
                    }
                    .into());
                }
                return Err(err.into());
            }
            Err(e) => return Err(e),
        }

        self.update_position().await
    }

    /// Free axes stuck against their limit switches.
    ///
    /// Runs at the configured high current and a low maximum speed. Axes
    /// whose switch is pressed are homed; the others back off by `distance`.
    pub async fn unstick_axes(
        &mut self,
        axes: &AxisSet,
        distance: Option<f64>,
        speed: Option<f64>,
    ) -> Result<()> {
        let distance = distance.unwrap_or(DEFAULT_UNSTICK_DISTANCE);
        let speed = speed.unwrap_or(DEFAULT_UNSTICK_SPEED);
        let axes = axes.clone();
        let high: BTreeMap<Axis, f64> = axes
            .iter()
            .map(|&a| (a, self.config.motion.high_current.get(a)))
            .collect();
        let speeds: BTreeMap<Axis, f64> = axes.iter().map(|&a| (a, speed)).collect();

        self.with_current(move |driver| {
            Box::pin(async move {
                driver.set_active_current(&high);
                driver
                    .with_axis_max_speed(speeds, move |driver| {
                        Box::pin(async move {
                            let switches = driver.switch_state().await?;
                            let pressed: AxisSet = axes
                                .iter()
                                .copied()
                                .filter(|&a| switches.is_pressed(a))
                                .collect();
                            let back_off: BTreeMap<Axis, f64> = axes
                                .iter()
                                .filter(|a| !pressed.contains(a))
                                .map(|&a| (a, driver.position.get(a) - distance))
                                .collect();

                            if !back_off.is_empty() {
                                driver.move_to(&back_off, MoveOptions::default()).await?;
                            }
                            if !pressed.is_empty() {
                                driver.home(&pressed, &AxisSet::new()).await?;
                            }
                            Ok(())
                        })
                    })
                    .await
            })
        })
        .await
    }
}
