//! Homing sequences
//!
//! Homing Y needs X homed first, and homing X needs the vertical axes
//! clear, so requests expand before running. X and Y each have their own
//! maneuver; the vertical and plunger axes home together.

use super::{MoveOptions, SmoothieDriver};
use crate::firmware::smoothie::command_builder::{CommandBuilder, GCode};
use motionkit_core::{Axis, AxisPosition, AxisSet, Error, Result};
use std::collections::BTreeMap;

/// Order in which axis groups home
const HOME_SEQUENCE: [&[Axis]; 3] = [&[Axis::Z, Axis::A, Axis::B, Axis::C], &[Axis::X], &[Axis::Y]];

/// Add the axes that must home along with the requested ones
pub(crate) fn expand_home_axes(axes: &AxisSet) -> AxisSet {
    let mut expanded = axes.clone();
    if expanded.contains(&Axis::Y) {
        expanded.insert(Axis::X);
    }
    if expanded.contains(&Axis::X) {
        expanded.extend([Axis::Z, Axis::A, Axis::B, Axis::C]);
    }
    expanded
}

/// Split the axes to home into the groups sent one command each, in order
pub(crate) fn home_groups(axes: &AxisSet, disabled: &AxisSet) -> Vec<AxisSet> {
    HOME_SEQUENCE
        .iter()
        .map(|group| {
            group
                .iter()
                .copied()
                .filter(|a| axes.contains(a) && !disabled.contains(a))
                .collect::<AxisSet>()
        })
        .filter(|group| !group.is_empty())
        .collect()
}

fn single(axis: Axis, value: f64) -> BTreeMap<Axis, f64> {
    BTreeMap::from([(axis, value)])
}

impl SmoothieDriver {
    /// Home the given axes, plus whatever they depend on, skipping `disabled`.
    ///
    /// Waits while the driver is paused. Afterwards the homed axes sit at the
    /// configured homed position.
    pub async fn home(&mut self, axes: &AxisSet, disabled: &AxisSet) -> Result<AxisPosition> {
        self.run.wait_until_running().await;
        self.home_sequence(axes, disabled).await
    }

    /// Home every axis
    pub async fn home_all(&mut self) -> Result<AxisPosition> {
        self.home(&Axis::all_set(), &AxisSet::new()).await
    }

    pub(super) async fn home_sequence(
        &mut self,
        axes: &AxisSet,
        disabled: &AxisSet,
    ) -> Result<AxisPosition> {
        let groups = home_groups(&expand_home_axes(axes), disabled);
        let homing: AxisSet = groups.iter().flatten().copied().collect();
        tracing::info!(
            "Homing {}",
            groups
                .iter()
                .map(Axis::set_to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let idle: AxisSet = Axis::ALL
            .iter()
            .copied()
            .filter(|a| !homing.contains(a))
            .collect();
        self.currents.dwell(&idle);

        for group in &groups {
            if group.contains(&Axis::X) {
                self.home_x().await?;
            } else if group.contains(&Axis::Y) {
                self.home_y().await?;
            } else {
                self.home_group(group).await?;
            }
        }

        let homed = self.homed_position.subset(&homing);
        self.position.update(&homed);
        self.currents.set_engaged(&homing, true);
        Ok(self.position.clone())
    }

    async fn home_group(&mut self, group: &AxisSet) -> Result<()> {
        self.currents.activate(group);
        let command = self
            .current_command()
            .add_gcode(GCode::Home)
            .add_element(Axis::set_to_string(group));
        let opts = self.movement_opts();
        let result = self.send_checked(command, opts).await;
        if result.is_ok() {
            for &axis in group {
                self.homing.set(axis, true);
            }
        }
        self.currents.dwell(group);
        let applied = self.apply_current().await;
        result?;
        applied
    }

    /// Back Y off its switch so it cannot trip while X travels, then home X
    async fn home_x(&mut self) -> Result<()> {
        let homing = self.config.homing.clone();
        let opts = self.opts();
        let movement = self.movement_opts();

        self.currents
            .save(&single(Axis::Y, homing.y_backoff_low_current), true);
        let mut back_off = CommandBuilder::new()
            .add_gcode(GCode::RelativeCoords)
            .add_gcode(GCode::Move)
            .add_float("Y", -homing.y_switch_back_off_mm, None);
        if homing.y_switch_reverse_back_off_mm > 0.0 {
            back_off = back_off
                .add_gcode(GCode::Move)
                .add_float("Y", homing.y_switch_reverse_back_off_mm, None);
        }
        let back_off = back_off.add_gcode(GCode::AbsoluteCoords);

        let backed_off = self
            .with_axis_max_speed(
                single(Axis::Y, homing.y_backoff_slow_speed),
                move |driver| {
                    Box::pin(async move {
                        let command = driver.current_command().extend(back_off);
                        driver.send_checked(command, opts).await.map(|_| ())
                    })
                },
            )
            .await;
        self.currents.dwell(&[Axis::Y]);
        backed_off?;
        let net_back_off = homing.y_switch_back_off_mm - homing.y_switch_reverse_back_off_mm;
        let y = self.position.get(Axis::Y) - net_back_off;
        self.position.set(Axis::Y, y);

        let homed = self
            .with_axis_max_speed(
                single(Axis::X, homing.xy_homing_speed),
                move |driver| {
                    Box::pin(async move {
                        driver.currents.activate(&[Axis::X]);
                        let command = driver
                            .current_command()
                            .add_gcode(GCode::Home)
                            .add_element("X");
                        driver.send_checked(command, movement).await?;
                        driver.homing.set(Axis::X, true);
                        Ok(())
                    })
                },
            )
            .await;
        self.currents.dwell(&[Axis::X]);
        let applied = self.apply_current().await;
        homed?;
        applied
    }

    /// Home Y fast, retract, home again slowly and retract off the switch
    async fn home_y(&mut self) -> Result<()> {
        let homing = self.config.homing.clone();
        let opts = self.opts();
        let movement = self.movement_opts();

        let first = self
            .with_axis_max_speed(
                single(Axis::Y, homing.xy_homing_speed),
                move |driver| {
                    Box::pin(async move {
                        driver.currents.activate(&[Axis::Y]);
                        let command = driver
                            .current_command()
                            .add_gcode(GCode::Home)
                            .add_element("Y");
                        driver.send_checked(command, movement).await.map(|_| ())
                    })
                },
            )
            .await;

        let result = match first {
            Ok(()) => {
                let retract = CommandBuilder::new()
                    .add_gcode(GCode::RelativeCoords)
                    .add_gcode(GCode::Move)
                    .add_float("Y", -homing.y_retract_distance, None)
                    .add_gcode(GCode::AbsoluteCoords);
                self.with_axis_max_speed(
                    single(Axis::Y, homing.y_retract_speed),
                    move |driver| {
                        Box::pin(async move {
                            driver.send_checked(retract.clone(), opts).await?;
                            let home = CommandBuilder::new().add_gcode(GCode::Home).add_element("Y");
                            driver.send_checked(home, movement).await?;
                            driver.homing.set(Axis::Y, true);
                            driver.send_checked(retract, opts).await?;
                            Ok(())
                        })
                    },
                )
                .await
            }
            Err(e) => Err(e),
        };

        self.currents.dwell(&[Axis::Y]);
        let applied = self.apply_current().await;
        result?;
        applied
    }

    /// Move close to the switches at full speed, then home only `axes`.
    ///
    /// A controller error during the approach is expected when an axis is
    /// already near its switch and is ignored.
    pub async fn fast_home(&mut self, axes: &AxisSet, safety_margin: f64) -> Result<AxisPosition> {
        let destination: BTreeMap<Axis, f64> = axes
            .iter()
            .map(|&a| (a, self.homed_position.get(a) - safety_margin.abs()))
            .collect();
        match self.move_to(&destination, MoveOptions::default()).await {
            Ok(_) => {}
            Err(Error::Controller(e)) => {
                tracing::debug!("fast_home approach stopped early: {}", e);
            }
            Err(e) => return Err(e),
        }
        let disabled: AxisSet = Axis::all_set().difference(axes).copied().collect();
        self.home(axes, &disabled).await
    }
}
