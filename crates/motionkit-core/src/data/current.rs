//! Per-axis motor current bookkeeping
//!
//! Each axis is either dwelling (low current, idle) or active (high current,
//! moving or holding under load). The tables here only record intent; the
//! driver is responsible for pushing the resulting currents to the board.

use super::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Motor state of a single axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisMotorState {
    /// High-current "doing work" mode
    pub active: bool,
    /// Motor driver output powered
    pub engaged: bool,
    /// Current (A) the axis was last set to
    pub current: f64,
}

/// Current state for every axis plus the active/dwelling tables the driver
/// switches between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisCurrentState {
    axes: BTreeMap<Axis, AxisMotorState>,
    active_current: BTreeMap<Axis, f64>,
    dwelling_current: BTreeMap<Axis, f64>,
}

impl AxisCurrentState {
    /// Every axis engaged and dwelling at its low current
    pub fn new(active_current: BTreeMap<Axis, f64>, dwelling_current: BTreeMap<Axis, f64>) -> Self {
        let axes = Axis::ALL
            .iter()
            .map(|&axis| {
                (
                    axis,
                    AxisMotorState {
                        active: false,
                        engaged: true,
                        current: dwelling_current.get(&axis).copied().unwrap_or_default(),
                    },
                )
            })
            .collect();
        Self {
            axes,
            active_current,
            dwelling_current,
        }
    }

    /// State of one axis
    pub fn axis(&self, axis: Axis) -> AxisMotorState {
        self.axes.get(&axis).copied().unwrap_or(AxisMotorState {
            active: false,
            engaged: false,
            current: 0.0,
        })
    }

    /// The current every axis is set to, in letter order
    pub fn currents(&self) -> BTreeMap<Axis, f64> {
        self.axes.iter().map(|(&a, s)| (a, s.current)).collect()
    }

    /// Whether an axis is in active (high current) mode
    pub fn is_active(&self, axis: Axis) -> bool {
        self.axis(axis).active
    }

    /// Whether an axis is powered
    pub fn is_engaged(&self, axis: Axis) -> bool {
        self.axis(axis).engaged
    }

    /// Mark axes engaged or disengaged
    pub fn set_engaged<'a>(&mut self, axes: impl IntoIterator<Item = &'a Axis>, engaged: bool) {
        for axis in axes {
            if let Some(state) = self.axes.get_mut(axis) {
                state.engaged = engaged;
            }
        }
    }

    /// Record explicit currents and the mode they represent
    pub fn save(&mut self, settings: &BTreeMap<Axis, f64>, active: bool) {
        for (&axis, &amps) in settings {
            let state = self.axes.entry(axis).or_insert(AxisMotorState {
                active,
                engaged: true,
                current: amps,
            });
            state.active = active;
            state.current = amps;
        }
    }

    /// Drop the given axes to their dwelling current.
    ///
    /// Returns `true` when at least one axis changed.
    pub fn dwell<'a>(&mut self, axes: impl IntoIterator<Item = &'a Axis>) -> bool {
        let dwelling: BTreeMap<Axis, f64> = axes
            .into_iter()
            .filter(|&&a| self.is_active(a))
            .map(|&a| (a, self.dwelling_current(a)))
            .collect();
        if dwelling.is_empty() {
            return false;
        }
        self.save(&dwelling, false);
        true
    }

    /// Raise the given axes to their active current.
    ///
    /// Returns `true` when at least one axis changed.
    pub fn activate<'a>(&mut self, axes: impl IntoIterator<Item = &'a Axis>) -> bool {
        let active: BTreeMap<Axis, f64> = axes
            .into_iter()
            .filter(|&&a| !self.is_active(a))
            .map(|&a| (a, self.active_current(a)))
            .collect();
        if active.is_empty() {
            return false;
        }
        self.save(&active, true);
        true
    }

    /// Configured high current of an axis
    pub fn active_current(&self, axis: Axis) -> f64 {
        self.active_current.get(&axis).copied().unwrap_or_default()
    }

    /// Configured low current of an axis
    pub fn dwelling_current(&self, axis: Axis) -> f64 {
        self.dwelling_current.get(&axis).copied().unwrap_or_default()
    }

    /// The whole active-current table
    pub fn active_table(&self) -> &BTreeMap<Axis, f64> {
        &self.active_current
    }

    /// The whole dwelling-current table
    pub fn dwelling_table(&self) -> &BTreeMap<Axis, f64> {
        &self.dwelling_current
    }

    /// Change the active-current table; active axes pick up the new value
    pub fn set_active_current(&mut self, settings: &BTreeMap<Axis, f64>) {
        self.active_current.extend(settings);
        let refresh: BTreeMap<Axis, f64> = self
            .active_current
            .iter()
            .filter(|&(&a, &amps)| self.is_active(a) && self.axis(a).current != amps)
            .map(|(&a, &amps)| (a, amps))
            .collect();
        if !refresh.is_empty() {
            self.save(&refresh, true);
        }
    }

    /// Change the dwelling-current table; dwelling axes pick up the new value
    pub fn set_dwelling_current(&mut self, settings: &BTreeMap<Axis, f64>) {
        self.dwelling_current.extend(settings);
        let refresh: BTreeMap<Axis, f64> = self
            .dwelling_current
            .iter()
            .filter(|&(&a, &amps)| !self.is_active(a) && self.axis(a).current != amps)
            .map(|(&a, &amps)| (a, amps))
            .collect();
        if !refresh.is_empty() {
            self.save(&refresh, false);
        }
    }
}
