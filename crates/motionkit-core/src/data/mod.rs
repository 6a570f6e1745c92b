//! Data models for axes, positions and per-axis motor state
//!
//! This module provides:
//! - The fixed six-axis set (gantry X/Y, mount Z/A, plungers B/C)
//! - Fully populated position maps
//! - Homing flags as reported by the controller
//! - Per-axis current/engagement state

pub mod current;

pub use current::{AxisCurrentState, AxisMotorState};

use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Index;

/// One physical degree of freedom of the robot.
///
/// Variants are declared in letter order so that `Ord` (and therefore every
/// `BTreeMap<Axis, _>`) iterates alphabetically, which is the order in which
/// axis words are written on a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// Right mount vertical axis
    A,
    /// Left plunger
    B,
    /// Right plunger
    C,
    /// Gantry left/right
    X,
    /// Gantry front/back
    Y,
    /// Left mount vertical axis
    Z,
}

/// A set of axes, iterated in letter order
pub type AxisSet = BTreeSet<Axis>;

impl Axis {
    /// Every axis, in the conventional `XYZABC` order
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C];

    /// Plunger axes
    pub const PLUNGERS: [Axis; 2] = [Axis::B, Axis::C];

    /// The axis letter as written on the wire
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::A => 'A',
            Axis::B => 'B',
            Axis::C => 'C',
        }
    }

    /// Parse a single axis letter (case-insensitive)
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            'A' => Some(Axis::A),
            'B' => Some(Axis::B),
            'C' => Some(Axis::C),
            _ => None,
        }
    }

    /// Whether this axis drives a pipette plunger
    pub fn is_plunger(self) -> bool {
        matches!(self, Axis::B | Axis::C)
    }

    /// Parse a string of axis letters such as `"ZABC"` into a set.
    ///
    /// Duplicates collapse; any unknown letter is an error.
    pub fn parse_set(axes: &str) -> Result<AxisSet, ControllerError> {
        axes.chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| {
                Axis::from_letter(c).ok_or_else(|| ControllerError::UnknownAxis {
                    axis: c.to_string(),
                })
            })
            .collect()
    }

    /// Render a set of axes as a letter string (alphabetical)
    pub fn set_to_string(axes: &AxisSet) -> String {
        axes.iter().map(|a| a.letter()).collect()
    }

    /// Every axis as a set
    pub fn all_set() -> AxisSet {
        Axis::ALL.iter().copied().collect()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl std::str::FromStr for Axis {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Axis::from_letter(c).ok_or_else(|| ControllerError::UnknownAxis {
                axis: s.to_string(),
            }),
            _ => Err(ControllerError::UnknownAxis {
                axis: s.to_string(),
            }),
        }
    }
}

/// Millimetre coordinate for every axis.
///
/// Always fully populated; partial updates go through [`AxisPosition::update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisPosition {
    coords: BTreeMap<Axis, f64>,
}

impl AxisPosition {
    /// A position with every axis at `value`
    pub fn uniform(value: f64) -> Self {
        Self {
            coords: Axis::ALL.iter().map(|&a| (a, value)).collect(),
        }
    }

    /// Build a position from six explicit coordinates
    pub fn with_axes(x: f64, y: f64, z: f64, a: f64, b: f64, c: f64) -> Self {
        let mut coords = BTreeMap::new();
        coords.insert(Axis::X, x);
        coords.insert(Axis::Y, y);
        coords.insert(Axis::Z, z);
        coords.insert(Axis::A, a);
        coords.insert(Axis::B, b);
        coords.insert(Axis::C, c);
        Self { coords }
    }

    /// Coordinate of one axis
    pub fn get(&self, axis: Axis) -> f64 {
        self.coords.get(&axis).copied().unwrap_or_default()
    }

    /// Set one axis
    pub fn set(&mut self, axis: Axis, value: f64) {
        self.coords.insert(axis, value);
    }

    /// Overwrite the axes present in `partial`, leaving the others untouched
    pub fn update(&mut self, partial: &BTreeMap<Axis, f64>) {
        for (&axis, &value) in partial {
            self.coords.insert(axis, value);
        }
    }

    /// Restrict to a subset of axes
    pub fn subset(&self, axes: &AxisSet) -> BTreeMap<Axis, f64> {
        axes.iter().map(|&a| (a, self.get(a))).collect()
    }

    /// Iterate `(axis, coordinate)` in letter order
    pub fn iter(&self) -> impl Iterator<Item = (Axis, f64)> + '_ {
        self.coords.iter().map(|(&a, &v)| (a, v))
    }

    /// Copy out as a plain map
    pub fn to_map(&self) -> BTreeMap<Axis, f64> {
        self.coords.clone()
    }
}

impl Default for AxisPosition {
    fn default() -> Self {
        Self::uniform(0.0)
    }
}

impl Index<Axis> for AxisPosition {
    type Output = f64;

    fn index(&self, axis: Axis) -> &Self::Output {
        // always populated by construction
        &self.coords[&axis]
    }
}

impl From<BTreeMap<Axis, f64>> for AxisPosition {
    fn from(partial: BTreeMap<Axis, f64>) -> Self {
        let mut position = AxisPosition::default();
        position.update(&partial);
        position
    }
}

impl fmt::Display for AxisPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = Axis::ALL
            .iter()
            .map(|&a| format!("{}:{:.3}", a, self.get(a)))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Homing flags sourced from the controller's internal register.
///
/// `true` means the axis has been homed since the last reset and its
/// coordinate can be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomingStatus {
    homed: BTreeMap<Axis, bool>,
}

impl HomingStatus {
    /// Every axis flagged as needing a home (the state after boot or reset)
    pub fn unhomed() -> Self {
        Self {
            homed: Axis::ALL.iter().map(|&a| (a, false)).collect(),
        }
    }

    /// Whether an axis must be homed before its coordinate is trusted
    pub fn needs_homing(&self, axis: Axis) -> bool {
        !self.homed.get(&axis).copied().unwrap_or(false)
    }

    /// Axes among `axes` that need homing
    pub fn needing_home<'a>(&self, axes: impl IntoIterator<Item = &'a Axis>) -> AxisSet {
        axes.into_iter()
            .copied()
            .filter(|&a| self.needs_homing(a))
            .collect()
    }

    /// Record the homed flag of one axis
    pub fn set(&mut self, axis: Axis, homed: bool) {
        self.homed.insert(axis, homed);
    }

    /// Merge flags reported by the controller
    pub fn update(&mut self, flags: &BTreeMap<Axis, bool>) {
        for (&axis, &homed) in flags {
            self.homed.insert(axis, homed);
        }
    }

    /// Whether an axis is homed
    pub fn is_homed(&self, axis: Axis) -> bool {
        !self.needs_homing(axis)
    }
}

impl Default for HomingStatus {
    fn default() -> Self {
        Self::unhomed()
    }
}
