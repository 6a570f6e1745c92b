//! GCODE vocabulary and command line assembly for Smoothieware

use motionkit_core::Axis;
use std::collections::BTreeMap;
use std::fmt;

/// Decimal places kept for coordinates sent to the controller
pub const GCODE_ROUNDING_PRECISION: u32 = 3;

/// GCODE words understood by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GCode {
    Home,
    Move,
    Dwell,
    CurrentPosition,
    LimitSwitchStatus,
    Probe,
    AbsoluteCoords,
    RelativeCoords,
    ResetFromError,
    SetSpeed,
    ReadInstrumentId,
    WriteInstrumentId,
    ReadInstrumentModel,
    WriteInstrumentModel,
    SetMaxSpeed,
    SetCurrent,
    DisengageMotor,
    HomingStatus,
    Acceleration,
    WaitForIdle,
    StepsPerMm,
    Version,
}

impl GCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "G28.2",
            Self::Move => "G0",
            Self::Dwell => "G4",
            Self::CurrentPosition => "M114.2",
            Self::LimitSwitchStatus => "M119",
            Self::Probe => "G38.2",
            Self::AbsoluteCoords => "G90",
            Self::RelativeCoords => "G91",
            Self::ResetFromError => "M999",
            Self::SetSpeed => "G0F",
            Self::ReadInstrumentId => "M369",
            Self::WriteInstrumentId => "M370",
            Self::ReadInstrumentModel => "M371",
            Self::WriteInstrumentModel => "M372",
            Self::SetMaxSpeed => "M203.1",
            Self::SetCurrent => "M907",
            Self::DisengageMotor => "M18",
            Self::HomingStatus => "G28.6",
            Self::Acceleration => "M204 S10000",
            Self::WaitForIdle => "M400",
            Self::StepsPerMm => "M92",
            Self::Version => "version",
        }
    }
}

impl fmt::Display for GCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builds one command line out of space-separated elements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandBuilder {
    elements: Vec<String>,
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_gcode(mut self, gcode: GCode) -> Self {
        self.elements.push(gcode.as_str().to_string());
        self
    }

    /// Append a raw element such as a mount letter or a hex payload
    pub fn add_element(mut self, element: impl Into<String>) -> Self {
        self.elements.push(element.into());
        self
    }

    /// Append `prefix` immediately followed by `value`, rounded when a
    /// precision is given
    pub fn add_float(mut self, prefix: &str, value: f64, precision: Option<u32>) -> Self {
        let value = match precision {
            Some(places) => round_to(value, places),
            None => value,
        };
        self.elements.push(format!("{}{}", prefix, value));
        self
    }

    pub fn add_int(mut self, prefix: &str, value: i64) -> Self {
        self.elements.push(format!("{}{}", prefix, value));
        self
    }

    /// Append one `<axis><value>` word per entry, in axis letter order
    pub fn add_axes(mut self, values: &BTreeMap<Axis, f64>, precision: Option<u32>) -> Self {
        for (&axis, &value) in values {
            self = self.add_float(&axis.to_string(), value, precision);
        }
        self
    }

    /// Append every element of another command
    pub fn extend(mut self, other: CommandBuilder) -> Self {
        self.elements.extend(other.elements);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Whether any element of the line is `gcode`
    pub fn contains(&self, gcode: GCode) -> bool {
        let word = gcode.as_str();
        self.elements
            .iter()
            .any(|e| e == word || e.split_whitespace().next() == Some(word))
    }

    /// The command line, without terminator
    pub fn build(&self) -> String {
        self.elements.join(" ")
    }
}

impl fmt::Display for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

/// Round half away from zero to `places` decimals
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}
