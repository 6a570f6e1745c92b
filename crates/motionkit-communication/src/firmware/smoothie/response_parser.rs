//! Smoothieware response parser
//!
//! Classifies acknowledged responses and parses the query replies the
//! driver relies on: positions, homing flags, switch states, pipette
//! memory and the firmware version.

use super::command_builder::{round_to, GCODE_ROUNDING_PRECISION};
use motionkit_core::{Axis, ParseError};
use serde::Serialize;
use std::collections::BTreeMap;

const ERROR_KEYWORD: &str = "error";
const ALARM_KEYWORD: &str = "alarm";

/// What the controller made of a command
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerReply {
    /// Acknowledged; carries any text printed before the acknowledgement
    Ok(String),
    /// Error marker in the response
    Error(String),
    /// Alarm marker in the response
    Alarm(String),
}

impl ControllerReply {
    /// Classify raw response text. Alarms win over errors.
    pub fn classify(response: &str) -> Self {
        let lower = response.to_lowercase();
        if lower.contains(ALARM_KEYWORD) {
            Self::Alarm(response.to_string())
        } else if lower.contains(ERROR_KEYWORD) {
            Self::Error(response.to_string())
        } else {
            Self::Ok(response.to_string())
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Ok(text) | Self::Error(text) | Self::Alarm(text) => text,
        }
    }
}

/// Limit switch and probe state reported by `M119`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwitchState {
    pub switches: BTreeMap<Axis, bool>,
    pub probe: bool,
}

impl SwitchState {
    pub fn is_pressed(&self, axis: Axis) -> bool {
        self.switches.get(&axis).copied().unwrap_or(false)
    }
}

fn axis_words(response: &str) -> impl Iterator<Item = (Axis, &str)> + '_ {
    response.split_whitespace().filter_map(|word| {
        let (name, value) = word.split_once(':')?;
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Axis::from_letter(c).map(|axis| (axis, value)),
            _ => None,
        }
    })
}

/// Parse an `M114.2` reply such as
/// `ok MCS: X:418.0000 Y:353.0000 Z:218.0000 A:218.0000 B:19.0000 C:19.0000`.
///
/// All six axes must be present; values are rounded to the command precision.
pub fn parse_position(response: &str) -> Result<BTreeMap<Axis, f64>, ParseError> {
    let mut values = BTreeMap::new();
    for (axis, value) in axis_words(response) {
        let value: f64 = value.parse().map_err(|_| ParseError::new(response))?;
        values.insert(axis, round_to(value, GCODE_ROUNDING_PRECISION));
    }
    if values.len() != Axis::ALL.len() {
        return Err(ParseError::new(response));
    }
    Ok(values)
}

/// Parse a `G28.6` reply such as `X:0 Y:1 Z:1 A:1 B:0 C:0`
pub fn parse_homing_flags(response: &str) -> Result<BTreeMap<Axis, bool>, ParseError> {
    let mut flags = BTreeMap::new();
    for (axis, value) in axis_words(response) {
        let value: u8 = value.parse().map_err(|_| ParseError::new(response))?;
        flags.insert(axis, value != 0);
    }
    if flags.len() != Axis::ALL.len() {
        return Err(ParseError::new(response));
    }
    Ok(flags)
}

/// Parse an `M119` reply such as
/// `X_max:0 Y_max:0 Z_max:0 A_max:1 B_max:0 C_max:0 Probe: 0`
pub fn parse_switch_values(response: &str) -> Result<SwitchState, ParseError> {
    // the probe entry carries a space after its colon
    let normalized = response.replace("Probe: ", "Probe:");
    let mut state = SwitchState::default();
    for word in normalized.split_whitespace() {
        let Some((name, value)) = word.split_once(':') else {
            continue;
        };
        if !(name.contains("max") || name.contains("Probe")) {
            continue;
        }
        let pressed = value
            .parse::<u8>()
            .map(|v| v != 0)
            .map_err(|_| ParseError::new(response))?;
        let key = name.split('_').next().unwrap_or(name);
        if key == "Probe" {
            state.probe = pressed;
        } else if let Some(axis) = key.chars().next().and_then(Axis::from_letter) {
            if key.len() == 1 {
                state.switches.insert(axis, pressed);
            }
        }
    }
    if state.switches.len() != Axis::ALL.len() {
        return Err(ParseError::new(response));
    }
    Ok(state)
}

/// Parse pipette memory returned as `L:<hex bytes>` for `mount_letter`
pub fn parse_instrument_data(response: &str, mount_letter: &str) -> Result<Vec<u8>, ParseError> {
    let first_line = response.lines().next().unwrap_or_default().trim();
    let (mount, hex) = first_line
        .split_once(':')
        .ok_or_else(|| ParseError::new(response))?;
    if mount != mount_letter || hex.len() % 2 != 0 {
        return Err(ParseError::new(response));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| ParseError::new(response))
        })
        .collect()
}

/// Decode pipette memory as text, cut at the first erased (`0x00`/`0xFF`) byte
pub fn bytes_to_ascii(data: &[u8]) -> Result<String, ParseError> {
    let end = data
        .iter()
        .position(|&b| b == 0x00 || b == 0xFF)
        .unwrap_or(data.len());
    String::from_utf8(data[..end].to_vec())
        .map_err(|_| ParseError::new(format!("non-ASCII pipette data: {:02x?}", data)))
}

/// Encode text as the hex payload the write commands expect
pub fn ascii_to_hex(text: &str) -> String {
    text.bytes().map(|b| format!("{:02x}", b)).collect()
}

/// Model names written before version suffixes existed get `_v1`; `_v13`
/// is the old spelling of `_v1.3`
pub fn normalize_pipette_model(model: String) -> String {
    if !model.contains("_v") {
        format!("{}_v1", model)
    } else if model.contains("_v13") {
        model.replace("_v13", "_v1.3")
    } else {
        model
    }
}

/// Extract the build version from a `version` reply, e.g.
/// `Build version: edge-66ec883NOMSD, Build date: ...` gives `edge-66ec883`
pub fn parse_fw_version(response: &str) -> String {
    response
        .split(',')
        .next()
        .and_then(|field| field.rsplit(':').next())
        .unwrap_or_default()
        .trim()
        .replace("NOMSD", "")
}

/// Axis named by the last character of an alarm or error response, if any
pub fn error_axis(response: &str) -> Option<Axis> {
    response
        .trim()
        .chars()
        .last()
        .filter(char::is_ascii_uppercase)
        .and_then(Axis::from_letter)
}
