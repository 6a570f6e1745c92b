//! Simulated controller
//!
//! A line transport that answers like a Smoothieware board without any
//! hardware attached. Every line sent is recorded with the instant it was
//! sent so tests can check ordering and the delays between commands.
//! Queries (`M114.2`, `G28.6`, `M119`, `version`, pipette memory) get
//! canned answers built from the simulated state; anything else is acked.
//! Moves (`G0`, absolute or relative) and homes (`G28.2`) update the
//! simulated position.

use super::{ControlLine, ControlLines, LineTransport};
use async_trait::async_trait;
use motionkit_core::{Axis, AxisPosition, ConnectionError, Result};
use motionkit_settings::MotionSettings;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A command line as it reached the simulated controller
#[derive(Debug, Clone)]
pub struct SentLine {
    pub at: Instant,
    pub line: String,
}

#[derive(Debug)]
enum Scripted {
    Reply(String),
    Timeout,
}

#[derive(Debug)]
struct SimState {
    sent: Vec<SentLine>,
    scripted: VecDeque<(String, Scripted)>,
    position: AxisPosition,
    homed_position: AxisPosition,
    relative: bool,
    homed: BTreeMap<Axis, bool>,
    switches: BTreeMap<Axis, bool>,
    probe: bool,
    pipette_memory: HashMap<String, Vec<u8>>,
    version: String,
}

/// Line transport backed by an in-memory controller.
///
/// Clones share state, so a test can keep one handle for inspection and
/// hand another to the driver.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// A controller with every axis homed and at the default homed
    /// position, no switches pressed and no pipettes attached
    pub fn new() -> Self {
        let homed_position = AxisPosition::from(MotionSettings::default().homed_position);
        Self {
            state: Arc::new(Mutex::new(SimState {
                sent: Vec::new(),
                scripted: VecDeque::new(),
                position: homed_position.clone(),
                homed_position,
                relative: false,
                homed: Axis::ALL.iter().map(|&a| (a, true)).collect(),
                switches: Axis::ALL.iter().map(|&a| (a, false)).collect(),
                probe: false,
                pipette_memory: HashMap::new(),
                version: "edge-1a2b3c4NOMSD".to_string(),
            })),
        }
    }

    /// Every line sent so far, in order
    pub fn sent_lines(&self) -> Vec<SentLine> {
        self.state.lock().sent.clone()
    }

    /// Every command sent so far, without the wait-for-idle lines
    pub fn sent_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|s| s.line != "M400")
            .map(|s| s.line.clone())
            .collect()
    }

    /// Forget the recorded lines
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Answer the next command containing `pattern` with `response`
    pub fn script_reply(&self, pattern: impl Into<String>, response: impl Into<String>) {
        self.state
            .lock()
            .scripted
            .push_back((pattern.into(), Scripted::Reply(response.into())));
    }

    /// Never acknowledge the next command containing `pattern`
    pub fn script_timeout(&self, pattern: impl Into<String>) {
        self.state
            .lock()
            .scripted
            .push_back((pattern.into(), Scripted::Timeout));
    }

    /// Position reported by `M114.2`
    pub fn set_position(&self, position: AxisPosition) {
        self.state.lock().position = position;
    }

    /// Homing flags reported by `G28.6`
    pub fn set_homed(&self, axis: Axis, homed: bool) {
        self.state.lock().homed.insert(axis, homed);
    }

    /// Limit switch state reported by `M119`
    pub fn set_switch(&self, axis: Axis, pressed: bool) {
        self.state.lock().switches.insert(axis, pressed);
    }

    /// Store raw bytes in a pipette's memory region (`"id:L"`, `"model:R"`...)
    pub fn set_pipette_memory(&self, region: &str, data: &[u8]) {
        self.state
            .lock()
            .pipette_memory
            .insert(region.to_string(), data.to_vec());
    }

    fn reply(state: &mut SimState, line: &str) -> Option<String> {
        if let Some(idx) = state
            .scripted
            .iter()
            .position(|(pattern, _)| line.contains(pattern.as_str()))
        {
            return match state.scripted.remove(idx) {
                Some((_, Scripted::Reply(text))) => Some(text),
                _ => None,
            };
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        Self::apply_motion(state, &words);
        let first = words.first().copied().unwrap_or_default();
        let reply = match first {
            "M114.2" => {
                let coords: Vec<String> = Axis::ALL
                    .iter()
                    .map(|&a| format!("{}:{:.4}", a, state.position.get(a)))
                    .collect();
                format!("ok MCS: {}", coords.join(" "))
            }
            "G28.6" => Axis::ALL
                .iter()
                .map(|a| format!("{}:{}", a, u8::from(state.homed[a])))
                .collect::<Vec<_>>()
                .join(" "),
            "M119" => {
                let mut parts: Vec<String> = Axis::ALL
                    .iter()
                    .map(|a| format!("{}_max:{}", a, u8::from(state.switches[a])))
                    .collect();
                parts.push(format!("Probe: {}", u8::from(state.probe)));
                parts.join(" ")
            }
            "version" => format!(
                "Build version: {}, Build date: Jan 28 2018 15:26:57, MCU: LPC1769, System Clock: 120MHz",
                state.version
            ),
            "M369" | "M371" => {
                let mount = words.get(1).copied().unwrap_or_default();
                let region = if first == "M369" { "id" } else { "model" };
                match state.pipette_memory.get(&format!("{}:{}", region, mount)) {
                    Some(data) => format!("{}:{}", mount, to_hex(data)),
                    None => format!("error: no {} instrument found", mount),
                }
            }
            "M370" | "M372" => {
                let mount = words.get(1).copied().unwrap_or_default();
                let region = if first == "M370" { "id" } else { "model" };
                let data = words.get(2).map(|hex| from_hex(hex)).unwrap_or_default();
                state
                    .pipette_memory
                    .insert(format!("{}:{}", region, mount), data);
                String::new()
            }
            _ => String::new(),
        };
        Some(reply)
    }

    fn apply_motion(state: &mut SimState, words: &[&str]) {
        let mut gcode: Option<&str> = None;
        for &word in words {
            match word {
                "G90" => state.relative = false,
                "G91" => state.relative = true,
                "G0" | "G28.2" => {
                    gcode = Some(word);
                    continue;
                }
                _ => {}
            }
            if word.starts_with('G') || word.starts_with('M') {
                gcode = None;
                continue;
            }
            match gcode {
                Some("G28.2") => {
                    for axis in word.chars().filter_map(Axis::from_letter) {
                        let homed = state.homed_position.get(axis);
                        state.position.set(axis, homed);
                        state.homed.insert(axis, true);
                    }
                }
                Some("G0") => {
                    let axis = word.chars().next().and_then(Axis::from_letter);
                    let value = word.get(1..).and_then(|v| v.parse::<f64>().ok());
                    if let (Some(axis), Some(value)) = (axis, value) {
                        let target = if state.relative {
                            state.position.get(axis) + value
                        } else {
                            value
                        };
                        state.position.set(axis, target);
                    }
                }
                _ => {}
            }
        }
    }

    /// Position the simulated controller would report
    pub fn position(&self) -> AxisPosition {
        self.state.lock().position.clone()
    }
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(hex: &str) -> Vec<u8> {
    (0..hex.len() / 2)
        .filter_map(|i| u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok())
        .collect()
}

#[async_trait]
impl LineTransport for SimulatedTransport {
    async fn send_line(&mut self, line: &str, timeout: Duration) -> Result<String> {
        let reply = {
            let mut state = self.state.lock();
            state.sent.push(SentLine {
                at: Instant::now(),
                line: line.to_string(),
            });
            Self::reply(&mut state, line)
        };

        match reply {
            Some(text) => Ok(text),
            None => {
                tokio::time::sleep(timeout).await;
                Err(ConnectionError::Timeout {
                    command: line.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    fn port_name(&self) -> Option<String> {
        Some("simulated".to_string())
    }
}

/// Control lines that record every transition
#[derive(Debug, Clone, Default)]
pub struct SimulatedControlLines {
    events: Arc<Mutex<Vec<(ControlLine, bool)>>>,
}

impl SimulatedControlLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transitions so far, in order
    pub fn events(&self) -> Vec<(ControlLine, bool)> {
        self.events.lock().clone()
    }
}

impl ControlLines for SimulatedControlLines {
    fn set_line(&self, line: ControlLine, asserted: bool) -> Result<()> {
        self.events.lock().push((line, asserted));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_position_query_reports_state() {
        let mut sim = SimulatedTransport::new();
        sim.set_position(AxisPosition::with_axes(1.0, 2.0, 3.0, 4.0, 5.0, 6.0));
        let reply = sim
            .send_line("M114.2", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            reply,
            "ok MCS: X:1.0000 Y:2.0000 Z:3.0000 A:4.0000 B:5.0000 C:6.0000"
        );
    }

    #[tokio::test]
    async fn test_scripted_reply_is_consumed_once() {
        let mut sim = SimulatedTransport::new();
        sim.script_reply("G0", "ALARM: Hard limit +X");
        let t = Duration::from_millis(10);
        assert_eq!(sim.send_line("G0 X10", t).await.unwrap(), "ALARM: Hard limit +X");
        assert_eq!(sim.send_line("G0 X10", t).await.unwrap(), "");
        assert_eq!(sim.sent_commands(), vec!["G0 X10", "G0 X10"]);
    }

    #[tokio::test]
    async fn test_moves_update_position() {
        let mut sim = SimulatedTransport::new();
        let t = Duration::from_millis(10);
        sim.send_line("M907 X1.25 G4 P0.05 G0 X100 Y50.5", t).await.unwrap();
        sim.send_line("G91 G0 Y-20 G0 Y10 G90", t).await.unwrap();
        assert_eq!(sim.position().get(Axis::X), 100.0);
        assert_eq!(sim.position().get(Axis::Y), 40.5);
        sim.send_line("G28.2 X", t).await.unwrap();
        assert_eq!(sim.position().get(Axis::X), 418.0);
    }

    #[tokio::test]
    async fn test_scripted_timeout() {
        let mut sim = SimulatedTransport::new();
        sim.script_timeout("M999");
        let err = sim
            .send_line("M999", Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_pipette_memory_round_trip() {
        let mut sim = SimulatedTransport::new();
        let t = Duration::from_millis(10);
        assert!(sim.send_line("M369 L", t).await.unwrap().contains("instrument found"));
        sim.send_line("M370 L 414243", t).await.unwrap();
        assert_eq!(sim.send_line("M369 L", t).await.unwrap(), "L:414243");
    }
}
