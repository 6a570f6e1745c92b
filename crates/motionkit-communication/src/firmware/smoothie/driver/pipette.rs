//! Pipette memory access
//!
//! Each mount has a small memory on the attached pipette holding its serial
//! number and model name. The controller reads it over a bus shared with
//! the plunger drivers, so those are powered down around each access.

use super::SmoothieDriver;
use crate::firmware::smoothie::command_builder::{CommandBuilder, GCode};
use crate::firmware::smoothie::response_parser;
use motionkit_core::{Axis, AxisSet, ControllerError, Error, Result};
use std::fmt;
use std::str::FromStr;

/// A pipette mount on the gantry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mount {
    Left,
    Right,
}

impl Mount {
    /// Letter the controller uses for this mount
    pub fn letter(self) -> &'static str {
        match self {
            Mount::Left => "L",
            Mount::Right => "R",
        }
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mount::Left => write!(f, "left"),
            Mount::Right => write!(f, "right"),
        }
    }
}

impl FromStr for Mount {
    type Err = ControllerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "left" => Ok(Mount::Left),
            "right" => Ok(Mount::Right),
            _ => Err(ControllerError::UnknownMount {
                mount: s.to_string(),
            }),
        }
    }
}

fn axes(letters: &[Axis]) -> AxisSet {
    letters.iter().copied().collect()
}

impl SmoothieDriver {
    /// Serial number stored on the pipette, `None` when nothing readable is
    /// attached
    pub async fn read_pipette_id(&mut self, mount: Mount) -> Result<Option<String>> {
        self.read_from_pipette(GCode::ReadInstrumentId, mount).await
    }

    /// Model name stored on the pipette, normalized to carry a version suffix
    pub async fn read_pipette_model(&mut self, mount: Mount) -> Result<Option<String>> {
        let model = self
            .read_from_pipette(GCode::ReadInstrumentModel, mount)
            .await?;
        Ok(model.map(response_parser::normalize_pipette_model))
    }

    pub async fn write_pipette_id(&mut self, mount: Mount, data: &str) -> Result<()> {
        self.write_to_pipette(GCode::WriteInstrumentId, mount, data).await
    }

    pub async fn write_pipette_model(&mut self, mount: Mount, data: &str) -> Result<()> {
        self.write_to_pipette(GCode::WriteInstrumentModel, mount, data)
            .await
    }

    /// Controller errors and unreadable data mean "no pipette"; connection
    /// failures still propagate
    async fn read_from_pipette(&mut self, gcode: GCode, mount: Mount) -> Result<Option<String>> {
        match self.disengage_axis(&axes(&[Axis::Z, Axis::A, Axis::B, Axis::C])).await {
            Ok(()) => {}
            Err(Error::Controller(e)) => {
                tracing::debug!("Could not disengage before reading {} mount: {}", mount, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(self.config.timing.pipette_read_delay()).await;

        let command = CommandBuilder::new()
            .add_gcode(gcode)
            .add_element(mount.letter());
        let opts = self.opts().quiet();
        let response = match self.send_checked(command, opts).await {
            Ok(response) => response,
            Err(Error::Controller(e)) => {
                tracing::debug!("No pipette data on {} mount: {}", mount, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let text = response_parser::parse_instrument_data(&response, mount.letter())
            .and_then(|data| response_parser::bytes_to_ascii(&data));
        match text {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                tracing::debug!("Unreadable pipette data on {} mount: {}", mount, e);
                Ok(None)
            }
        }
    }

    async fn write_to_pipette(&mut self, gcode: GCode, mount: Mount, data: &str) -> Result<()> {
        self.disengage_axis(&axes(&[Axis::B, Axis::C])).await?;
        tokio::time::sleep(self.config.timing.current_settle()).await;
        let command = CommandBuilder::new()
            .add_gcode(gcode)
            .add_element(mount.letter())
            .add_element(response_parser::ascii_to_hex(data));
        tracing::debug!("Writing pipette memory on {} mount: {}", mount, command);
        let opts = self.opts();
        self.send_checked(command, opts).await?;
        Ok(())
    }
}
