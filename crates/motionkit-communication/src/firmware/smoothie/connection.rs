//! Command/acknowledge exchange with a Smoothieware board
//!
//! Every command is followed by a wait-for-idle (`M400`) so the exchange
//! does not complete until any motion it started has finished.

use super::command_builder::{CommandBuilder, GCode};
use super::response_parser::ControllerReply;
use crate::communication::LineTransport;
use motionkit_core::Result;
use std::time::Duration;

pub struct SmoothieConnection {
    transport: Box<dyn LineTransport>,
}

impl SmoothieConnection {
    pub fn new(transport: Box<dyn LineTransport>) -> Self {
        Self { transport }
    }

    pub fn port_name(&self) -> Option<String> {
        self.transport.port_name()
    }

    /// Send `command`, then block on the wait-for-idle suffix.
    ///
    /// `ack_timeout` bounds the acknowledgement of the command itself,
    /// `execute_timeout` bounds the motion it triggers. An error or alarm
    /// in either reply is returned as the classified reply.
    pub async fn send_command(
        &mut self,
        command: &CommandBuilder,
        ack_timeout: Duration,
        execute_timeout: Duration,
    ) -> Result<ControllerReply> {
        let line = command.build();
        tracing::debug!("smoothie -> {}", line);
        let response = self.transport.send_line(&line, ack_timeout).await?;
        let reply = ControllerReply::classify(&response);
        if !matches!(reply, ControllerReply::Ok(_)) {
            return Ok(reply);
        }

        let wait = self
            .transport
            .send_line(GCode::WaitForIdle.as_str(), execute_timeout)
            .await?;
        match ControllerReply::classify(&wait) {
            ControllerReply::Ok(_) => {
                if !response.is_empty() {
                    tracing::debug!("smoothie <- {}", response);
                }
                Ok(reply)
            }
            failed => Ok(failed),
        }
    }

    /// Send a line with no wait-for-idle, for draining boot chatter
    pub async fn send_raw(&mut self, line: &str, timeout: Duration) -> Result<ControllerReply> {
        let response = self.transport.send_line(line, timeout).await?;
        Ok(ControllerReply::classify(&response))
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}
