//! Chunked transfer of the firmware image

use super::TargetLink;
use crate::bus::{DataPayload, ErrorCode, Message};
use crate::chunks::Chunk;
use crate::error::{HexError, UpdateError};
use std::time::Duration;

impl TargetLink {
    /// Send one chunk and wait for the bootloader to acknowledge its address
    pub async fn send_chunk(&mut self, chunk: &Chunk, ack_wait: Duration) -> Result<(), UpdateError> {
        let payload =
            DataPayload::create(chunk.address, &chunk.data).ok_or(HexError::InvalidChunkSize)?;
        let address = chunk.address;
        tracing::trace!(
            "Sending {} bytes at {:#010x} to {}",
            chunk.data.len(),
            address,
            self.bootloader
        );
        self.bus
            .send(self.bootloader, Message::Data(payload))
            .await?;

        let description = format!("data at {:#010x}", address);
        let code = self
            .expect(&description, ack_wait, |message| match message {
                Message::DataAck {
                    address: acked,
                    error_code,
                } if *acked == address => Some(*error_code),
                _ => None,
            })
            .await?;
        self.check(code, description)
    }

    /// Report the number of data messages sent and wait for the bootloader
    /// to accept the image
    pub async fn complete(&mut self, num_messages: u32, ack_wait: Duration) -> Result<(), UpdateError> {
        self.bus
            .send(self.bootloader, Message::Complete { num_messages })
            .await?;
        let code = self
            .expect("update complete ack", ack_wait, |message| match message {
                Message::CompleteAck { error_code } => Some(*error_code),
                _ => None,
            })
            .await?;
        self.check(code, "update complete".to_string())
    }

    /// Start the new application. The node reboots, so nothing is awaited.
    pub async fn start_app(&mut self) -> Result<(), UpdateError> {
        tracing::info!("Starting new application on {}", self.node);
        self.bus.send(self.bootloader, Message::StartApp).await?;
        Ok(())
    }

    fn check(&self, code: ErrorCode, message: String) -> Result<(), UpdateError> {
        if code.is_ok() {
            Ok(())
        } else {
            Err(UpdateError::ErrorResponse {
                node: self.bootloader,
                message,
                code,
            })
        }
    }
}
