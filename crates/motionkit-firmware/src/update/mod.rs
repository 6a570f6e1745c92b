//! Firmware transfer to bus nodes
//!
//! Each target goes through initiate, optional erase, chunked download,
//! completion and restart. [`run_updates`] runs any number of targets
//! concurrently and streams their progress.

mod downloader;
mod eraser;
mod initiator;
mod runner;

pub use runner::{run_updates, UpdateStream};

use crate::bus::{wait_for, Arrival, Message, MessageBus, NodeId};
use crate::error::UpdateError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Progress reported once the node is ready for data
pub const DOWNLOAD_START_PROGRESS: f64 = 0.1;

/// Progress reported once every chunk is acknowledged
pub const DOWNLOAD_END_PROGRESS: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Queued,
    Updating,
    Done,
}

/// Phase and fractional progress (0.0 to 1.0) of one target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub phase: UpdatePhase,
    pub progress: f64,
}

impl UpdateStatus {
    pub fn queued() -> Self {
        Self {
            phase: UpdatePhase::Queued,
            progress: 0.0,
        }
    }

    pub fn updating(progress: f64) -> Self {
        Self {
            phase: UpdatePhase::Updating,
            progress,
        }
    }

    pub fn done() -> Self {
        Self {
            phase: UpdatePhase::Done,
            progress: 1.0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == UpdatePhase::Done
    }
}

/// Progress after `sent` of `total` chunks
pub fn download_progress(sent: usize, total: usize) -> f64 {
    if total == 0 {
        return DOWNLOAD_END_PROGRESS;
    }
    DOWNLOAD_START_PROGRESS
        + (DOWNLOAD_END_PROGRESS - DOWNLOAD_START_PROGRESS) * (sent as f64 / total as f64)
}

/// Retry and timeout policy for an update run
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSettings {
    /// Status requests sent while waiting for the bootloader
    pub retry_count: u32,
    /// Wait for each status response and for the erase acknowledgement
    pub timeout: Duration,
    /// Erase the application before downloading
    pub erase: bool,
    /// Wait for each data and completion acknowledgement
    pub ack_wait: Duration,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            retry_count: 12,
            timeout: Duration::from_secs(5),
            erase: true,
            ack_wait: Duration::from_secs(3),
        }
    }
}

/// Conversation with one target's application and bootloader.
///
/// Subscribes to the bus on creation so no reply is missed.
pub struct TargetLink {
    bus: Arc<dyn MessageBus>,
    rx: broadcast::Receiver<Arrival>,
    node: NodeId,
    bootloader: NodeId,
}

impl TargetLink {
    pub fn new(bus: Arc<dyn MessageBus>, node: NodeId) -> Result<Self, UpdateError> {
        let bootloader = node
            .bootloader_for()
            .ok_or(UpdateError::NotUpdatable { node })?;
        let rx = bus.subscribe();
        Ok(Self {
            bus,
            rx,
            node: node.application_for(),
            bootloader,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn bootloader(&self) -> NodeId {
        self.bootloader
    }

    /// Wait for a reply from the bootloader accepted by `matcher`
    async fn expect<T, F>(
        &mut self,
        waiting_for: &str,
        timeout: Duration,
        mut matcher: F,
    ) -> Result<T, UpdateError>
    where
        F: FnMut(&Message) -> Option<T>,
    {
        let bootloader = self.bootloader;
        wait_for(&mut self.rx, bootloader, waiting_for, timeout, |arrival| {
            if arrival.from == bootloader {
                matcher(&arrival.message)
            } else {
                None
            }
        })
        .await
    }
}
