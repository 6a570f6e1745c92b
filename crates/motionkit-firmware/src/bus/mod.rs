//! Message bus abstraction for talking to networked controller nodes
//!
//! Nodes have an application address and, while flashing, a bootloader
//! address. The update flow sends to a node and waits for its reply on a
//! broadcast subscription of everything the bus receives.

pub mod simulated;

pub use simulated::{NodeBehavior, SimulatedBus};

use crate::error::{BusError, UpdateError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

/// Largest firmware payload carried by one data message
pub const DATA_PAYLOAD_SIZE: usize = 48;

/// Addressable nodes on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeId {
    Broadcast,
    Host,
    Gripper,
    GripperBootloader,
    GantryX,
    GantryXBootloader,
    GantryY,
    GantryYBootloader,
    Head,
    HeadBootloader,
    PipetteLeft,
    PipetteLeftBootloader,
    PipetteRight,
    PipetteRightBootloader,
}

impl NodeId {
    pub const APPLICATIONS: [NodeId; 6] = [
        NodeId::Gripper,
        NodeId::GantryX,
        NodeId::GantryY,
        NodeId::Head,
        NodeId::PipetteLeft,
        NodeId::PipetteRight,
    ];

    /// Bus address of the node
    pub fn address(self) -> u8 {
        match self {
            NodeId::Broadcast => 0x00,
            NodeId::Host => 0x10,
            NodeId::Gripper => 0x20,
            NodeId::GripperBootloader => 0x2F,
            NodeId::GantryX => 0x30,
            NodeId::GantryXBootloader => 0x3F,
            NodeId::GantryY => 0x40,
            NodeId::GantryYBootloader => 0x4F,
            NodeId::Head => 0x50,
            NodeId::HeadBootloader => 0x5F,
            NodeId::PipetteLeft => 0x60,
            NodeId::PipetteLeftBootloader => 0x6F,
            NodeId::PipetteRight => 0x70,
            NodeId::PipetteRightBootloader => 0x7F,
        }
    }

    /// The bootloader address serving this node; bootloaders map to
    /// themselves and nodes without one return `None`
    pub fn bootloader_for(self) -> Option<NodeId> {
        match self {
            NodeId::Gripper | NodeId::GripperBootloader => Some(NodeId::GripperBootloader),
            NodeId::GantryX | NodeId::GantryXBootloader => Some(NodeId::GantryXBootloader),
            NodeId::GantryY | NodeId::GantryYBootloader => Some(NodeId::GantryYBootloader),
            NodeId::Head | NodeId::HeadBootloader => Some(NodeId::HeadBootloader),
            NodeId::PipetteLeft | NodeId::PipetteLeftBootloader => {
                Some(NodeId::PipetteLeftBootloader)
            }
            NodeId::PipetteRight | NodeId::PipetteRightBootloader => {
                Some(NodeId::PipetteRightBootloader)
            }
            NodeId::Broadcast | NodeId::Host => None,
        }
    }

    /// The application address for this node
    pub fn application_for(self) -> NodeId {
        match self {
            NodeId::GripperBootloader => NodeId::Gripper,
            NodeId::GantryXBootloader => NodeId::GantryX,
            NodeId::GantryYBootloader => NodeId::GantryY,
            NodeId::HeadBootloader => NodeId::Head,
            NodeId::PipetteLeftBootloader => NodeId::PipetteLeft,
            NodeId::PipetteRightBootloader => NodeId::PipetteRight,
            other => other,
        }
    }

    pub fn is_bootloader(self) -> bool {
        self.application_for() != self
    }

    fn name(self) -> &'static str {
        match self {
            NodeId::Broadcast => "broadcast",
            NodeId::Host => "host",
            NodeId::Gripper => "gripper",
            NodeId::GripperBootloader => "gripper-bootloader",
            NodeId::GantryX => "gantry-x",
            NodeId::GantryXBootloader => "gantry-x-bootloader",
            NodeId::GantryY => "gantry-y",
            NodeId::GantryYBootloader => "gantry-y-bootloader",
            NodeId::Head => "head",
            NodeId::HeadBootloader => "head-bootloader",
            NodeId::PipetteLeft => "pipette-left",
            NodeId::PipetteLeftBootloader => "pipette-left-bootloader",
            NodeId::PipetteRight => "pipette-right",
            NodeId::PipetteRightBootloader => "pipette-right-bootloader",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result code carried by bootloader acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0x00);
    pub const INVALID_SIZE: ErrorCode = ErrorCode(0x01);
    pub const BAD_CHECKSUM: ErrorCode = ErrorCode(0x02);
    pub const INVALID_BYTE_COUNT: ErrorCode = ErrorCode(0x03);
    pub const INVALID_INPUT: ErrorCode = ErrorCode(0x04);
    pub const HARDWARE: ErrorCode = ErrorCode(0x05);

    pub fn is_ok(self) -> bool {
        self == ErrorCode::OK
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            ErrorCode::OK => "ok",
            ErrorCode::INVALID_SIZE => "invalid size",
            ErrorCode::BAD_CHECKSUM => "bad checksum",
            ErrorCode::INVALID_BYTE_COUNT => "invalid byte count",
            ErrorCode::INVALID_INPUT => "invalid input",
            ErrorCode::HARDWARE => "hardware error",
            _ => "unknown error",
        };
        write!(f, "{} ({:#06x})", name, self.0)
    }
}

/// Firmware payload of a data message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub address: u32,
    pub num_bytes: u8,
    pub data: [u8; DATA_PAYLOAD_SIZE],
    pub checksum: u16,
}

impl DataPayload {
    /// Build a payload for up to [`DATA_PAYLOAD_SIZE`] bytes, zero padded.
    ///
    /// Returns `None` when `data` is too long.
    pub fn create(address: u32, data: &[u8]) -> Option<Self> {
        if data.len() > DATA_PAYLOAD_SIZE {
            return None;
        }
        let mut padded = [0u8; DATA_PAYLOAD_SIZE];
        padded[..data.len()].copy_from_slice(data);
        let num_bytes = data.len() as u8;
        Some(Self {
            address,
            num_bytes,
            data: padded,
            checksum: Self::compute_checksum(address, num_bytes, &padded),
        })
    }

    /// Two's complement of the sum of the address bytes, length and data
    pub fn compute_checksum(address: u32, num_bytes: u8, data: &[u8]) -> u16 {
        let sum = address
            .to_be_bytes()
            .iter()
            .chain(std::iter::once(&num_bytes))
            .chain(data.iter())
            .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
        sum.wrapping_neg()
    }

    /// The meaningful bytes of the payload
    pub fn bytes(&self) -> &[u8] {
        let len = usize::from(self.num_bytes).min(DATA_PAYLOAD_SIZE);
        &self.data[..len]
    }

    pub fn is_valid(&self) -> bool {
        usize::from(self.num_bytes) <= DATA_PAYLOAD_SIZE
            && self.checksum == Self::compute_checksum(self.address, self.num_bytes, &self.data)
    }
}

/// Messages exchanged during a firmware update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask an application to jump to its bootloader
    Initiate,
    StatusRequest,
    StatusResponse { ready: bool },
    EraseApplication,
    EraseApplicationAck { error_code: ErrorCode },
    Data(DataPayload),
    DataAck { address: u32, error_code: ErrorCode },
    Complete { num_messages: u32 },
    CompleteAck { error_code: ErrorCode },
    StartApp,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Initiate => "initiate",
            Message::StatusRequest => "status request",
            Message::StatusResponse { .. } => "status response",
            Message::EraseApplication => "erase application",
            Message::EraseApplicationAck { .. } => "erase application ack",
            Message::Data(_) => "data",
            Message::DataAck { .. } => "data ack",
            Message::Complete { .. } => "update complete",
            Message::CompleteAck { .. } => "update complete ack",
            Message::StartApp => "start app",
        }
    }
}

/// A message received from a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub from: NodeId,
    pub message: Message,
}

/// Transport carrying firmware update messages to nodes.
///
/// `subscribe` must be called before sending a request whose reply is
/// awaited so the reply cannot be missed.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send(&self, node: NodeId, message: Message) -> Result<(), BusError>;

    fn subscribe(&self) -> broadcast::Receiver<Arrival>;
}

/// Wait for the first arrival accepted by `matcher`.
///
/// Gives `UpdateError::Timeout` naming `node` and `waiting_for` when nothing
/// matches within `timeout`.
pub async fn wait_for<T, F>(
    rx: &mut broadcast::Receiver<Arrival>,
    node: NodeId,
    waiting_for: &str,
    timeout: Duration,
    mut matcher: F,
) -> Result<T, UpdateError>
where
    F: FnMut(&Arrival) -> Option<T>,
{
    let timed_out = || UpdateError::Timeout {
        node,
        message: waiting_for.to_string(),
    };
    let result = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(arrival) => {
                    if let Some(value) = matcher(&arrival) {
                        return Ok(value);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Bus listener lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(UpdateError::Bus(BusError::Closed));
                }
            }
        }
    })
    .await;
    result.unwrap_or_else(|_| Err(timed_out()))
}
