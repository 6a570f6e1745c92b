//! In-memory message bus with scripted bootloader nodes
//!
//! Replies are published synchronously from `send`, so a listener that
//! subscribed before sending always sees them.

use super::{Arrival, ErrorCode, Message, MessageBus, NodeId};
use crate::error::BusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// How a simulated node answers update messages
#[derive(Debug, Clone, PartialEq)]
pub struct NodeBehavior {
    /// Bootloader reports ready to status requests
    pub ready: bool,
    /// Erase requests are acknowledged
    pub ack_erase: bool,
    /// Code returned for every data message
    pub data_error: Option<ErrorCode>,
    /// Data messages are silently dropped
    pub drop_data_acks: bool,
    /// Code returned for the update complete message
    pub complete_error: Option<ErrorCode>,
}

impl Default for NodeBehavior {
    fn default() -> Self {
        Self {
            ready: true,
            ack_erase: true,
            data_error: None,
            drop_data_acks: false,
            complete_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    nodes: BTreeMap<NodeId, NodeBehavior>,
    sent: Vec<(NodeId, Message)>,
    images: BTreeMap<NodeId, Vec<(u32, Vec<u8>)>>,
}

/// Simulated bus for driving update flows in tests
pub struct SimulatedBus {
    tx: broadcast::Sender<Arrival>,
    state: Mutex<BusState>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            state: Mutex::new(BusState::default()),
        }
    }

    /// Attach a node, addressed by its application id
    pub fn add_node(&self, node: NodeId, behavior: NodeBehavior) {
        self.state
            .lock()
            .nodes
            .insert(node.application_for(), behavior);
    }

    /// Every message sent on the bus, in order
    pub fn sent(&self) -> Vec<(NodeId, Message)> {
        self.state.lock().sent.clone()
    }

    /// Messages sent to one node
    pub fn sent_to(&self, node: NodeId) -> Vec<Message> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(to, _)| *to == node)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Data accepted by a node's bootloader as (address, bytes) pairs
    pub fn received_image(&self, node: NodeId) -> Vec<(u32, Vec<u8>)> {
        self.state
            .lock()
            .images
            .get(&node.application_for())
            .cloned()
            .unwrap_or_default()
    }

    fn reply(state: &mut BusState, to: NodeId, message: &Message) -> Option<Message> {
        let app = to.application_for();
        let behavior = state.nodes.get(&app)?.clone();
        match message {
            Message::StatusRequest if to.is_bootloader() => {
                behavior.ready.then_some(Message::StatusResponse { ready: true })
            }
            Message::EraseApplication if to.is_bootloader() => behavior
                .ack_erase
                .then_some(Message::EraseApplicationAck {
                    error_code: ErrorCode::OK,
                }),
            Message::Data(payload) if to.is_bootloader() => {
                if behavior.drop_data_acks {
                    return None;
                }
                let error_code = if !payload.is_valid() {
                    ErrorCode::BAD_CHECKSUM
                } else {
                    behavior.data_error.unwrap_or(ErrorCode::OK)
                };
                if error_code.is_ok() {
                    state
                        .images
                        .entry(app)
                        .or_default()
                        .push((payload.address, payload.bytes().to_vec()));
                }
                Some(Message::DataAck {
                    address: payload.address,
                    error_code,
                })
            }
            Message::Complete { .. } if to.is_bootloader() => Some(Message::CompleteAck {
                error_code: behavior.complete_error.unwrap_or(ErrorCode::OK),
            }),
            _ => None,
        }
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for SimulatedBus {
    async fn send(&self, node: NodeId, message: Message) -> Result<(), BusError> {
        let reply = {
            let mut state = self.state.lock();
            state.sent.push((node, message.clone()));
            Self::reply(&mut state, node, &message)
        };
        if let Some(reply) = reply {
            // No listeners is not an error
            let _ = self.tx.send(Arrival {
                from: node,
                message: reply,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arrival> {
        self.tx.subscribe()
    }
}
