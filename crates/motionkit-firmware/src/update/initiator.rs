//! Handshake that moves a node into its bootloader

use super::TargetLink;
use crate::bus::Message;
use crate::error::UpdateError;
use std::time::Duration;

impl TargetLink {
    /// Ask the application to restart into its bootloader, then poll the
    /// bootloader until it reports ready.
    ///
    /// Each of the `retry_count` status requests waits up to `timeout`.
    pub async fn initiate(&mut self, retry_count: u32, timeout: Duration) -> Result<(), UpdateError> {
        tracing::info!("Starting firmware update on {}", self.node);
        self.bus.send(self.node, Message::Initiate).await?;

        let attempts = retry_count.max(1);
        for attempt in 1..=attempts {
            self.bus.send(self.bootloader, Message::StatusRequest).await?;
            let ready = self
                .expect("status response", timeout, |message| match message {
                    Message::StatusResponse { ready: true } => Some(()),
                    _ => None,
                })
                .await;
            match ready {
                Ok(()) => {
                    tracing::debug!("{} ready after {} status requests", self.bootloader, attempt);
                    return Ok(());
                }
                Err(e) if e.is_timeout() => {
                    tracing::debug!(
                        "{} not ready ({}/{})",
                        self.bootloader,
                        attempt,
                        attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(UpdateError::Timeout {
            node: self.bootloader,
            message: "status response".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::{Message, MessageBus, NodeBehavior, NodeId, SimulatedBus};
    use crate::update::TargetLink;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initiate_polls_bootloader() {
        let sim = Arc::new(SimulatedBus::new());
        sim.add_node(NodeId::Head, NodeBehavior::default());
        let bus: Arc<dyn MessageBus> = sim.clone();

        let mut link = TargetLink::new(bus, NodeId::Head).unwrap();
        link.initiate(3, Duration::from_millis(50)).await.unwrap();

        assert_eq!(sim.sent_to(NodeId::Head), vec![Message::Initiate]);
        assert_eq!(sim.sent_to(NodeId::HeadBootloader), vec![Message::StatusRequest]);
    }

    #[tokio::test]
    async fn test_initiate_gives_up_after_retries() {
        let sim = Arc::new(SimulatedBus::new());
        sim.add_node(
            NodeId::GantryX,
            NodeBehavior {
                ready: false,
                ..NodeBehavior::default()
            },
        );
        let bus: Arc<dyn MessageBus> = sim.clone();

        let mut link = TargetLink::new(bus, NodeId::GantryX).unwrap();
        let err = link.initiate(3, Duration::from_millis(5)).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(sim.sent_to(NodeId::GantryXBootloader).len(), 3);
    }
}
