//! Erasing the application image

use super::TargetLink;
use crate::bus::Message;
use crate::error::UpdateError;
use std::time::Duration;

impl TargetLink {
    /// Erase the application flash and wait for the acknowledgement
    pub async fn erase(&mut self, timeout: Duration) -> Result<(), UpdateError> {
        tracing::info!("Erasing application on {}", self.bootloader);
        self.bus
            .send(self.bootloader, Message::EraseApplication)
            .await?;
        let code = self
            .expect("erase application ack", timeout, |message| match message {
                Message::EraseApplicationAck { error_code } => Some(*error_code),
                _ => None,
            })
            .await?;
        if !code.is_ok() {
            return Err(UpdateError::ErrorResponse {
                node: self.bootloader,
                message: "erase application".to_string(),
                code,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::{MessageBus, NodeBehavior, NodeId, SimulatedBus};
    use crate::update::TargetLink;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_erase_times_out_without_ack() {
        let sim = Arc::new(SimulatedBus::new());
        sim.add_node(
            NodeId::Gripper,
            NodeBehavior {
                ack_erase: false,
                ..NodeBehavior::default()
            },
        );
        let bus: Arc<dyn MessageBus> = sim;

        let mut link = TargetLink::new(bus, NodeId::Gripper).unwrap();
        let err = link.erase(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
