
//! Publishing persistent messages to the main exchange.

use std::sync::Arc;

use chrono::Utc;
use lapin::{options::BasicPublishOptions, BasicProperties};
use serde::Serialize;

use crate::error::AmqpError;
use crate::supervisor::ConnectionSupervisor;

/// Delivery mode marking a message as persisted to disk by the broker.
const PERSISTENT: u8 = 2;

/// Publishes serialized payloads to the main exchange.
///
/// Fire-and-forget at the transport's durability guarantee: a publish
/// returns once the local channel accepts it, not once the broker has
/// fully persisted it.
pub struct Publisher {
    supervisor: Arc<ConnectionSupervisor>,
}

impl Publisher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Publishes with the default priority of 0.
    pub async fn publish<T: Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError> {
        self.publish_with_priority(routing_key, payload, 0).await
    }

    /// Publishes a persistent message with the given priority (0 to 255,
    /// higher values preferred by the broker for delivery order within a
    /// queue).
    ///
    /// Serialization and transport errors propagate synchronously to the
    /// caller.
    pub async fn publish_with_priority<T: Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
        priority: u8,
    ) -> Result<(), AmqpError> {
        let channel = self.supervisor.get_channel().await?;
        let body = serde_json::to_vec(payload)?;

        channel
            .basic_publish(
                &self.supervisor.config().exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                message_properties(priority),
            )
            .await?;

        log::debug!("Published message to '{routing_key}' with priority {priority}");
        Ok(())
    }
}

fn message_properties(priority: u8) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_priority(priority)
        .with_timestamp(Utc::now().timestamp() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_persistent() {
        let properties = message_properties(0);
        assert_eq!(properties.delivery_mode(), &Some(PERSISTENT));
    }

    #[test]
    fn test_priority_is_carried() {
        let properties = message_properties(5);
        assert_eq!(properties.priority(), &Some(5));
    }

    #[test]
    fn test_messages_are_timestamped() {
        let properties = message_properties(0);
        assert!(properties.timestamp().is_some());
    }
}
