
//! Idempotent declaration of exchanges, queues, and bindings.

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};

use crate::error::AmqpError;

/// Priority ceiling applied to every declared queue.
pub const MAX_PRIORITY: u8 = 255;

/// Static description of the broker topology.
///
/// Immutable after load and safe to re-apply on every reconnect.
#[derive(Debug, Clone)]
pub struct TopologyDescriptor {
    /// Main topic exchange messages are published to.
    pub exchange: String,
    /// Exchange receiving deliveries nacked without requeue.
    pub dead_letter_exchange: String,
    /// Queues to declare and bind.
    pub queues: Vec<QueueSpec>,
}

/// One durable queue, its bindings, and its dead-letter target.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    /// Routing keys bound to the main exchange for this queue.
    pub routing_keys: Vec<String>,
    /// Exchange this queue dead-letters to.
    pub dead_letter_exchange: String,
    /// Maximum per-message priority the queue honors.
    pub max_priority: u8,
}

/// Declares all exchanges and queues, then binds each queue to the main
/// exchange for every configured routing key.
///
/// Safe to call on every reconnect: redeclaring an identical exchange or
/// queue is a broker-side no-op. Redeclaring with incompatible parameters
/// fails with the broker's error, which is a fatal configuration problem
/// for the caller to surface.
pub async fn ensure_topology(
    channel: &Channel,
    descriptor: &TopologyDescriptor,
) -> Result<(), AmqpError> {
    for exchange in [&descriptor.exchange, &descriptor.dead_letter_exchange] {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
    }

    for queue in &descriptor.queues {
        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(queue),
            )
            .await?;
    }

    // Bindings only after both sides of each binding exist.
    for queue in &descriptor.queues {
        for routing_key in &queue.routing_keys {
            channel
                .queue_bind(
                    &queue.name,
                    &descriptor.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
    }

    log::info!(
        "Topology ensured: exchange '{}', dead-letter exchange '{}', {} queue(s)",
        descriptor.exchange,
        descriptor.dead_letter_exchange,
        descriptor.queues.len()
    );
    Ok(())
}

/// Builds the declaration arguments for one queue.
fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(queue.dead_letter_exchange.clone().into()),
    );
    args.insert(
        "x-max-priority".into(),
        AMQPValue::LongInt(i32::from(queue.max_priority)),
    );
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> QueueSpec {
        QueueSpec {
            name: "orders.sync".to_string(),
            routing_keys: vec!["orders.created".to_string()],
            dead_letter_exchange: "orders_dlx".to_string(),
            max_priority: MAX_PRIORITY,
        }
    }

    #[test]
    fn test_queue_arguments_set_dead_letter_exchange() {
        let args = queue_arguments(&spec());
        match args.inner().get("x-dead-letter-exchange") {
            Some(AMQPValue::LongString(value)) => {
                assert_eq!(value.to_string(), "orders_dlx");
            }
            other => panic!("unexpected x-dead-letter-exchange value: {other:?}"),
        }
    }

    #[test]
    fn test_queue_arguments_set_priority_ceiling() {
        let args = queue_arguments(&spec());
        match args.inner().get("x-max-priority") {
            Some(AMQPValue::LongInt(value)) => assert_eq!(*value, 255),
            other => panic!("unexpected x-max-priority value: {other:?}"),
        }
    }
}
