
//! # RabbitMQ Pub/Sub
//! A durable topic-based publish/subscribe client layer for RabbitMQ with
//! explicit acknowledgement, prefetch-bounded in-flight work, supervised
//! reconnection with exponential backoff, and a drain-and-exit consumption
//! mode for batch workers.

pub mod config;
pub mod consumer;
pub mod error;
pub mod publisher;
pub mod reconnect;
pub mod supervisor;
pub mod topology;
pub mod worker;

// Re-export key components for easy access
pub use config::{AmqpConfig, AmqpConfigBuilder, QueueBinding};
pub use consumer::{subscribe_to_queue, ConsumeMode};
pub use error::AmqpError;
pub use publisher::Publisher;
pub use reconnect::ReconnectSchedule;
pub use supervisor::{ConnectionSupervisor, Subscription};
pub use topology::{ensure_topology, QueueSpec, TopologyDescriptor, MAX_PRIORITY};
pub use worker::{Worker, WorkerError};
