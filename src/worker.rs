
//! Defines the capability invoked for each delivery.

use async_trait::async_trait;
use lapin::BasicProperties;

/// Cause of a failed worker run.
pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

/// A unit of message-processing logic bound to one queue.
///
/// Success is signaled by returning normally and failure by returning an
/// error; the consumer runtime derives the delivery's disposition purely
/// from that result. The payload is handed over as opaque bytes, decoding
/// is the worker's concern.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Processes one delivery.
    async fn run(&self, payload: &[u8], properties: &BasicProperties) -> Result<(), WorkerError>;

    /// A name for the worker, used for logging and identification.
    fn name(&self) -> &str;
}
