
//! Queue consumption: prefetch-bounded dispatch, ack/nack disposition,
//! and the two consumption modes.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    BasicProperties,
};

use crate::error::AmqpError;
use crate::supervisor::{ConnectionSupervisor, Subscription};
use crate::worker::{Worker, WorkerError};

/// Number of unacknowledged deliveries a consumer may hold at once.
///
/// Fixed at 1: strict backpressure that trades throughput for fairness
/// and crash-safety. If the process dies mid-processing, at most one
/// message is left redelivered.
const PREFETCH_COUNT: u16 = 1;

/// How a dispatch session consumes its queue.
#[derive(Debug, Clone, Copy)]
pub enum ConsumeMode {
    /// Keep consuming until the process is stopped externally.
    Standard,
    /// Process at most one delivery, or stop after `idle_timeout` with
    /// nothing to do. Suited to scale-to-zero invocation.
    SelfTerminating { idle_timeout: Duration },
}

/// Why a dispatch session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Idle timeout elapsed with no delivery (self-terminating only).
    Drained,
    /// Exactly one delivery was processed (self-terminating only).
    ProcessedOne,
    /// The consume stream ended, typically because the connection dropped.
    StreamClosed,
}

/// Terminal disposition of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    /// Nack without requeue; the broker routes the delivery to the
    /// queue's dead-letter exchange.
    DeadLetter,
}

/// The ack/nack decision is purely a function of the worker's result.
fn disposition_for(outcome: &Result<(), WorkerError>) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(_) => Disposition::DeadLetter,
    }
}

fn dead_letter_options() -> BasicNackOptions {
    // Never requeue, a poison message would redeliver forever.
    BasicNackOptions {
        requeue: false,
        ..Default::default()
    }
}

fn consumer_tag(queue: &str) -> String {
    format!("{queue}_consumer")
}

/// Subscribes `worker` to `queue` in the mode selected by the supervisor's
/// configuration and starts the dispatch session.
///
/// The subscription is recorded with the supervisor so a reconnect
/// re-establishes it with the same (queue, worker) pair.
pub async fn subscribe_to_queue(
    supervisor: &Arc<ConnectionSupervisor>,
    queue: &str,
    worker: Arc<dyn Worker>,
) -> Result<(), AmqpError> {
    // Fail fast while the caller can still see the error; the dispatch
    // task itself only logs.
    supervisor.get_channel().await?;

    let subscription = Subscription {
        queue: queue.to_string(),
        worker,
        mode: supervisor.config().consume_mode(),
    };
    supervisor.set_subscription(subscription.clone()).await;

    log::info!("Waiting on messages from '{queue}'");
    spawn_dispatch(Arc::clone(supervisor), subscription);
    Ok(())
}

/// Runs one dispatch session on its own task and applies the mode's exit
/// semantics when it ends.
pub(crate) fn spawn_dispatch(supervisor: Arc<ConnectionSupervisor>, subscription: Subscription) {
    tokio::spawn(async move {
        match run_session(&supervisor, &subscription).await {
            Ok(SessionEnd::Drained) => {
                supervisor.close_connection().await;
                log::info!("No messages enqueued. Terminating worker.");
                process::exit(0);
            }
            Ok(SessionEnd::ProcessedOne) => {
                supervisor.close_connection().await;
                log::info!("Finished processing message. Terminating worker.");
                process::exit(0);
            }
            Ok(SessionEnd::StreamClosed) => {
                log::warn!(
                    "Consume stream for '{}' ended, waiting for reconnect",
                    subscription.queue
                );
            }
            Err(error) => {
                log::error!("Subscription on '{}' failed: {error}", subscription.queue);
            }
        }
    });
}

/// Consumes the queue until the mode says to stop.
///
/// Deliveries are handled strictly one at a time: prefetch is 1 and the
/// loop awaits each disposition before polling the next delivery.
async fn run_session(
    supervisor: &Arc<ConnectionSupervisor>,
    subscription: &Subscription,
) -> Result<SessionEnd, AmqpError> {
    let channel = supervisor.get_channel().await?;
    channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
        .await?;

    let tag = consumer_tag(&subscription.queue);
    let mut consumer = channel
        .basic_consume(
            &subscription.queue,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let processing_timeout = supervisor.config().processing_timeout;
    match subscription.mode {
        ConsumeMode::Standard => {
            while let Some(attempt) = consumer.next().await {
                match attempt {
                    Ok(delivery) => {
                        let handled = process_message(
                            subscription.worker.as_ref(),
                            delivery,
                            processing_timeout,
                        )
                        .await;
                        if let Err(error) = handled {
                            log::error!("Delivery handling failed with a broker error: {error}");
                        }
                    }
                    Err(error) => {
                        log::error!("Consume stream error: {error}");
                        break;
                    }
                }
            }
            Ok(SessionEnd::StreamClosed)
        }
        ConsumeMode::SelfTerminating { idle_timeout } => {
            match tokio::time::timeout(idle_timeout, consumer.next()).await {
                Err(_) => Ok(SessionEnd::Drained),
                Ok(None) => Ok(SessionEnd::StreamClosed),
                Ok(Some(Err(error))) => Err(error.into()),
                Ok(Some(Ok(delivery))) => {
                    process_message(subscription.worker.as_ref(), delivery, processing_timeout)
                        .await?;
                    Ok(SessionEnd::ProcessedOne)
                }
            }
        }
    }
}

/// Hands one delivery to the worker and applies exactly one terminal
/// disposition, whatever the outcome.
async fn process_message(
    worker: &dyn Worker,
    delivery: Delivery,
    processing_timeout: Option<Duration>,
) -> Result<(), AmqpError> {
    // Metadata only; payloads can be large or sensitive.
    log::info!(
        "Received message: tag {}, exchange '{}', routing key '{}', redelivered {}",
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.redelivered,
    );

    let outcome = run_worker(
        worker,
        &delivery.data,
        &delivery.properties,
        processing_timeout,
    )
    .await;

    match disposition_for(&outcome) {
        Disposition::Ack => {
            delivery.ack(BasicAckOptions::default()).await?;
            log::info!("Acking message {}", delivery.delivery_tag);
        }
        Disposition::DeadLetter => {
            if let Err(error) = &outcome {
                log::error!(
                    "Error processing message {} with worker '{}': {error:?}",
                    delivery.delivery_tag,
                    worker.name(),
                );
            }
            delivery.nack(dead_letter_options()).await?;
            log::info!("Nacked message {} for dead-lettering", delivery.delivery_tag);
        }
    }
    Ok(())
}

/// Runs the worker, applying the optional per-delivery processing timeout.
async fn run_worker(
    worker: &dyn Worker,
    payload: &[u8],
    properties: &BasicProperties,
    processing_timeout: Option<Duration>,
) -> Result<(), WorkerError> {
    match processing_timeout {
        None => worker.run(payload, properties).await,
        Some(limit) => match tokio::time::timeout(limit, worker.run(payload, properties)).await {
            Ok(outcome) => outcome,
            Err(elapsed) => Err(Box::new(elapsed)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SucceedingWorker;

    #[async_trait]
    impl Worker for SucceedingWorker {
        async fn run(
            &self,
            _payload: &[u8],
            _properties: &BasicProperties,
        ) -> Result<(), WorkerError> {
            Ok(())
        }

        fn name(&self) -> &str {
            "succeeding"
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl Worker for FailingWorker {
        async fn run(
            &self,
            _payload: &[u8],
            _properties: &BasicProperties,
        ) -> Result<(), WorkerError> {
            Err("payload rejected".into())
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct SlowWorker(Duration);

    #[async_trait]
    impl Worker for SlowWorker {
        async fn run(
            &self,
            _payload: &[u8],
            _properties: &BasicProperties,
        ) -> Result<(), WorkerError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[test]
    fn test_successful_outcomes_ack() {
        assert_eq!(disposition_for(&Ok(())), Disposition::Ack);
    }

    #[test]
    fn test_failed_outcomes_dead_letter() {
        let outcome: Result<(), WorkerError> = Err("boom".into());
        assert_eq!(disposition_for(&outcome), Disposition::DeadLetter);
    }

    #[test]
    fn test_dead_letter_never_requeues() {
        assert!(!dead_letter_options().requeue);
    }

    #[test]
    fn test_consumer_tag_derivation() {
        assert_eq!(consumer_tag("orders.sync"), "orders.sync_consumer");
    }

    #[tokio::test]
    async fn test_run_worker_passes_outcomes_through() {
        let properties = BasicProperties::default();
        assert!(run_worker(&SucceedingWorker, b"{}", &properties, None)
            .await
            .is_ok());
        assert!(run_worker(&FailingWorker, b"{}", &properties, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_processing_timeout_fails_slow_workers() {
        let properties = BasicProperties::default();
        let worker = SlowWorker(Duration::from_millis(200));

        let outcome = run_worker(
            &worker,
            b"{}",
            &properties,
            Some(Duration::from_millis(10)),
        )
        .await;
        assert_eq!(disposition_for(&outcome), Disposition::DeadLetter);

        let outcome = run_worker(
            &worker,
            b"{}",
            &properties,
            Some(Duration::from_secs(5)),
        )
        .await;
        assert_eq!(disposition_for(&outcome), Disposition::Ack);
    }
}
