use std::process;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::BasicProperties;
use rabbitmq_pubsub::{
    subscribe_to_queue, AmqpConfig, AmqpError, ConnectionSupervisor, Worker, WorkerError,
};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
struct ProductSyncJob {
    id: u64,
}

/// Synchronizes one product per delivery. A payload that fails to decode
/// fails the run, so the delivery dead-letters instead of redelivering.
struct ProductSyncWorker;

#[async_trait]
impl Worker for ProductSyncWorker {
    async fn run(&self, payload: &[u8], _properties: &BasicProperties) -> Result<(), WorkerError> {
        let job: ProductSyncJob = serde_json::from_slice(payload)?;
        log::info!("Syncing product {}", job.id);
        Ok(())
    }

    fn name(&self) -> &str {
        "product_sync"
    }
}

fn worker_for(worker_type: &str) -> Result<Arc<dyn Worker>, AmqpError> {
    match worker_type {
        "productsync" => Ok(Arc::new(ProductSyncWorker)),
        other => Err(AmqpError::config(format!(
            "worker type '{other}' is invalid"
        ))),
    }
}

async fn run() -> Result<(), AmqpError> {
    let config = AmqpConfig::from_env()?;
    let worker_type =
        std::env::var("WORKER_TYPE").unwrap_or_else(|_| "productsync".to_string());
    let worker = worker_for(&worker_type)?;

    let queue = config
        .bindings
        .first()
        .map(|binding| binding.queue.clone())
        .ok_or_else(|| AmqpError::config("no queue configured"))?;

    let supervisor = ConnectionSupervisor::new(config);
    supervisor.init().await?;
    subscribe_to_queue(&supervisor, &queue, worker).await?;

    // Self-terminating sessions exit on their own; standard sessions run
    // until the operator stops the process.
    if let Err(error) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {error}");
    }
    log::info!("Ctrl+C received. Shutting down.");
    supervisor.close_connection().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(error) = run().await {
        log::error!("Worker failed to start: {error}");
        process::exit(1);
    }
}
