
//! Connection ownership, failure detection, and supervised reconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lapin::{protocol::constants::REPLY_SUCCESS, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, Mutex};

use crate::config::AmqpConfig;
use crate::consumer::{self, ConsumeMode};
use crate::error::AmqpError;
use crate::reconnect::ReconnectSchedule;
use crate::topology::{self, TopologyDescriptor};
use crate::worker::Worker;

/// The at-most-one active (queue, worker) pair of this process.
///
/// Recorded so a reconnect can re-establish consumption with the same
/// pair and mode.
#[derive(Clone)]
pub struct Subscription {
    pub queue: String,
    pub worker: Arc<dyn Worker>,
    pub mode: ConsumeMode,
}

#[derive(Default)]
struct SessionState {
    connection: Option<Connection>,
    channel: Option<Channel>,
    subscription: Option<Subscription>,
}

/// Exclusive owner of the broker Connection and Channel.
///
/// Construct one per process and share it via the returned `Arc`; the
/// publisher and consumer runtime always fetch the channel through
/// [`ConnectionSupervisor::get_channel`] instead of caching a reference,
/// so reconnection can replace the session wholesale underneath them.
pub struct ConnectionSupervisor {
    config: AmqpConfig,
    topology: TopologyDescriptor,
    state: Mutex<SessionState>,
    error_tx: mpsc::UnboundedSender<lapin::Error>,
    closed: AtomicBool,
}

impl ConnectionSupervisor {
    /// Creates the supervisor and spawns its failure monitor.
    ///
    /// Must be called from within a tokio runtime. No connection is
    /// opened until [`ConnectionSupervisor::init`] or the first
    /// [`ConnectionSupervisor::get_channel`].
    pub fn new(config: AmqpConfig) -> Arc<Self> {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            topology: config.topology(),
            state: Mutex::new(SessionState::default()),
            error_tx,
            closed: AtomicBool::new(false),
            config,
        });
        tokio::spawn(Self::monitor(Arc::clone(&supervisor), error_rx));
        supervisor
    }

    /// The configuration this supervisor was built from.
    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    /// Opens a Connection and Channel, applies the topology, and arms the
    /// failure observer.
    ///
    /// Propagates failure to the caller. The initial `init` is never
    /// retried internally; only reconnection after an established and
    /// then lost connection is.
    pub async fn init(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        self.open_session(&mut state).await?;
        Ok(())
    }

    /// Returns the current Channel, lazily opening whatever is missing.
    ///
    /// Concurrent callers serialize on the session mutex, so lazy
    /// initialization converges on a single Connection.
    pub async fn get_channel(&self) -> Result<Channel, AmqpError> {
        let mut state = self.state.lock().await;

        if let Some(channel) = state.channel.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        // The channel is absent or stale; re-create it on a live
        // connection before falling back to a full session open.
        if let Some(connection) = state.connection.as_ref() {
            if connection.status().connected() {
                let channel = connection.create_channel().await?;
                state.channel = Some(channel.clone());
                return Ok(channel);
            }
        }

        self.open_session(&mut state).await
    }

    /// Best-effort ordered close of Channel then Connection.
    ///
    /// Errors from an already-closed resource are swallowed, and the
    /// failure monitor is suppressed so an intentional close never
    /// triggers reconnection.
    pub async fn close_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(channel) = state.channel.take() {
            if let Err(error) = channel.close(REPLY_SUCCESS, "shutting down").await {
                log::debug!("Channel close ignored: {error}");
            }
        }
        if let Some(connection) = state.connection.take() {
            if let Err(error) = connection.close(REPLY_SUCCESS, "shutting down").await {
                log::debug!("Connection close ignored: {error}");
            }
        }
    }

    pub(crate) async fn set_subscription(&self, subscription: Subscription) {
        let mut state = self.state.lock().await;
        state.subscription = Some(subscription);
    }

    pub(crate) async fn subscription(&self) -> Option<Subscription> {
        self.state.lock().await.subscription.clone()
    }

    /// Replaces the session wholesale: connect, open a channel, re-apply
    /// the topology, and register the failure observer.
    async fn open_session(&self, state: &mut SessionState) -> Result<Channel, AmqpError> {
        if let Some(channel) = state.channel.take() {
            let _ = channel.close(REPLY_SUCCESS, "replacing session").await;
        }
        if let Some(connection) = state.connection.take() {
            let _ = connection.close(REPLY_SUCCESS, "replacing session").await;
        }

        let connection =
            Connection::connect(&self.config.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        topology::ensure_topology(&channel, &self.topology).await?;

        let error_tx = self.error_tx.clone();
        connection.on_error(move |error| {
            let _ = error_tx.send(error);
        });

        self.closed.store(false, Ordering::SeqCst);
        state.connection = Some(connection);
        state.channel = Some(channel.clone());
        log::info!("Connected to {}", self.config.url);
        Ok(channel)
    }

    /// Failure observer: waits for connection errors, reconnects, and
    /// re-establishes the recorded subscription.
    async fn monitor(supervisor: Arc<Self>, mut error_rx: mpsc::UnboundedReceiver<lapin::Error>) {
        while let Some(error) = error_rx.recv().await {
            if supervisor.closed.load(Ordering::SeqCst) {
                log::debug!("Ignoring connection event after shutdown: {error}");
                continue;
            }
            log::error!("Connection to broker lost: {error}");
            supervisor.reconnect().await;

            // One outage can emit several errors; drop the ones that
            // piled up while we were reconnecting.
            while error_rx.try_recv().is_ok() {}

            if let Some(subscription) = supervisor.subscription().await {
                log::info!("Re-establishing subscription on '{}'", subscription.queue);
                consumer::spawn_dispatch(Arc::clone(&supervisor), subscription);
            }
        }
    }

    /// Retries the session open with strictly doubling delays until the
    /// broker is reachable again.
    async fn reconnect(&self) {
        let mut schedule = ReconnectSchedule::new(self.config.reconnect_delay);
        loop {
            let delay = schedule.next_delay();
            log::warn!("Reconnecting to {} in {:?}", self.config.url, delay);
            tokio::time::sleep(delay).await;
            match self.init().await {
                Ok(()) => return,
                Err(error) => log::error!("Reconnect attempt failed: {error}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmqpConfig;

    #[tokio::test]
    async fn test_new_supervisor_starts_without_a_session() {
        let config = AmqpConfig::builder("amqp://localhost".into(), "events".into()).build();
        let supervisor = ConnectionSupervisor::new(config);
        assert!(supervisor.subscription().await.is_none());
        assert_eq!(supervisor.config().exchange, "events");
    }
}
