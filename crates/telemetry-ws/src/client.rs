//! Caller-facing handle to the telemetry engine.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::{
    auth::TokenProvider,
    command::Command,
    config::TelemetryConfig,
    engine::{ConnectionEpoch, Engine, EngineCommand, EngineShared},
    error::{TelemetryError, TelemetryResult},
    registry::SubscriberRegistry,
    status::{ConnectionStatus, ListenerId, StatusBroadcaster},
    subscriber::{Subscriber, SubscriberEntry, SubscriberId},
    transport::{Connector, TungsteniteConnector},
};

fn engine_gone() -> TelemetryError {
    TelemetryError::connection_closed(Some("Telemetry engine shut down".to_string()))
}

/// Handle to a running telemetry engine.
///
/// Cloning is cheap; all clones talk to the same engine. The engine task
/// stops once every clone and every [`SubscriptionGuard`] has been dropped.
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use telemetry_ws::{Command, EntityRef, StaticTokenProvider, Subscriber, TelemetryClient, TelemetryConfig};
///
/// # async fn run() -> telemetry_ws::TelemetryResult<()> {
/// let config = TelemetryConfig::from_api_endpoint("https://iot.example.com")?;
/// let tokens = Arc::new(StaticTokenProvider::new("eyJhbGciOi..."));
/// let client = TelemetryClient::with_tungstenite(config, tokens)?;
///
/// let guard = client
///     .subscribe(
///         Subscriber::new([Command::timeseries(EntityRef::device("dev-1"), &["temperature"])])
///             .on_data(|msg| println!("{:?}", msg.data)),
///     )
///     .await?;
///
/// // Dropping the guard unsubscribes.
/// drop(guard);
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TelemetryClient {
    tx: mpsc::Sender<EngineCommand>,
    registry: Arc<SubscriberRegistry>,
    status: Arc<StatusBroadcaster>,
    epoch: Arc<AtomicU64>,
}

impl TelemetryClient {
    /// Validate `config` and spawn the engine on the current Tokio runtime.
    ///
    /// No connection is opened until the first [`TelemetryClient::subscribe`].
    pub fn new(
        config: TelemetryConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> TelemetryResult<Self> {
        config.validate().map_err(TelemetryError::config)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TelemetryError::config("TelemetryClient requires a Tokio runtime"))?;

        let config = Arc::new(config);
        let (tx, rx) = mpsc::channel(config.command_channel_capacity);
        let shared = EngineShared {
            registry: Arc::new(SubscriberRegistry::new()),
            status: Arc::new(StatusBroadcaster::new()),
            epoch: Arc::new(AtomicU64::new(0)),
        };

        let client = Self {
            tx,
            registry: Arc::clone(&shared.registry),
            status: Arc::clone(&shared.status),
            epoch: Arc::clone(&shared.epoch),
        };

        let engine = Engine::new(config, connector, tokens, rx, shared);
        runtime.spawn(engine.run());

        Ok(client)
    }

    /// Create a client using the `tokio-tungstenite` transport.
    pub fn with_tungstenite(
        config: TelemetryConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> TelemetryResult<Self> {
        let connector = TungsteniteConnector::new().max_message_size(config.max_message_size);
        Self::new(config, Arc::new(connector), tokens)
    }

    /// Register a subscriber. Its commands are sent once the connection is
    /// open, and re-sent under fresh ids after every reconnect.
    pub async fn subscribe(&self, subscriber: Subscriber) -> TelemetryResult<SubscriptionGuard> {
        let entry = SubscriberEntry::new(subscriber);
        let id = entry.id;
        self.tx
            .send(EngineCommand::Subscribe { entry })
            .await
            .map_err(|_| engine_gone())?;
        Ok(SubscriptionGuard::new(id, self.tx.clone()))
    }

    /// Cancel every live command of a subscriber.
    pub async fn unsubscribe(&self, id: SubscriberId) -> TelemetryResult<()> {
        self.tx
            .send(EngineCommand::Unsubscribe { id })
            .await
            .map_err(|_| engine_gone())
    }

    /// Send a one-way command such as [`Command::mark_all_notifications_as_read`].
    pub async fn send_command(&self, command: Command) -> TelemetryResult<()> {
        self.tx
            .send(EngineCommand::Send { command })
            .await
            .map_err(|_| engine_gone())
    }

    /// Close the connection. Subscribers are kept and restored by the next
    /// `subscribe`, which reactivates the engine.
    pub async fn close(&self) -> TelemetryResult<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Close { done })
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    /// Observe status changes. The listener is called immediately with the
    /// current status.
    pub fn add_status_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.status.add_listener(listener)
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.status.remove_listener(id)
    }

    /// Number of command ids live in the current epoch.
    pub fn live_command_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of connections opened so far.
    pub fn epoch(&self) -> ConnectionEpoch {
        ConnectionEpoch(self.epoch.load(Ordering::Relaxed))
    }

    /// Check whether the engine task is still running.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Keeps a subscriber registered; dropping it unsubscribes.
///
/// Discarding the guard returned by [`TelemetryClient::subscribe`] would
/// retire the subscriber immediately, so ignoring it is rejected:
///
/// ```compile_fail
/// #![deny(unused_must_use)]
/// use telemetry_ws::{Command, Subscriber, TelemetryClient, TelemetryResult};
///
/// async fn subscribe_and_forget(client: &TelemetryClient) -> TelemetryResult<()> {
///     client
///         .subscribe(Subscriber::new([Command::notifications_count()]))
///         .await?;
///     Ok(())
/// }
/// ```
#[must_use = "dropping the guard unsubscribes"]
pub struct SubscriptionGuard {
    id: SubscriberId,
    tx: mpsc::Sender<EngineCommand>,
    armed: bool,
}

impl SubscriptionGuard {
    fn new(id: SubscriberId, tx: mpsc::Sender<EngineCommand>) -> Self {
        Self {
            id,
            tx,
            armed: true,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Unsubscribe now, waiting for the engine to accept the request.
    pub async fn unsubscribe(mut self) -> TelemetryResult<()> {
        self.armed = false;
        self.tx
            .send(EngineCommand::Unsubscribe { id: self.id })
            .await
            .map_err(|_| engine_gone())
    }

    /// Keep the subscription alive without a guard.
    ///
    /// Returns the id to pass to [`TelemetryClient::unsubscribe`] later.
    pub fn detach(mut self) -> SubscriberId {
        self.armed = false;
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let unsubscribe = EngineCommand::Unsubscribe { id: self.id };
        match self.tx.try_send(unsubscribe) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Telemetry engine closed while dropping SubscriptionGuard");
            }
            Err(mpsc::error::TrySendError::Full(unsubscribe)) => {
                let tx = self.tx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if tx.send(unsubscribe).await.is_err() {
                                warn!("Telemetry engine closed while sending unsubscribe on drop");
                            }
                        });
                    }
                    Err(_) => {
                        if tx.blocking_send(unsubscribe).is_err() {
                            warn!("Telemetry engine closed while blocking_send unsubscribe on drop");
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("id", &self.id)
            .field("armed", &self.armed)
            .finish()
    }
}
