//! Connection manager actor.
//!
//! The engine runs in a background task and owns everything that changes
//! over a connection's lifetime:
//! - the pending command queue and the resubscription set
//! - registry writes (id allocation, retirement, epoch teardown)
//! - the transport halves, reconnect/idle timers and keepalive
//!
//! Caller commands, open outcomes, inbound frames and timer fires are all
//! consumed by one `select!` loop, so no two handlers ever run at once.
//! Token refresh and transport open happen in a spawned task whose result
//! comes back through a oneshot channel.

use std::{
    future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::StreamExt;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    auth::TokenProvider,
    command::Command,
    config::TelemetryConfig,
    error::{TelemetryError, TelemetryResult},
    queue::{CommandQueue, auth_frame},
    registry::SubscriberRegistry,
    router::{MessageRouter, Routed},
    status::{ConnectionStatus, StatusBroadcaster},
    subscriber::{SubscriberEntry, SubscriberId},
    transport::{Connector, FrameStream, FrameWriter, WsMessage},
};

/// Counter of successfully opened connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionEpoch(pub u64);

/// Commands sent from [`crate::TelemetryClient`] to the engine.
pub(crate) enum EngineCommand {
    /// Register a subscriber and queue its commands.
    Subscribe { entry: Arc<SubscriberEntry> },
    /// Retire a subscriber's ids and queue the matching unsubscribe envelopes.
    Unsubscribe { id: SubscriberId },
    /// Queue a one-way command under a fresh id.
    Send { command: Command },
    /// Tear down the connection; no automatic reconnect afterwards.
    Close { done: oneshot::Sender<()> },
}

/// Shared state the client handle reads without going through the mailbox.
#[derive(Clone)]
pub(crate) struct EngineShared {
    pub(crate) registry: Arc<SubscriberRegistry>,
    pub(crate) status: Arc<StatusBroadcaster>,
    pub(crate) epoch: Arc<AtomicU64>,
}

/// An authenticated-ready transport handed back by the open task.
struct Opened {
    writer: Box<dyn FrameWriter>,
    reader: FrameStream,
    token: String,
}

enum OpenError {
    /// Token refresh failed; the session cannot be recovered automatically.
    Session(TelemetryError),
    /// Transport failure; retried after the reconnect delay.
    Transport(TelemetryError),
}

type OpenResult = Result<Opened, OpenError>;

/// An in-flight open attempt.
struct PendingOpen {
    attempt: u64,
    rx: oneshot::Receiver<(u64, OpenResult)>,
    task: JoinHandle<()>,
}

/// The connection manager actor.
pub(crate) struct Engine {
    config: Arc<TelemetryConfig>,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    /// Mailbox fed by client handles and subscription guards.
    mailbox: mpsc::Receiver<EngineCommand>,
    registry: Arc<SubscriberRegistry>,
    status: Arc<StatusBroadcaster>,
    epoch: Arc<AtomicU64>,
    router: MessageRouter,
    queue: CommandQueue,
    /// Subscribers whose ids were invalidated and must be re-registered.
    resubscribe: Vec<Arc<SubscriberEntry>>,
    /// Set by `subscribe`, cleared by `close` and by session invalidation.
    active: bool,
    /// The next successful open restores the resubscription set.
    is_reconnect: bool,
    /// Consecutive failed opens, fed into the backoff.
    reconnect_attempt: u32,
    /// Tag of the most recent open attempt.
    open_attempt: u64,
    opening: Option<PendingOpen>,
    writer: Option<Box<dyn FrameWriter>>,
    reader: Option<FrameStream>,
    ping: Option<Interval>,
    reconnect_at: Option<Instant>,
    idle_at: Option<Instant>,
}

impl Engine {
    pub(crate) fn new(
        config: Arc<TelemetryConfig>,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        mailbox: mpsc::Receiver<EngineCommand>,
        shared: EngineShared,
    ) -> Self {
        let router = MessageRouter::new(
            config.critical_error_codes.clone(),
            config.max_message_size,
        );
        let queue = CommandQueue::new(config.batch_size);
        Self {
            config,
            connector,
            tokens,
            mailbox,
            registry: shared.registry,
            status: shared.status,
            epoch: shared.epoch,
            router,
            queue,
            resubscribe: Vec::new(),
            active: false,
            is_reconnect: false,
            reconnect_attempt: 0,
            open_attempt: 0,
            opening: None,
            writer: None,
            reader: None,
            ping: None,
            reconnect_at: None,
            idle_at: None,
        }
    }

    /// Run until every client handle and guard has been dropped.
    pub(crate) async fn run(mut self) {
        debug!(url = %self.config.url, "Starting telemetry engine");

        loop {
            tokio::select! {
                biased;
                cmd = self.mailbox.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("All client handles dropped; shutting down engine");
                            self.handle_close().await;
                            break;
                        }
                    }
                }
                (attempt, result) = open_outcome(&mut self.opening) => {
                    self.handle_open_outcome(attempt, result).await;
                }
                frame = next_frame(&mut self.reader) => {
                    match frame {
                        Some(Ok(frame)) => self.handle_frame(frame).await,
                        Some(Err(err)) => {
                            self.handle_transport_error(&err);
                            self.handle_connection_lost(err.to_string()).await;
                        }
                        None => self.handle_connection_lost("closed by peer".to_string()).await,
                    }
                }
                () = deadline(self.reconnect_at) => {
                    self.reconnect_at = None;
                    debug!(attempt = self.reconnect_attempt, "Reconnect timer fired");
                    self.ensure_open();
                }
                () = deadline(self.idle_at) => {
                    self.idle_at = None;
                    info!("No subscribers left; closing idle telemetry connection");
                    self.handle_close().await;
                }
                () = tick(&mut self.ping) => {
                    self.send_ping().await;
                }
            }
        }

        debug!("Telemetry engine stopped");
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Subscribe { entry } => self.handle_subscribe(entry).await,
            EngineCommand::Unsubscribe { id } => self.handle_unsubscribe(id).await,
            EngineCommand::Send { command } => self.handle_send(command).await,
            EngineCommand::Close { done } => {
                self.handle_close().await;
                let _ = done.send(());
            }
        }
    }

    async fn handle_subscribe(&mut self, entry: Arc<SubscriberEntry>) {
        self.active = true;
        self.idle_at = None;
        self.register(&entry);
        self.flush().await;
    }

    /// Allocate fresh ids for every command of `entry` and queue them in order.
    fn register(&mut self, entry: &Arc<SubscriberEntry>) {
        for (index, command) in entry.subscriber.commands.iter().enumerate() {
            let cmd_id = self.registry.next_id();
            self.registry.insert(cmd_id, entry, index);
            self.queue.push(command.envelope(cmd_id));
        }
        debug!(
            subscriber = %entry.id,
            commands = entry.subscriber.commands.len(),
            "Registered subscriber"
        );
    }

    async fn handle_unsubscribe(&mut self, id: SubscriberId) {
        let envelopes = self.registry.retire_subscriber(id);
        self.resubscribe.retain(|entry| entry.id != id);
        debug!(subscriber = %id, retired = envelopes.len(), "Unsubscribing");

        if self.active {
            for envelope in envelopes {
                self.queue.push(envelope);
            }
            self.arm_idle_timer();
            self.flush().await;
        } else {
            // Nothing will be sent before the next activation; drop the
            // retired ids' subscribe envelopes too.
            let ids: Vec<_> = envelopes.iter().map(|envelope| envelope.cmd_id()).collect();
            self.queue.discard_ids(&ids);
        }
    }

    async fn handle_send(&mut self, command: Command) {
        let cmd_id = self.registry.next_id();
        debug!(%cmd_id, kind = ?command.kind(), "Queueing one-way command");
        self.queue.push_one_way(command.envelope(cmd_id));
        self.flush().await;
    }

    /// Arm the idle timer once nothing is registered or awaiting resubscription.
    fn arm_idle_timer(&mut self) {
        let Some(idle) = self.config.idle_timeout else {
            return;
        };
        if self.active && self.registry.is_empty() && self.resubscribe.is_empty() {
            self.idle_at = Some(Instant::now() + idle);
        }
    }

    /// Write pending commands while the connection is open, or request one.
    async fn flush(&mut self) {
        if self.writer.is_none() {
            if !self.queue.is_empty() {
                self.ensure_open();
            }
            return;
        }

        while let Some(batch) = self.queue.next_batch() {
            let frame = match batch.to_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, commands = batch.len(), "Failed to encode command batch");
                    continue;
                }
            };
            let Some(writer) = self.writer.as_mut() else {
                self.queue.requeue_front(batch);
                return;
            };
            debug!(commands = batch.len(), "Sending command batch");
            if let Err(err) = writer.send_text(frame).await {
                warn!(error = %err, "Failed to send command batch");
                self.queue.requeue_front(batch);
                self.handle_connection_lost(err.to_string()).await;
                return;
            }
        }
    }

    /// Start an open attempt unless one is running or the engine is idle.
    fn ensure_open(&mut self) {
        if !self.active || self.writer.is_some() || self.opening.is_some() {
            return;
        }

        self.open_attempt += 1;
        let attempt = self.open_attempt;
        self.status.set(ConnectionStatus::Connecting);
        info!(url = %self.config.url, attempt, "Opening telemetry connection");

        let (tx, rx) = oneshot::channel();
        let connector = Arc::clone(&self.connector);
        let tokens = Arc::clone(&self.tokens);
        let url = self.config.url.clone();
        let limit = self.config.connect_timeout;
        let task = tokio::spawn(async move {
            let result = match timeout(limit, open_connection(connector, tokens, url)).await {
                Ok(result) => result,
                Err(_) => Err(OpenError::Transport(TelemetryError::timeout(limit))),
            };
            let _ = tx.send((attempt, result));
        });

        self.opening = Some(PendingOpen { attempt, rx, task });
    }

    async fn handle_open_outcome(
        &mut self,
        attempt: u64,
        result: Result<OpenResult, oneshot::error::RecvError>,
    ) {
        self.opening = None;
        if attempt != self.open_attempt || !self.active {
            debug!(attempt, "Discarding stale open outcome");
            return;
        }

        match result {
            Ok(Ok(opened)) => self.handle_open(opened).await,
            Ok(Err(OpenError::Session(err))) => self.handle_session_invalid(&err),
            Ok(Err(OpenError::Transport(err))) => {
                warn!(error = %err, attempt, "Failed to open telemetry connection");
                self.handle_connection_lost(err.to_string()).await;
            }
            Err(_) => {
                // The open task panicked or was aborted before reporting.
                let err = TelemetryError::internal("open task ended without a result");
                warn!(error = %err, attempt, "Failed to open telemetry connection");
                self.handle_connection_lost(err.to_string()).await;
            }
        }
    }

    async fn handle_open(&mut self, opened: Opened) {
        let Opened {
            mut writer,
            reader,
            token,
        } = opened;

        let sent = match auth_frame(&token) {
            Ok(frame) => writer.send_text(frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            warn!(error = %err, "Failed to send authentication frame");
            self.handle_connection_lost(err.to_string()).await;
            return;
        }

        self.writer = Some(writer);
        self.reader = Some(reader);
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.ping = self.config.ping_interval.map(|period| {
            let mut ping = interval_at(Instant::now() + period, period);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ping
        });

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        self.status.set(ConnectionStatus::Connected);
        info!(url = %self.config.url, epoch, "Telemetry connection established");

        if self.is_reconnect {
            self.is_reconnect = false;
            self.resubscribe_all().await;
        }
        if self.writer.is_some() {
            self.flush().await;
        }
    }

    /// Re-register every subscriber invalidated by the last disconnect.
    async fn resubscribe_all(&mut self) {
        let snapshot = std::mem::take(&mut self.resubscribe);
        debug!(subscribers = snapshot.len(), "Resubscribing after reconnect");

        let mut remaining = snapshot.into_iter();
        for entry in remaining.by_ref() {
            entry.subscriber.notify_reconnected();
            self.register(&entry);
            self.flush().await;
            if self.writer.is_none() {
                break;
            }
        }
        // Lost the connection mid-way; the rest waits for the next epoch.
        for entry in remaining {
            self.add_resubscriber(entry);
        }
    }

    fn handle_session_invalid(&mut self, err: &TelemetryError) {
        error!(error = %err, "Token refresh failed; telemetry session is invalid");
        self.active = false;
        self.reconnect_at = None;
        self.status.set(ConnectionStatus::Disconnected);
        self.tokens.on_session_invalid();
    }

    fn handle_transport_error(&mut self, err: &TelemetryError) {
        warn!(error = %err, "Telemetry transport error");
        self.status.set(ConnectionStatus::Error);
    }

    /// Close handler: invalidate the epoch and schedule a reconnect.
    async fn handle_connection_lost(&mut self, reason: String) {
        self.writer = None;
        self.reader = None;
        self.ping = None;
        if !self.active {
            return;
        }

        self.invalidate_epoch();
        let discarded = self.queue.discard_epoch_bound();
        self.is_reconnect = true;
        self.status.set(ConnectionStatus::Reconnecting);

        let delay = self.config.reconnect_policy().delay(self.reconnect_attempt);
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        info!(
            epoch = self.epoch.load(Ordering::Relaxed),
            delay_ms = delay.as_millis() as u64,
            discarded,
            pending = self.queue.len(),
            resubscribe = self.resubscribe.len(),
            reason = %reason,
            "Telemetry connection closed; reconnect scheduled"
        );
    }

    /// Move every live subscriber into the resubscription set and clear the registry.
    fn invalidate_epoch(&mut self) {
        for entry in self.registry.drain_subscribers() {
            self.add_resubscriber(entry);
        }
    }

    fn add_resubscriber(&mut self, entry: Arc<SubscriberEntry>) {
        if !self.resubscribe.iter().any(|existing| existing.id == entry.id) {
            self.resubscribe.push(entry);
        }
    }

    /// A critical in-band error: recycle the connection as if it had failed.
    async fn force_reconnect(&mut self, code: i64, message: Option<String>) {
        warn!(
            error_code = code,
            error_msg = message.as_deref().unwrap_or_default(),
            "Critical error code received; reconnecting"
        );
        if let Some(mut writer) = self.writer.take()
            && let Err(err) = writer.close().await
        {
            debug!(error = %err, "Failed to close transport");
        }
        self.handle_connection_lost(format!("error code {code}"))
            .await;
    }

    async fn handle_frame(&mut self, frame: WsMessage) {
        if let Routed::Critical { code, message } = self.router.route(&self.registry, frame) {
            self.force_reconnect(code, message).await;
        }
    }

    async fn send_ping(&mut self) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(err) = writer.send_ping().await
        {
            warn!(error = %err, "Failed to send keepalive ping");
        }
    }

    /// Caller-initiated teardown.
    async fn handle_close(&mut self) {
        self.active = false;
        self.reconnect_at = None;
        self.idle_at = None;
        self.ping = None;
        if let Some(pending) = self.opening.take() {
            debug!(attempt = pending.attempt, "Cancelling open attempt");
            pending.task.abort();
        }
        self.reader = None;
        if let Some(mut writer) = self.writer.take()
            && let Err(err) = writer.close().await
        {
            debug!(error = %err, "Failed to close transport");
        }

        // Keep live subscribers so a later subscribe restores them.
        self.invalidate_epoch();
        if !self.resubscribe.is_empty() {
            self.is_reconnect = true;
        }
        self.queue.clear();
        if self.status.set(ConnectionStatus::Disconnected) {
            info!(url = %self.config.url, "Telemetry connection closed");
        }
    }
}

/// Obtain a usable token (refreshing at most once) and open the transport.
async fn open_connection(
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    url: String,
) -> OpenResult {
    let token = match tokens.token() {
        Some(token) if !tokens.is_token_expired(&token) => token,
        _ => {
            debug!("Access token missing or expired; refreshing");
            tokens.refresh().await.map_err(OpenError::Session)?;
            tokens.token().ok_or_else(|| {
                OpenError::Session(TelemetryError::auth("No access token after refresh"))
            })?
        }
    };

    let (writer, reader) = connector
        .connect(&url)
        .await
        .map_err(OpenError::Transport)?;
    Ok(Opened {
        writer,
        reader,
        token,
    })
}

async fn open_outcome(
    opening: &mut Option<PendingOpen>,
) -> (u64, Result<OpenResult, oneshot::error::RecvError>) {
    match opening {
        Some(pending) => {
            let attempt = pending.attempt;
            match (&mut pending.rx).await {
                Ok((tagged, result)) => (tagged, Ok(result)),
                Err(err) => (attempt, Err(err)),
            }
        }
        None => future::pending().await,
    }
}

async fn next_frame(reader: &mut Option<FrameStream>) -> Option<TelemetryResult<WsMessage>> {
    match reader {
        Some(reader) => reader.next().await,
        None => future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
