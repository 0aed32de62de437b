#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use serde_json::Value;
use telemetry_ws::{
    ConnectionStatus, Connector, FrameStream, FrameWriter, InboundMessage, TelemetryClient,
    TelemetryConfig, TelemetryError, TelemetryResult, TokenProvider, WsMessage,
};
use tokio::{sync::mpsc, time::timeout};

pub const URL: &str = "ws://iot.test/api/ws";

/// Upper bound for anything a test waits on. Time is paused, so this only
/// matters when an expectation is never met.
const WAIT: Duration = Duration::from_secs(600);

/// What the engine wrote to a mock connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Text(Value),
    Ping,
    Close,
}

/// Server side of one mock connection.
pub struct MockServer {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: Option<mpsc::UnboundedSender<TelemetryResult<WsMessage>>>,
}

impl MockServer {
    /// Next outbound item, or `None` once the engine dropped the connection.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for outbound frame")
    }

    /// Next text frame, skipping pings.
    pub async fn next_frame(&mut self) -> Value {
        loop {
            match self.next_outbound().await {
                Some(Outbound::Text(value)) => return value,
                Some(Outbound::Ping) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Text frame written within `wait`, if any.
    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<Value> {
        loop {
            match timeout(wait, self.outbound.recv()).await {
                Ok(Some(Outbound::Text(value))) => return Some(value),
                Ok(Some(Outbound::Ping)) => continue,
                Ok(Some(Outbound::Close) | None) | Err(_) => return None,
            }
        }
    }

    /// Collect `count` envelopes from consecutive `{"cmds": [...]}` frames.
    pub async fn next_cmds(&mut self, count: usize) -> Vec<Value> {
        let mut cmds = Vec::new();
        while cmds.len() < count {
            let frame = self.next_frame().await;
            cmds.extend(cmds_of(&frame));
        }
        assert_eq!(cmds.len(), count, "received more commands than expected");
        cmds
    }

    /// Wait until the engine closes or drops this connection.
    pub async fn expect_closed(&mut self) {
        loop {
            match self.next_outbound().await {
                Some(Outbound::Close) | None => return,
                Some(_) => continue,
            }
        }
    }

    pub fn push(&self, value: Value) {
        self.push_raw(WsMessage::text(value.to_string()));
    }

    pub fn push_raw(&self, message: WsMessage) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Ok(message));
        }
    }

    /// Report a transport error on the engine's read side.
    pub fn fail(&self, message: &str) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Err(TelemetryError::websocket(message)));
        }
    }

    /// End the engine's read stream, as a peer close would.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }
}

/// Extract the envelopes of a `{"cmds": [...]}` frame.
pub fn cmds_of(frame: &Value) -> Vec<Value> {
    frame["cmds"]
        .as_array()
        .unwrap_or_else(|| panic!("not a cmds frame: {frame}"))
        .clone()
}

pub fn cmd_ids(cmds: &[Value]) -> Vec<u64> {
    cmds.iter()
        .map(|cmd| cmd["cmdId"].as_u64().expect("cmdId"))
        .collect()
}

struct MockWriter {
    tx: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl FrameWriter for MockWriter {
    async fn send_text(&mut self, text: String) -> TelemetryResult<()> {
        let value: Value = serde_json::from_str(&text)?;
        self.tx
            .send(Outbound::Text(value))
            .map_err(|_| TelemetryError::websocket("peer gone"))
    }

    async fn send_ping(&mut self) -> TelemetryResult<()> {
        self.tx
            .send(Outbound::Ping)
            .map_err(|_| TelemetryError::websocket("peer gone"))
    }

    async fn close(&mut self) -> TelemetryResult<()> {
        let _ = self.tx.send(Outbound::Close);
        Ok(())
    }
}

/// In-memory connector handing each connection's server side to the test.
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    failures: Mutex<usize>,
    crashes: Mutex<usize>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            failures: Mutex::new(0),
            crashes: Mutex::new(0),
            attempts: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        *self.failures.lock() = n;
    }

    /// Panic inside the next `n` connection attempts.
    pub fn crash_next(&self, n: usize) {
        *self.crashes.lock() = n;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> TelemetryResult<(Box<dyn FrameWriter>, FrameStream)> {
        assert_eq!(url, URL);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let crash = {
            let mut crashes = self.crashes.lock();
            let crash = *crashes > 0;
            *crashes = crashes.saturating_sub(1);
            crash
        };
        if crash {
            panic!("connector crashed");
        }
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(TelemetryError::websocket("connection refused"));
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let server = MockServer {
            outbound: out_rx,
            inbound: Some(in_tx),
        };
        self.servers
            .send(server)
            .map_err(|_| TelemetryError::websocket("test harness gone"))?;

        let frames = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok((Box::new(MockWriter { tx: out_tx }), frames))
    }
}

/// Scripted token provider.
pub struct TestTokens {
    token: Mutex<Option<String>>,
    expired: Mutex<Vec<String>>,
    refreshes: Mutex<VecDeque<Result<String, String>>>,
    refresh_calls: AtomicUsize,
    session_invalid_calls: AtomicUsize,
}

impl TestTokens {
    fn with(token: Option<&str>, expired: bool) -> Arc<Self> {
        let expired = match (token, expired) {
            (Some(token), true) => vec![token.to_string()],
            _ => Vec::new(),
        };
        Arc::new(Self {
            token: Mutex::new(token.map(str::to_string)),
            expired: Mutex::new(expired),
            refreshes: Mutex::new(VecDeque::new()),
            refresh_calls: AtomicUsize::new(0),
            session_invalid_calls: AtomicUsize::new(0),
        })
    }

    pub fn valid(token: &str) -> Arc<Self> {
        Self::with(Some(token), false)
    }

    pub fn expired(token: &str) -> Arc<Self> {
        Self::with(Some(token), true)
    }

    pub fn missing() -> Arc<Self> {
        Self::with(None, false)
    }

    /// Script the outcome of the next refresh.
    pub fn on_refresh(&self, outcome: Result<&str, &str>) {
        self.refreshes
            .lock()
            .push_back(outcome.map(str::to_string).map_err(str::to_string));
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn session_invalid_calls(&self) -> usize {
        self.session_invalid_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for TestTokens {
    fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    fn is_token_expired(&self, token: &str) -> bool {
        self.expired.lock().iter().any(|expired| expired == token)
    }

    async fn refresh(&self) -> TelemetryResult<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.refreshes.lock().pop_front();
        match next {
            Some(Ok(token)) => {
                *self.token.lock() = Some(token);
                Ok(())
            }
            Some(Err(message)) => Err(TelemetryError::auth(message)),
            None => Err(TelemetryError::auth("no refresh scripted")),
        }
    }

    fn on_session_invalid(&self) {
        self.session_invalid_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every status change seen by a listener.
pub struct StatusLog {
    rx: mpsc::UnboundedReceiver<ConnectionStatus>,
    seen: Vec<ConnectionStatus>,
}

impl StatusLog {
    pub fn attach(client: &TelemetryClient) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        client.add_status_listener(move |status| {
            let _ = tx.send(status);
        });
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Wait until `status` is broadcast.
    pub async fn wait_for(&mut self, status: ConnectionStatus) {
        loop {
            let next = timeout(WAIT, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {status}; saw {:?}", self.seen))
                .expect("status listener dropped");
            self.seen.push(next);
            if next == status {
                return;
            }
        }
    }

    /// Every status observed so far, including ones not yet waited for.
    pub fn seen(&mut self) -> &[ConnectionStatus] {
        while let Ok(next) = self.rx.try_recv() {
            self.seen.push(next);
        }
        &self.seen
    }
}

/// Messages delivered to a subscriber callback.
///
/// The inbox holds its own sender, so the channel stays open after the
/// engine drops a retired subscriber together with its callback.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    _tx: mpsc::UnboundedSender<InboundMessage>,
}

impl Inbox {
    pub async fn recv(&mut self) -> InboundMessage {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("inbox sender is held")
    }

    /// Fail if anything is delivered within `wait`.
    pub async fn assert_quiet(&mut self, wait: Duration, context: &str) -> TelemetryResult<()> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(message)) => Err(TelemetryError::internal(format!(
                "unexpected delivery during {context}: {message:?}",
            ))),
            Ok(None) => Err(TelemetryError::internal("inbox closed")),
            Err(_) => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Callback that forwards every message into an [`Inbox`].
pub fn forward() -> (impl Fn(&InboundMessage) + Send + Sync + 'static, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let inbox = Inbox {
        rx,
        _tx: tx.clone(),
    };
    let callback = move |message: &InboundMessage| {
        let _ = tx.send(message.clone());
    };
    (callback, inbox)
}

/// Callback that counts invocations.
pub fn counter() -> (impl Fn() + Send + Sync + 'static, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&count);
    (
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
        },
        count,
    )
}

pub fn test_config() -> TelemetryConfig {
    TelemetryConfig::new(URL).ping_interval(None).idle_timeout(None)
}

/// A client wired to a mock connector.
pub struct Harness {
    pub client: TelemetryClient,
    pub connector: Arc<MockConnector>,
    pub servers: mpsc::UnboundedReceiver<MockServer>,
    pub tokens: Arc<TestTokens>,
    pub status: StatusLog,
}

impl Harness {
    pub fn new(config: TelemetryConfig, tokens: Arc<TestTokens>) -> Self {
        let (connector, servers) = MockConnector::new();
        let client = TelemetryClient::new(
            config,
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&tokens) as Arc<dyn TokenProvider>,
        )
        .expect("client");
        let status = StatusLog::attach(&client);
        Self {
            client,
            connector,
            servers,
            tokens,
            status,
        }
    }

    pub fn start() -> Self {
        Self::new(test_config(), TestTokens::valid("token-1"))
    }

    pub async fn next_server(&mut self) -> MockServer {
        timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Next connection, with its authentication frame already checked.
    pub async fn accept(&mut self, token: &str) -> MockServer {
        let mut server = self.next_server().await;
        let auth = server.next_frame().await;
        assert_eq!(auth, serde_json::json!({"authCmd": {"cmdId": 0, "token": token}}));
        server
    }

    /// Assert no connection is opened within `wait`.
    pub async fn expect_no_connection(&mut self, wait: Duration) {
        if let Ok(Some(_)) = timeout(wait, self.servers.recv()).await {
            panic!("unexpected connection");
        }
    }
}
