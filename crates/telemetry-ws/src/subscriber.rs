//! Subscribers: an ordered list of commands plus optional callbacks.

use std::{fmt, sync::Arc};

use crate::{command::Command, router::InboundMessage};

/// Callback for plain telemetry/attribute pushes.
pub type OnDataCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Callback for query-result updates (messages carrying `cmdUpdateType`).
pub type OnUpdateCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Callback fired before a subscriber is re-registered after a reconnect.
pub type OnReconnectedCallback = Arc<dyn Fn() + Send + Sync>;

/// Identity of a registered subscriber, stable across reconnects.
/// Uses ULID so ids are unique without coordination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(ulid::Ulid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of commands owned by one consumer, with the callbacks that receive
/// its data.
///
/// All callbacks are optional. Messages for a missing callback are discarded.
///
/// ```rust
/// use telemetry_ws::{Command, EntityRef, Subscriber};
///
/// let subscriber = Subscriber::new([Command::timeseries(
///     EntityRef::device("0d4c6f0e-5e0b-11ef-9c3a-0242ac120002"),
///     &["temperature"],
/// )])
/// .on_data(|msg| println!("telemetry: {:?}", msg.data))
/// .on_reconnected(|| println!("dropping cached values"));
/// # let _ = subscriber;
/// ```
#[derive(Clone, Default)]
pub struct Subscriber {
    pub(crate) commands: Vec<Command>,
    pub(crate) on_data: Option<OnDataCallback>,
    pub(crate) on_update: Option<OnUpdateCallback>,
    pub(crate) on_reconnected: Option<OnReconnectedCallback>,
}

impl Subscriber {
    /// Create a subscriber for the given commands, in transmission order.
    pub fn new(commands: impl IntoIterator<Item = Command>) -> Self {
        Self {
            commands: commands.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Register the data callback.
    #[must_use]
    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(f));
        self
    }

    /// Register the update callback.
    #[must_use]
    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    /// Register the reconnect callback.
    #[must_use]
    pub fn on_reconnected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_reconnected = Some(Arc::new(f));
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub(crate) fn deliver_data(&self, message: &InboundMessage) {
        if let Some(cb) = &self.on_data {
            cb(message);
        }
    }

    pub(crate) fn deliver_update(&self, message: &InboundMessage) {
        if let Some(cb) = &self.on_update {
            cb(message);
        }
    }

    pub(crate) fn notify_reconnected(&self) {
        if let Some(cb) = &self.on_reconnected {
            cb();
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("commands", &self.commands)
            .field("on_data", &self.on_data.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_reconnected", &self.on_reconnected.is_some())
            .finish()
    }
}

/// A subscriber as held by the engine.
#[derive(Debug)]
pub(crate) struct SubscriberEntry {
    pub(crate) id: SubscriberId,
    pub(crate) subscriber: Subscriber,
}

impl SubscriberEntry {
    pub(crate) fn new(subscriber: Subscriber) -> Arc<Self> {
        Arc::new(Self {
            id: SubscriberId::new(),
            subscriber,
        })
    }
}
