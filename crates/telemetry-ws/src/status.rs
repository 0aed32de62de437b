//! Connection status and its observers.

use std::{cell::RefCell, fmt, sync::Arc};

use parking_lot::ReentrantMutex;

/// Externally visible connection status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No connection and none being attempted.
    #[default]
    Disconnected,
    /// Opening the transport (including token refresh).
    Connecting,
    /// Transport open and authenticated.
    Connected,
    /// Connection lost; a reconnect is scheduled.
    Reconnecting,
    /// A transport error was reported; the close that follows drives recovery.
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer invoked with every status change.
pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Handle returned by [`StatusBroadcaster::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    status: ConnectionStatus,
    listeners: Vec<(ListenerId, StatusListener)>,
    next_id: u64,
}

/// Holds the current status and notifies listeners of changes.
///
/// Notifications are delivered synchronously, in registration order, while
/// the broadcaster lock is held, so two changes are never observed out of
/// order. The lock is reentrant: a listener may read the status or add and
/// remove listeners from inside its callback.
pub struct StatusBroadcaster {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                status: ConnectionStatus::Disconnected,
                listeners: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Current status.
    pub fn get(&self) -> ConnectionStatus {
        self.inner.lock().borrow().status
    }

    /// Update the status, notifying listeners if it changed.
    ///
    /// Returns `false` when `status` equals the current value.
    pub fn set(&self, status: ConnectionStatus) -> bool {
        let guard = self.inner.lock();
        let listeners = {
            let mut inner = guard.borrow_mut();
            if inner.status == status {
                return false;
            }
            inner.status = status;
            inner
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect::<Vec<_>>()
        };
        for listener in listeners {
            listener(status);
        }
        true
    }

    /// Register a listener; it is called immediately with the current status.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let listener: StatusListener = Arc::new(listener);
        let guard = self.inner.lock();
        let (id, status) = {
            let mut inner = guard.borrow_mut();
            let id = ListenerId(inner.next_id);
            inner.next_id += 1;
            inner.listeners.push((id, Arc::clone(&listener)));
            (id, inner.status)
        };
        listener(status);
        id
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        inner.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().borrow().listeners.len()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        f.debug_struct("StatusBroadcaster")
            .field("status", &inner.status)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}
