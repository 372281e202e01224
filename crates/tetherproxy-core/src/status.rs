//! Status and event channels shared between the network layer and its observers.
//!
//! Two kinds of channel exist:
//!
//! - [`StatusChannel`] carries a [`RunningStatus`] and always holds the latest
//!   value. A new subscriber sees the current status immediately.
//! - [`EventBus`] carries one-shot requests (shutdown, notification refresh,
//!   proxy stop). Only receivers subscribed at send time get the event.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::warn;
use utoipa::ToSchema;

/// Default buffer for event buses.
pub const EVENT_BUS_CAPACITY: usize = 16;

/// Lifecycle state of the network or the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum RunningStatus {
    /// Not started, or stopped.
    #[default]
    NotRunning,
    /// Start-up in progress.
    Starting,
    /// Up and serving.
    Running,
    /// Failed with a message.
    Error(String),
}

impl RunningStatus {
    /// Whether this is [`RunningStatus::Running`].
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether this is [`RunningStatus::Error`].
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Short lowercase label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error(_) => "error",
        }
    }
}

/// Latest-value channel for a [`RunningStatus`].
#[derive(Debug)]
pub struct StatusChannel {
    tx: watch::Sender<RunningStatus>,
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusChannel {
    /// Create a channel holding [`RunningStatus::NotRunning`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunningStatus::NotRunning);
        Self { tx }
    }

    /// Replace the current status. Works with or without subscribers.
    pub fn publish(&self, status: RunningStatus) {
        self.tx.send_replace(status);
    }

    /// The current status.
    #[must_use]
    pub fn current(&self) -> RunningStatus {
        self.tx.borrow().clone()
    }

    /// Subscribe. The receiver starts with the current status unseen.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunningStatus> {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        rx
    }
}

/// A request to shut the whole service down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownRequest;

/// A request to redraw the user-facing status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshNotification;

/// A request for the running proxy manager to exit its accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopProxy;

/// No-replay broadcast bus for events of type `E`.
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl<E: Clone> EventBus<E> {
    /// Create a bus buffering up to `capacity` events per lagging receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send `event` to current subscribers. Returns how many received it.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receive the next event, skipping over lag.
///
/// Returns `None` once every sender is gone.
pub async fn next_event<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Option<E> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber lagged; dropped events");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
