//! Lifecycle coordination between the network layer and the wake lock.
//!
//! [`LifecycleCoordinator::bind`] wires four independent streams to their
//! reactions:
//!
//! | Stream               | Reaction                                   | Scope            |
//! |----------------------|--------------------------------------------|------------------|
//! | shutdown requests    | `on_shutdown()`                            | detached         |
//! | network status       | `Error` releases the lock                  | caller's scope   |
//! | proxy status         | `Running` acquires, `Error` releases       | caller's scope   |
//! | notification refresh | `on_refresh()`                             | caller's scope   |
//!
//! The shutdown subscription is deliberately outside the caller's scope: it is
//! the path the final stop signal arrives on while everything else is being
//! torn down. Rebinding replaces the whole set, shutdown subscription included.
//!
//! [`LifecycleCoordinator::start_proxy`] runs the network until its proxy loop
//! ends, then always runs the shutdown phase exactly once, even if the caller
//! is cancelled while waiting.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TetherProxyError};
use crate::locker::Locker;
use crate::network::NetworkController;
use crate::status::{next_event, RunningStatus};

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Subscriptions {
    scope: CancellationToken,
    shutdown_task: JoinHandle<()>,
}

impl Subscriptions {
    fn cancel(self) {
        self.scope.cancel();
        self.shutdown_task.abort();
    }
}

/// Ties the wake lock and shutdown signalling to network and proxy state.
pub struct LifecycleCoordinator {
    network: Arc<dyn NetworkController>,
    locker: Arc<dyn Locker>,
    subscriptions: Mutex<Option<Subscriptions>>,
}

impl LifecycleCoordinator {
    /// Create an unbound coordinator.
    #[must_use]
    pub fn new(network: Arc<dyn NetworkController>, locker: Arc<dyn Locker>) -> Self {
        Self {
            network,
            locker,
            subscriptions: Mutex::new(None),
        }
    }

    /// Whether a subscription set is active.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|subs| !subs.scope.is_cancelled())
    }

    /// Subscribe to the network's status and event streams.
    ///
    /// Replaces any earlier subscription set. Cancelling `scope` stops the
    /// status and refresh subscriptions but leaves the shutdown subscription
    /// running. Must be called inside a Tokio runtime.
    pub fn bind<S, R>(&self, scope: &CancellationToken, on_shutdown: S, on_refresh: R)
    where
        S: Fn() + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let mut current = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.take() {
            debug!("Replacing previous lifecycle subscriptions");
            previous.cancel();
        }

        // Receivers are created here, before any task is spawned, so events
        // sent right after `bind` returns are not missed.
        let shutdown_task = tokio::spawn(follow_shutdown(
            self.network.shutdown_events(),
            Arc::new(on_shutdown),
        ));

        let child = scope.child_token();
        let locker = Arc::clone(&self.locker);
        tokio::spawn(follow_status(
            child.clone(),
            self.network.network_status(),
            "network",
            move |status| {
                if let RunningStatus::Error(message) = status {
                    warn!(%message, "Network error; releasing wake lock");
                    locker.release();
                }
            },
        ));

        let locker = Arc::clone(&self.locker);
        tokio::spawn(follow_status(
            child.clone(),
            self.network.proxy_status(),
            "proxy",
            move |status| match status {
                RunningStatus::Running => locker.acquire(),
                RunningStatus::Error(message) => {
                    warn!(%message, "Proxy error; releasing wake lock");
                    locker.release();
                }
                RunningStatus::NotRunning | RunningStatus::Starting => {}
            },
        ));

        tokio::spawn(follow_refresh(
            child.clone(),
            self.network.refresh_events(),
            Arc::new(on_refresh),
        ));

        *current = Some(Subscriptions {
            scope: child,
            shutdown_task,
        });
    }

    /// Cancel every subscription, the shutdown one included.
    pub fn unbind(&self) {
        if let Some(previous) = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            previous.cancel();
        }
    }

    /// Run the network until its proxy loop ends.
    ///
    /// The network runs on a spawned task under its own cancellation scope.
    /// Afterwards the shutdown phase (network teardown, then wake lock
    /// release) runs once on a spawned task, so cancelling the caller cannot
    /// interrupt it. If the caller is dropped mid-wait, the nested scope is
    /// cancelled and the shutdown phase is spawned from the drop.
    ///
    /// # Errors
    ///
    /// Returns the network's error, or `NetworkStartFailed` if the network
    /// task panicked. The wake lock is released either way.
    pub async fn start_proxy(&self) -> Result<()> {
        let nested = CancellationToken::new();
        let mut cleanup = ShutdownPhase {
            network: Arc::clone(&self.network),
            locker: Arc::clone(&self.locker),
            nested: nested.clone(),
            armed: true,
        };

        info!("Starting proxy");
        let network = Arc::clone(&self.network);
        let outcome = match tokio::spawn(async move { network.start(nested).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(TetherProxyError::NetworkStartFailed(format!(
                "network task ended abnormally: {e}"
            ))),
        };

        if let Err(e) = &outcome {
            error!(error = %e, "Proxy ended with error");
        } else {
            info!("Proxy ended");
        }

        cleanup.run().await;
        outcome
    }
}

/// The teardown that follows every `start_proxy`, run at most once.
struct ShutdownPhase {
    network: Arc<dyn NetworkController>,
    locker: Arc<dyn Locker>,
    nested: CancellationToken,
    armed: bool,
}

impl ShutdownPhase {
    fn spawn(&mut self) -> Option<JoinHandle<()>> {
        if !std::mem::replace(&mut self.armed, false) {
            return None;
        }
        self.nested.cancel();

        let network = Arc::clone(&self.network);
        let locker = Arc::clone(&self.locker);
        let phase = async move {
            network.shutdown().await;
            locker.release();
            debug!("Shutdown phase complete");
        };

        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(phase)),
            Err(_) => {
                // No runtime left to tear the network down on; the lock at
                // least must not stay held.
                warn!("No runtime for shutdown phase; releasing wake lock only");
                self.locker.release();
                None
            }
        }
    }

    async fn run(&mut self) {
        if let Some(task) = self.spawn() {
            if let Err(e) = task.await {
                error!(error = %e, "Shutdown phase failed");
            }
        }
    }
}

impl Drop for ShutdownPhase {
    fn drop(&mut self) {
        if self.armed {
            debug!("start_proxy cancelled; running shutdown phase detached");
            let _ = self.spawn();
        }
    }
}

async fn follow_status<F>(
    scope: CancellationToken,
    mut rx: watch::Receiver<RunningStatus>,
    source: &'static str,
    react: F,
) where
    F: Fn(&RunningStatus) + Send,
{
    loop {
        if scope.is_cancelled() {
            break;
        }
        let status = rx.borrow_and_update().clone();
        debug!(source, status = status.label(), "Status update");
        react(&status);

        tokio::select! {
            biased;
            () = scope.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    debug!(source, "Status channel closed");
                    break;
                }
            }
        }
    }
}

async fn follow_refresh<E: Clone + Send>(
    scope: CancellationToken,
    mut rx: broadcast::Receiver<E>,
    on_refresh: Callback,
) {
    loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => break,
            event = next_event(&mut rx) => match event {
                Some(_) => on_refresh(),
                None => break,
            },
        }
    }
}

async fn follow_shutdown<E: Clone + Send>(mut rx: broadcast::Receiver<E>, on_shutdown: Callback) {
    while next_event(&mut rx).await.is_some() {
        info!("Shutdown request received");
        on_shutdown();
    }
}
