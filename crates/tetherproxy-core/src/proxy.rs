//! Proxy session managers and the factory that builds them.
//!
//! [`ProxyManagerFactory::create`] turns a transport type plus an established
//! [`ConnectionInfo`] into a [`ProxyManager`]. Only TCP has a manager; asking
//! for UDP fails with [`TetherProxyError::UnsupportedTransport`].
//!
//! The TCP manager owns the accept loop. Every accepted socket is tagged,
//! wrapped in a [`ClientSession`], and handed to the injected
//! [`SessionHandler`], which does the actual relaying. Listener failures are
//! published on the proxy status channel and retried after
//! [`PROXY_RETRY_DELAY`]. A [`StopProxy`] event ends the loop.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TetherProxyError};
use crate::status::{next_event, EventBus, RunningStatus, StatusChannel, StopProxy};
use crate::types::{ConnectionInfo, TransportType};

/// Delay between listener restarts after a failure.
pub const PROXY_RETRY_DELAY: Duration = Duration::from_secs(3);

static FOREGROUND_THREAD: OnceLock<ThreadId> = OnceLock::new();

/// Register the calling thread as the foreground thread.
///
/// Proxy managers must never be built from this thread. Returns `false` if a
/// foreground thread was already registered.
pub fn mark_foreground_thread() -> bool {
    FOREGROUND_THREAD.set(thread::current().id()).is_ok()
}

/// Panic if called from the registered foreground thread.
///
/// # Panics
///
/// Always panics when the current thread is the one passed to
/// [`mark_foreground_thread`]. This is a contract violation, not an error.
pub fn ensure_background_thread() {
    if let Some(foreground) = FOREGROUND_THREAD.get() {
        assert_ne!(
            *foreground,
            thread::current().id(),
            "proxy managers must not be created on the foreground thread"
        );
    }
}

// =============================================================================
// INJECTED STRATEGIES
// =============================================================================

/// Source of the port the proxy should listen on.
#[async_trait]
pub trait PortPreference: Send + Sync {
    /// Wait for the configured port.
    async fn listen_port(&self) -> Result<u16>;
}

/// Labels accepted client sockets, for example for per-app traffic statistics.
pub trait SocketTagger: Send + Sync {
    /// Tag a freshly accepted socket.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket could not be tagged; the session
    /// continues untagged.
    fn tag(&self, stream: &TcpStream, peer: SocketAddr) -> std::io::Result<()>;
}

/// Binds outbound sockets to the network that should carry client traffic.
pub trait SocketBinder: Send + Sync {
    /// Prepare `socket` before it connects upstream.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket could not be bound.
    fn bind(&self, socket: &TcpSocket, upstream: SocketAddr) -> std::io::Result<()>;
}

/// Tagger that leaves sockets untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTagger;

impl SocketTagger for NoopTagger {
    fn tag(&self, _stream: &TcpStream, _peer: SocketAddr) -> std::io::Result<()> {
        Ok(())
    }
}

/// Binder that lets the OS pick the outbound route.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRouteBinder;

impl SocketBinder for DefaultRouteBinder {
    fn bind(&self, _socket: &TcpSocket, _upstream: SocketAddr) -> std::io::Result<()> {
        Ok(())
    }
}

/// Binder that pins outbound sockets to a local address of the same family.
#[derive(Debug, Clone, Copy)]
pub struct LocalAddressBinder {
    local: std::net::IpAddr,
}

impl LocalAddressBinder {
    /// Bind outbound sockets to `local`.
    #[must_use]
    pub const fn new(local: std::net::IpAddr) -> Self {
        Self { local }
    }
}

impl SocketBinder for LocalAddressBinder {
    fn bind(&self, socket: &TcpSocket, upstream: SocketAddr) -> std::io::Result<()> {
        if self.local.is_ipv4() == upstream.is_ipv4() {
            socket.bind(SocketAddr::new(self.local, 0))?;
        }
        Ok(())
    }
}

/// One accepted client connection.
pub struct ClientSession {
    /// Socket to the tethered client.
    pub stream: TcpStream,
    /// Client address.
    pub peer: SocketAddr,
    /// Binder for the upstream socket.
    pub binder: Arc<dyn SocketBinder>,
}

/// Per-connection relay logic.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Serve one client until it disconnects.
    async fn handle(&self, session: ClientSession);
}

/// Everything the factory injects into the managers it builds.
#[derive(Clone)]
pub struct ProxyStrategies {
    /// Listen port source.
    pub port_preference: Arc<dyn PortPreference>,
    /// Client socket tagger.
    pub tagger: Arc<dyn SocketTagger>,
    /// Upstream socket binder.
    pub binder: Arc<dyn SocketBinder>,
    /// Shared relay logic.
    pub session_handler: Arc<dyn SessionHandler>,
}

// =============================================================================
// MANAGERS
// =============================================================================

/// A running proxy for one established connection.
#[async_trait]
pub trait ProxyManager: Send {
    /// Transport this manager relays.
    fn transport(&self) -> TransportType;

    /// Port the manager listens on.
    fn listen_port(&self) -> u16;

    /// Serve until a stop event arrives.
    async fn run(self: Box<Self>) -> Result<()>;
}

/// TCP accept loop handing sockets to the session handler.
pub struct TcpProxyManager {
    tagger: Arc<dyn SocketTagger>,
    binder: Arc<dyn SocketBinder>,
    session_handler: Arc<dyn SessionHandler>,
    connection: ConnectionInfo,
    port: u16,
    dispatcher: Handle,
    stop_rx: broadcast::Receiver<StopProxy>,
    retry_delay: Duration,
    status: Arc<StatusChannel>,
}

enum ServeOutcome {
    Stopped,
    Failed(std::io::Error),
}

impl TcpProxyManager {
    /// Address the listener binds.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.connection.host, self.port)
    }

    async fn serve(&mut self, listener: &TcpListener) -> ServeOutcome {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = next_event(&mut self.stop_rx) => {
                    debug!(active = sessions.len(), "Stop requested; closing sessions");
                    sessions.shutdown().await;
                    return ServeOutcome::Stopped;
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = %e, "Client session panicked");
                        }
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(&mut sessions, stream, peer),
                    Err(e) => {
                        sessions.shutdown().await;
                        return ServeOutcome::Failed(e);
                    }
                },
            }
        }
    }

    fn dispatch(&self, sessions: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.tagger.tag(&stream, peer) {
            warn!(%peer, error = %e, "Failed to tag client socket");
        }
        debug!(%peer, "Client connected");

        let session = ClientSession {
            stream,
            peer,
            binder: Arc::clone(&self.binder),
        };
        let handler = Arc::clone(&self.session_handler);
        sessions.spawn_on(async move { handler.handle(session).await }, &self.dispatcher);
    }

    /// Wait out the retry delay. Returns `true` if a stop arrived meanwhile.
    async fn back_off(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = next_event(&mut self.stop_rx) => true,
            () = tokio::time::sleep(self.retry_delay) => false,
        }
    }
}

#[async_trait]
impl ProxyManager for TcpProxyManager {
    fn transport(&self) -> TransportType {
        TransportType::Tcp
    }

    fn listen_port(&self) -> u16 {
        self.port
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let addr = this.listen_addr();
        info!(%addr, group = %this.connection.group_name, "Starting TCP proxy");
        this.status.publish(RunningStatus::Starting);

        loop {
            let bound = tokio::select! {
                biased;
                _ = next_event(&mut this.stop_rx) => break,
                bound = TcpListener::bind(addr) => bound,
            };

            match bound {
                Ok(listener) => {
                    info!(%addr, "Proxy listening");
                    this.status.publish(RunningStatus::Running);
                    match this.serve(&listener).await {
                        ServeOutcome::Stopped => break,
                        ServeOutcome::Failed(e) => {
                            error!(%addr, error = %e, "Proxy accept loop failed");
                            this.status
                                .publish(RunningStatus::Error(format!("accept failed: {e}")));
                        }
                    }
                }
                Err(source) => {
                    let err = TetherProxyError::ProxyBindFailed { addr, source };
                    error!(error = %err, "Proxy listener unavailable");
                    this.status.publish(RunningStatus::Error(err.to_string()));
                }
            }

            warn!(
                delay_secs = this.retry_delay.as_secs(),
                "Restarting proxy listener after delay"
            );
            if this.back_off().await {
                break;
            }
        }

        info!(%addr, "TCP proxy stopped");
        this.status.publish(RunningStatus::NotRunning);
        Ok(())
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Builds proxy managers for established connections.
///
/// Holds only shared, immutable handles; concurrent `create` calls for
/// independent connections do not interact.
#[derive(Clone)]
pub struct ProxyManagerFactory {
    strategies: ProxyStrategies,
    stop_events: EventBus<StopProxy>,
    proxy_status: Arc<StatusChannel>,
}

impl ProxyManagerFactory {
    /// Create a factory whose managers publish to `proxy_status` and stop on
    /// events from `stop_events`.
    #[must_use]
    pub const fn new(
        strategies: ProxyStrategies,
        stop_events: EventBus<StopProxy>,
        proxy_status: Arc<StatusChannel>,
    ) -> Self {
        Self {
            strategies,
            stop_events,
            proxy_status,
        }
    }

    /// Build a manager for `transport` serving `connection`.
    ///
    /// For TCP this waits for the listen port, then subscribes the manager to
    /// stop events so a stop sent before `run` is still honored.
    ///
    /// # Errors
    ///
    /// Returns [`TetherProxyError::UnsupportedTransport`] for anything but TCP,
    /// or [`TetherProxyError::PortUnavailable`] if the port source closed.
    ///
    /// # Panics
    ///
    /// Panics when called from the foreground thread.
    pub async fn create(
        &self,
        transport: TransportType,
        connection: ConnectionInfo,
        dispatcher: Handle,
    ) -> Result<Box<dyn ProxyManager>> {
        ensure_background_thread();

        match transport {
            TransportType::Tcp => {
                let port = self.strategies.port_preference.listen_port().await?;
                debug!(port, host = %connection.host, "Building TCP proxy manager");
                Ok(Box::new(TcpProxyManager {
                    tagger: Arc::clone(&self.strategies.tagger),
                    binder: Arc::clone(&self.strategies.binder),
                    session_handler: Arc::clone(&self.strategies.session_handler),
                    connection,
                    port,
                    dispatcher,
                    stop_rx: self.stop_events.subscribe(),
                    retry_delay: PROXY_RETRY_DELAY,
                    status: Arc::clone(&self.proxy_status),
                }))
            }
            TransportType::Udp => Err(TetherProxyError::UnsupportedTransport(transport)),
        }
    }
}
