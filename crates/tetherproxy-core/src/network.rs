//! Hotspot network layer.
//!
//! [`NetworkController`] is the seam the lifecycle coordinator talks to: it
//! exposes the network and proxy status channels, the shutdown and
//! notification-refresh buses, and the blocking `start` call that returns only
//! when the proxy loop ends.
//!
//! [`HotspotNetwork`] is the shipped implementation. It asks a
//! [`GroupProvider`] for a peer group, publishes the resulting
//! [`ConnectionInfo`], builds a proxy manager through the
//! [`ProxyManagerFactory`], and runs it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::proxy::{ProxyManagerFactory, ProxyStrategies};
use crate::status::{
    EventBus, RefreshNotification, RunningStatus, ShutdownRequest, StatusChannel, StopProxy,
};
use crate::types::{ConnectionInfo, TransportType};

/// Network layer observed and driven by the lifecycle coordinator.
#[async_trait]
pub trait NetworkController: Send + Sync {
    /// Status of the hotspot group. Replays the latest value.
    fn network_status(&self) -> watch::Receiver<RunningStatus>;

    /// Status of the proxy loop. Replays the latest value.
    fn proxy_status(&self) -> watch::Receiver<RunningStatus>;

    /// Shutdown requests. No replay.
    fn shutdown_events(&self) -> broadcast::Receiver<ShutdownRequest>;

    /// Notification refresh requests. No replay.
    fn refresh_events(&self) -> broadcast::Receiver<RefreshNotification>;

    /// Bring the network up and run the proxy until it stops or `scope` is
    /// cancelled.
    async fn start(&self, scope: CancellationToken) -> Result<()>;

    /// Tear down the proxy and the group. Idempotent.
    async fn shutdown(&self);
}

/// Creates and removes the peer group clients join.
#[async_trait]
pub trait GroupProvider: Send + Sync {
    /// Create the group and report how to reach this device inside it.
    async fn create_group(&self) -> Result<ConnectionInfo>;

    /// Remove the group. Idempotent.
    async fn remove_group(&self);
}

/// Group provider for an interface that already exists.
///
/// Reports a fixed [`ConnectionInfo`]; creating and removing are no-ops.
#[derive(Debug, Clone)]
pub struct StaticGroup {
    info: ConnectionInfo,
}

impl StaticGroup {
    /// Always report `info`.
    #[must_use]
    pub const fn new(info: ConnectionInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl GroupProvider for StaticGroup {
    async fn create_group(&self) -> Result<ConnectionInfo> {
        Ok(self.info.clone())
    }

    async fn remove_group(&self) {}
}

/// Network layer backed by a [`GroupProvider`] and a TCP proxy.
pub struct HotspotNetwork {
    group_provider: Arc<dyn GroupProvider>,
    factory: ProxyManagerFactory,
    transport: TransportType,
    network_status: Arc<StatusChannel>,
    proxy_status: Arc<StatusChannel>,
    shutdown_bus: EventBus<ShutdownRequest>,
    refresh_bus: EventBus<RefreshNotification>,
    stop_bus: EventBus<StopProxy>,
    connection: watch::Sender<Option<ConnectionInfo>>,
    serving_port: watch::Sender<Option<u16>>,
    stop_requested: AtomicBool,
}

impl HotspotNetwork {
    /// Create a network that relays `transport` using `strategies`.
    #[must_use]
    pub fn new(
        group_provider: Arc<dyn GroupProvider>,
        strategies: ProxyStrategies,
        transport: TransportType,
    ) -> Self {
        Self::with_refresh_bus(group_provider, strategies, transport, EventBus::default())
    }

    /// Like [`Self::new`], publishing refresh requests on an existing bus.
    ///
    /// Lets a session handler built before the network share the bus.
    #[must_use]
    pub fn with_refresh_bus(
        group_provider: Arc<dyn GroupProvider>,
        strategies: ProxyStrategies,
        transport: TransportType,
        refresh_bus: EventBus<RefreshNotification>,
    ) -> Self {
        let proxy_status = Arc::new(StatusChannel::new());
        let stop_bus = EventBus::default();
        let factory =
            ProxyManagerFactory::new(strategies, stop_bus.clone(), Arc::clone(&proxy_status));
        let (connection, _rx) = watch::channel(None);
        let (serving_port, _rx) = watch::channel(None);

        Self {
            group_provider,
            factory,
            transport,
            network_status: Arc::new(StatusChannel::new()),
            proxy_status,
            shutdown_bus: EventBus::default(),
            refresh_bus,
            stop_bus,
            connection,
            serving_port,
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Current network status.
    #[must_use]
    pub fn current_network_status(&self) -> RunningStatus {
        self.network_status.current()
    }

    /// Current proxy status.
    #[must_use]
    pub fn current_proxy_status(&self) -> RunningStatus {
        self.proxy_status.current()
    }

    /// The established group, if any.
    #[must_use]
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.connection.borrow().clone()
    }

    /// Port the proxy is accepting clients on, while it is running.
    ///
    /// May differ from the listen-port preference, which only applies to the
    /// next manager built.
    #[must_use]
    pub fn active_port(&self) -> Option<u16> {
        if self.proxy_status.current().is_running() {
            *self.serving_port.borrow()
        } else {
            None
        }
    }

    /// Bus the relay uses to ask for a notification refresh.
    #[must_use]
    pub fn refresh_bus(&self) -> EventBus<RefreshNotification> {
        self.refresh_bus.clone()
    }

    /// Ask every observer to shut the service down.
    pub fn request_shutdown(&self) {
        let delivered = self.shutdown_bus.publish(ShutdownRequest);
        info!(delivered, "Shutdown requested");
    }

    /// Ask observers to redraw the status notification.
    pub fn request_refresh(&self) {
        self.refresh_bus.publish(RefreshNotification);
    }

    /// Ask the running proxy manager to exit.
    ///
    /// Also honored if the manager has not been built yet.
    pub fn stop_proxy(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let delivered = self.stop_bus.publish(StopProxy);
        debug!(delivered, "Proxy stop requested");
    }

    async fn run_proxy(&self, scope: &CancellationToken, info: ConnectionInfo) -> Result<()> {
        let manager = match self
            .factory
            .create(self.transport, info, Handle::current())
            .await
        {
            Ok(manager) => manager,
            Err(e) => {
                error!(error = %e, transport = %self.transport, "Cannot build proxy manager");
                self.proxy_status.publish(RunningStatus::Error(e.to_string()));
                return Err(e);
            }
        };

        // The manager subscribed to stop events inside `create`; a stop that
        // raced ahead of that subscription is caught here.
        if self.stop_requested.load(Ordering::SeqCst) {
            debug!("Stop requested before the proxy started");
            return Ok(());
        }

        self.serving_port.send_replace(Some(manager.listen_port()));
        let outcome = tokio::select! {
            biased;
            () = scope.cancelled() => {
                debug!("Network scope cancelled; abandoning proxy loop");
                Ok(())
            }
            outcome = manager.run() => outcome,
        };
        self.serving_port.send_replace(None);
        outcome
    }
}

#[async_trait]
impl NetworkController for HotspotNetwork {
    fn network_status(&self) -> watch::Receiver<RunningStatus> {
        self.network_status.subscribe()
    }

    fn proxy_status(&self) -> watch::Receiver<RunningStatus> {
        self.proxy_status.subscribe()
    }

    fn shutdown_events(&self) -> broadcast::Receiver<ShutdownRequest> {
        self.shutdown_bus.subscribe()
    }

    fn refresh_events(&self) -> broadcast::Receiver<RefreshNotification> {
        self.refresh_bus.subscribe()
    }

    async fn start(&self, scope: CancellationToken) -> Result<()> {
        self.network_status.publish(RunningStatus::Starting);

        let created = tokio::select! {
            biased;
            () = scope.cancelled() => {
                self.network_status.publish(RunningStatus::NotRunning);
                return Ok(());
            }
            created = self.group_provider.create_group() => created,
        };

        let info = match created {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "Hotspot group creation failed");
                self.network_status
                    .publish(RunningStatus::Error(e.to_string()));
                return Err(e);
            }
        };

        info!(group = %info.group_name, host = %info.host, "Hotspot group established");
        self.connection.send_replace(Some(info.clone()));
        self.network_status.publish(RunningStatus::Running);
        self.request_refresh();

        self.run_proxy(&scope, info).await
    }

    async fn shutdown(&self) {
        self.stop_proxy();
        self.group_provider.remove_group().await;
        if self.connection.send_replace(None).is_some() {
            info!("Hotspot group removed");
        }
        self.serving_port.send_replace(None);

        if !self.network_status.current().is_error() {
            self.network_status.publish(RunningStatus::NotRunning);
        } else {
            warn!("Leaving network error status in place after shutdown");
        }
        if !self.proxy_status.current().is_error() {
            self.proxy_status.publish(RunningStatus::NotRunning);
        }
        // Teardown is complete; the next start begins without a pending stop.
        self.stop_requested.store(false, Ordering::SeqCst);
        self.request_refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenPort;
    use crate::error::TetherProxyError;
    use crate::proxy::{ClientSession, DefaultRouteBinder, NoopTagger, SessionHandler};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    struct Silent;

    #[async_trait]
    impl SessionHandler for Silent {
        async fn handle(&self, _session: ClientSession) {}
    }

    struct FailingGroup;

    #[async_trait]
    impl GroupProvider for FailingGroup {
        async fn create_group(&self) -> Result<ConnectionInfo> {
            Err(TetherProxyError::NetworkStartFailed("radio off".into()))
        }

        async fn remove_group(&self) {}
    }

    fn strategies(port: u16) -> ProxyStrategies {
        ProxyStrategies {
            port_preference: Arc::new(ListenPort::new(port)),
            tagger: Arc::new(NoopTagger),
            binder: Arc::new(DefaultRouteBinder),
            session_handler: Arc::new(Silent),
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn localhost_group() -> Arc<dyn GroupProvider> {
        Arc::new(StaticGroup::new(ConnectionInfo::new(
            "DIRECT-test",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )))
    }

    #[tokio::test]
    async fn test_group_failure_is_published_as_status() {
        let network = HotspotNetwork::new(
            Arc::new(FailingGroup),
            strategies(free_port()),
            TransportType::Tcp,
        );

        let result = network.start(CancellationToken::new()).await;
        assert!(matches!(result, Err(TetherProxyError::NetworkStartFailed(_))));
        assert!(network.current_network_status().is_error());
        assert!(network.connection_info().is_none());
    }

    #[tokio::test]
    async fn test_udp_publishes_proxy_error() {
        let network =
            HotspotNetwork::new(localhost_group(), strategies(free_port()), TransportType::Udp);

        let result = network.start(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(TetherProxyError::UnsupportedTransport(TransportType::Udp))
        ));
        assert!(network.current_network_status().is_running());
        assert!(network.current_proxy_status().is_error());
    }

    #[tokio::test]
    async fn test_start_runs_until_stopped_then_shutdown_resets() {
        let port = free_port();
        let network = Arc::new(HotspotNetwork::new(
            localhost_group(),
            strategies(port),
            TransportType::Tcp,
        ));

        let started = {
            let network = Arc::clone(&network);
            tokio::spawn(async move { network.start(CancellationToken::new()).await })
        };

        let mut proxy_rx = network.proxy_status();
        tokio::time::timeout(
            Duration::from_secs(2),
            proxy_rx.wait_for(RunningStatus::is_running),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(network.connection_info().is_some());
        assert_eq!(network.active_port(), Some(port));

        network.stop_proxy();
        tokio::time::timeout(Duration::from_secs(2), started)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(network.active_port(), None);

        network.shutdown().await;
        assert_eq!(network.current_network_status(), RunningStatus::NotRunning);
        assert_eq!(network.current_proxy_status(), RunningStatus::NotRunning);
        assert!(network.connection_info().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_honored_once() {
        let network =
            HotspotNetwork::new(localhost_group(), strategies(free_port()), TransportType::Tcp);

        network.stop_proxy();
        tokio::time::timeout(Duration::from_secs(2), network.start(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert!(!network.current_proxy_status().is_running());

        network.shutdown().await;
        assert!(!network.stop_requested.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_scope_ends_start() {
        let network = Arc::new(HotspotNetwork::new(
            localhost_group(),
            strategies(free_port()),
            TransportType::Tcp,
        ));
        let scope = CancellationToken::new();

        let started = {
            let network = Arc::clone(&network);
            let scope = scope.clone();
            tokio::spawn(async move { network.start(scope).await })
        };

        let mut proxy_rx = network.proxy_status();
        tokio::time::timeout(
            Duration::from_secs(2),
            proxy_rx.wait_for(RunningStatus::is_running),
        )
        .await
        .unwrap()
        .unwrap();

        scope.cancel();
        tokio::time::timeout(Duration::from_secs(2), started)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_event_buses_reach_subscribers() {
        let network =
            HotspotNetwork::new(localhost_group(), strategies(free_port()), TransportType::Tcp);
        let mut shutdown_rx = network.shutdown_events();
        let mut refresh_rx = network.refresh_events();

        network.request_shutdown();
        network.request_refresh();

        assert_eq!(shutdown_rx.recv().await.unwrap(), ShutdownRequest);
        assert_eq!(refresh_rx.recv().await.unwrap(), RefreshNotification);
    }

    #[tokio::test]
    async fn test_shared_refresh_bus_reaches_network_subscribers() {
        let bus = EventBus::default();
        let network = HotspotNetwork::with_refresh_bus(
            localhost_group(),
            strategies(free_port()),
            TransportType::Tcp,
            bus.clone(),
        );
        let mut refresh_rx = network.refresh_events();

        assert_eq!(bus.publish(RefreshNotification), 1);
        assert_eq!(refresh_rx.recv().await.unwrap(), RefreshNotification);
        assert_eq!(network.refresh_bus().subscriber_count(), 1);
    }
}
