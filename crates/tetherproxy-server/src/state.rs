//! Application state shared across handlers and the daemon loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use tetherproxy_core::{
    ClientHistory, Config, ConfigResult, ConnectionInfo, DefaultRouteBinder, EventBus,
    HotspotNetwork, LifecycleCoordinator, ListenPort, LocalAddressBinder, Locker,
    NetworkController, NoopTagger, ProxyStrategies, SocketBinder, StaticGroup, WakeLock,
};

use crate::relay::ConnectRelay;

/// Shared handle passed to every route.
pub type SharedState = Arc<AppState>;

/// Wake lock tag shown in logs.
pub const WAKE_LOCK_TAG: &str = "tetherproxy";

/// Everything the daemon wires together at startup.
pub struct AppState {
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    /// Hotspot network and its proxy.
    pub network: Arc<HotspotNetwork>,
    /// Wake lock and shutdown wiring around the network.
    pub coordinator: Arc<LifecycleCoordinator>,
    /// Per-client traffic.
    pub history: Arc<ClientHistory>,
    /// Held while the proxy is running.
    pub wake_lock: Arc<WakeLock>,
    /// Live listen-port preference.
    pub listen_port: Arc<ListenPort>,
    refreshes: AtomicU64,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Build the component graph from `config`.
    ///
    /// The hotspot group is the configured host and name; sessions are
    /// relayed by a [`ConnectRelay`] sharing the network's refresh bus.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let history = Arc::new(ClientHistory::default());
        let refresh_bus = EventBus::default();
        let listen_port = Arc::new(ListenPort::new(config.proxy.listen_port));

        let binder: Arc<dyn SocketBinder> = match config.proxy.outbound_address {
            Some(local) => Arc::new(LocalAddressBinder::new(local)),
            None => Arc::new(DefaultRouteBinder),
        };
        let strategies = ProxyStrategies {
            port_preference: Arc::clone(&listen_port) as _,
            tagger: Arc::new(NoopTagger),
            binder,
            session_handler: Arc::new(ConnectRelay::new(
                Arc::clone(&history),
                refresh_bus.clone(),
            )),
        };

        let mut group = ConnectionInfo::new(config.hotspot.group_name.clone(), config.hotspot.host);
        group.passphrase.clone_from(&config.hotspot.passphrase);

        let network = Arc::new(HotspotNetwork::with_refresh_bus(
            Arc::new(StaticGroup::new(group)),
            strategies,
            config.proxy.transport,
            refresh_bus,
        ));
        let wake_lock = Arc::new(WakeLock::new(WAKE_LOCK_TAG));
        let coordinator = Arc::new(LifecycleCoordinator::new(
            Arc::clone(&network) as Arc<dyn NetworkController>,
            Arc::clone(&wake_lock) as Arc<dyn Locker>,
        ));

        Self {
            config: RwLock::new(config),
            config_path: None,
            network,
            coordinator,
            history,
            wake_lock,
            listen_port,
            refreshes: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    /// Persist configuration changes to `path`.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Get read access to config.
    pub async fn config(&self) -> RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    /// Get write access to config.
    pub async fn config_mut(&self) -> RwLockWriteGuard<'_, Config> {
        self.config.write().await
    }

    /// File the configuration is persisted to, if any.
    #[must_use]
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Write `config` to the configuration file.
    ///
    /// Returns `false` without touching disk when no path was set.
    ///
    /// # Errors
    ///
    /// Returns the save error if the file cannot be written.
    pub fn persist(&self, config: &Config) -> ConfigResult<bool> {
        let Some(path) = self.config_path() else {
            return Ok(false);
        };
        config.save(path)?;
        debug!(path = %path.display(), "Configuration saved");
        Ok(true)
    }

    /// Wrap in the handle routes expect.
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }

    /// When the daemon started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whole seconds since start.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        u64::try_from((Utc::now() - self.started_at).num_seconds()).unwrap_or(0)
    }

    /// Count a redraw of the status notification.
    pub fn record_refresh(&self) -> u64 {
        self.refreshes.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// How many notification refreshes have been handled.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetherproxy_core::RunningStatus;

    #[test]
    fn test_new_state_is_idle() {
        let state = AppState::new(Config::default());

        assert_eq!(state.network.current_network_status(), RunningStatus::NotRunning);
        assert_eq!(state.network.current_proxy_status(), RunningStatus::NotRunning);
        assert!(state.network.connection_info().is_none());
        assert!(!state.wake_lock.is_held());
        assert_eq!(state.listen_port.current(), Config::default().proxy.listen_port);
        assert_eq!(state.refresh_count(), 0);
    }

    #[test]
    fn test_persist_without_path_is_a_no_op() {
        let state = AppState::new(Config::default());
        assert!(state.config_path().is_none());
        assert!(!state.persist(&Config::default()).unwrap());
    }

    #[test]
    fn test_persist_writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let state = AppState::new(Config::default()).with_config_path(&path);

        let mut config = Config::default();
        config.proxy.listen_port = 9100;
        assert!(state.persist(&config).unwrap());

        assert_eq!(Config::load(&path).unwrap().proxy.listen_port, 9100);
    }

    #[test]
    fn test_refresh_counter() {
        let state = AppState::new(Config::default());
        assert_eq!(state.record_refresh(), 1);
        assert_eq!(state.record_refresh(), 2);
        assert_eq!(state.refresh_count(), 2);
    }
}
