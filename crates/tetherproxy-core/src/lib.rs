//! # tetherproxy-core
//!
//! Core logic for the tetherproxy hotspot proxy.
//!
//! This crate provides:
//! - Per-client traffic accounting and display formatting
//! - Proxy session managers and the factory that builds them
//! - The hotspot network layer and its status and event channels
//! - Lifecycle coordination between the network and the wake lock
//! - Configuration loading, saving, and validation
//!
//! ## Architecture
//!
//! - [`client`] - Client identities, traffic records, and byte formatting
//! - [`history`] - Concurrent per-client traffic history
//! - [`proxy`] - Proxy strategies, managers, and the manager factory
//! - [`network`] - Network controller and the hotspot implementation
//! - [`coordinator`] - Wake lock and shutdown wiring around the network
//! - [`locker`] - Wake lock contract and in-process implementation
//! - [`status`] - Running status channels and event buses
//! - [`config`] - Application configuration
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod locker;
pub mod network;
pub mod proxy;
pub mod status;
pub mod types;

pub use client::{
    format_bytes, is_ipv4_identifier, ClientIdentity, ClientRecord, Clock, SystemClock,
};
pub use config::{
    Config, ConfigError, ConfigResult, HotspotConfig, ListenPort, ProxyConfig, ServerConfig,
};
pub use coordinator::LifecycleCoordinator;
pub use error::{Error, Result, TetherProxyError};
pub use history::ClientHistory;
pub use locker::{Locker, WakeLock};
pub use network::{GroupProvider, HotspotNetwork, NetworkController, StaticGroup};
pub use proxy::{
    ClientSession, DefaultRouteBinder, LocalAddressBinder, NoopTagger, PortPreference,
    ProxyManager, ProxyManagerFactory, ProxyStrategies, SessionHandler, SocketBinder, SocketTagger,
};
pub use status::{EventBus, RefreshNotification, RunningStatus, ShutdownRequest, StatusChannel};
pub use types::{ByteTransferReport, ConnectionInfo, TransportType};
