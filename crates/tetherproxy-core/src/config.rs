//! Application configuration management.
//!
//! Handles loading, saving, and validating tetherproxy configuration:
//! - Proxy listen port and transport
//! - Hotspot group name, address, and passphrase
//! - HTTP API port and bind address
//!
//! Files are TOML. Any key can be overridden from the environment with the
//! `TETHERPROXY_` prefix and `__` as the section separator, for example
//! `TETHERPROXY_PROXY__LISTEN_PORT=9000`.
//!
//! The listen port is also exposed as a live value through [`ListenPort`] so it
//! can change while the service runs; the proxy factory reads whatever value
//! is current when it builds a manager.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::error::TetherProxyError;
use crate::proxy::PortPreference;
use crate::types::TransportType;

/// Environment variable that overrides the configuration file path.
pub const CONFIG_PATH_ENV: &str = "TETHERPROXY_CONFIG";

/// Prefix for per-key environment overrides.
pub const ENV_PREFIX: &str = "TETHERPROXY";

/// Default proxy listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 8228;

/// Default HTTP API port.
pub const DEFAULT_API_PORT: u16 = 3000;

/// Errors produced while loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// One field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proxy settings.
    pub proxy: ProxyConfig,
    /// Hotspot group settings.
    pub hotspot: HotspotConfig,
    /// HTTP API settings.
    pub server: ServerConfig,
}

/// Proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port tethered clients connect to.
    pub listen_port: u16,
    /// Transport to relay.
    pub transport: TransportType,
    /// Local address upstream sockets bind to; the OS routes when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_address: Option<IpAddr>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            transport: TransportType::Tcp,
            outbound_address: None,
        }
    }
}

/// Hotspot group settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotspotConfig {
    /// Group name (SSID) advertised to clients.
    pub group_name: String,
    /// Address of this device inside the group.
    pub host: IpAddr,
    /// WPA2 passphrase, 8 to 63 characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            group_name: "DIRECT-tetherproxy".to_string(),
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            passphrase: None,
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the status API listens on.
    pub api_port: u16,
    /// Address the status API binds.
    pub bind_host: IpAddr,
    /// Use production logging (JSON files plus compact stdout).
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: DEFAULT_API_PORT,
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            production: false,
        }
    }
}

impl Config {
    /// Load configuration from `path`, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load configuration from `path`, or defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        match Self::load(path) {
            Err(ConfigError::NotFound(path)) => {
                tracing::info!(path = %path.display(), "No configuration file; using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Write configuration to `path` as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns a single `ValidationError` or `MultipleValidationErrors`.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.proxy.listen_port == 0 {
            errors.push(invalid("proxy.listen_port", "must not be 0"));
        }
        if self.server.api_port == 0 {
            errors.push(invalid("server.api_port", "must not be 0"));
        }
        if self.proxy.listen_port != 0 && self.proxy.listen_port == self.server.api_port {
            errors.push(invalid(
                "server.api_port",
                "must differ from proxy.listen_port",
            ));
        }
        if self.hotspot.group_name.trim().is_empty() {
            errors.push(invalid("hotspot.group_name", "must not be empty"));
        }
        if let Some(passphrase) = &self.hotspot.passphrase {
            if !(8..=63).contains(&passphrase.chars().count()) {
                errors.push(invalid(
                    "hotspot.passphrase",
                    "must be between 8 and 63 characters",
                ));
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Resolve the configuration file path.
    ///
    /// `TETHERPROXY_CONFIG` wins; otherwise `/etc/tetherproxy/config.toml` on
    /// Linux and the platform config directory elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if no config directory can be determined.
    pub fn default_path() -> crate::error::Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/tetherproxy/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "tetherproxy").ok_or_else(|| {
                TetherProxyError::ConfigValidationError("Cannot determine config directory".into())
            })?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Live listen-port preference.
///
/// Port `0` means "not configured yet"; readers wait until a real port is set.
#[derive(Debug)]
pub struct ListenPort {
    tx: watch::Sender<u16>,
}

impl ListenPort {
    /// Start with `port`.
    #[must_use]
    pub fn new(port: u16) -> Self {
        let (tx, _rx) = watch::channel(port);
        Self { tx }
    }

    /// Change the port. Managers created afterwards use the new value.
    pub fn set(&self, port: u16) {
        self.tx.send_replace(port);
    }

    /// The current value.
    #[must_use]
    pub fn current(&self) -> u16 {
        *self.tx.borrow()
    }

    /// Observe changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u16> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl PortPreference for ListenPort {
    async fn listen_port(&self) -> crate::error::Result<u16> {
        let mut rx = self.tx.subscribe();
        let port = rx
            .wait_for(|port| *port != 0)
            .await
            .map(|port| *port)
            .map_err(|_| TetherProxyError::PortUnavailable)?;
        Ok(port)
    }
}
