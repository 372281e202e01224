//! Tethered client identity and traffic accounting.
//!
//! A [`ClientRecord`] identifies one peer either by IPv4 address or by host
//! name. The kind is decided once, when the record is created, by checking the
//! identifier against a strict dotted-quad pattern. Records never change in
//! place: folding in a new traffic report produces a new record.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::types::ByteTransferReport;

/// Strict IPv4 dotted quad: four octets in 0-255, no leading zeros, nothing else.
static IPV4_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])(\.(25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])){3}$",
    )
    .expect("IPv4 pattern is a valid regex")
});

/// Unit suffixes for [`format_bytes`], smallest first.
const SIZE_UNITS: [&str; 6] = ["bytes", "KB", "MB", "GB", "TB", "PB"];

/// Returns `true` if `value` is a strict IPv4 dotted quad.
#[must_use]
pub fn is_ipv4_identifier(value: &str) -> bool {
    IPV4_PATTERN.is_match(value)
}

/// Render a byte count for humans.
///
/// Divides by 1024 while the magnitude is at least 1024, moving through
/// `bytes`, `KB`, `MB`, `GB`, `TB` and `PB`. Plain bytes keep a space before
/// the unit (`"0 bytes"`); scaled values do not (`"2KB"`, `"1.5MB"`).
/// Scaled values keep at most two decimals with trailing zeros removed.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    #[allow(clippy::cast_precision_loss)]
    let mut magnitude = bytes as f64;
    let mut unit = 0;

    // PB is the last unit; anything larger stays expressed in PB.
    while magnitude >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        magnitude /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        return format!("{bytes} {}", SIZE_UNITS[0]);
    }

    let rendered = format!("{magnitude:.2}");
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed}{}", SIZE_UNITS[unit])
}

/// Source of the current time for record timestamps.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// How a tethered client is identified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientIdentity {
    /// Identified by IPv4 address.
    ByIp {
        /// Dotted-quad address.
        ip: String,
    },
    /// Identified by host name (anything that is not a strict IPv4 address).
    ByHost {
        /// Host name as reported by the peer.
        hostname: String,
    },
}

impl ClientIdentity {
    /// Classify an identifier string.
    #[must_use]
    pub fn classify(identifier: &str) -> Self {
        if is_ipv4_identifier(identifier) {
            Self::ByIp {
                ip: identifier.to_owned(),
            }
        } else {
            Self::ByHost {
                hostname: identifier.to_owned(),
            }
        }
    }

    /// The identifier carried by either variant.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::ByIp { ip } => ip,
            Self::ByHost { hostname } => hostname,
        }
    }

    /// Whether this identity is an IP address.
    #[must_use]
    pub const fn is_ip(&self) -> bool {
        matches!(self, Self::ByIp { .. })
    }
}

/// Identity and cumulative traffic for one tethered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    identity: ClientIdentity,
    nick_name: String,
    last_seen: DateTime<Utc>,
    totals: ByteTransferReport,
}

impl ClientRecord {
    /// Create a record for a newly connected peer with zero traffic.
    #[must_use]
    pub fn create(identifier: &str, clock: &dyn Clock) -> Self {
        Self {
            identity: ClientIdentity::classify(identifier),
            nick_name: String::new(),
            last_seen: clock.now(),
            totals: ByteTransferReport::ZERO,
        }
    }

    /// The peer's identity.
    #[must_use]
    pub const fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// User-assigned display name, empty if none.
    #[must_use]
    pub fn nick_name(&self) -> &str {
        &self.nick_name
    }

    /// When the peer was last observed.
    #[must_use]
    pub const fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Cumulative traffic for this peer.
    #[must_use]
    pub const fn totals(&self) -> ByteTransferReport {
        self.totals
    }

    /// Canonical lookup key: the IP address or the host name.
    #[must_use]
    pub fn key(&self) -> &str {
        self.identity.key()
    }

    /// Same variant and same identifier.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.identity == other.identity
    }

    /// Whether `identifier`, classified the same way as at creation, names this peer.
    ///
    /// An IP-shaped string never matches a host-name record and vice versa.
    #[must_use]
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        self.identity == ClientIdentity::classify(identifier)
    }

    /// Fold `incoming` into this record's totals without modifying the record.
    #[must_use]
    pub fn merge_report(&self, incoming: ByteTransferReport) -> ByteTransferReport {
        incoming + self.totals
    }

    /// A copy with `incoming` merged into the totals and `last_seen` refreshed.
    #[must_use]
    pub fn with_report(&self, incoming: ByteTransferReport, clock: &dyn Clock) -> Self {
        Self {
            totals: self.merge_report(incoming),
            last_seen: clock.now(),
            ..self.clone()
        }
    }

    /// A copy seen again at the current time, totals unchanged.
    #[must_use]
    pub fn touched(&self, clock: &dyn Clock) -> Self {
        Self {
            last_seen: clock.now(),
            ..self.clone()
        }
    }

    /// A copy with a new display name.
    #[must_use]
    pub fn with_nick_name(&self, nick_name: impl Into<String>) -> Self {
        Self {
            nick_name: nick_name.into(),
            ..self.clone()
        }
    }

    /// Nick name if set, otherwise the key.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.nick_name.is_empty() {
            self.key()
        } else {
            &self.nick_name
        }
    }

    /// Both directions combined, formatted for humans.
    #[must_use]
    pub fn total_transfer_display(&self) -> String {
        format_bytes(self.totals.total())
    }

    /// Internet-to-proxy bytes, formatted for humans.
    #[must_use]
    pub fn download_display(&self) -> String {
        format_bytes(self.totals.internet_to_proxy)
    }

    /// Proxy-to-internet bytes, formatted for humans.
    #[must_use]
    pub fn upload_display(&self) -> String {
        format_bytes(self.totals.proxy_to_internet)
    }
}
