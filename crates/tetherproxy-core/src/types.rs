//! Shared value types and OpenAPI schemas.
//!
//! These types cross module boundaries: the transport selector used by the
//! proxy factory, the connection info published once a hotspot group is up,
//! and the byte counters every traffic report carries.

use std::fmt;
use std::iter::Sum;
use std::net::IpAddr;
use std::ops::Add;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Transport a proxy manager relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Stream relay over TCP.
    Tcp,
    /// Datagram relay. Reserved; no manager exists for it.
    Udp,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Details of an established hotspot group.
///
/// Only exists once the network is up; code that may run before that holds
/// an `Option<ConnectionInfo>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "group_name": "DIRECT-tetherproxy",
    "host": "192.168.49.1"
}))]
pub struct ConnectionInfo {
    /// Name (SSID) of the hotspot group.
    #[schema(example = "DIRECT-tetherproxy")]
    pub group_name: String,

    /// Address of this device inside the group. The proxy listens here.
    #[schema(value_type = String, example = "192.168.49.1")]
    pub host: IpAddr,

    /// Group passphrase. Never serialized.
    #[serde(skip_serializing, default)]
    pub passphrase: Option<String>,
}

impl ConnectionInfo {
    /// Create connection info without a passphrase.
    #[must_use]
    pub fn new(group_name: impl Into<String>, host: IpAddr) -> Self {
        Self {
            group_name: group_name.into(),
            host,
            passphrase: None,
        }
    }
}

/// Bytes moved for one client in both directions.
///
/// Reports combine by field-wise addition. Addition saturates at `u64::MAX`,
/// which keeps it commutative and associative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "internet_to_proxy": 1_048_576,
    "proxy_to_internet": 2048
}))]
pub struct ByteTransferReport {
    /// Bytes received from the internet on behalf of the client (download).
    pub internet_to_proxy: u64,

    /// Bytes sent to the internet on behalf of the client (upload).
    pub proxy_to_internet: u64,
}

impl ByteTransferReport {
    /// An empty report.
    pub const ZERO: Self = Self {
        internet_to_proxy: 0,
        proxy_to_internet: 0,
    };

    /// Create a report from both directions.
    #[must_use]
    pub const fn new(internet_to_proxy: u64, proxy_to_internet: u64) -> Self {
        Self {
            internet_to_proxy,
            proxy_to_internet,
        }
    }

    /// Sum of both directions.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.internet_to_proxy
            .saturating_add(self.proxy_to_internet)
    }

    /// Whether no bytes were moved in either direction.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.internet_to_proxy == 0 && self.proxy_to_internet == 0
    }
}

impl Add for ByteTransferReport {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            internet_to_proxy: self.internet_to_proxy.saturating_add(rhs.internet_to_proxy),
            proxy_to_internet: self.proxy_to_internet.saturating_add(rhs.proxy_to_internet),
        }
    }
}

impl Sum for ByteTransferReport {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Self> for ByteTransferReport {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_addition_is_commutative() {
        let a = ByteTransferReport::new(10, 20);
        let b = ByteTransferReport::new(5, 7);
        assert_eq!(a + b, b + a);
        assert_eq!(a + b, ByteTransferReport::new(15, 27));
    }

    #[test]
    fn test_report_addition_is_associative() {
        let a = ByteTransferReport::new(1, 2);
        let b = ByteTransferReport::new(30, 40);
        let c = ByteTransferReport::new(500, 600);
        assert_eq!((a + b) + c, a + (b + c));
    }

    #[test]
    fn test_report_addition_saturates() {
        let big = ByteTransferReport::new(u64::MAX, 1);
        let sum = big + ByteTransferReport::new(1, 1);
        assert_eq!(sum, ByteTransferReport::new(u64::MAX, 2));
    }

    #[test]
    fn test_report_sum() {
        let reports = [
            ByteTransferReport::new(1, 1),
            ByteTransferReport::new(2, 3),
            ByteTransferReport::ZERO,
        ];
        let total: ByteTransferReport = reports.iter().sum();
        assert_eq!(total, ByteTransferReport::new(3, 4));
        assert_eq!(total.total(), 7);
        assert!(ByteTransferReport::default().is_empty());
    }

    #[test]
    fn test_transport_serialization() {
        assert_eq!(serde_json::to_string(&TransportType::Tcp).unwrap(), "\"tcp\"");
        let parsed: TransportType = serde_json::from_str("\"udp\"").unwrap();
        assert_eq!(parsed, TransportType::Udp);
    }

    #[test]
    fn test_connection_info_hides_passphrase() {
        let mut info = ConnectionInfo::new("DIRECT-test", "192.168.49.1".parse().unwrap());
        info.passphrase = Some("hunter22".into());
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("DIRECT-test"));
        assert!(!json.contains("hunter22"));
    }
}
