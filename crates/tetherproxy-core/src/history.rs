//! Session-scoped table of tethered clients.
//!
//! Records live for the lifetime of the process only. Each update replaces the
//! stored [`ClientRecord`] with a new copy produced by the record itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::client::{ClientRecord, Clock, SystemClock};
use crate::types::ByteTransferReport;

/// In-memory client table keyed by [`ClientRecord::key`].
pub struct ClientHistory {
    records: RwLock<HashMap<String, ClientRecord>>,
    clock: Arc<dyn Clock>,
}

impl Default for ClientHistory {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ClientHistory {
    /// Create an empty history using `clock` for timestamps.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Note that `identifier` connected, creating its record on first sight.
    pub async fn observe(&self, identifier: &str) -> ClientRecord {
        let mut records = self.records.write().await;
        let record = match records.get(identifier) {
            Some(existing) if existing.matches_identifier(identifier) => {
                existing.touched(self.clock.as_ref())
            }
            _ => {
                let created = ClientRecord::create(identifier, self.clock.as_ref());
                info!(
                    client = %identifier,
                    by_ip = created.identity().is_ip(),
                    "New tethered client"
                );
                created
            }
        };
        records.insert(identifier.to_owned(), record.clone());
        record
    }

    /// Fold a traffic report into the record for `identifier`.
    ///
    /// Creates the record if the client was never observed.
    pub async fn record_report(
        &self,
        identifier: &str,
        report: ByteTransferReport,
    ) -> ClientRecord {
        let mut records = self.records.write().await;
        let current = records
            .get(identifier)
            .filter(|existing| existing.matches_identifier(identifier))
            .cloned()
            .unwrap_or_else(|| ClientRecord::create(identifier, self.clock.as_ref()));

        let updated = current.with_report(report, self.clock.as_ref());
        debug!(
            client = %identifier,
            internet_to_proxy = report.internet_to_proxy,
            proxy_to_internet = report.proxy_to_internet,
            total = %updated.total_transfer_display(),
            "Traffic recorded"
        );
        records.insert(identifier.to_owned(), updated.clone());
        updated
    }

    /// Assign a display name. Returns `None` if the client is unknown.
    pub async fn rename(&self, identifier: &str, nick_name: &str) -> Option<ClientRecord> {
        let mut records = self.records.write().await;
        let renamed = records.get(identifier)?.with_nick_name(nick_name);
        records.insert(identifier.to_owned(), renamed.clone());
        Some(renamed)
    }

    /// Look up one client.
    pub async fn get(&self, identifier: &str) -> Option<ClientRecord> {
        self.records.read().await.get(identifier).cloned()
    }

    /// All clients, ordered by key.
    pub async fn snapshot(&self) -> Vec<ClientRecord> {
        let mut records: Vec<ClientRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }

    /// Traffic summed over every client.
    pub async fn total(&self) -> ByteTransferReport {
        self.records
            .read()
            .await
            .values()
            .map(ClientRecord::totals)
            .sum()
    }

    /// Number of known clients.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether no client has been seen.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Forget every client.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}
