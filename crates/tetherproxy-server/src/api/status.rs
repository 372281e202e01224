//! Network and proxy status endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use tetherproxy_core::{ConnectionInfo, Locker, RunningStatus, TetherProxyError, TransportType};

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the status router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/connection", get(get_connection))
}

/// Combined daemon status.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "network": {"state": "running"},
    "proxy": {"state": "running"},
    "connection": {"group_name": "DIRECT-tetherproxy", "host": "192.168.49.1"},
    "transport": "tcp",
    "listen_port": 8228,
    "active_port": 8228,
    "wake_lock_held": true,
    "wake_lock_held_secs": 3590,
    "wake_lock_acquisitions": 1,
    "client_count": 2,
    "refresh_count": 14,
    "started_at": "2025-01-15T04:30:00Z",
    "uptime_secs": 3600
}))]
pub struct StatusResponse {
    /// Hotspot network status.
    pub network: RunningStatus,

    /// Proxy listener status.
    pub proxy: RunningStatus,

    /// The established group, absent while the network is down.
    #[schema(nullable)]
    pub connection: Option<ConnectionInfo>,

    /// Relayed transport.
    pub transport: TransportType,

    /// Preferred port, used by the next proxy start.
    #[schema(example = 8228)]
    pub listen_port: u16,

    /// Port the running proxy accepts on, absent while it is stopped.
    #[schema(nullable, example = 8228)]
    pub active_port: Option<u16>,

    /// Whether the wake lock is held.
    #[schema(example = true)]
    pub wake_lock_held: bool,

    /// Seconds the wake lock has been held, absent while released.
    #[schema(nullable, example = 3590)]
    pub wake_lock_held_secs: Option<u64>,

    /// Times the wake lock went from released to held.
    #[schema(example = 1)]
    pub wake_lock_acquisitions: u64,

    /// Clients seen since start.
    #[schema(example = 2)]
    pub client_count: usize,

    /// Notification refreshes handled since start.
    #[schema(example = 14)]
    pub refresh_count: u64,

    /// When the daemon started.
    pub started_at: DateTime<Utc>,

    /// Seconds since start.
    #[schema(example = 3600)]
    pub uptime_secs: u64,
}

/// Get daemon status.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "status",
    operation_id = "getStatus",
    summary = "Get network and proxy status",
    description = "Returns the hotspot network and proxy states, the established group if \
        any, the wake lock state, and counters since start. Error states carry a message.",
    responses(
        (status = 200, description = "Status retrieved", body = StatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        network: state.network.current_network_status(),
        proxy: state.network.current_proxy_status(),
        connection: state.network.connection_info(),
        transport: state.config().await.proxy.transport,
        listen_port: state.listen_port.current(),
        active_port: state.network.active_port(),
        wake_lock_held: state.wake_lock.is_held(),
        wake_lock_held_secs: state.wake_lock.held_for().map(|held| held.as_secs()),
        wake_lock_acquisitions: state.wake_lock.acquisitions(),
        client_count: state.history.len().await,
        refresh_count: state.refresh_count(),
        started_at: state.started_at(),
        uptime_secs: state.uptime_secs(),
    })
}

/// Get the established hotspot group.
#[utoipa::path(
    get,
    path = "/api/connection",
    tag = "status",
    operation_id = "getConnection",
    summary = "Get hotspot group details",
    description = "Returns the group name and host address clients should use. \
        Fails with 409 while no group is established.",
    responses(
        (status = 200, description = "Group is established", body = ConnectionInfo),
        (status = 409, description = "No group established", body = ErrorResponse)
    )
)]
pub async fn get_connection(State(state): State<SharedState>) -> ApiResult<Json<ConnectionInfo>> {
    let info = state
        .network
        .connection_info()
        .ok_or(TetherProxyError::NoConnection)?;
    Ok(Json(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use tetherproxy_core::{ByteTransferReport, Config};

    fn server() -> (TestServer, SharedState) {
        let state = AppState::new(Config::default()).shared();
        let server = TestServer::new(router().with_state(state.clone())).unwrap();
        (server, state)
    }

    #[tokio::test]
    async fn test_idle_status() {
        let (server, state) = server();
        state
            .history
            .record_report("10.0.0.2", ByteTransferReport::new(10, 20))
            .await;
        state.record_refresh();

        let response = server.get("/status").await;
        response.assert_status_ok();
        let body: StatusResponse = response.json();

        assert_eq!(body.network, RunningStatus::NotRunning);
        assert_eq!(body.proxy, RunningStatus::NotRunning);
        assert!(body.connection.is_none());
        assert_eq!(body.transport, TransportType::Tcp);
        assert_eq!(body.listen_port, 8228);
        assert_eq!(body.active_port, None);
        assert!(!body.wake_lock_held);
        assert_eq!(body.wake_lock_held_secs, None);
        assert_eq!(body.client_count, 1);
        assert_eq!(body.refresh_count, 1);
    }

    #[tokio::test]
    async fn test_status_reports_wake_lock_hold_time() {
        let (server, state) = server();
        state.wake_lock.acquire();

        let body: StatusResponse = server.get("/status").await.json();
        assert!(body.wake_lock_held);
        assert_eq!(body.wake_lock_held_secs, Some(0));
        assert_eq!(body.wake_lock_acquisitions, 1);
    }

    #[tokio::test]
    async fn test_status_json_uses_state_tags() {
        let (server, _state) = server();
        let body: serde_json::Value = server.get("/status").await.json();
        assert_eq!(body["network"]["state"], "not_running");
        assert_eq!(body["transport"], "tcp");
    }

    #[tokio::test]
    async fn test_connection_conflict_while_down() {
        let (server, _state) = server();
        let response = server.get("/connection").await;
        response.assert_status(StatusCode::CONFLICT);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "no_connection");
    }
}
