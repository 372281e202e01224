//! Tethered client and traffic endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use tetherproxy_core::{format_bytes, ByteTransferReport, ClientIdentity, ClientRecord};

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Longest accepted nick name, in characters.
pub const MAX_NICK_NAME_LENGTH: usize = 64;

/// Creates the clients router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/clients", get(list_clients).delete(clear_clients))
        .route("/clients/{key}", get(get_client))
        .route("/clients/{key}/nick_name", put(rename_client))
        .route("/traffic", get(get_traffic))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// One tethered client.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "key": "192.168.49.7",
    "identity": {"kind": "by_ip", "ip": "192.168.49.7"},
    "nick_name": "laptop",
    "display_name": "laptop",
    "last_seen": "2025-01-15T04:30:00Z",
    "totals": {"internet_to_proxy": 1_048_576, "proxy_to_internet": 2048},
    "total_display": "1MB",
    "download_display": "1MB",
    "upload_display": "2KB"
}))]
pub struct ClientResponse {
    /// Lookup key: IP address or host name.
    pub key: String,
    /// How the client is identified.
    pub identity: ClientIdentity,
    /// User-assigned name, empty if none.
    pub nick_name: String,
    /// Nick name if set, otherwise the key.
    pub display_name: String,
    /// Last connection or traffic report.
    pub last_seen: DateTime<Utc>,
    /// Cumulative traffic.
    pub totals: ByteTransferReport,
    /// Both directions combined, human readable.
    pub total_display: String,
    /// Internet to proxy, human readable.
    pub download_display: String,
    /// Proxy to internet, human readable.
    pub upload_display: String,
}

impl From<&ClientRecord> for ClientResponse {
    fn from(record: &ClientRecord) -> Self {
        Self {
            key: record.key().to_string(),
            identity: record.identity().clone(),
            nick_name: record.nick_name().to_string(),
            display_name: record.display_name().to_string(),
            last_seen: record.last_seen(),
            totals: record.totals(),
            total_display: record.total_transfer_display(),
            download_display: record.download_display(),
            upload_display: record.upload_display(),
        }
    }
}

/// All clients, sorted by key.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientListResponse {
    /// Number of clients.
    #[schema(example = 1)]
    pub count: usize,
    /// The clients.
    pub clients: Vec<ClientResponse>,
}

/// Traffic summed over every client.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "client_count": 2,
    "totals": {"internet_to_proxy": 1_048_576, "proxy_to_internet": 2048},
    "total_display": "1MB",
    "download_display": "1MB",
    "upload_display": "2KB"
}))]
pub struct TrafficResponse {
    /// Number of clients contributing.
    pub client_count: usize,
    /// Summed traffic.
    pub totals: ByteTransferReport,
    /// Both directions combined, human readable.
    pub total_display: String,
    /// Internet to proxy, human readable.
    pub download_display: String,
    /// Proxy to internet, human readable.
    pub upload_display: String,
}

/// Rename request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({"nick_name": "laptop"}))]
pub struct RenameClientRequest {
    /// New name; empty clears it.
    #[schema(max_length = 64)]
    pub nick_name: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// List tethered clients.
#[utoipa::path(
    get,
    path = "/api/clients",
    tag = "clients",
    operation_id = "listClients",
    summary = "List tethered clients",
    description = "Returns every client seen since the daemon started, sorted by key, \
        with cumulative traffic and human-readable sizes.",
    responses(
        (status = 200, description = "Clients retrieved", body = ClientListResponse)
    )
)]
pub async fn list_clients(State(state): State<SharedState>) -> Json<ClientListResponse> {
    let clients: Vec<ClientResponse> = state
        .history
        .snapshot()
        .await
        .iter()
        .map(ClientResponse::from)
        .collect();

    Json(ClientListResponse {
        count: clients.len(),
        clients,
    })
}

/// Forget every client.
#[utoipa::path(
    delete,
    path = "/api/clients",
    tag = "clients",
    operation_id = "clearClients",
    summary = "Forget all tethered clients",
    description = "Drops every client record and its traffic totals. Clients reappear \
        on their next connection.",
    responses(
        (status = 204, description = "History cleared")
    )
)]
pub async fn clear_clients(State(state): State<SharedState>) -> StatusCode {
    state.history.clear().await;
    tracing::info!("Client history cleared");
    state.network.request_refresh();
    StatusCode::NO_CONTENT
}

/// Get one client.
#[utoipa::path(
    get,
    path = "/api/clients/{key}",
    tag = "clients",
    operation_id = "getClient",
    summary = "Get one tethered client",
    params(
        ("key" = String, Path, description = "Client IP address or host name")
    ),
    responses(
        (status = 200, description = "Client found", body = ClientResponse),
        (status = 404, description = "Unknown client", body = ErrorResponse)
    )
)]
pub async fn get_client(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> ApiResult<Json<ClientResponse>> {
    let record = state
        .history
        .get(&key)
        .await
        .ok_or_else(|| ApiError::client_not_found(&key))?;
    Ok(Json(ClientResponse::from(&record)))
}

/// Set a client's nick name.
#[utoipa::path(
    put,
    path = "/api/clients/{key}/nick_name",
    tag = "clients",
    operation_id = "renameClient",
    summary = "Set a client's display name",
    params(
        ("key" = String, Path, description = "Client IP address or host name")
    ),
    request_body = RenameClientRequest,
    responses(
        (status = 200, description = "Client renamed", body = ClientResponse),
        (status = 400, description = "Name too long", body = ErrorResponse),
        (status = 404, description = "Unknown client", body = ErrorResponse)
    )
)]
pub async fn rename_client(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(request): Json<RenameClientRequest>,
) -> ApiResult<Json<ClientResponse>> {
    let nick_name = request.nick_name.trim();
    if nick_name.chars().count() > MAX_NICK_NAME_LENGTH {
        return Err(ApiError::BadRequest {
            error_code: "nick_name_too_long".to_string(),
            message: format!("Nick name must be at most {MAX_NICK_NAME_LENGTH} characters"),
        });
    }

    let record = state
        .history
        .rename(&key, nick_name)
        .await
        .ok_or_else(|| ApiError::client_not_found(&key))?;
    state.network.request_refresh();
    Ok(Json(ClientResponse::from(&record)))
}

/// Get traffic totals.
#[utoipa::path(
    get,
    path = "/api/traffic",
    tag = "clients",
    operation_id = "getTraffic",
    summary = "Get traffic summed over all clients",
    responses(
        (status = 200, description = "Totals retrieved", body = TrafficResponse)
    )
)]
pub async fn get_traffic(State(state): State<SharedState>) -> Json<TrafficResponse> {
    let totals = state.history.total().await;
    Json(TrafficResponse {
        client_count: state.history.len().await,
        totals,
        total_display: format_bytes(totals.total()),
        download_display: format_bytes(totals.internet_to_proxy),
        upload_display: format_bytes(totals.proxy_to_internet),
    })
}
