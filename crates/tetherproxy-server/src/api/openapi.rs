//! OpenAPI specification for the tetherproxy API.
//!
//! Served at `/api/openapi.json` and written to `openapi.json` by the
//! `gen-openapi` binary for client generation.

use axum::Json;
use utoipa::OpenApi;

use tetherproxy_core::{
    ByteTransferReport, ClientIdentity, ConnectionInfo, RunningStatus, TransportType,
};

use super::clients::{ClientListResponse, ClientResponse, RenameClientRequest, TrafficResponse};
use super::control::{ControlResponse, ListenPortRequest, ListenPortResponse};
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::status::StatusResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for tetherproxy.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "tetherproxy API",
        version = "0.1.0",
        description = r#"
# tetherproxy API

tetherproxy shares this device's internet connection with nearby clients over a
peer-to-peer hotspot group, relaying their traffic through an HTTP CONNECT proxy.

## Overview

1. **Status**: Network and proxy lifecycle state, the established group, and the wake lock
2. **Clients**: Every tethered client with cumulative download and upload totals
3. **Control**: Shutdown, notification refresh, and the proxy listen port

Status values are objects tagged by `state` (`not_running`, `starting`, `running`,
`error`); errors carry a `message`.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local tetherproxy daemon")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "status", description = "Network, proxy, and wake lock state"),
        (name = "clients", description = "Tethered clients and their traffic"),
        (name = "control", description = "Shutdown, notification refresh, and proxy settings")
    ),
    paths(
        super::health::health_check,
        super::status::get_status,
        super::status::get_connection,
        super::clients::list_clients,
        super::clients::clear_clients,
        super::clients::get_client,
        super::clients::rename_client,
        super::clients::get_traffic,
        super::control::request_shutdown,
        super::control::request_refresh,
        super::control::update_listen_port,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            StatusResponse,
            RunningStatus,
            ConnectionInfo,
            TransportType,
            ClientIdentity,
            ByteTransferReport,
            ClientResponse,
            ClientListResponse,
            TrafficResponse,
            RenameClientRequest,
            ControlResponse,
            ListenPortRequest,
            ListenPortResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "tetherproxy API");
        assert!(spec.paths.paths.contains_key("/api/clients/{key}"));
        assert!(spec.paths.paths.contains_key("/api/shutdown"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"tetherproxy API\""));
        assert!(json.contains("\"StatusResponse\""));
    }
}
