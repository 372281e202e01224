//! Control endpoints: shutdown, notification refresh, and the listen port.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use tetherproxy_core::TetherProxyError;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the control router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/shutdown", post(request_shutdown))
        .route("/notification/refresh", post(request_refresh))
        .route("/proxy/port", put(update_listen_port))
}

/// Acknowledgement for asynchronous requests.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "accepted": true,
    "message": "Shutdown requested"
}))]
pub struct ControlResponse {
    /// Whether the request was queued.
    pub accepted: bool,
    /// What happens next.
    pub message: String,
}

/// Listen port change.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"listen_port": 8228}))]
pub struct ListenPortRequest {
    /// New port for tethered clients.
    #[schema(minimum = 1, maximum = 65535)]
    pub listen_port: u16,
}

/// Result of a listen port change.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "listen_port": 9000,
    "active_port": 8228,
    "persisted": true
}))]
pub struct ListenPortResponse {
    /// Port the next proxy start will listen on.
    pub listen_port: u16,
    /// Port the running proxy still accepts on, absent while it is stopped.
    #[schema(nullable)]
    pub active_port: Option<u16>,
    /// Whether the change was written to the configuration file.
    pub persisted: bool,
}

/// Request shutdown.
#[utoipa::path(
    post,
    path = "/api/shutdown",
    tag = "control",
    operation_id = "requestShutdown",
    summary = "Shut the daemon down",
    description = "Publishes a shutdown request. The daemon stops the proxy, removes the \
        hotspot group, releases the wake lock, and exits.",
    responses(
        (status = 202, description = "Shutdown requested", body = ControlResponse)
    )
)]
pub async fn request_shutdown(
    State(state): State<SharedState>,
) -> (StatusCode, Json<ControlResponse>) {
    info!("Shutdown requested over HTTP");
    state.network.request_shutdown();
    (
        StatusCode::ACCEPTED,
        Json(ControlResponse {
            accepted: true,
            message: "Shutdown requested".to_string(),
        }),
    )
}

/// Request a notification refresh.
#[utoipa::path(
    post,
    path = "/api/notification/refresh",
    tag = "control",
    operation_id = "refreshNotification",
    summary = "Redraw the status notification",
    responses(
        (status = 202, description = "Refresh requested", body = ControlResponse)
    )
)]
pub async fn request_refresh(
    State(state): State<SharedState>,
) -> (StatusCode, Json<ControlResponse>) {
    state.network.request_refresh();
    (
        StatusCode::ACCEPTED,
        Json(ControlResponse {
            accepted: true,
            message: "Refresh requested".to_string(),
        }),
    )
}

/// Change the proxy listen port.
#[utoipa::path(
    put,
    path = "/api/proxy/port",
    tag = "control",
    operation_id = "updateListenPort",
    summary = "Change the proxy listen port",
    description = "Sets and saves the port used by the next proxy start. A running proxy \
        keeps accepting on `active_port` until it is restarted.",
    request_body = ListenPortRequest,
    responses(
        (status = 200, description = "Port updated", body = ListenPortResponse),
        (status = 422, description = "Port is 0 or collides with the API port", body = ErrorResponse),
        (status = 500, description = "Configuration file could not be written", body = ErrorResponse)
    )
)]
pub async fn update_listen_port(
    State(state): State<SharedState>,
    Json(request): Json<ListenPortRequest>,
) -> ApiResult<Json<ListenPortResponse>> {
    let port = request.listen_port;
    let mut config = state.config_mut().await;

    if port == 0 {
        return Err(TetherProxyError::ConfigValidationError(
            "proxy.listen_port must not be 0".into(),
        )
        .into());
    }
    if port == config.server.api_port {
        return Err(TetherProxyError::ConfigValidationError(
            "proxy.listen_port must differ from server.api_port".into(),
        )
        .into());
    }

    let mut updated = config.clone();
    updated.proxy.listen_port = port;
    let persisted = state.persist(&updated).map_err(|e| ApiError::InternalError {
        error_code: "config_save_failed".to_string(),
        message: "Failed to save configuration".to_string(),
        details: Some(e.to_string()),
    })?;
    *config = updated;
    state.listen_port.set(port);

    let active_port = state.network.active_port();
    info!(port, ?active_port, persisted, "Listen port updated");
    Ok(Json(ListenPortResponse {
        listen_port: port,
        active_port,
        persisted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use axum_test::TestServer;
    use serde_json::json;
    use tetherproxy_core::{Config, NetworkController, RefreshNotification, ShutdownRequest};

    fn server() -> (TestServer, SharedState) {
        let state = AppState::new(Config::default()).shared();
        let server = TestServer::new(router().with_state(state.clone())).unwrap();
        (server, state)
    }

    #[tokio::test]
    async fn test_shutdown_publishes_request() {
        let (server, state) = server();
        let mut rx = state.network.shutdown_events();

        let response = server.post("/shutdown").await;
        response.assert_status(StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().unwrap(), ShutdownRequest);
    }

    #[tokio::test]
    async fn test_refresh_publishes_request() {
        let (server, state) = server();
        let mut rx = state.network.refresh_events();

        server
            .post("/notification/refresh")
            .await
            .assert_status(StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().unwrap(), RefreshNotification);
    }

    #[tokio::test]
    async fn test_listen_port_update() {
        let (server, state) = server();

        let response = server
            .put("/proxy/port")
            .json(&json!({"listen_port": 9000}))
            .await;
        response.assert_status_ok();
        let body: ListenPortResponse = response.json();
        assert_eq!(body.listen_port, 9000);
        assert_eq!(body.active_port, None);
        assert!(!body.persisted);
        assert_eq!(state.listen_port.current(), 9000);
        assert_eq!(state.config().await.proxy.listen_port, 9000);
    }

    #[tokio::test]
    async fn test_listen_port_update_is_saved_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let state = AppState::new(Config::default())
            .with_config_path(&path)
            .shared();
        let server = TestServer::new(router().with_state(state)).unwrap();

        let body: ListenPortResponse = server
            .put("/proxy/port")
            .json(&json!({"listen_port": 9001}))
            .await
            .json();
        assert!(body.persisted);

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.proxy.listen_port, 9001);
    }

    #[tokio::test]
    async fn test_listen_port_unsaved_when_file_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the write fail.
        let path = dir.path().join("config.toml");
        std::fs::create_dir(&path).unwrap();
        let state = AppState::new(Config::default())
            .with_config_path(&path)
            .shared();
        let server = TestServer::new(router().with_state(state.clone())).unwrap();

        let response = server
            .put("/proxy/port")
            .json(&json!({"listen_port": 9002}))
            .await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = response.json();
        assert_eq!(body.error, "config_save_failed");
        assert_eq!(state.listen_port.current(), 8228);
        assert_eq!(state.config().await.proxy.listen_port, 8228);
    }

    #[tokio::test]
    async fn test_listen_port_rejects_zero_and_api_port() {
        let (server, state) = server();
        let api_port = state.config().await.server.api_port;

        for port in [0, api_port] {
            let response = server
                .put("/proxy/port")
                .json(&json!({"listen_port": port}))
                .await;
            response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
            let body: ErrorResponse = response.json();
            assert_eq!(body.error, "config_validation_error");
        }
        assert_eq!(state.listen_port.current(), 8228);
    }
}
