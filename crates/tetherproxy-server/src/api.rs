//! HTTP API routes and handlers.
//!
//! - `health` - Service health check
//! - `status` - Network, proxy, and wake lock state
//! - `clients` - Tethered clients and traffic totals
//! - `control` - Shutdown, notification refresh, listen port
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod clients;
pub mod control;
pub mod error;
pub mod health;
pub mod openapi;
pub mod status;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// ```text
/// /health                          - Health check
/// /api
/// ├── /status                      - Network and proxy status
/// ├── /connection                  - Established hotspot group
/// ├── /clients                     - Client list (GET), clear (DELETE)
/// ├── /clients/{key}               - One client
/// ├── /clients/{key}/nick_name     - Rename a client
/// ├── /traffic                     - Totals across clients
/// ├── /shutdown                    - Request shutdown
/// ├── /notification/refresh        - Request notification refresh
/// ├── /proxy/port                  - Change the listen port
/// └── /openapi.json                - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .merge(status::router())
                .merge(clients::router())
                .merge(control::router())
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
