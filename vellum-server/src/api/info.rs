//! Info endpoints.
//!
//! - `/health` – liveness probe, returns `200 OK`.
//! - `/version` – cargo package name and version of the server library.
//! - `/stats` – live room and connection counts as JSON, read by the
//!   surrounding dashboard.
//!
//! The endpoints include a `Cache-Control: no-cache` header to prevent
//! caching of responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::services::events::EventHub;
use crate::services::registry::DocumentRegistry;

/// Statistics about the live collaboration state.
#[derive(Debug, Serialize)]
struct Stats {
    /// Number of live in-memory rooms.
    rooms: usize,
    /// Number of open document-channel connections.
    document_connections: usize,
    /// Number of open event-channel connections.
    event_connections: usize,
}

/// Create a router containing the info endpoints.
///
/// All endpoints have `Cache-Control: no-cache` set.
pub(crate) fn routes(registry: DocumentRegistry, hub: EventHub) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route(
            "/stats",
            get(move || stats(registry.clone(), hub.clone())),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// Responds with `200 OK` once the router is serving.
async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Responds with cargo package name and version.
async fn version() -> impl IntoResponse {
    (
        StatusCode::OK,
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
    )
}

/// Responds with live room and connection counts.
async fn stats(registry: DocumentRegistry, hub: EventHub) -> impl IntoResponse {
    let stats = Stats {
        rooms: registry.room_count(),
        document_connections: registry.connection_count().await,
        event_connections: hub.connection_count(),
    };
    (StatusCode::OK, Json(stats))
}
