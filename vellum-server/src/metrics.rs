//! Metrics definitions for the collaboration server.
//!
//! This module defines all metrics keys used by the service and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for currently open document-channel connections.
pub const METRICS_ID_COLLAB_CONNECTIONS_OPEN: &str = "vellum.collab.connections.open";
/// Metrics key for currently live in-memory rooms.
pub const METRICS_ID_COLLAB_ROOMS_OPEN: &str = "vellum.collab.rooms.open";
/// Metrics key for inbound frames dropped by the message rate limiter.
pub const METRICS_ID_COLLAB_FRAMES_DROPPED: &str = "vellum.collab.frames.dropped";
/// Metrics key for connection attempts rejected by the connection rate limiter.
pub const METRICS_ID_COLLAB_CONNECTIONS_REJECTED: &str = "vellum.collab.connections.rejected";
/// Metrics key for successful persistence writes.
pub const METRICS_ID_COLLAB_PERSIST_SUCCESS: &str = "vellum.collab.persist.success";
/// Metrics key for failed persistence writes.
pub const METRICS_ID_COLLAB_PERSIST_ERROR: &str = "vellum.collab.persist.error";
/// Metrics key for authoritative-content restores triggered by the
/// protection engine.
pub const METRICS_ID_COLLAB_PROTECTION_RESTORES: &str = "vellum.collab.protection.restores";
/// Metrics key for currently open event-channel connections.
pub const METRICS_ID_EVENTS_CONNECTIONS_OPEN: &str = "vellum.events.connections.open";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_COLLAB_CONNECTIONS_OPEN,
        metrics::Unit::Count,
        "Number of open document-channel websocket connections"
    );

    metrics::describe_gauge!(
        METRICS_ID_COLLAB_ROOMS_OPEN,
        metrics::Unit::Count,
        "Number of live in-memory document rooms"
    );

    metrics::describe_counter!(
        METRICS_ID_COLLAB_FRAMES_DROPPED,
        metrics::Unit::Count,
        "Number of inbound frames dropped by the message rate limiter"
    );

    metrics::describe_counter!(
        METRICS_ID_COLLAB_CONNECTIONS_REJECTED,
        metrics::Unit::Count,
        "Number of connection attempts rejected by the connection rate limiter"
    );

    metrics::describe_counter!(
        METRICS_ID_COLLAB_PERSIST_SUCCESS,
        metrics::Unit::Count,
        "Number of successful document persistence writes"
    );

    metrics::describe_counter!(
        METRICS_ID_COLLAB_PERSIST_ERROR,
        metrics::Unit::Count,
        "Number of failed document persistence writes"
    );

    metrics::describe_counter!(
        METRICS_ID_COLLAB_PROTECTION_RESTORES,
        metrics::Unit::Count,
        "Number of authoritative-content restores performed by the protection engine"
    );

    metrics::describe_gauge!(
        METRICS_ID_EVENTS_CONNECTIONS_OPEN,
        metrics::Unit::Count,
        "Number of open event-channel websocket connections"
    );
}
