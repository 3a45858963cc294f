#![deny(missing_docs)]
//! This crate provides the core functionality of a Vellum real-time
//! collaboration server.
//!
//! The server is a websocket fan-out hub that multiplexes CRDT document
//! edits and presence among many concurrent editors of the same logical
//! document, persists convergent state to a relational store, and defends
//! authoritative server content against stale client caches attempting to
//! resurrect deletions.
//!
//! The main entry point for embedders is the [`CollabServiceBuilder`]. It
//! wires the provided [`storage::Storage`] backend and a `CancellationToken`
//! into an `axum::Router` carrying the two websocket endpoints
//! (`/collaboration/{roomName}` and `/events`) plus the info routes, and
//! returns a [`CollabHooks`] handle for the surrounding REST layer.
//!
//! The hooks are how out-of-band mutations reach live rooms: REST handlers
//! call [`CollabHooks::invalidate_document_cache`] after rewriting a
//! document, [`CollabHooks::notify_document_conversion`] after converting
//! one, and [`CollabHooks::handle_visibility_change`] after narrowing
//! visibility. [`CollabHooks::broadcast_to_user`] pushes notifications onto
//! the event channel.
//!
//! To shut down gracefully, cancel the `CancellationToken` (stopping the
//! background sweep), stop the axum server, and then await
//! [`CollabHooks::shutdown`], which performs a final persistence write for
//! every dirty room.
//!
//! Clients connect via web-sockets. Axum supports both HTTP/1.1 and
//! HTTP/2.0 web-socket connections, therefore we accept connections with
//! `any`.

use axum::Router;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use vellum_types::Visibility;

use crate::api::collaboration::CollabArgs;
use crate::api::events::EventsArgs;
use crate::config::CollabServiceConfig;
use crate::services::access_gate::AccessGate;
use crate::services::events::EventHub;
use crate::services::rate_limiter::ConnectionRateLimiter;
use crate::services::registry::DocumentRegistry;
use crate::services::room::RoomTunables;
use crate::services::session_gate::SessionGate;
use crate::services::storage::StorageService;

pub(crate) mod api;
pub mod config;
pub mod metrics;
pub(crate) mod services;

pub use services::storage;

/// [`CollabServiceBuilder`] to initialize a collaboration server.
pub struct CollabServiceBuilder {
    config: CollabServiceConfig,
    registry: DocumentRegistry,
    hub: EventHub,
    session_gate: SessionGate,
    access_gate: AccessGate,
    rate_limiter: ConnectionRateLimiter,
}

impl CollabServiceBuilder {
    /// Initializes the collaboration server.
    ///
    /// This sets up the process-wide services (document registry, event
    /// hub, rate-limit tables) and spawns the rate-limit sweep task, which
    /// runs until the provided `cancellation_token` is cancelled.
    pub fn init(
        config: CollabServiceConfig,
        storage: StorageService,
        cancellation_token: CancellationToken,
    ) -> Self {
        metrics::describe_metrics();
        ::metrics::gauge!(metrics::METRICS_ID_COLLAB_CONNECTIONS_OPEN).set(0);
        ::metrics::gauge!(metrics::METRICS_ID_COLLAB_ROOMS_OPEN).set(0);
        ::metrics::gauge!(metrics::METRICS_ID_EVENTS_CONNECTIONS_OPEN).set(0);

        tracing::info!("init document registry..");
        let registry = DocumentRegistry::new(
            storage.clone(),
            RoomTunables {
                write_debounce: config.write_debounce,
                protection_window: config.protection_window,
            },
            config.room_teardown_grace,
        );

        tracing::info!("init rate limiter..");
        let rate_limiter = ConnectionRateLimiter::new(
            config.connection_rate_limit,
            config.connection_rate_window,
        );
        rate_limiter.spawn_sweeper(config.rate_limit_sweep_interval, cancellation_token);

        let session_gate = SessionGate::new(
            storage.clone(),
            config.session_idle_timeout,
            config.session_max_age,
        );
        let access_gate = AccessGate::new(storage);

        Self {
            config,
            registry,
            hub: EventHub::default(),
            session_gate,
            access_gate,
            rate_limiter,
        }
    }

    /// Build the `axum` [`Router`] and the hooks handle.
    ///
    /// # Returns
    ///
    /// Returns a tuple containing:
    /// - An Axum `Router` with the websocket and info routes.
    /// - A [`CollabHooks`] handle for the surrounding REST layer.
    pub fn build(self) -> (Router, CollabHooks) {
        let hooks = CollabHooks {
            registry: self.registry.clone(),
            hub: self.hub.clone(),
        };
        let router = Router::new()
            .merge(api::info::routes(self.registry.clone(), self.hub.clone()))
            .merge(api::collaboration::routes(CollabArgs {
                registry: self.registry,
                session_gate: self.session_gate.clone(),
                access_gate: self.access_gate,
                rate_limiter: self.rate_limiter.clone(),
                config: self.config.clone(),
            }))
            .merge(api::events::routes(EventsArgs {
                hub: self.hub,
                session_gate: self.session_gate,
                rate_limiter: self.rate_limiter,
                config: self.config.clone(),
            }))
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(TraceLayer::new_for_http());
        (router, hooks)
    }
}

/// Hooks exported to the surrounding HTTP layer.
///
/// Cheap to clone; every method may be called concurrently from REST
/// handlers.
#[derive(Clone)]
pub struct CollabHooks {
    registry: DocumentRegistry,
    hub: EventHub,
}

impl CollabHooks {
    /// Closes every connection to the document with code 4101 and drops its
    /// rooms so the next connection reloads from storage. Pending writes
    /// are cancelled.
    pub async fn invalidate_document_cache(&self, doc_id: Uuid) {
        self.registry.invalidate(doc_id).await;
    }

    /// As [`Self::invalidate_document_cache`], for every live room.
    pub async fn invalidate_all_document_caches(&self) {
        self.registry.invalidate_all().await;
    }

    /// Closes every connection to the converted document with code 4100 and
    /// a reason payload naming the successor id and type.
    pub async fn notify_document_conversion(
        &self,
        old_id: Uuid,
        new_id: Uuid,
        _old_kind: &str,
        new_kind: &str,
    ) {
        self.registry
            .notify_conversion(old_id, new_id, new_kind)
            .await;
    }

    /// Re-checks connected principals after a visibility change; closes
    /// connections that no longer qualify with code 4403.
    pub async fn handle_visibility_change(
        &self,
        doc_id: Uuid,
        new_visibility: Visibility,
        creator_id: Uuid,
    ) {
        self.registry
            .notify_visibility_change(doc_id, new_visibility, creator_id)
            .await;
    }

    /// Fans a `{type, data}` payload to every open event socket of the
    /// user.
    pub fn broadcast_to_user(&self, user_id: Uuid, event_type: &str, data: Value) {
        self.hub.broadcast_to_user(user_id, event_type, data);
    }

    /// Final persistence write for every dirty room. Call once during
    /// process shutdown, after the axum server stopped accepting traffic.
    pub async fn shutdown(&self) {
        tracing::info!("flushing dirty rooms for shutdown..");
        self.registry.shutdown().await;
    }
}
