//! API module for the Vellum collaboration server.
//!
//! This module defines all HTTP endpoints the server serves and organizes
//! them into submodules:
//!
//! - [`collaboration`] – the document websocket endpoint
//!   `/collaboration/{roomName}`.
//! - [`errors`] – websocket session error types and close-frame conversion.
//! - [`events`] – the per-user notification websocket endpoint `/events`.
//! - [`info`] – liveness, version, and live-stats endpoints.

pub(crate) mod collaboration;
pub(crate) mod errors;
pub(crate) mod events;
pub(crate) mod info;
