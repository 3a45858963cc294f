//! Core services that make up a Vellum collaboration server.
//!
//! This module exposes all internal services used by the server to gate,
//! synchronize, protect, and persist collaborative documents. Each service
//! encapsulates a single responsibility and is wired together by the
//! builder in the crate root.
//!
//! # Services overview
//!
//! - [`access_gate`] – resolves whether a principal may open a document.
//! - [`codec`] – translates between the content tree and the CRDT tree.
//! - [`events`] – per-user notification fan-out on `/events`.
//! - [`persistence`] – debounced document writes and derived properties.
//! - [`rate_limiter`] – sliding-window limits per IP and per socket.
//! - [`registry`] – process-wide bookkeeping of live rooms.
//! - [`room`] – the live room: sync protocol, presence, protection.
//! - [`session_gate`] – session-cookie validation at upgrade.
//! - [`storage`] – the relational-store interface.

pub(crate) mod access_gate;
pub(crate) mod codec;
pub(crate) mod events;
pub(crate) mod persistence;
pub(crate) mod rate_limiter;
pub(crate) mod registry;
pub(crate) mod room;
pub(crate) mod session_gate;
pub mod storage;
