//! The line-delimited JSON protocol of the per-user event channel.
//!
//! The `/events` endpoint is independent of document rooms: the server
//! greets with [`EventMessage::Connected`], answers pings, and pushes
//! arbitrary `{type, data}` payloads targeted at a single principal.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message on the event channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventMessage {
    /// Server → client greeting sent once after the upgrade.
    Connected,
    /// Client → server liveness probe.
    Ping,
    /// Server → client answer to [`EventMessage::Ping`].
    Pong,
    /// Server → client pushed event.
    #[serde(untagged)]
    Push {
        /// Application-defined event type.
        #[serde(rename = "type")]
        event_type: String,
        /// Free-form payload.
        data: Value,
    },
}
