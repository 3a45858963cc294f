//! Configuration types and CLI/environment parsing for a Vellum
//! collaboration server.
//!
//! Concrete deployments may have a more detailed config and can use the
//! exposed [`CollabServiceConfig`] and flatten it with `#[clap(flatten)]`.

use std::num::NonZeroU32;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

/// The configuration for the Vellum collaboration core.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`. The defaults encode the documented protocol windows; change
/// them only in lockstep with connected clients.
#[derive(Parser, Debug, Clone)]
pub struct CollabServiceConfig {
    /// Max message size the websocket connection accepts.
    ///
    /// Default value: 10 MiB
    #[clap(long, env = "VELLUM_MAX_MESSAGE_SIZE", default_value = "10485760")]
    pub ws_max_message_size: usize,

    /// Debounce interval between a document mutation and its persistence
    /// write.
    #[clap(
        long,
        env = "VELLUM_WRITE_DEBOUNCE",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    pub write_debounce: Duration,

    /// Grace period after the last connection closes before the in-memory
    /// room is evicted.
    #[clap(
        long,
        env = "VELLUM_ROOM_TEARDOWN_GRACE",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub room_teardown_grace: Duration,

    /// Sliding window during which authoritative content loaded from a
    /// non-CRDT source is defended against stale client histories. The
    /// window extends on each protected sync.
    #[clap(
        long,
        env = "VELLUM_PROTECTION_WINDOW",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub protection_window: Duration,

    /// Number of connections a single source IP may open within the
    /// connection rate window before being rejected with HTTP 429.
    #[clap(long, env = "VELLUM_CONNECTION_RATE_LIMIT", default_value = "30")]
    pub connection_rate_limit: usize,

    /// Rolling window of the per-IP connection limit.
    #[clap(
        long,
        env = "VELLUM_CONNECTION_RATE_WINDOW",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub connection_rate_window: Duration,

    /// Number of messages a single socket may send within the message rate
    /// window before messages are silently dropped.
    #[clap(long, env = "VELLUM_MESSAGE_RATE_LIMIT", default_value = "50")]
    pub message_rate_limit: usize,

    /// Rolling window of the per-socket message limit.
    #[clap(
        long,
        env = "VELLUM_MESSAGE_RATE_WINDOW",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub message_rate_window: Duration,

    /// Number of silently dropped messages after which the socket is closed
    /// with code 1008.
    #[clap(long, env = "VELLUM_MAX_RATE_VIOLATIONS", default_value = "50")]
    pub max_rate_violations: u32,

    /// Interval of the sweep that evicts empty rate-limit windows.
    #[clap(
        long,
        env = "VELLUM_RATE_LIMIT_SWEEP_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub rate_limit_sweep_interval: Duration,

    /// Idle timeout of a session: sessions without activity for longer than
    /// this are rejected at upgrade.
    #[clap(
        long,
        env = "VELLUM_SESSION_IDLE_TIMEOUT",
        default_value = "15min",
        value_parser = humantime::parse_duration
    )]
    pub session_idle_timeout: Duration,

    /// Absolute lifetime of a session since its creation.
    #[clap(
        long,
        env = "VELLUM_SESSION_MAX_AGE",
        default_value = "12h",
        value_parser = humantime::parse_duration
    )]
    pub session_max_age: Duration,

    /// Server-wide timeout of plain HTTP requests, hardening against
    /// slow-read attacks. Does not apply to upgraded websockets.
    #[clap(
        long,
        env = "VELLUM_REQUEST_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub request_timeout: Duration,

    /// The connection string for the Postgres DB.
    #[clap(long, env = "VELLUM_DB_CONNECTION_STRING", default_value = "")]
    pub db_connection_string: SecretString,

    /// The maximum number of pooled DB connections.
    #[clap(long, env = "VELLUM_DB_MAX_CONNECTIONS", default_value = "8")]
    pub db_max_connections: NonZeroU32,
}

impl CollabServiceConfig {
    /// A config with all defaults, used by tests and embedders that
    /// configure through code rather than the environment.
    pub fn default_for_tests() -> Self {
        Self::parse_from(["vellum-server"])
    }
}
