//! The per-user event endpoint `/events`.
//!
//! A separate websocket independent of document rooms, speaking
//! line-delimited JSON: the server greets with `{"type":"connected"}`,
//! answers pings with pongs, and pushes `{type, data}` payloads targeted at
//! the authenticated principal. Rate limits and session rules are identical
//! to the document channel.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use axum_extra::extract::CookieJar;
use futures::{SinkExt as _, StreamExt as _};
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tracing::{instrument, Instrument as _};
use uuid::Uuid;
use vellum_types::events::EventMessage;
use vellum_types::Principal;

use crate::api::errors::Error;
use crate::config::CollabServiceConfig;
use crate::metrics::METRICS_ID_COLLAB_FRAMES_DROPPED;
use crate::services::events::EventHub;
use crate::services::rate_limiter::{ConnectionRateLimiter, MessageVerdict, MessageWindow};
use crate::services::session_gate::SessionGate;

pub(crate) struct EventsArgs {
    pub(crate) hub: EventHub,
    pub(crate) session_gate: SessionGate,
    pub(crate) rate_limiter: ConnectionRateLimiter,
    pub(crate) config: CollabServiceConfig,
}

#[instrument(level = "debug", skip_all)]
async fn ws(
    shared: Arc<EventsArgs>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    cookies: CookieJar,
    peer_addr: SocketAddr,
) -> axum::response::Response {
    let source_ip = crate::services::rate_limiter::source_ip(&headers, Some(peer_addr));
    if !shared.rate_limiter.check_connection(source_ip) {
        tracing::debug!(%source_ip, "rejecting event connection, rate limited");
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }
    let principal = match shared.session_gate.authenticate(&cookies).await {
        Ok(principal) => principal,
        Err(rejection) => {
            tracing::debug!(?rejection, "rejecting event connection, invalid session");
            return (StatusCode::UNAUTHORIZED, "invalid session").into_response();
        }
    };

    let parent_span = tracing::Span::current();
    ws.max_message_size(shared.config.ws_max_message_size)
        .on_failed_upgrade(|err| {
            tracing::warn!("could not establish event websocket: {err:?}");
        })
        .on_upgrade(move |socket| {
            handle_socket(socket, shared, principal).instrument(parent_span)
        })
        .into_response()
}

async fn handle_socket(socket: WebSocket, shared: Arc<EventsArgs>, principal: Principal) {
    let connection_id = Uuid::new_v4();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    shared
        .hub
        .register(principal.user_id, connection_id, outbound.clone());
    if let Ok(greeting) = serde_json::to_string(&EventMessage::Connected) {
        let _ = outbound.send(WsMessage::Text(greeting.into()));
    }

    let mut window = MessageWindow::new(
        shared.config.message_rate_limit,
        shared.config.message_rate_window,
        shared.config.max_rate_violations,
    );
    let result: Result<(), Error> = async {
        while let Some(frame) = stream.next().await {
            let message = match frame {
                Ok(message) => message,
                Err(err) => {
                    tracing::debug!("event read error, closing: {err:?}");
                    return Err(Error::ConnectionClosed);
                }
            };
            let text = match message {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => return Err(Error::ConnectionClosed),
                WsMessage::Binary(_) => {
                    match window.admit() {
                        MessageVerdict::Allowed | MessageVerdict::Dropped => continue,
                        MessageVerdict::Exhausted => return Err(Error::RateLimitExhausted),
                    }
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            };
            match window.admit() {
                MessageVerdict::Allowed => {}
                MessageVerdict::Dropped => {
                    ::metrics::counter!(METRICS_ID_COLLAB_FRAMES_DROPPED).increment(1);
                    continue;
                }
                MessageVerdict::Exhausted => return Err(Error::RateLimitExhausted),
            }
            if text.len() > shared.config.ws_max_message_size {
                return Err(Error::FrameTooLarge(text.len()));
            }
            match serde_json::from_str::<EventMessage>(&text) {
                Ok(EventMessage::Ping) => {
                    if let Ok(pong) = serde_json::to_string(&EventMessage::Pong) {
                        let _ = outbound.send(WsMessage::Text(pong.into()));
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::debug!("dropping malformed event message: {err}"),
            }
        }
        Err(Error::ConnectionClosed)
    }
    .await;

    if let Err(error) = result
        && let Some(close_frame) = error.into_close_frame()
    {
        let _ = outbound.send(WsMessage::Close(Some(close_frame)));
    }

    shared.hub.unregister(principal.user_id, connection_id);
    drop(outbound);
    let _ = writer.await;
}

/// Creates a `Router` with the `/events` route.
pub(crate) fn routes(args: EventsArgs) -> Router {
    let shared = Arc::new(args);
    Router::new().route(
        "/events",
        any(
            move |ws: WebSocketUpgrade,
                  headers: HeaderMap,
                  cookies: CookieJar,
                  ConnectInfo(peer_addr): ConnectInfo<SocketAddr>| {
                let shared = Arc::clone(&shared);
                self::ws(shared, ws, headers, cookies, peer_addr)
            },
        ),
    )
}
