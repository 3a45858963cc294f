//! The document collaboration endpoint `/collaboration/{roomName}`.
//!
//! Upgrade order: connection rate check, session gate, room-name parse,
//! access gate, websocket upgrade. Only then is the room acquired and the
//! first frames (sync step 1 and the presence snapshot) go out.
//!
//! Each socket runs a dedicated reader loop plus a writer task draining the
//! connection's outbound queue; the reader never blocks on peers. On reader
//! exit the connection is released: presence is torn down, a final
//! persistence write fires if the room just became idle, and the teardown
//! grace timer is armed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, Path, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use axum_extra::extract::CookieJar;
use futures::{SinkExt as _, StreamExt as _};
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tracing::{instrument, Instrument as _};
use uuid::Uuid;
use vellum_types::{Principal, RoomName};

use crate::api::errors::Error;
use crate::config::CollabServiceConfig;
use crate::metrics::{
    METRICS_ID_COLLAB_CONNECTIONS_OPEN, METRICS_ID_COLLAB_FRAMES_DROPPED,
};
use crate::services::access_gate::AccessGate;
use crate::services::rate_limiter::{ConnectionRateLimiter, MessageVerdict, MessageWindow};
use crate::services::registry::DocumentRegistry;
use crate::services::room::Connection;
use crate::services::session_gate::SessionGate;

pub(crate) struct CollabArgs {
    pub(crate) registry: DocumentRegistry,
    pub(crate) session_gate: SessionGate,
    pub(crate) access_gate: AccessGate,
    pub(crate) rate_limiter: ConnectionRateLimiter,
    pub(crate) config: CollabServiceConfig,
}

struct WsArgs {
    shared: Arc<CollabArgs>,

    // axum extracted values
    ws: WebSocketUpgrade,
    room_name: String,
    headers: HeaderMap,
    cookies: CookieJar,
    peer_addr: SocketAddr,
}

/// Web-socket upgrade handler.
///
/// The upgrade is refused before any socket exists: 429 when the source IP
/// exhausted its connection window, 401 when the session cookie is missing
/// or timed out, 403 when the principal may not open the document. The
/// websocket layer itself enforces the maximum frame size; the read loop
/// defends it again for the close-code contract.
///
/// Adds a `failed_upgrade` handler that logs the error.
#[instrument(level = "debug", skip_all, fields(room = %args.room_name))]
async fn ws(args: WsArgs) -> axum::response::Response {
    let WsArgs {
        shared,
        ws,
        room_name,
        headers,
        cookies,
        peer_addr,
    } = args;

    let source_ip = crate::services::rate_limiter::source_ip(&headers, Some(peer_addr));
    if !shared.rate_limiter.check_connection(source_ip) {
        tracing::debug!(%source_ip, "rejecting connection, rate limited");
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }

    let principal = match shared.session_gate.authenticate(&cookies).await {
        Ok(principal) => principal,
        Err(rejection) => {
            tracing::debug!(?rejection, "rejecting connection, invalid session");
            return (StatusCode::UNAUTHORIZED, "invalid session").into_response();
        }
    };

    let room_name: RoomName = match room_name.parse() {
        Ok(room_name) => room_name,
        Err(err) => {
            tracing::debug!("rejecting connection, malformed room name: {err}");
            return (StatusCode::BAD_REQUEST, "invalid room name").into_response();
        }
    };

    if !shared
        .access_gate
        .can_access(room_name.doc_id(), principal)
        .await
    {
        return (StatusCode::FORBIDDEN, "no access to document").into_response();
    }

    let parent_span = tracing::Span::current();
    ws.max_message_size(shared.config.ws_max_message_size)
        .on_failed_upgrade(|err| {
            tracing::warn!("could not establish websocket connection: {err:?}");
        })
        .on_upgrade(move |socket| {
            handle_socket(socket, shared, room_name, principal).instrument(parent_span)
        })
        .into_response()
}

/// The whole life-cycle of one document socket.
async fn handle_socket(
    socket: WebSocket,
    shared: Arc<CollabArgs>,
    room_name: RoomName,
    principal: Principal,
) {
    let connection_id = Uuid::new_v4();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
    let (mut sink, mut stream) = socket.split();

    // writer task: drains the outbound queue so broadcasts never block on
    // this peer; terminates after a close frame or when all senders drop
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

    let connection = Connection::new(connection_id, principal, outbound.clone());
    let room = shared.registry.acquire(&room_name, connection).await;
    ::metrics::gauge!(METRICS_ID_COLLAB_CONNECTIONS_OPEN).increment(1);
    tracing::debug!(%connection_id, user = %principal.user_id, "connection joined room");

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
                    tracing::debug!("read error, closing: {err:?}");
                    return Err(Error::ConnectionClosed);
                }
            };
            let data = match message {
                WsMessage::Binary(data) => data,
                WsMessage::Close(_) => return Err(Error::ConnectionClosed),
                // the document protocol is binary; anything else only
                // counts against the rate window
                WsMessage::Text(_) => {
                    message_admit(&mut window)?;
                    continue;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            };
            if !message_admit(&mut window)? {
                continue;
            }
            if data.len() > shared.config.ws_max_message_size {
                return Err(Error::FrameTooLarge(data.len()));
            }
            room.handle_frame(connection_id, data.to_vec()).await;
        }
        Err(Error::ConnectionClosed)
    }
    .await;

    if let Err(error) = result
        && let Some(close_frame) = error.into_close_frame()
    {
        let _ = outbound.send(WsMessage::Close(Some(close_frame)));
    }

    shared.registry.release(&room, connection_id).await;
    ::metrics::gauge!(METRICS_ID_COLLAB_CONNECTIONS_OPEN).decrement(1);
    tracing::debug!(%connection_id, "connection left room");

    // let the writer drain the queue (including our close frame) before
    // returning
    drop(outbound);
    let _ = writer.await;
}

/// Runs one frame through the message window. `Ok(true)` admits, `Ok(false)`
/// silently drops, `Err` means the violation budget is gone.
fn message_admit(window: &mut MessageWindow) -> Result<bool, Error> {
    match window.admit() {
        MessageVerdict::Allowed => Ok(true),
        MessageVerdict::Dropped => {
            ::metrics::counter!(METRICS_ID_COLLAB_FRAMES_DROPPED).increment(1);
            Ok(false)
        }
        MessageVerdict::Exhausted => Err(Error::RateLimitExhausted),
    }
}

/// Creates a `Router` with the `/collaboration/{roomName}` route.
///
/// The clients will upgrade their connection via the web-socket upgrade
/// protocol. Axum supports both HTTP/1.1 and HTTP/2.0 web-socket
/// connections, therefore we accept connections with `any`.
///
/// The router must be served with `into_make_service_with_connect_info` so
/// the rate limiter can fall back to the peer address when no forwarded-for
/// header is present.
pub(crate) fn routes(args: CollabArgs) -> Router {
    let shared = Arc::new(args);
    Router::new().route(
        "/collaboration/{room_name}",
        any(
            move |ws: WebSocketUpgrade,
                  Path(room_name): Path<String>,
                  headers: HeaderMap,
                  cookies: CookieJar,
                  ConnectInfo(peer_addr): ConnectInfo<SocketAddr>| {
                let shared = Arc::clone(&shared);
                self::ws(WsArgs {
                    shared,
                    ws,
                    room_name,
                    headers,
                    cookies,
                    peer_addr,
                })
            },
        ),
    )
}
