//! WebSocket Endpoint
//!
//! `GET /ws` upgrades an authenticated connection into the persistent
//! event channel. The token comes from the `token` query parameter or an
//! `Authorization: Bearer` header and is verified before the upgrade; a
//! bad token is rejected with 401 and no socket is opened.
//!
//! After the upgrade the socket splits: a writer task drains the
//! connection's event channel while the read loop parses frames and feeds
//! them to the engine. Either side closing tears the connection down and
//! runs the engine's disconnect path.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::server::state::AppState;
use crate::shared::event::ErrorPayload;
use crate::shared::{ClientEvent, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Upgrade handler for `/ws`.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match params.token.or_else(|| bearer_token(&headers)) {
        Some(token) => token,
        None => {
            return (StatusCode::UNAUTHORIZED, "Missing authentication token").into_response();
        }
    };
    let identity = match state.verifier.verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            info!("[WS] Rejected connection: {}", e);
            return (StatusCode::UNAUTHORIZED, "Invalid authentication token").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity.user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let conn = match state.engine.handle_connect(user_id, tx).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("[WS] Connect failed for user {}: {}", user_id, e);
            let _ = ws_tx.close().await;
            return;
        }
    };

    // Writer task: everything the engine emits for this connection goes out
    // as one JSON text frame.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[WS] Failed to serialize outbound event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => state.engine.handle_event(conn, event).await,
                Err(e) => {
                    debug!("[WS] Unparseable frame from {:?}: {}", conn, e);
                    state.engine.registry().send_to_connection(
                        conn,
                        ServerEvent::MessageError(
                            ErrorPayload::new("Unrecognized event").with_details(e.to_string()),
                        ),
                    );
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            // Pings are answered by the protocol layer; binary frames are
            // not part of the wire format.
            Ok(_) => {}
        }
    }

    state.engine.handle_disconnect(conn).await;
    writer.abort();
    debug!("[WS] Connection {:?} closed", conn);
}
