use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::StreamExt;
use podflow_events::EngineEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;
use crate::ws::relay::{relay_events, RelayEnd, HEARTBEAT_INTERVAL};

/// GET /api/ws
///
/// Upgrades to a WebSocket that streams engine events. The subscription is
/// taken before the upgrade, so events emitted during the handshake are
/// delivered too.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let events = state.engine.subscribe();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, events, shutdown))
}

/// Relay events out while reading inbound frames to notice disconnects.
async fn handle_socket(
    socket: WebSocket,
    events: broadcast::Receiver<EngineEvent>,
    shutdown: CancellationToken,
) {
    let conn_id = uuid::Uuid::new_v4();
    tracing::info!(%conn_id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();
    let inbound = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Ok(Message::Pong(_)) => tracing::trace!(%conn_id, "Pong received"),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(%conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    };

    let end = tokio::select! {
        end = relay_events(&mut sink, events, &shutdown, HEARTBEAT_INTERVAL) => end,
        () = inbound => RelayEnd::ClientGone,
    };
    tracing::info!(%conn_id, reason = ?end, "WebSocket disconnected");
}
