use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use podflow_events::EngineEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Interval between heartbeat pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The server is shutting down.
    Shutdown,
    /// The engine's event bus is gone.
    BusClosed,
    /// The client disconnected or a frame could not be written.
    ClientGone,
}

/// Frame sent in place of the events a slow client missed.
fn lagged_frame(skipped: u64) -> Message {
    let notice = serde_json::json!({ "type": "events_lagged", "skipped": skipped });
    Message::Text(notice.to_string().into())
}

/// Forward `events` to `sink` until the client goes away, the bus closes or
/// `shutdown` fires. A close frame is sent on the last two.
pub async fn relay_events<S>(
    sink: &mut S,
    mut events: broadcast::Receiver<EngineEvent>,
    shutdown: &CancellationToken,
    heartbeat: Duration,
) -> RelayEnd
where
    S: Sink<Message> + Unpin,
{
    let mut ping = interval_at(Instant::now() + heartbeat, heartbeat);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break RelayEnd::Shutdown,
            _ = ping.tick() => Message::Ping(Bytes::new()),
            received = events.recv() => match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize engine event");
                        continue;
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "WebSocket client lagged behind the event bus");
                    lagged_frame(skipped)
                }
                Err(RecvError::Closed) => break RelayEnd::BusClosed,
            },
        };
        if sink.send(frame).await.is_err() {
            return RelayEnd::ClientGone;
        }
    };

    let _ = sink.send(Message::Close(None)).await;
    end
}
