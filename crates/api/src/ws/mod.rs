//! WebSocket event stream.
//!
//! Every connection subscribes to the engine's event bus on its own and
//! receives each event as a JSON text frame, plus a ping every
//! [`HEARTBEAT_INTERVAL`].

mod handler;
mod relay;

pub use handler::ws_handler;
pub use relay::{relay_events, RelayEnd, HEARTBEAT_INTERVAL};
