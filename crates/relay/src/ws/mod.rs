// WebSocket transport for rooms: one socket per participant connection.
//
// The first client frame must be `join`. After that the socket loop relays
// client frames to the room and drains the connection's broadcast channel.

mod handler;
mod protocol;
mod session;

use axum::{routing::get, Router};

use crate::rooms::RoomRegistry;

pub use protocol::{decode_message, encode_message};

pub fn router(registry: RoomRegistry) -> Router {
    Router::new().route("/v1/rooms/{room_id}/ws", get(handler::ws_upgrade)).with_state(registry)
}
