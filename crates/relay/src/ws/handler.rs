use super::protocol as ws_protocol;
use super::session::{Dispatch, RoomSession, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES};
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::metrics;
use crate::rooms::{JoinRequest, RoomRegistry};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use formcollab_common::protocol::ws::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub async fn ws_upgrade(
    Path(room_id): Path<Uuid>,
    State(registry): State<RoomRegistry>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(registry, room_id, socket)).await;
    })
}

fn elapsed_ms(started_at: Instant) -> u64 {
    u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn reject_and_close(socket: &mut WebSocket, error: &RelayError) {
    let _ = ws_protocol::send_ws_message(socket, &ws_protocol::error_frame(error)).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Reads the first frame, which must be a `join`, and registers the
/// participant. Returns `None` after closing the socket on any failure.
async fn accept_join(
    registry: &RoomRegistry,
    room_id: Uuid,
    socket: &mut WebSocket,
    outbound_sender: mpsc::UnboundedSender<ServerMessage>,
) -> Option<RoomSession> {
    let join_started_at = Instant::now();
    let raw_message = match socket.recv().await {
        Some(Ok(Message::Text(raw_message))) => raw_message,
        Some(Err(error)) if is_frame_size_violation(&error) => {
            metrics::record_ws_request("join", true, elapsed_ms(join_started_at));
            close_frame_too_large(socket).await;
            return None;
        }
        _ => {
            metrics::record_ws_request("join", true, elapsed_ms(join_started_at));
            return None;
        }
    };
    if raw_message.len() > MAX_FRAME_BYTES {
        metrics::record_ws_request("join", true, elapsed_ms(join_started_at));
        close_frame_too_large(socket).await;
        return None;
    }

    let Ok(ClientMessage::Join {
        identity,
        display_name,
        protocol_version,
        conflict_strategy,
        last_sequence,
    }) = ws_protocol::decode_message(&raw_message)
    else {
        metrics::record_ws_request("join", true, elapsed_ms(join_started_at));
        let error = RelayError::new(
            ErrorCode::ValidationFailed,
            "first WebSocket message must be a join frame",
        );
        reject_and_close(socket, &error).await;
        return None;
    };

    let version = match ws_protocol::negotiate_version(protocol_version.as_deref()) {
        Ok(version) => version,
        Err(error) => {
            metrics::record_ws_request("join", true, elapsed_ms(join_started_at));
            reject_and_close(socket, &error).await;
            return None;
        }
    };

    let request = JoinRequest { identity, display_name, conflict_strategy, last_sequence };
    let (room, joined) = match registry.join(room_id, request, Some(outbound_sender)).await {
        Ok(joined) => joined,
        Err(error) => {
            metrics::record_ws_request("join", true, elapsed_ms(join_started_at));
            reject_and_close(socket, &RelayError::from(error)).await;
            return None;
        }
    };
    let Some(connection_id) = joined.connection_id else {
        metrics::record_ws_request("join", true, elapsed_ms(join_started_at));
        return None;
    };

    metrics::record_ws_request("join", false, elapsed_ms(join_started_at));
    debug!(room_id = %room_id, protocol_version = version, "join accepted");
    Some(RoomSession {
        registry: registry.clone(),
        room,
        participant_id: joined.participant.participant_id,
        connection_id,
    })
}

async fn handle_socket(registry: RoomRegistry, room_id: Uuid, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();
    let Some(session) = accept_join(&registry, room_id, &mut socket, outbound_sender).await else {
        return;
    };
    info!(
        room_id = %room_id,
        participant_id = %session.participant_id,
        request_id = %request_id,
        "websocket session joined"
    );

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS of the last one.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout =
        std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);
    let mut left = false;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(
                        room_id = %room_id,
                        participant_id = %session.participant_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(outbound_message) = maybe_outbound else {
                    break;
                };
                if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                    break;
                }
                if matches!(outbound_message, ServerMessage::RoomClosed { .. }) {
                    let _ = socket.send(Message::Close(None)).await;
                    left = true;
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        let inbound = match ws_protocol::decode_message(&raw_message) {
                            Ok(message) => message,
                            Err(error) => {
                                debug!(error = %error, "undecodable websocket frame");
                                let error = RelayError::new(
                                    ErrorCode::ValidationFailed,
                                    "invalid websocket frame payload",
                                );
                                if ws_protocol::send_ws_message(&mut socket, &ws_protocol::error_frame(&error))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };

                        let kind = inbound.kind();
                        let started_at = Instant::now();
                        match session.handle(inbound).await {
                            Ok(dispatch) => {
                                metrics::record_ws_request(kind, false, elapsed_ms(started_at));
                                match dispatch {
                                    Dispatch::Done => {}
                                    Dispatch::Reply(reply) => {
                                        if ws_protocol::send_ws_message(&mut socket, &reply).await.is_err() {
                                            break;
                                        }
                                    }
                                    Dispatch::Leave => {
                                        let _ = socket.send(Message::Close(None)).await;
                                        left = true;
                                        break;
                                    }
                                }
                            }
                            Err(error) => {
                                metrics::record_ws_request(kind, true, elapsed_ms(started_at));
                                if ws_protocol::send_ws_message(&mut socket, &ws_protocol::error_frame(&error))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                if error.code() == ErrorCode::RoomClosed {
                                    let _ = socket.send(Message::Close(None)).await;
                                    left = true;
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    if !left {
        session.disconnect().await;
    }
    info!(
        room_id = %room_id,
        participant_id = %session.participant_id,
        explicit_leave = left,
        "websocket session ended"
    );
}
