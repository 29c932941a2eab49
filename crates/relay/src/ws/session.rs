// One joined WebSocket connection and the dispatch of its client frames.

use std::sync::Arc;

use formcollab_common::protocol::ws::{ClientMessage, ServerMessage};
use formcollab_common::types::{Cursor, ProposedOperation};
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};
use crate::rooms::{ConnectionId, Origin, Room, RoomRegistry};
use crate::sync::snapshot::SnapshotTrigger;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 262_144;

/// What the socket loop does after a frame was handled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Dispatch {
    /// Outcome travels through the room broadcaster, or there is none.
    Done,
    Reply(ServerMessage),
    /// The participant left; the socket closes.
    Leave,
}

#[derive(Clone)]
pub(crate) struct RoomSession {
    pub(crate) registry: RoomRegistry,
    pub(crate) room: Arc<Room>,
    pub(crate) participant_id: Uuid,
    pub(crate) connection_id: ConnectionId,
}

impl RoomSession {
    fn origin(&self) -> Origin {
        Origin { participant_id: self.participant_id, connection_id: Some(self.connection_id) }
    }

    pub(crate) async fn handle(&self, message: ClientMessage) -> Result<Dispatch, RelayError> {
        match message {
            ClientMessage::Join { .. } => Err(RelayError::new(
                ErrorCode::ValidationFailed,
                "connection has already joined this room",
            )),
            ClientMessage::Operation {
                idempotency_id,
                kind,
                target_path,
                new_value,
                client_vector_clock,
            } => {
                let proposal = ProposedOperation {
                    idempotency_id,
                    kind,
                    target_path,
                    new_value,
                    client_vector_clock,
                };
                self.room.submit(self.origin(), proposal).await?;
                Ok(Dispatch::Done)
            }
            ClientMessage::Presence { cursor_x, cursor_y, active_field } => {
                let cursor = Some(Cursor { x: cursor_x, y: cursor_y });
                self.room.update_presence(self.participant_id, cursor, active_field).await;
                Ok(Dispatch::Done)
            }
            ClientMessage::Comment { target_path, content, parent_comment_id, mentions } => {
                self.room
                    .add_comment(self.participant_id, target_path, content, parent_comment_id, mentions)
                    .await?;
                Ok(Dispatch::Done)
            }
            ClientMessage::ResolveComment { comment_id } => {
                self.room.resolve_comment(self.participant_id, comment_id).await?;
                Ok(Dispatch::Done)
            }
            ClientMessage::ResolveConflict { conflict_id, variant } => {
                self.room.resolve_conflict(self.participant_id, conflict_id, variant).await?;
                Ok(Dispatch::Done)
            }
            ClientMessage::SyncRequest { since } => {
                if since < 0 {
                    return Err(RelayError::new(ErrorCode::ValidationFailed, "since must be non-negative"));
                }
                let head_sequence = self.room.head_sequence().await;
                let operations = self.registry.read_since(self.room.room_id(), since).await?;
                Ok(Dispatch::Reply(ServerMessage::SyncResponse { since, head_sequence, operations }))
            }
            ClientMessage::Save => {
                self.room.snapshot(SnapshotTrigger::Requested).await;
                Ok(Dispatch::Done)
            }
            ClientMessage::Leave => {
                self.room.leave(self.participant_id).await;
                Ok(Dispatch::Leave)
            }
        }
    }

    /// Transport drop without an explicit leave.
    pub(crate) async fn disconnect(&self) {
        self.registry.disconnect(self.room.room_id(), self.participant_id, self.connection_id).await;
    }
}
