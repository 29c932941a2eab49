// WebSocket message types for the formcollab.v1 room protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::path::TargetPath;
use crate::types::{
    Comment, ConflictStrategy, Cursor, Identity, Operation, OperationKind, ParticipantSnapshot,
    PendingConflict, ProposedOperation, RejectReason, RoomSnapshot,
};

pub const CURRENT_PROTOCOL_VERSION: &str = "formcollab.v1";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION, "formcollab.v0"];

/// Frames a client may send after the socket opens. The first must be `Join`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        identity: Identity,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<String>,
        /// Only honored when the join creates the room.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict_strategy: Option<ConflictStrategy>,
        /// Replays accepted operations after this sequence number.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_sequence: Option<i64>,
    },

    Operation {
        idempotency_id: Uuid,
        kind: OperationKind,
        target_path: TargetPath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_value: Option<Value>,
        #[serde(default)]
        client_vector_clock: VectorClock,
    },

    Presence {
        cursor_x: f64,
        cursor_y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_field: Option<TargetPath>,
    },

    Comment {
        target_path: TargetPath,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_comment_id: Option<Uuid>,
        #[serde(default)]
        mentions: Vec<Uuid>,
    },

    ResolveComment {
        comment_id: Uuid,
    },

    /// Picks one variant of a pending manual conflict.
    ResolveConflict {
        conflict_id: Uuid,
        variant: usize,
    },

    SyncRequest {
        since: i64,
    },

    /// Requests an immediate snapshot to the document store.
    Save,

    Leave,
}

impl ClientMessage {
    /// Metric label for the frame.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Operation { .. } => "operation",
            Self::Presence { .. } => "presence",
            Self::Comment { .. } => "comment",
            Self::ResolveComment { .. } => "resolve_comment",
            Self::ResolveConflict { .. } => "resolve_conflict",
            Self::SyncRequest { .. } => "sync_request",
            Self::Save => "save",
            Self::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Direct reply to a successful join.
    Welcome {
        participant: ParticipantSnapshot,
        room: RoomSnapshot,
    },

    ParticipantJoined {
        participant: ParticipantSnapshot,
    },

    ParticipantLeft {
        participant: ParticipantSnapshot,
    },

    OperationAccepted {
        operation: Operation,
        #[serde(default)]
        superseded: Vec<i64>,
    },

    OperationRejected {
        operation: ProposedOperation,
        reason: RejectReason,
        detail: String,
        #[serde(default)]
        current_value: Option<Value>,
    },

    ConflictPending {
        conflict: PendingConflict,
    },

    /// `operation` is absent when nothing had to be applied: the chosen
    /// variant deletes a target that is already gone, or an accepted edit
    /// removed or shifted the conflict's target first.
    ConflictResolved {
        conflict_id: Uuid,
        #[serde(default)]
        operation: Option<Operation>,
    },

    PresenceUpdate {
        participant_id: Uuid,
        #[serde(default)]
        cursor: Option<Cursor>,
        #[serde(default)]
        active_field: Option<TargetPath>,
        presence_seq: u64,
    },

    CommentAdded {
        comment: Comment,
    },

    CommentResolved {
        comment: Comment,
    },

    SyncResponse {
        since: i64,
        head_sequence: i64,
        operations: Vec<Operation>,
    },

    RoomClosed {
        room_id: Uuid,
    },

    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Error { code: code.to_string(), message: message.into(), retryable }
    }
}
