// Core domain types shared by the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::path::TargetPath;

/// Participant id used for operations the relay itself emits (document seeding).
pub const SYSTEM_PARTICIPANT_ID: Uuid = Uuid::nil();

/// Who is behind a participant: an authenticated user or an anonymous guest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    User { user_id: Uuid },
    Guest { guest_id: String },
}

impl Identity {
    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest { .. })
    }

    /// Stable textual key, used for persistence.
    pub fn storage_key(&self) -> String {
        match self {
            Self::User { user_id } => format!("user:{user_id}"),
            Self::Guest { guest_id } => format!("guest:{guest_id}"),
        }
    }

    pub fn from_storage_key(value: &str) -> Option<Self> {
        if let Some(user_id) = value.strip_prefix("user:") {
            return Uuid::parse_str(user_id).ok().map(|user_id| Self::User { user_id });
        }
        value.strip_prefix("guest:").map(|guest_id| Self::Guest { guest_id: guest_id.to_string() })
    }
}

/// How a room settles concurrent edits to the same target. Fixed at room creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    FirstWriteWins,
    Merge,
    Manual,
}

impl ConflictStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::FirstWriteWins => "first_write_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "last_write_wins" | "lww" => Some(Self::LastWriteWins),
            "first_write_wins" | "fww" => Some(Self::FirstWriteWins),
            "merge" => Some(Self::Merge),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    InsertField,
    DeleteField,
    UpdateField,
    MoveField,
    UpdateSetting,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InsertField => "insert_field",
            Self::DeleteField => "delete_field",
            Self::UpdateField => "update_field",
            Self::MoveField => "move_field",
            Self::UpdateSetting => "update_setting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert_field" => Some(Self::InsertField),
            "delete_field" => Some(Self::DeleteField),
            "update_field" => Some(Self::UpdateField),
            "move_field" => Some(Self::MoveField),
            "update_setting" => Some(Self::UpdateSetting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// An edit as submitted by a client, before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedOperation {
    pub idempotency_id: Uuid,
    pub kind: OperationKind,
    pub target_path: TargetPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    #[serde(default)]
    pub client_vector_clock: VectorClock,
}

/// An accepted, sequenced operation. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub idempotency_id: Uuid,
    pub room_id: Uuid,
    pub kind: OperationKind,
    pub target_path: TargetPath,
    #[serde(default)]
    pub previous_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    /// Value actually applied; differs from `new_value` after a merge.
    #[serde(default)]
    pub final_value: Option<Value>,
    pub participant_id: Uuid,
    pub sequence_number: i64,
    pub vector_clock: VectorClock,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn proposal(&self) -> ProposedOperation {
        ProposedOperation {
            idempotency_id: self.idempotency_id,
            kind: self.kind,
            target_path: self.target_path.clone(),
            new_value: self.new_value.clone(),
            client_vector_clock: self.vector_clock.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TargetMissing,
    TargetExists,
    InvalidTarget,
    InvalidValue,
    FirstWriteWins,
    PendingManualResolution,
    PermissionDenied,
    IdempotencyMismatch,
}

impl RejectReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TargetMissing => "target_missing",
            Self::TargetExists => "target_exists",
            Self::InvalidTarget => "invalid_target",
            Self::InvalidValue => "invalid_value",
            Self::FirstWriteWins => "first_write_wins",
            Self::PendingManualResolution => "pending_manual_resolution",
            Self::PermissionDenied => "permission_denied",
            Self::IdempotencyMismatch => "idempotency_mismatch",
        }
    }
}

/// Wire view of a participant, presence included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub participant_id: Uuid,
    pub room_id: Uuid,
    pub identity: Identity,
    pub display_name: String,
    pub color: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub active_field: Option<TargetPath>,
    pub can_edit: bool,
    pub can_comment: bool,
    pub joined_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: Uuid,
    pub room_id: Uuid,
    pub target_path: TargetPath,
    pub author_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub parent_comment_id: Option<Uuid>,
    /// Id of the root comment of the thread.
    pub thread_id: Uuid,
    /// Position within the thread, starting at 1 for the root.
    pub position: i64,
    #[serde(default)]
    pub mentions: Vec<Uuid>,
    pub resolved: bool,
    #[serde(default)]
    pub resolved_by: Option<Uuid>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One side of a manual-strategy conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictVariant {
    pub participant_id: Uuid,
    pub kind: OperationKind,
    #[serde(default)]
    pub value: Option<Value>,
    pub vector_clock: VectorClock,
    /// Set when this variant is the one currently applied.
    #[serde(default)]
    pub sequence_number: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub conflict_id: Uuid,
    pub room_id: Uuid,
    pub target_path: TargetPath,
    pub variants: Vec<ConflictVariant>,
    pub opened_at: DateTime<Utc>,
}

/// Room state handed to a participant when it joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: Uuid,
    pub strategy: ConflictStrategy,
    pub head_sequence: i64,
    pub document: Value,
    pub participants: Vec<ParticipantSnapshot>,
    #[serde(default)]
    pub pending_conflicts: Vec<PendingConflict>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_storage_key_round_trips() {
        let user = Identity::User { user_id: Uuid::from_u128(42) };
        let guest = Identity::Guest { guest_id: "anon-7".to_string() };

        assert_eq!(Identity::from_storage_key(&user.storage_key()), Some(user));
        assert_eq!(Identity::from_storage_key(&guest.storage_key()), Some(guest.clone()));
        assert!(guest.is_guest());
        assert_eq!(Identity::from_storage_key("robot:1"), None);
    }

    #[test]
    fn identity_is_tagged_by_kind() {
        let value = serde_json::to_value(Identity::Guest { guest_id: "g1".into() })
            .expect("identity should serialize");
        assert_eq!(value, serde_json::json!({ "kind": "guest", "guest_id": "g1" }));
    }

    #[test]
    fn strategy_parse_accepts_aliases() {
        assert_eq!(ConflictStrategy::parse("LWW"), Some(ConflictStrategy::LastWriteWins));
        assert_eq!(ConflictStrategy::parse("first_write_wins"), Some(ConflictStrategy::FirstWriteWins));
        assert_eq!(ConflictStrategy::parse(" merge "), Some(ConflictStrategy::Merge));
        assert_eq!(ConflictStrategy::parse("vote"), None);
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn operation_kind_names_match_wire_format() {
        for kind in [
            OperationKind::InsertField,
            OperationKind::DeleteField,
            OperationKind::UpdateField,
            OperationKind::MoveField,
            OperationKind::UpdateSetting,
        ] {
            let value = serde_json::to_value(kind).expect("kind should serialize");
            assert_eq!(value, serde_json::json!(kind.as_str()));
            assert_eq!(OperationKind::parse(kind.as_str()), Some(kind));
        }
    }
}
