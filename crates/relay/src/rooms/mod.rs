// Room actors: one per form document, owned by the registry.
//
// A room serializes sequencing, conflict resolution and log append behind a
// single mutex. Presence and comments have their own locks and never wait on
// the sequencing lock.

pub mod broadcast;
pub mod participants;
pub mod presence;
pub mod registry;
pub mod room;
mod targets;

use formcollab_common::document::ApplyError;
use formcollab_common::types::{Operation, PendingConflict, ProposedOperation, RejectReason};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};
use crate::log::comments::CommentError;
use crate::log::LogError;
use crate::sync::sequencer::SequenceError;

pub use broadcast::{Broadcaster, ConnectionId};
pub use registry::{JoinRequest, RoomDeps, RoomRegistry, SweepReport};
pub use room::{JoinOutcome, Origin, Room};

/// Result of one submission. Replays of an idempotency id return a clone of
/// the first outcome.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted { operation: Operation, superseded: Vec<i64> },
    Rejected {
        proposal: ProposedOperation,
        reason: RejectReason,
        detail: String,
        current_value: Option<Value>,
    },
    /// Parked under the manual strategy until someone picks a variant.
    Pending { conflict: PendingConflict },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room {0} is closed")]
    RoomClosed(Uuid),

    #[error("room {0} not found")]
    UnknownRoom(Uuid),

    #[error("participant {0} is not active in this room")]
    UnknownParticipant(Uuid),

    #[error("participant lacks edit permission")]
    PermissionDenied,

    #[error("conflict {0} not found")]
    ConflictNotFound(Uuid),

    #[error("conflict {conflict_id} has no variant {variant}")]
    InvalidVariant { conflict_id: Uuid, variant: usize },

    #[error("chosen variant no longer applies: {0}")]
    VariantNotApplicable(#[from] ApplyError),

    #[error(transparent)]
    Comment(#[from] CommentError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<RoomError> for RelayError {
    fn from(error: RoomError) -> Self {
        let code = match &error {
            RoomError::RoomClosed(_) => ErrorCode::RoomClosed,
            RoomError::UnknownRoom(_)
            | RoomError::UnknownParticipant(_)
            | RoomError::ConflictNotFound(_) => ErrorCode::NotFound,
            RoomError::PermissionDenied => ErrorCode::AuthForbidden,
            RoomError::InvalidVariant { .. } | RoomError::VariantNotApplicable(_) => {
                ErrorCode::ValidationFailed
            }
            RoomError::Comment(comment_error) => match comment_error {
                CommentError::EmptyContent
                | CommentError::ContentTooLong(_)
                | CommentError::ForeignParent(_)
                | CommentError::Cycle(_) => ErrorCode::ValidationFailed,
                CommentError::NotFound(_) => ErrorCode::NotFound,
                CommentError::AlreadyResolved(_) => ErrorCode::Conflict,
                CommentError::PermissionDenied => ErrorCode::AuthForbidden,
                CommentError::Log(_) => ErrorCode::InternalError,
            },
            RoomError::Log(_) | RoomError::Sequence(_) | RoomError::Storage(_) => {
                tracing::error!(error = ?error, "room operation failed");
                ErrorCode::InternalError
            }
        };

        let relay_error = match code {
            ErrorCode::InternalError => RelayError::from_code(code),
            _ => RelayError::new(code, error.to_string()),
        };
        match error {
            RoomError::InvalidVariant { conflict_id, variant } => {
                relay_error.with_details(json!({ "conflict_id": conflict_id, "variant": variant }))
            }
            _ => relay_error,
        }
    }
}

/// Maps a document application failure onto the wire rejection reason.
pub(crate) fn reject_reason(error: &ApplyError) -> RejectReason {
    match error {
        ApplyError::TargetMissing(_) => RejectReason::TargetMissing,
        ApplyError::TargetExists(_) => RejectReason::TargetExists,
        ApplyError::InvalidTarget(_) => RejectReason::InvalidTarget,
        ApplyError::MissingValue | ApplyError::InvalidValue(_) => RejectReason::InvalidValue,
    }
}
