// Append-only operation log and threaded comment store.
//
// Two backends share one dispatch enum: PostgreSQL for deployments and an
// in-memory map for development and tests. Both enforce gap-free sequence
// numbers and one log entry per idempotency id.

pub mod comments;
mod memory;
mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use formcollab_common::types::{Comment, ConflictStrategy, Operation, ParticipantSnapshot};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use memory::MemoryLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub room_id: Uuid,
    pub strategy: ConflictStrategy,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// An accepted operation as logged, with the sequence numbers it made stale.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedOperation {
    pub operation: Operation,
    pub superseded: Vec<i64>,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("sequence gap in room {room_id}: expected {expected}, got {actual}")]
    SequenceGap { room_id: Uuid, expected: i64, actual: i64 },

    #[error("idempotency id {0} already logged")]
    DuplicateIdempotency(Uuid),

    #[error("room {0} has no record")]
    UnknownRoom(Uuid),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone)]
pub enum LogStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryLog>>),
}

impl LogStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryLog::default())))
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    /// Returns the room record, creating it with `strategy` when absent.
    /// Reopening a closed room clears `closed_at` and keeps the original strategy.
    pub async fn ensure_room(
        &self,
        room_id: Uuid,
        strategy: ConflictStrategy,
        now: DateTime<Utc>,
    ) -> Result<RoomRecord, LogError> {
        match self {
            Self::Postgres(pool) => postgres::ensure_room_pg(pool, room_id, strategy, now).await,
            Self::Memory(store) => memory::ensure_room_mem(store, room_id, strategy, now).await,
        }
    }

    pub async fn load_room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, LogError> {
        match self {
            Self::Postgres(pool) => postgres::load_room_pg(pool, room_id).await,
            Self::Memory(store) => Ok(store.read().await.rooms.get(&room_id).cloned()),
        }
    }

    pub async fn mark_room_closed(
        &self,
        room_id: Uuid,
        closed_at: DateTime<Utc>,
    ) -> Result<(), LogError> {
        match self {
            Self::Postgres(pool) => postgres::mark_room_closed_pg(pool, room_id, closed_at).await,
            Self::Memory(store) => memory::mark_room_closed_mem(store, room_id, closed_at).await,
        }
    }

    /// Appends an accepted operation. Its sequence number must be exactly
    /// one past the room's current head.
    pub async fn append(&self, operation: &Operation, superseded: &[i64]) -> Result<(), LogError> {
        match self {
            Self::Postgres(pool) => postgres::append_pg(pool, operation, superseded).await,
            Self::Memory(store) => memory::append_mem(store, operation, superseded).await,
        }
    }

    /// Operations with `sequence_number > since`, ascending.
    pub async fn read_since(&self, room_id: Uuid, since: i64) -> Result<Vec<Operation>, LogError> {
        match self {
            Self::Postgres(pool) => postgres::read_since_pg(pool, room_id, since).await,
            Self::Memory(store) => Ok(memory::read_since_mem(&*store.read().await, room_id, since)),
        }
    }

    pub async fn head_sequence(&self, room_id: Uuid) -> Result<i64, LogError> {
        match self {
            Self::Postgres(pool) => postgres::head_sequence_pg(pool, room_id).await,
            Self::Memory(store) => Ok(memory::head_sequence_mem(&*store.read().await, room_id)),
        }
    }

    pub async fn operation_at(
        &self,
        room_id: Uuid,
        sequence_number: i64,
    ) -> Result<Option<Operation>, LogError> {
        match self {
            Self::Postgres(pool) => postgres::operation_at_pg(pool, room_id, sequence_number).await,
            Self::Memory(store) => Ok(store
                .read()
                .await
                .operations
                .get(&room_id)
                .and_then(|ops| ops.iter().find(|op| op.sequence_number == sequence_number))
                .cloned()),
        }
    }

    pub async fn operation_by_idempotency(
        &self,
        room_id: Uuid,
        idempotency_id: Uuid,
    ) -> Result<Option<LoggedOperation>, LogError> {
        match self {
            Self::Postgres(pool) => {
                postgres::operation_by_idempotency_pg(pool, room_id, idempotency_id).await
            }
            Self::Memory(store) => {
                Ok(memory::operation_by_idempotency_mem(&*store.read().await, room_id, idempotency_id))
            }
        }
    }

    pub async fn upsert_participant(&self, participant: &ParticipantSnapshot) -> Result<(), LogError> {
        match self {
            Self::Postgres(pool) => postgres::upsert_participant_pg(pool, participant).await,
            Self::Memory(store) => {
                let mut presence_free = participant.clone();
                presence_free.cursor = None;
                presence_free.active_field = None;
                store.write().await.participants.insert(participant.participant_id, presence_free);
                Ok(())
            }
        }
    }

    /// Every participant ever recorded for the room, in join order.
    pub async fn load_participants(&self, room_id: Uuid) -> Result<Vec<ParticipantSnapshot>, LogError> {
        match self {
            Self::Postgres(pool) => postgres::load_participants_pg(pool, room_id).await,
            Self::Memory(store) => Ok(memory::load_participants_mem(&*store.read().await, room_id)),
        }
    }

    pub async fn insert_comment(&self, comment: &Comment) -> Result<(), LogError> {
        match self {
            Self::Postgres(pool) => postgres::insert_comment_pg(pool, comment).await,
            Self::Memory(store) => {
                store.write().await.comments.insert(comment.comment_id, comment.clone());
                Ok(())
            }
        }
    }

    /// Persists the resolution fields of an existing comment.
    pub async fn update_comment(&self, comment: &Comment) -> Result<(), LogError> {
        match self {
            Self::Postgres(pool) => postgres::update_comment_pg(pool, comment).await,
            Self::Memory(store) => {
                store.write().await.comments.insert(comment.comment_id, comment.clone());
                Ok(())
            }
        }
    }

    pub async fn comment(&self, comment_id: Uuid) -> Result<Option<Comment>, LogError> {
        match self {
            Self::Postgres(pool) => postgres::comment_pg(pool, comment_id).await,
            Self::Memory(store) => Ok(store.read().await.comments.get(&comment_id).cloned()),
        }
    }

    pub async fn comments_for_room(&self, room_id: Uuid) -> Result<Vec<Comment>, LogError> {
        match self {
            Self::Postgres(pool) => postgres::comments_for_room_pg(pool, room_id).await,
            Self::Memory(store) => Ok(memory::comments_for_room_mem(&*store.read().await, room_id)),
        }
    }

    /// Next free position inside a comment thread (1 for a new thread).
    pub async fn next_comment_position(&self, thread_id: Uuid) -> Result<i64, LogError> {
        match self {
            Self::Postgres(pool) => postgres::next_comment_position_pg(pool, thread_id).await,
            Self::Memory(store) => Ok(store
                .read()
                .await
                .comments
                .values()
                .filter(|comment| comment.thread_id == thread_id)
                .map(|comment| comment.position)
                .max()
                .unwrap_or(0)
                + 1),
        }
    }
}
