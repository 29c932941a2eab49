use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use formcollab_common::clock::VectorClock;
use formcollab_common::path::TargetPath;
use formcollab_common::types::{
    Comment, ConflictStrategy, Identity, Operation, OperationKind, ParticipantSnapshot,
};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{LogError, LoggedOperation, RoomRecord};

// ── SQL rows ────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct RoomRow {
    room_id: Uuid,
    strategy: String,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    room_id: Uuid,
    sequence_number: i64,
    idempotency_id: Uuid,
    kind: String,
    target_path: String,
    previous_value: Option<Value>,
    new_value: Option<Value>,
    final_value: Option<Value>,
    participant_id: Uuid,
    vector_clock: Json<VectorClock>,
    superseded: Vec<i64>,
    accepted_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    participant_id: Uuid,
    room_id: Uuid,
    identity_key: String,
    display_name: String,
    color: String,
    can_edit: bool,
    can_comment: bool,
    joined_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    comment_id: Uuid,
    room_id: Uuid,
    target_path: String,
    author_id: Uuid,
    content: String,
    parent_comment_id: Option<Uuid>,
    thread_id: Uuid,
    position: i64,
    mentions: Json<Vec<Uuid>>,
    resolved: bool,
    resolved_by: Option<Uuid>,
    resolved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RoomRow> for RoomRecord {
    type Error = LogError;

    fn try_from(row: RoomRow) -> Result<Self, Self::Error> {
        let strategy = ConflictStrategy::parse(&row.strategy)
            .ok_or_else(|| anyhow!("invalid conflict strategy '{}' in database", row.strategy))?;
        Ok(Self { room_id: row.room_id, strategy, created_at: row.created_at, closed_at: row.closed_at })
    }
}

impl TryFrom<OperationRow> for Operation {
    type Error = LogError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let kind = OperationKind::parse(&row.kind)
            .ok_or_else(|| anyhow!("invalid operation kind '{}' in database", row.kind))?;
        let target_path = TargetPath::parse(&row.target_path)
            .with_context(|| format!("invalid target path '{}' in database", row.target_path))?;
        Ok(Self {
            idempotency_id: row.idempotency_id,
            room_id: row.room_id,
            kind,
            target_path,
            previous_value: row.previous_value,
            new_value: row.new_value,
            final_value: row.final_value,
            participant_id: row.participant_id,
            sequence_number: row.sequence_number,
            vector_clock: row.vector_clock.0,
            timestamp: row.accepted_at,
        })
    }
}

impl TryFrom<ParticipantRow> for ParticipantSnapshot {
    type Error = LogError;

    fn try_from(row: ParticipantRow) -> Result<Self, Self::Error> {
        let identity = Identity::from_storage_key(&row.identity_key)
            .ok_or_else(|| anyhow!("invalid identity key '{}' in database", row.identity_key))?;
        Ok(Self {
            participant_id: row.participant_id,
            room_id: row.room_id,
            identity,
            display_name: row.display_name,
            color: row.color,
            cursor: None,
            active_field: None,
            can_edit: row.can_edit,
            can_comment: row.can_comment,
            joined_at: row.joined_at,
            last_activity_at: row.last_activity_at,
            left_at: row.left_at,
        })
    }
}

impl TryFrom<CommentRow> for Comment {
    type Error = LogError;

    fn try_from(row: CommentRow) -> Result<Self, Self::Error> {
        let target_path = TargetPath::parse(&row.target_path)
            .with_context(|| format!("invalid comment path '{}' in database", row.target_path))?;
        Ok(Self {
            comment_id: row.comment_id,
            room_id: row.room_id,
            target_path,
            author_id: row.author_id,
            content: row.content,
            parent_comment_id: row.parent_comment_id,
            thread_id: row.thread_id,
            position: row.position,
            mentions: row.mentions.0,
            resolved: row.resolved,
            resolved_by: row.resolved_by,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
        })
    }
}

fn map_sqlx_error(error: sqlx::Error) -> LogError {
    LogError::Storage(error.into())
}

const OPERATION_COLUMNS: &str = "room_id, sequence_number, idempotency_id, kind, target_path, \
     previous_value, new_value, final_value, participant_id, vector_clock, superseded, accepted_at";

const COMMENT_COLUMNS: &str = "comment_id, room_id, target_path, author_id, content, \
     parent_comment_id, thread_id, position, mentions, resolved, resolved_by, resolved_at, created_at";

// ── Rooms ───────────────────────────────────────────────────────────

pub(super) async fn ensure_room_pg(
    pool: &PgPool,
    room_id: Uuid,
    strategy: ConflictStrategy,
    now: DateTime<Utc>,
) -> Result<RoomRecord, LogError> {
    let row = sqlx::query_as::<_, RoomRow>(
        r#"
        INSERT INTO collab_rooms (room_id, strategy, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (room_id) DO UPDATE SET closed_at = NULL
        RETURNING room_id, strategy, created_at, closed_at
        "#,
    )
    .bind(room_id)
    .bind(strategy.as_str())
    .bind(now)
    .fetch_one(pool)
    .instrument(info_span!("relay.db.query", query = "ensure_room"))
    .await
    .map_err(map_sqlx_error)?;

    row.try_into()
}

pub(super) async fn load_room_pg(pool: &PgPool, room_id: Uuid) -> Result<Option<RoomRecord>, LogError> {
    let row = sqlx::query_as::<_, RoomRow>(
        "SELECT room_id, strategy, created_at, closed_at FROM collab_rooms WHERE room_id = $1",
    )
    .bind(room_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "load_room"))
    .await
    .map_err(map_sqlx_error)?;

    row.map(TryInto::try_into).transpose()
}

pub(super) async fn mark_room_closed_pg(
    pool: &PgPool,
    room_id: Uuid,
    closed_at: DateTime<Utc>,
) -> Result<(), LogError> {
    let result = sqlx::query("UPDATE collab_rooms SET closed_at = $2 WHERE room_id = $1")
        .bind(room_id)
        .bind(closed_at)
        .execute(pool)
        .instrument(info_span!("relay.db.query", query = "mark_room_closed"))
        .await
        .map_err(map_sqlx_error)?;

    if result.rows_affected() == 0 {
        return Err(LogError::UnknownRoom(room_id));
    }
    Ok(())
}

// ── Operations ──────────────────────────────────────────────────────

pub(super) async fn append_pg(
    pool: &PgPool,
    operation: &Operation,
    superseded: &[i64],
) -> Result<(), LogError> {
    let inserted = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO collab_operations (
            room_id, sequence_number, idempotency_id, kind, target_path, previous_value,
            new_value, final_value, participant_id, vector_clock, superseded, accepted_at
        )
        SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
        WHERE (
            SELECT COALESCE(MAX(sequence_number), 0)
            FROM collab_operations
            WHERE room_id = $1
        ) = $2 - 1
        ON CONFLICT DO NOTHING
        RETURNING sequence_number
        "#,
    )
    .bind(operation.room_id)
    .bind(operation.sequence_number)
    .bind(operation.idempotency_id)
    .bind(operation.kind.as_str())
    .bind(operation.target_path.to_string())
    .bind(operation.previous_value.clone())
    .bind(operation.new_value.clone())
    .bind(operation.final_value.clone())
    .bind(operation.participant_id)
    .bind(Json(&operation.vector_clock))
    .bind(superseded)
    .bind(operation.timestamp)
    .fetch_optional(pool)
    .instrument(info_span!(
        "relay.db.query",
        query = "append_operation",
        room_id = %operation.room_id,
        sequence_number = operation.sequence_number
    ))
    .await
    .map_err(map_sqlx_error)?;

    if inserted.is_some() {
        return Ok(());
    }

    if operation_by_idempotency_pg(pool, operation.room_id, operation.idempotency_id)
        .await?
        .is_some()
    {
        return Err(LogError::DuplicateIdempotency(operation.idempotency_id));
    }

    let head = head_sequence_pg(pool, operation.room_id).await?;
    Err(LogError::SequenceGap {
        room_id: operation.room_id,
        expected: head + 1,
        actual: operation.sequence_number,
    })
}

pub(super) async fn read_since_pg(
    pool: &PgPool,
    room_id: Uuid,
    since: i64,
) -> Result<Vec<Operation>, LogError> {
    let rows = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {OPERATION_COLUMNS} FROM collab_operations \
         WHERE room_id = $1 AND sequence_number > $2 \
         ORDER BY sequence_number ASC"
    ))
    .bind(room_id)
    .bind(since)
    .fetch_all(pool)
    .instrument(info_span!("relay.db.query", query = "read_operations_since", since))
    .await
    .map_err(map_sqlx_error)?;

    rows.into_iter().map(TryInto::try_into).collect()
}

pub(super) async fn head_sequence_pg(pool: &PgPool, room_id: Uuid) -> Result<i64, LogError> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(sequence_number), 0) FROM collab_operations WHERE room_id = $1",
    )
    .bind(room_id)
    .fetch_one(pool)
    .instrument(info_span!("relay.db.query", query = "head_sequence"))
    .await
    .map_err(map_sqlx_error)
}

pub(super) async fn operation_at_pg(
    pool: &PgPool,
    room_id: Uuid,
    sequence_number: i64,
) -> Result<Option<Operation>, LogError> {
    let row = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {OPERATION_COLUMNS} FROM collab_operations \
         WHERE room_id = $1 AND sequence_number = $2"
    ))
    .bind(room_id)
    .bind(sequence_number)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "operation_at"))
    .await
    .map_err(map_sqlx_error)?;

    row.map(TryInto::try_into).transpose()
}

pub(super) async fn operation_by_idempotency_pg(
    pool: &PgPool,
    room_id: Uuid,
    idempotency_id: Uuid,
) -> Result<Option<LoggedOperation>, LogError> {
    let row = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {OPERATION_COLUMNS} FROM collab_operations \
         WHERE room_id = $1 AND idempotency_id = $2"
    ))
    .bind(room_id)
    .bind(idempotency_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "operation_by_idempotency"))
    .await
    .map_err(map_sqlx_error)?;

    let Some(mut row) = row else {
        return Ok(None);
    };
    let superseded = std::mem::take(&mut row.superseded);
    Ok(Some(LoggedOperation { operation: row.try_into()?, superseded }))
}

// ── Participants ────────────────────────────────────────────────────

pub(super) async fn upsert_participant_pg(
    pool: &PgPool,
    participant: &ParticipantSnapshot,
) -> Result<(), LogError> {
    sqlx::query(
        r#"
        INSERT INTO collab_participants (
            participant_id, room_id, identity_key, display_name, color,
            can_edit, can_comment, joined_at, last_activity_at, left_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (participant_id) DO UPDATE SET
            display_name = EXCLUDED.display_name,
            last_activity_at = EXCLUDED.last_activity_at,
            left_at = EXCLUDED.left_at
        "#,
    )
    .bind(participant.participant_id)
    .bind(participant.room_id)
    .bind(participant.identity.storage_key())
    .bind(&participant.display_name)
    .bind(&participant.color)
    .bind(participant.can_edit)
    .bind(participant.can_comment)
    .bind(participant.joined_at)
    .bind(participant.last_activity_at)
    .bind(participant.left_at)
    .execute(pool)
    .instrument(info_span!(
        "relay.db.query",
        query = "upsert_participant",
        participant_id = %participant.participant_id
    ))
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

pub(super) async fn load_participants_pg(
    pool: &PgPool,
    room_id: Uuid,
) -> Result<Vec<ParticipantSnapshot>, LogError> {
    let rows = sqlx::query_as::<_, ParticipantRow>(
        r#"
        SELECT participant_id, room_id, identity_key, display_name, color,
               can_edit, can_comment, joined_at, last_activity_at, left_at
        FROM collab_participants
        WHERE room_id = $1
        ORDER BY joined_at ASC, participant_id ASC
        "#,
    )
    .bind(room_id)
    .fetch_all(pool)
    .instrument(info_span!("relay.db.query", query = "load_participants"))
    .await
    .map_err(map_sqlx_error)?;

    rows.into_iter().map(TryInto::try_into).collect()
}

// ── Comments ────────────────────────────────────────────────────────

pub(super) async fn insert_comment_pg(pool: &PgPool, comment: &Comment) -> Result<(), LogError> {
    sqlx::query(&format!(
        "INSERT INTO collab_comments ({COMMENT_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    ))
    .bind(comment.comment_id)
    .bind(comment.room_id)
    .bind(comment.target_path.to_string())
    .bind(comment.author_id)
    .bind(&comment.content)
    .bind(comment.parent_comment_id)
    .bind(comment.thread_id)
    .bind(comment.position)
    .bind(Json(&comment.mentions))
    .bind(comment.resolved)
    .bind(comment.resolved_by)
    .bind(comment.resolved_at)
    .bind(comment.created_at)
    .execute(pool)
    .instrument(info_span!("relay.db.query", query = "insert_comment"))
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

pub(super) async fn update_comment_pg(pool: &PgPool, comment: &Comment) -> Result<(), LogError> {
    sqlx::query(
        r#"
        UPDATE collab_comments
        SET resolved = $2, resolved_by = $3, resolved_at = $4
        WHERE comment_id = $1
        "#,
    )
    .bind(comment.comment_id)
    .bind(comment.resolved)
    .bind(comment.resolved_by)
    .bind(comment.resolved_at)
    .execute(pool)
    .instrument(info_span!("relay.db.query", query = "update_comment"))
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

pub(super) async fn comment_pg(pool: &PgPool, comment_id: Uuid) -> Result<Option<Comment>, LogError> {
    let row = sqlx::query_as::<_, CommentRow>(&format!(
        "SELECT {COMMENT_COLUMNS} FROM collab_comments WHERE comment_id = $1"
    ))
    .bind(comment_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "load_comment"))
    .await
    .map_err(map_sqlx_error)?;

    row.map(TryInto::try_into).transpose()
}

pub(super) async fn comments_for_room_pg(pool: &PgPool, room_id: Uuid) -> Result<Vec<Comment>, LogError> {
    let rows = sqlx::query_as::<_, CommentRow>(&format!(
        "SELECT {COMMENT_COLUMNS} FROM collab_comments \
         WHERE room_id = $1 \
         ORDER BY created_at ASC, thread_id ASC, position ASC"
    ))
    .bind(room_id)
    .fetch_all(pool)
    .instrument(info_span!("relay.db.query", query = "comments_for_room"))
    .await
    .map_err(map_sqlx_error)?;

    rows.into_iter().map(TryInto::try_into).collect()
}

pub(super) async fn next_comment_position_pg(pool: &PgPool, thread_id: Uuid) -> Result<i64, LogError> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(position), 0) + 1 FROM collab_comments WHERE thread_id = $1",
    )
    .bind(thread_id)
    .fetch_one(pool)
    .instrument(info_span!("relay.db.query", query = "next_comment_position"))
    .await
    .map_err(map_sqlx_error)
}
