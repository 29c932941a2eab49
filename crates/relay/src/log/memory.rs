use std::collections::HashMap;

use chrono::{DateTime, Utc};
use formcollab_common::types::{Comment, ConflictStrategy, Operation, ParticipantSnapshot};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{LogError, LoggedOperation, RoomRecord};

#[derive(Debug, Default)]
pub struct MemoryLog {
    pub(super) rooms: HashMap<Uuid, RoomRecord>,
    pub(super) operations: HashMap<Uuid, Vec<Operation>>,
    /// Keyed by room and idempotency id.
    pub(super) superseded: HashMap<(Uuid, Uuid), Vec<i64>>,
    pub(super) participants: HashMap<Uuid, ParticipantSnapshot>,
    pub(super) comments: HashMap<Uuid, Comment>,
}

pub(super) async fn ensure_room_mem(
    store: &RwLock<MemoryLog>,
    room_id: Uuid,
    strategy: ConflictStrategy,
    now: DateTime<Utc>,
) -> Result<RoomRecord, LogError> {
    let mut store = store.write().await;
    let record = store.rooms.entry(room_id).or_insert_with(|| RoomRecord {
        room_id,
        strategy,
        created_at: now,
        closed_at: None,
    });
    record.closed_at = None;
    Ok(record.clone())
}

pub(super) async fn mark_room_closed_mem(
    store: &RwLock<MemoryLog>,
    room_id: Uuid,
    closed_at: DateTime<Utc>,
) -> Result<(), LogError> {
    let mut store = store.write().await;
    let record = store.rooms.get_mut(&room_id).ok_or(LogError::UnknownRoom(room_id))?;
    record.closed_at = Some(closed_at);
    Ok(())
}

pub(super) async fn append_mem(
    store: &RwLock<MemoryLog>,
    operation: &Operation,
    superseded: &[i64],
) -> Result<(), LogError> {
    let mut store = store.write().await;
    if !store.rooms.contains_key(&operation.room_id) {
        return Err(LogError::UnknownRoom(operation.room_id));
    }

    let log = store.operations.entry(operation.room_id).or_default();
    if log.iter().any(|existing| existing.idempotency_id == operation.idempotency_id) {
        return Err(LogError::DuplicateIdempotency(operation.idempotency_id));
    }

    let expected = log.last().map(|last| last.sequence_number).unwrap_or(0) + 1;
    if operation.sequence_number != expected {
        return Err(LogError::SequenceGap {
            room_id: operation.room_id,
            expected,
            actual: operation.sequence_number,
        });
    }

    log.push(operation.clone());
    store
        .superseded
        .insert((operation.room_id, operation.idempotency_id), superseded.to_vec());
    Ok(())
}

pub(super) fn operation_by_idempotency_mem(
    store: &MemoryLog,
    room_id: Uuid,
    idempotency_id: Uuid,
) -> Option<LoggedOperation> {
    let operation = store
        .operations
        .get(&room_id)?
        .iter()
        .find(|op| op.idempotency_id == idempotency_id)?
        .clone();
    let superseded = store.superseded.get(&(room_id, idempotency_id)).cloned().unwrap_or_default();
    Some(LoggedOperation { operation, superseded })
}

pub(super) fn read_since_mem(store: &MemoryLog, room_id: Uuid, since: i64) -> Vec<Operation> {
    let Some(log) = store.operations.get(&room_id) else {
        return Vec::new();
    };
    // Sequence numbers start at 1 and are dense, so the offset is direct.
    let start = usize::try_from(since.max(0)).unwrap_or(usize::MAX).min(log.len());
    log[start..].to_vec()
}

pub(super) fn head_sequence_mem(store: &MemoryLog, room_id: Uuid) -> i64 {
    store
        .operations
        .get(&room_id)
        .and_then(|log| log.last())
        .map(|last| last.sequence_number)
        .unwrap_or(0)
}

pub(super) fn load_participants_mem(store: &MemoryLog, room_id: Uuid) -> Vec<ParticipantSnapshot> {
    let mut participants: Vec<_> =
        store.participants.values().filter(|p| p.room_id == room_id).cloned().collect();
    participants.sort_by(|left, right| {
        left.joined_at.cmp(&right.joined_at).then_with(|| left.participant_id.cmp(&right.participant_id))
    });
    participants
}

pub(super) fn comments_for_room_mem(store: &MemoryLog, room_id: Uuid) -> Vec<Comment> {
    let mut comments: Vec<_> =
        store.comments.values().filter(|c| c.room_id == room_id).cloned().collect();
    comments.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.thread_id.cmp(&right.thread_id))
            .then_with(|| left.position.cmp(&right.position))
    });
    comments
}
