// Room registry: lazily hydrates rooms from the log, hands out shared
// handles, and evicts idle rooms.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use formcollab_common::clock::VectorClock;
use formcollab_common::document::FormDocument;
use formcollab_common::path::TargetPath;
use formcollab_common::protocol::ws::ServerMessage;
use formcollab_common::types::{
    Comment, ConflictStrategy, Cursor, Identity, Operation, OperationKind, ParticipantSnapshot,
    SYSTEM_PARTICIPANT_ID,
};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::room::{JoinOutcome, Room};
use super::{ConnectionId, RoomError};
use crate::config::RoomSettings;
use crate::idempotency::IdempotencyStore;
use crate::log::{LogStore, RoomRecord};
use crate::metrics;
use crate::notify::{default_notifier, MentionNotifier};
use crate::sync::snapshot::{DocumentStore, InMemoryDocumentStore, SnapshotScheduler, SnapshotTrigger};

/// Everything a room needs from the outside world.
#[derive(Clone)]
pub struct RoomDeps {
    pub log: LogStore,
    pub documents: Arc<dyn DocumentStore>,
    pub idempotency: IdempotencyStore,
    pub snapshots: SnapshotScheduler,
    pub notifier: Arc<dyn MentionNotifier>,
    pub settings: RoomSettings,
}

impl RoomDeps {
    /// In-memory log and document store, snapshots disabled.
    pub fn in_memory(settings: RoomSettings) -> Self {
        Self {
            log: LogStore::in_memory(),
            documents: Arc::new(InMemoryDocumentStore::new()),
            idempotency: IdempotencyStore::new(),
            snapshots: SnapshotScheduler::disabled(),
            notifier: default_notifier(),
            settings,
        }
    }

    pub fn with_documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotScheduler) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn MentionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub identity: Identity,
    pub display_name: String,
    /// Only honored when the join creates the room.
    pub conflict_strategy: Option<ConflictStrategy>,
    pub last_sequence: Option<i64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub finalized_disconnects: usize,
    pub evicted_rooms: Vec<Uuid>,
    pub expired_idempotency_entries: usize,
}

#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    hydrate_lock: Mutex<()>,
    deps: RoomDeps,
}

impl RoomRegistry {
    pub fn new(deps: RoomDeps) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: RwLock::new(HashMap::new()),
                hydrate_lock: Mutex::new(()),
                deps,
            }),
        }
    }

    pub fn deps(&self) -> &RoomDeps {
        &self.inner.deps
    }

    /// Live room handle, if the room is currently in memory.
    pub async fn room(&self, room_id: Uuid) -> Option<Arc<Room>> {
        self.inner.rooms.read().await.get(&room_id).filter(|room| !room.is_closed()).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    /// Returns the live room, hydrating it from the log when needed.
    pub async fn open_room(
        &self,
        room_id: Uuid,
        requested_strategy: Option<ConflictStrategy>,
    ) -> Result<Arc<Room>, RoomError> {
        if let Some(room) = self.room(room_id).await {
            return Ok(room);
        }

        let _hydrating = self.inner.hydrate_lock.lock().await;
        if let Some(room) = self.room(room_id).await {
            return Ok(room);
        }

        let deps = &self.inner.deps;
        async {
            let now = Utc::now();
            let strategy = requested_strategy.unwrap_or(deps.settings.default_strategy);
            let record = deps.log.ensure_room(room_id, strategy, now).await?;

            let mut operations = deps.log.read_since(room_id, 0).await?;
            if operations.is_empty() {
                if let Some(seed) = self.seed_operation(room_id, now).await? {
                    deps.log.append(&seed, &[]).await?;
                    operations.push(seed);
                }
            }

            let participants_seen = deps.log.load_participants(room_id).await?.len();
            let room = Arc::new(Room::new(record, operations, participants_seen, deps.clone(), now)?);
            self.inner.rooms.write().await.insert(room_id, Arc::clone(&room));
            let head_sequence = room.head_sequence().await;
            info!(strategy = room.strategy().as_str(), head_sequence, "room hydrated");
            self.refresh_gauges().await;
            Ok::<_, RoomError>(room)
        }
        .instrument(info_span!("relay.registry.hydrate", room_id = %room_id))
        .await
    }

    /// Root insert by the system participant carrying the stored document,
    /// so replaying the log reproduces it.
    async fn seed_operation(&self, room_id: Uuid, now: DateTime<Utc>) -> Result<Option<Operation>, RoomError> {
        let Some(document) = self.inner.deps.documents.load_document(room_id).await? else {
            return Ok(None);
        };
        if !document.is_object() {
            warn!(room_id = %room_id, "stored document is not an object, starting empty");
            return Ok(None);
        }
        if FormDocument::from_value(document.clone()).is_empty() {
            return Ok(None);
        }

        debug!(room_id = %room_id, "seeding room log from document store");
        Ok(Some(Operation {
            idempotency_id: Uuid::new_v4(),
            room_id,
            kind: OperationKind::InsertField,
            target_path: TargetPath::root(),
            previous_value: None,
            new_value: Some(document.clone()),
            final_value: Some(document),
            participant_id: SYSTEM_PARTICIPANT_ID,
            sequence_number: 1,
            vector_clock: VectorClock::from_entries([(SYSTEM_PARTICIPANT_ID, 1)]),
            timestamp: now,
        }))
    }

    /// Joins a room, creating or reopening it. A room that closes between
    /// lookup and join is reopened once.
    pub async fn join(
        &self,
        room_id: Uuid,
        request: JoinRequest,
        sender: Option<mpsc::UnboundedSender<ServerMessage>>,
    ) -> Result<(Arc<Room>, JoinOutcome), RoomError> {
        for _ in 0..2 {
            let room = self.open_room(room_id, request.conflict_strategy).await?;
            match room.join(request.clone(), sender.clone()).await {
                Err(RoomError::RoomClosed(_)) => {
                    self.forget(&room).await;
                }
                result => {
                    self.refresh_gauges().await;
                    return result.map(|outcome| (room, outcome));
                }
            }
        }
        Err(RoomError::RoomClosed(room_id))
    }

    pub async fn leave(
        &self,
        room_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Option<ParticipantSnapshot>, RoomError> {
        let room = self.room(room_id).await.ok_or(RoomError::UnknownRoom(room_id))?;
        let left = room.leave(participant_id).await;
        self.refresh_gauges().await;
        Ok(left)
    }

    /// Transport drop for one connection.
    pub async fn disconnect(&self, room_id: Uuid, participant_id: Uuid, connection_id: ConnectionId) {
        if let Some(room) = self.room(room_id).await {
            room.disconnect(participant_id, connection_id).await;
            self.refresh_gauges().await;
        }
    }

    pub async fn update_presence(
        &self,
        room_id: Uuid,
        participant_id: Uuid,
        cursor: Option<Cursor>,
        active_field: Option<TargetPath>,
    ) -> Option<u64> {
        let room = self.room(room_id).await?;
        room.update_presence(participant_id, cursor, active_field).await
    }

    /// Explicit termination. Returns false when the room was not live.
    pub async fn close_room(&self, room_id: Uuid) -> Result<bool, RoomError> {
        let Some(room) = self.room(room_id).await else {
            return Ok(false);
        };
        let closed = room.close(Utc::now()).await?;
        self.forget(&room).await;
        self.refresh_gauges().await;
        Ok(closed)
    }

    /// Finalizes expired disconnects, evicts idle rooms and expired
    /// idempotency entries.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let rooms: Vec<Arc<Room>> = self.inner.rooms.read().await.values().cloned().collect();

        for room in rooms {
            report.finalized_disconnects += room.finalize_disconnects(now).await;
            match room.evict_if_idle(now).await {
                Ok(true) => {
                    self.forget(&room).await;
                    report.evicted_rooms.push(room.room_id());
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(room_id = %room.room_id(), error = ?error, "failed to evict idle room");
                }
            }
        }

        report.expired_idempotency_entries = self.inner.deps.idempotency.evict_expired().await;
        if !report.evicted_rooms.is_empty() || report.finalized_disconnects > 0 {
            debug!(
                evicted = report.evicted_rooms.len(),
                finalized = report.finalized_disconnects,
                "registry sweep"
            );
        }
        self.refresh_gauges().await;
        report
    }

    /// Runs `sweep` on a fixed interval until the task is aborted.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.reset();
            loop {
                ticker.tick().await;
                registry.sweep(Utc::now()).await;
            }
        })
    }

    /// Schedules a snapshot of every live room. Returns how many were queued.
    pub async fn snapshot_all(&self, trigger: SnapshotTrigger) -> usize {
        let rooms: Vec<Arc<Room>> = self.inner.rooms.read().await.values().cloned().collect();
        let mut scheduled = 0;
        for room in rooms {
            if room.snapshot(trigger).await {
                scheduled += 1;
            }
        }
        scheduled
    }

    pub async fn room_record(&self, room_id: Uuid) -> Result<Option<RoomRecord>, RoomError> {
        Ok(self.inner.deps.log.load_room(room_id).await?)
    }

    async fn require_record(&self, room_id: Uuid) -> Result<RoomRecord, RoomError> {
        self.room_record(room_id).await?.ok_or(RoomError::UnknownRoom(room_id))
    }

    /// Accepted operations after `since`, from the log.
    pub async fn read_since(&self, room_id: Uuid, since: i64) -> Result<Vec<Operation>, RoomError> {
        self.require_record(room_id).await?;
        Ok(self.inner.deps.log.read_since(room_id, since).await?)
    }

    /// Head sequence and materialized document. Rooms not in memory are
    /// replayed from the log.
    pub async fn document(&self, room_id: Uuid) -> Result<(i64, Value), RoomError> {
        if let Some(room) = self.room(room_id).await {
            return Ok(room.document().await);
        }
        self.require_record(room_id).await?;
        let operations = self.inner.deps.log.read_since(room_id, 0).await?;
        let head = operations.last().map_or(0, |operation| operation.sequence_number);
        let document = FormDocument::replay(&operations)
            .map_err(|error| anyhow::anyhow!("log replay failed for room {room_id}: {error}"))?;
        Ok((head, document.into_value()))
    }

    pub async fn participants(&self, room_id: Uuid) -> Result<Vec<ParticipantSnapshot>, RoomError> {
        if let Some(room) = self.room(room_id).await {
            return Ok(room.active_participants().await);
        }
        self.require_record(room_id).await?;
        Ok(Vec::new())
    }

    pub async fn comments(&self, room_id: Uuid) -> Result<Vec<Comment>, RoomError> {
        self.require_record(room_id).await?;
        Ok(self.inner.deps.log.comments_for_room(room_id).await?)
    }

    /// Drops the map entry if it still points at `room`.
    async fn forget(&self, room: &Arc<Room>) {
        let room_id = room.room_id();
        {
            let mut rooms = self.inner.rooms.write().await;
            if rooms.get(&room_id).is_some_and(|current| Arc::ptr_eq(current, room)) {
                rooms.remove(&room_id);
            }
        }
        self.inner.deps.idempotency.forget_room(room_id).await;
    }

    async fn refresh_gauges(&self) {
        let rooms: Vec<Arc<Room>> = self.inner.rooms.read().await.values().cloned().collect();
        let mut participants = 0usize;
        for room in &rooms {
            participants += room.active_count().await;
        }
        metrics::set_active_rooms(i64::try_from(rooms.len()).unwrap_or(i64::MAX));
        metrics::set_active_participants(i64::try_from(participants).unwrap_or(i64::MAX));
    }
}
