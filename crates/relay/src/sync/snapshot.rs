// Snapshot persistence: policy, job queue, and the background worker that
// writes room documents to the document store.
//
// Jobs come from three places: the snapshot policy after an accepted
// operation, explicit `save` requests, and room eviction. Failed writes are
// retried with exponential backoff up to a bounded number of attempts, then
// logged and counted. Clients never see snapshot failures.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::metrics;

pub const SNAPSHOT_INTERVAL_UPDATES: i64 = 100;
pub const SNAPSHOT_INTERVAL_SECS: u64 = 600;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub interval_updates: i64,
    pub interval: Duration,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            interval_updates: SNAPSHOT_INTERVAL_UPDATES,
            interval: Duration::from_secs(SNAPSHOT_INTERVAL_SECS),
        }
    }
}

impl SnapshotPolicy {
    pub fn should_snapshot(
        &self,
        last_snapshot_seq: i64,
        current_seq: i64,
        last_snapshot_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if current_seq <= last_snapshot_seq {
            return false;
        }

        let updates_since_snapshot = current_seq.saturating_sub(last_snapshot_seq);
        if updates_since_snapshot >= self.interval_updates {
            return true;
        }

        let Some(interval) = ChronoDuration::from_std(self.interval).ok() else {
            return false;
        };

        now.signed_duration_since(last_snapshot_at) >= interval
    }
}

/// Exponential backoff for snapshot retries (0-based attempt).
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = attempt.min(7);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(MAX_RETRY_DELAY_MS);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exp).min(MAX_RETRY_DELAY_MS))
}

// ── Document store ──────────────────────────────────────────────────

pub type DocumentStoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Where room documents live outside the relay.
pub trait DocumentStore: Send + Sync {
    /// Latest stored state of a form document, if any.
    fn load_document(&self, room_id: Uuid) -> DocumentStoreFuture<'_, Option<Value>>;

    fn save_snapshot<'a>(
        &'a self,
        room_id: Uuid,
        sequence_number: i64,
        document: &'a Value,
    ) -> DocumentStoreFuture<'a, ()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub sequence_number: i64,
    pub document: Value,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    snapshots: Arc<RwLock<HashMap<Uuid, StoredSnapshot>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates a document, as if written by the form service.
    pub async fn seed(&self, room_id: Uuid, document: Value) {
        self.snapshots
            .write()
            .await
            .insert(room_id, StoredSnapshot { sequence_number: 0, document });
    }

    pub async fn latest(&self, room_id: Uuid) -> Option<StoredSnapshot> {
        self.snapshots.read().await.get(&room_id).cloned()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn load_document(&self, room_id: Uuid) -> DocumentStoreFuture<'_, Option<Value>> {
        Box::pin(async move {
            Ok::<_, anyhow::Error>(self.latest(room_id).await.map(|snapshot| snapshot.document))
        })
    }

    fn save_snapshot<'a>(
        &'a self,
        room_id: Uuid,
        sequence_number: i64,
        document: &'a Value,
    ) -> DocumentStoreFuture<'a, ()> {
        Box::pin(async move {
            let mut guard = self.snapshots.write().await;
            let stale = guard
                .get(&room_id)
                .is_some_and(|existing| existing.sequence_number > sequence_number);
            if !stale {
                guard.insert(room_id, StoredSnapshot { sequence_number, document: document.clone() });
            }
            Ok::<_, anyhow::Error>(())
        })
    }
}

/// Snapshots in the relay's own `collab_snapshots` table.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotDocumentRow {
    document: Json<Value>,
}

impl DocumentStore for PgDocumentStore {
    fn load_document(&self, room_id: Uuid) -> DocumentStoreFuture<'_, Option<Value>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, SnapshotDocumentRow>(
                "
                SELECT document
                FROM collab_snapshots
                WHERE room_id = $1
                ORDER BY sequence_number DESC
                LIMIT 1
                ",
            )
            .bind(room_id)
            .fetch_optional(&self.pool)
            .instrument(info_span!("relay.db.query", query = "fetch_latest_snapshot"))
            .await
            .context("failed to fetch latest room snapshot")?;
            Ok::<_, anyhow::Error>(row.map(|row| row.document.0))
        })
    }

    fn save_snapshot<'a>(
        &'a self,
        room_id: Uuid,
        sequence_number: i64,
        document: &'a Value,
    ) -> DocumentStoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                "
                INSERT INTO collab_snapshots (room_id, sequence_number, document, created_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (room_id, sequence_number) DO NOTHING
                ",
            )
            .bind(room_id)
            .bind(sequence_number)
            .bind(Json(document))
            .execute(&self.pool)
            .instrument(info_span!("relay.db.query", query = "insert_collab_snapshot"))
            .await
            .context("failed to persist room snapshot")?;
            Ok::<_, anyhow::Error>(())
        })
    }
}

// ── Jobs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTrigger {
    Policy,
    Requested,
    Eviction,
}

impl SnapshotTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Requested => "requested",
            Self::Eviction => "eviction",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotJob {
    pub room_id: Uuid,
    pub sequence_number: i64,
    pub document: Value,
    pub trigger: SnapshotTrigger,
}

/// Sending half of the snapshot queue. Cloned into every room.
#[derive(Debug, Clone)]
pub struct SnapshotScheduler {
    sender: Option<mpsc::UnboundedSender<SnapshotJob>>,
}

impl SnapshotScheduler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SnapshotJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender: Some(sender) }, receiver)
    }

    /// A scheduler that drops every job.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Queues a job. Returns false when no worker is listening.
    pub fn schedule(&self, job: SnapshotJob) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        let room_id = job.room_id;
        let trigger = job.trigger;
        match sender.send(job) {
            Ok(()) => {
                debug!(room_id = %room_id, trigger = trigger.as_str(), "snapshot scheduled");
                true
            }
            Err(_) => {
                warn!(room_id = %room_id, "snapshot worker is gone, dropping job");
                false
            }
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────

pub struct SnapshotWorker {
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
    retry_base: Duration,
}

impl SnapshotWorker {
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: u32, retry_base: Duration) -> Self {
        Self { store, max_attempts: max_attempts.max(1), retry_base }
    }

    /// Drains the queue until every scheduler clone is dropped.
    pub fn spawn(self, mut receiver: mpsc::UnboundedReceiver<SnapshotJob>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                self.persist(job).await;
            }
            debug!("snapshot worker stopped");
        })
    }

    /// Writes one job, retrying with backoff. Returns whether it landed.
    pub async fn persist(&self, job: SnapshotJob) -> bool {
        let span = info_span!(
            "relay.snapshot.persist",
            room_id = %job.room_id,
            sequence_number = job.sequence_number,
            trigger = job.trigger.as_str()
        );
        async {
            for attempt in 0..self.max_attempts {
                match self.store.save_snapshot(job.room_id, job.sequence_number, &job.document).await {
                    Ok(()) => return true,
                    Err(error) => {
                        warn!(attempt = attempt + 1, error = ?error, "snapshot write failed");
                        if attempt + 1 < self.max_attempts {
                            tokio::time::sleep(backoff_delay(attempt, self.retry_base)).await;
                        }
                    }
                }
            }
            error!(attempts = self.max_attempts, "giving up on room snapshot");
            metrics::increment_snapshot_failures();
            false
        }
        .instrument(span)
        .await
    }
}
