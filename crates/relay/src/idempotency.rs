// Idempotency cache for submitted operations.
//
// Keyed by (room, idempotency id). A resubmission with the same payload
// replays the cached outcome; the same id with a different payload is a
// mismatch. Entries expire after the TTL; accepted operations stay
// recoverable from the log afterwards.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use formcollab_common::path::TargetPath;
use formcollab_common::types::OperationKind;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::rooms::SubmitOutcome;

/// Default TTL for cached idempotency entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    entries: Arc<RwLock<HashMap<(Uuid, Uuid), IdempotencyEntry>>>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct IdempotencyEntry {
    /// SHA-256 of the operation payload.
    payload_hash: String,
    outcome: SubmitOutcome,
    created_at: Instant,
}

#[derive(Debug, Clone)]
pub enum IdempotencyLookup {
    Miss,
    Replay(SubmitOutcome),
    Mismatch,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), ttl: DEFAULT_TTL }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn lookup(&self, room_id: Uuid, idempotency_id: Uuid, payload_hash: &str) -> IdempotencyLookup {
        let guard = self.entries.read().await;
        match guard.get(&(room_id, idempotency_id)) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                if entry.payload_hash == payload_hash {
                    IdempotencyLookup::Replay(entry.outcome.clone())
                } else {
                    IdempotencyLookup::Mismatch
                }
            }
            _ => IdempotencyLookup::Miss,
        }
    }

    pub async fn insert(
        &self,
        room_id: Uuid,
        idempotency_id: Uuid,
        payload_hash: String,
        outcome: SubmitOutcome,
    ) {
        let mut guard = self.entries.write().await;
        guard.insert(
            (room_id, idempotency_id),
            IdempotencyEntry { payload_hash, outcome, created_at: Instant::now() },
        );
    }

    /// Drops every entry of a room, e.g. when it is evicted.
    pub async fn forget_room(&self, room_id: Uuid) {
        self.entries.write().await.retain(|(entry_room, _), _| *entry_room != room_id);
    }

    /// Remove expired entries. Called from the registry sweep.
    pub async fn evict_expired(&self) -> usize {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        before - guard.len()
    }

    /// Number of cached entries (including potentially expired).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Hash of the parts of a submission that must match on replay. The client
/// clock is excluded so a retry after observing more operations still replays.
pub fn hash_payload(kind: OperationKind, target_path: &TargetPath, new_value: Option<&Value>) -> String {
    let canonical = json!({
        "kind": kind.as_str(),
        "target_path": target_path.to_string(),
        "new_value": new_value,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use formcollab_common::clock::VectorClock;
    use formcollab_common::types::{ProposedOperation, RejectReason};

    use super::*;

    fn path(raw: &str) -> TargetPath {
        TargetPath::parse(raw).expect("path should parse")
    }

    fn rejected(idempotency_id: Uuid) -> SubmitOutcome {
        SubmitOutcome::Rejected {
            proposal: ProposedOperation {
                idempotency_id,
                kind: OperationKind::UpdateField,
                target_path: path("f1.label"),
                new_value: Some(json!("x")),
                client_vector_clock: VectorClock::new(),
            },
            reason: RejectReason::TargetMissing,
            detail: "target missing: f1.label".to_string(),
            current_value: None,
        }
    }

    #[tokio::test]
    async fn replay_requires_matching_payload() {
        let store = IdempotencyStore::new();
        let room_id = Uuid::new_v4();
        let idempotency_id = Uuid::new_v4();
        let hash = hash_payload(OperationKind::UpdateField, &path("f1.label"), Some(&json!("x")));

        assert!(matches!(store.lookup(room_id, idempotency_id, &hash).await, IdempotencyLookup::Miss));
        store.insert(room_id, idempotency_id, hash.clone(), rejected(idempotency_id)).await;

        assert!(matches!(
            store.lookup(room_id, idempotency_id, &hash).await,
            IdempotencyLookup::Replay(SubmitOutcome::Rejected { reason: RejectReason::TargetMissing, .. })
        ));

        let other = hash_payload(OperationKind::UpdateField, &path("f1.label"), Some(&json!("y")));
        assert!(matches!(
            store.lookup(room_id, idempotency_id, &other).await,
            IdempotencyLookup::Mismatch
        ));

        assert!(matches!(
            store.lookup(Uuid::new_v4(), idempotency_id, &hash).await,
            IdempotencyLookup::Miss
        ));
    }

    #[tokio::test]
    async fn expired_entries_are_evicted() {
        let store = IdempotencyStore::new().with_ttl(Duration::from_millis(1));
        let room_id = Uuid::new_v4();
        let idempotency_id = Uuid::new_v4();
        store.insert(room_id, idempotency_id, "h".to_string(), rejected(idempotency_id)).await;
        assert_eq!(store.len().await, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(store.lookup(room_id, idempotency_id, "h").await, IdempotencyLookup::Miss));
        assert_eq!(store.evict_expired().await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn forget_room_only_drops_that_room() {
        let store = IdempotencyStore::new();
        let kept = Uuid::new_v4();
        let dropped = Uuid::new_v4();
        store.insert(kept, Uuid::new_v4(), "a".to_string(), rejected(Uuid::new_v4())).await;
        store.insert(dropped, Uuid::new_v4(), "b".to_string(), rejected(Uuid::new_v4())).await;

        store.forget_room(dropped).await;
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn payload_hash_covers_kind_path_and_value() {
        let a = hash_payload(OperationKind::UpdateField, &path("f1.label"), Some(&json!("x")));
        assert_eq!(a, hash_payload(OperationKind::UpdateField, &path("f1.label"), Some(&json!("x"))));
        assert_ne!(a, hash_payload(OperationKind::UpdateSetting, &path("f1.label"), Some(&json!("x"))));
        assert_ne!(a, hash_payload(OperationKind::UpdateField, &path("f2.label"), Some(&json!("x"))));
        assert_ne!(a, hash_payload(OperationKind::UpdateField, &path("f1.label"), None));
    }
}
