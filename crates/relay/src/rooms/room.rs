// One collaborative room.
//
// Lock order: `state` (sequencing) before `presence`. Presence updates and
// comment threads never take `state`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use formcollab_common::clock::VectorClock;
use formcollab_common::document::FormDocument;
use formcollab_common::path::{Segment, TargetPath};
use formcollab_common::protocol::ws::ServerMessage;
use formcollab_common::types::{
    Comment, ConflictStrategy, ConflictVariant, Cursor, Operation, OperationKind,
    ParticipantSnapshot, PendingConflict, ProposedOperation, RejectReason, RoomSnapshot,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::broadcast::{Broadcaster, ConnectionId};
use super::participants::AccessPolicy;
use super::presence::PresenceTable;
use super::registry::{JoinRequest, RoomDeps};
use super::targets::TargetIndex;
use super::{reject_reason, RoomError, SubmitOutcome};
use crate::idempotency::{hash_payload, IdempotencyLookup};
use crate::log::comments::{self, CommentDraft, CommentError};
use crate::log::RoomRecord;
use crate::metrics;
use crate::sync::resolver::{self, Candidate, Resolution};
use crate::sync::sequencer::RoomSequencer;
use crate::sync::snapshot::{SnapshotJob, SnapshotTrigger};

/// Who submitted an operation, and over which connection to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub participant_id: Uuid,
    pub connection_id: Option<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant: ParticipantSnapshot,
    pub connection_id: Option<ConnectionId>,
    pub newly_active: bool,
}

struct RoomState {
    document: FormDocument,
    sequencer: RoomSequencer,
    targets: TargetIndex,
    pending: Vec<PendingConflict>,
    last_snapshot_seq: i64,
    last_snapshot_at: DateTime<Utc>,
}

pub struct Room {
    room_id: Uuid,
    strategy: ConflictStrategy,
    created_at: DateTime<Utc>,
    deps: RoomDeps,
    state: Mutex<RoomState>,
    presence: RwLock<PresenceTable>,
    comment_threads: Mutex<()>,
    broadcaster: Broadcaster,
    closed: AtomicBool,
}

impl Room {
    /// Builds a room from its record and full log.
    pub fn new(
        record: RoomRecord,
        operations: Vec<Operation>,
        participants_seen: usize,
        deps: RoomDeps,
        now: DateTime<Utc>,
    ) -> Result<Self, RoomError> {
        let room_id = record.room_id;
        let document = FormDocument::replay(&operations)
            .map_err(|error| anyhow!("log replay failed for room {room_id}: {error}"))?;
        let sequencer = RoomSequencer::hydrate(room_id, &operations)?;
        let targets = TargetIndex::replay(&operations);

        let mut presence = PresenceTable::new(room_id, AccessPolicy::new(deps.settings.guest_can_edit))
            .with_join_count(participants_seen);
        presence.mark_idle(now);

        Ok(Self {
            room_id,
            strategy: record.strategy,
            created_at: record.created_at,
            state: Mutex::new(RoomState {
                document,
                sequencer,
                targets,
                pending: Vec::new(),
                last_snapshot_seq: 0,
                last_snapshot_at: now,
            }),
            presence: RwLock::new(presence),
            comment_threads: Mutex::new(()),
            broadcaster: Broadcaster::new(),
            closed: AtomicBool::new(false),
            deps,
        })
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn head_sequence(&self) -> i64 {
        self.state.lock().await.sequencer.head()
    }

    pub async fn document(&self) -> (i64, Value) {
        let state = self.state.lock().await;
        (state.sequencer.head(), state.document.as_value().clone())
    }

    pub async fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.state.lock().await.pending.clone()
    }

    pub async fn active_participants(&self) -> Vec<ParticipantSnapshot> {
        self.presence.read().await.active_participants()
    }

    pub async fn active_count(&self) -> usize {
        self.presence.read().await.active_count()
    }

    pub async fn participant(&self, participant_id: Uuid) -> Option<ParticipantSnapshot> {
        self.presence.read().await.get(participant_id).cloned()
    }

    fn ensure_open(&self) -> Result<(), RoomError> {
        if self.is_closed() {
            return Err(RoomError::RoomClosed(self.room_id));
        }
        Ok(())
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Registers a participant and, when a sender is given, attaches the
    /// connection and queues `welcome` (plus `sync_response` for a resuming
    /// client) before any later broadcast.
    pub async fn join(
        &self,
        request: JoinRequest,
        sender: Option<mpsc::UnboundedSender<ServerMessage>>,
    ) -> Result<JoinOutcome, RoomError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        self.ensure_open()?;

        let now = Utc::now();
        let joined = self.presence.write().await.join(request.identity, request.display_name, now);
        let participant = joined.participant;
        if let Err(error) = self.deps.log.upsert_participant(&participant).await {
            warn!(participant_id = %participant.participant_id, error = ?error, "failed to persist participant");
        }

        let mut connection_id = None;
        if let Some(sender) = sender {
            let welcome = ServerMessage::Welcome {
                participant: participant.clone(),
                room: self.snapshot_view(&state).await,
            };
            let _ = sender.send(welcome);

            let head = state.sequencer.head();
            if let Some(since) = request.last_sequence.filter(|since| *since < head) {
                metrics::increment_sequence_gap_count();
                let operations = self.deps.log.read_since(self.room_id, since.max(0)).await?;
                let _ = sender.send(ServerMessage::SyncResponse { since, head_sequence: head, operations });
            }
            connection_id = Some(self.broadcaster.attach(participant.participant_id, sender).await);
        }

        if joined.newly_active {
            let message = ServerMessage::ParticipantJoined { participant: participant.clone() };
            self.broadcaster.broadcast(&message, Some(participant.participant_id)).await;
        }
        info!(
            room_id = %self.room_id,
            participant_id = %participant.participant_id,
            newly_active = joined.newly_active,
            "participant joined"
        );

        Ok(JoinOutcome { participant, connection_id, newly_active: joined.newly_active })
    }

    /// Explicit leave: the participant stops receiving broadcasts and its
    /// presence is cleared. Accepted operations stay.
    pub async fn leave(&self, participant_id: Uuid) -> Option<ParticipantSnapshot> {
        let left = self.presence.write().await.leave(participant_id, Utc::now())?;
        self.broadcaster.remove_participant(participant_id).await;
        if let Err(error) = self.deps.log.upsert_participant(&left).await {
            warn!(participant_id = %participant_id, error = ?error, "failed to persist participant leave");
        }
        let message = ServerMessage::ParticipantLeft { participant: left.clone() };
        self.broadcaster.broadcast(&message, Some(participant_id)).await;
        info!(room_id = %self.room_id, participant_id = %participant_id, "participant left");
        Some(left)
    }

    /// Transport drop of one connection. Leaves immediately when the
    /// reconnect grace is zero, otherwise waits for the sweep.
    pub async fn disconnect(&self, participant_id: Uuid, connection_id: ConnectionId) {
        if self.broadcaster.detach(participant_id, connection_id).await > 0 {
            return;
        }
        if self.deps.settings.reconnect_grace.is_zero() {
            self.leave(participant_id).await;
        } else {
            self.presence.write().await.mark_disconnected(participant_id, Utc::now());
        }
    }

    /// Leaves every participant whose reconnect grace ran out.
    pub async fn finalize_disconnects(&self, now: DateTime<Utc>) -> usize {
        let expired =
            self.presence.read().await.expired_disconnects(now, self.deps.settings.reconnect_grace);
        let mut finalized = 0;
        for participant_id in expired {
            // A reconnect may have attached a new connection meanwhile.
            if self.broadcaster.connection_count(participant_id).await > 0 {
                continue;
            }
            if self.leave(participant_id).await.is_some() {
                finalized += 1;
            }
        }
        finalized
    }

    pub async fn update_presence(
        &self,
        participant_id: Uuid,
        cursor: Option<Cursor>,
        active_field: Option<TargetPath>,
    ) -> Option<u64> {
        let presence_seq = self.presence.write().await.update(
            participant_id,
            cursor,
            active_field.clone(),
            Utc::now(),
        )?;
        let message = ServerMessage::PresenceUpdate { participant_id, cursor, active_field, presence_seq };
        self.broadcaster.broadcast(&message, Some(participant_id)).await;
        Some(presence_seq)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Explicit termination. Returns false when already closed.
    pub async fn close(&self, now: DateTime<Utc>) -> Result<bool, RoomError> {
        let mut state = self.state.lock().await;
        self.shut_down(&mut state, now).await
    }

    /// Closes the room only if it is still empty past the idle grace.
    pub async fn evict_if_idle(&self, now: DateTime<Utc>) -> Result<bool, RoomError> {
        let mut state = self.state.lock().await;
        let idle_since = {
            let presence = self.presence.read().await;
            if presence.active_count() > 0 {
                return Ok(false);
            }
            presence.idle_since()
        };
        let grace = chrono::Duration::from_std(self.deps.settings.idle_grace)
            .unwrap_or(chrono::Duration::zero());
        match idle_since {
            Some(since) if now.signed_duration_since(since) >= grace => {
                self.shut_down(&mut state, now).await
            }
            _ => Ok(false),
        }
    }

    async fn shut_down(&self, state: &mut RoomState, now: DateTime<Utc>) -> Result<bool, RoomError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let left: Vec<ParticipantSnapshot> = {
            let mut presence = self.presence.write().await;
            presence
                .active_ids()
                .into_iter()
                .filter_map(|participant_id| presence.leave(participant_id, now))
                .collect()
        };
        for participant in &left {
            if let Err(error) = self.deps.log.upsert_participant(participant).await {
                warn!(participant_id = %participant.participant_id, error = ?error, "failed to persist participant leave");
            }
        }

        self.broadcaster.broadcast(&ServerMessage::RoomClosed { room_id: self.room_id }, None).await;
        self.broadcaster.clear().await;

        if state.sequencer.head() > state.last_snapshot_seq {
            self.schedule_snapshot(state, SnapshotTrigger::Eviction, now);
        }
        self.deps.log.mark_room_closed(self.room_id, now).await?;
        info!(room_id = %self.room_id, participants = left.len(), "room closed");
        Ok(true)
    }

    /// Queues a snapshot of the current document. Returns whether a worker
    /// accepted the job.
    pub async fn snapshot(&self, trigger: SnapshotTrigger) -> bool {
        let mut state = self.state.lock().await;
        self.schedule_snapshot(&mut state, trigger, Utc::now())
    }

    fn schedule_snapshot(&self, state: &mut RoomState, trigger: SnapshotTrigger, now: DateTime<Utc>) -> bool {
        let job = SnapshotJob {
            room_id: self.room_id,
            sequence_number: state.sequencer.head(),
            document: state.document.as_value().clone(),
            trigger,
        };
        state.last_snapshot_seq = state.sequencer.head();
        state.last_snapshot_at = now;
        self.deps.snapshots.schedule(job)
    }

    pub async fn room_snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().await;
        self.snapshot_view(&state).await
    }

    async fn snapshot_view(&self, state: &RoomState) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id,
            strategy: self.strategy,
            head_sequence: state.sequencer.head(),
            document: state.document.as_value().clone(),
            participants: self.presence.read().await.active_participants(),
            pending_conflicts: state.pending.clone(),
            created_at: self.created_at,
        }
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Sequences one proposed operation. Every outcome is also delivered to
    /// the origin connection; accepted operations and opened conflicts are
    /// broadcast to the other participants while the sequencing lock is held.
    pub async fn submit(
        &self,
        origin: Origin,
        proposal: ProposedOperation,
    ) -> Result<SubmitOutcome, RoomError> {
        let span = info_span!(
            "relay.room.submit",
            room_id = %self.room_id,
            participant_id = %origin.participant_id,
            kind = proposal.kind.as_str(),
            target_path = %proposal.target_path
        );
        async move {
            let started_at = Instant::now();
            let mut state = self.state.lock().await;
            self.ensure_open()?;

            let payload_hash =
                hash_payload(proposal.kind, &proposal.target_path, proposal.new_value.as_ref());
            match self
                .deps
                .idempotency
                .lookup(self.room_id, proposal.idempotency_id, &payload_hash)
                .await
            {
                IdempotencyLookup::Replay(outcome) => {
                    metrics::increment_duplicate_submissions();
                    self.deliver(origin, &outcome).await;
                    return Ok(outcome);
                }
                IdempotencyLookup::Mismatch => {
                    let outcome = self.reject(
                        &state,
                        proposal,
                        RejectReason::IdempotencyMismatch,
                        "idempotency id was already used with a different payload".to_string(),
                    );
                    self.deliver(origin, &outcome).await;
                    return Ok(outcome);
                }
                IdempotencyLookup::Miss => {}
            }

            // The cache may have expired; the log still knows accepted ids.
            if let Some(logged) =
                self.deps.log.operation_by_idempotency(self.room_id, proposal.idempotency_id).await?
            {
                metrics::increment_duplicate_submissions();
                let operation = &logged.operation;
                let logged_hash =
                    hash_payload(operation.kind, &operation.target_path, operation.new_value.as_ref());
                let outcome = if logged_hash == payload_hash {
                    SubmitOutcome::Accepted { operation: logged.operation, superseded: logged.superseded }
                } else {
                    self.reject(
                        &state,
                        proposal,
                        RejectReason::IdempotencyMismatch,
                        "idempotency id was already used with a different payload".to_string(),
                    )
                };
                self.deliver(origin, &outcome).await;
                return Ok(outcome);
            }

            let idempotency_id = proposal.idempotency_id;
            let outcome = self.sequence(&mut state, origin, proposal).await?;
            match &outcome {
                SubmitOutcome::Accepted { operation, .. } => {
                    metrics::increment_operations_accepted();
                    metrics::observe_operation_ack_latency_ms(
                        u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    );
                    debug!(sequence_number = operation.sequence_number, "operation accepted");
                }
                SubmitOutcome::Rejected { reason, .. } => {
                    self.deliver(origin, &outcome).await;
                    debug!(reason = reason.as_str(), "operation rejected");
                }
                SubmitOutcome::Pending { conflict } => {
                    debug!(conflict_id = %conflict.conflict_id, "operation parked for manual resolution");
                }
            }
            self.deps
                .idempotency
                .insert(self.room_id, idempotency_id, payload_hash, outcome.clone())
                .await;
            Ok::<_, RoomError>(outcome)
        }
        .instrument(span)
        .await
    }

    /// Steps after the idempotency check. Nothing is committed unless the
    /// operation is accepted and durably logged.
    async fn sequence(
        &self,
        state: &mut RoomState,
        origin: Origin,
        proposal: ProposedOperation,
    ) -> Result<SubmitOutcome, RoomError> {
        let participant_id = origin.participant_id;
        let can_edit = {
            let mut presence = self.presence.write().await;
            let can_edit = presence
                .active(participant_id)
                .map(|participant| participant.can_edit)
                .ok_or(RoomError::UnknownParticipant(participant_id))?;
            presence.touch(participant_id, Utc::now());
            can_edit
        };
        if !can_edit {
            return Ok(self.reject(
                state,
                proposal,
                RejectReason::PermissionDenied,
                "participant may not edit this room".to_string(),
            ));
        }

        if state.pending.iter().any(|conflict| conflict.target_path == proposal.target_path) {
            let detail = format!("{} awaits manual conflict resolution", proposal.target_path);
            return Ok(self.reject(state, proposal, RejectReason::PendingManualResolution, detail));
        }

        if let Err(error) =
            state.document.check(proposal.kind, &proposal.target_path, proposal.new_value.as_ref())
        {
            return Ok(self.reject(state, proposal, reject_reason(&error), error.to_string()));
        }

        let stamp = state.sequencer.stamp(participant_id, &proposal.client_vector_clock);
        if let Some(reshape) = state.targets.unseen_reshape(&proposal.target_path, &stamp.vector_clock) {
            let detail = format!(
                "operation {} by participant {} moved elements of {} after the submitter's view",
                reshape.sequence_number,
                reshape.participant_id,
                reshape.target_path.parent().unwrap_or_else(TargetPath::root)
            );
            return Ok(self.reject(state, proposal, RejectReason::TargetMissing, detail));
        }

        let now = Utc::now();
        let resolution = {
            let candidate = Candidate {
                kind: proposal.kind,
                target_path: &proposal.target_path,
                new_value: proposal.new_value.as_ref(),
                vector_clock: &stamp.vector_clock,
            };
            let priors = state.targets.related(&proposal.target_path);
            resolver::resolve(
                self.strategy,
                self.deps.settings.first_write_window,
                &candidate,
                &priors,
                now,
            )
        };

        match resolution {
            Resolution::Reject { reason, winner } => {
                let detail = format!(
                    "operation {} by participant {} won on {}",
                    winner.sequence_number, winner.participant_id, winner.target_path
                );
                Ok(self.reject(state, proposal, reason, detail))
            }
            Resolution::Pending { against } => {
                let conflict = PendingConflict {
                    conflict_id: Uuid::new_v4(),
                    room_id: self.room_id,
                    target_path: proposal.target_path.clone(),
                    variants: vec![
                        ConflictVariant {
                            participant_id: against.participant_id,
                            kind: against.kind,
                            value: against.final_value.clone(),
                            vector_clock: against.vector_clock.clone(),
                            sequence_number: Some(against.sequence_number),
                        },
                        ConflictVariant {
                            participant_id,
                            kind: proposal.kind,
                            value: proposal.new_value.clone(),
                            vector_clock: stamp.vector_clock,
                            sequence_number: None,
                        },
                    ],
                    opened_at: now,
                };
                state.pending.push(conflict.clone());
                metrics::increment_conflicts_opened(self.strategy.as_str());
                info!(
                    conflict_id = %conflict.conflict_id,
                    target_path = %conflict.target_path,
                    "manual conflict opened"
                );

                let message = ServerMessage::ConflictPending { conflict: conflict.clone() };
                self.broadcaster.broadcast(&message, Some(participant_id)).await;
                self.broadcaster.send_to(participant_id, &message).await;
                Ok(SubmitOutcome::Pending { conflict })
            }
            Resolution::Accept { final_value, superseded } => {
                if let Err(error) =
                    state.document.check(proposal.kind, &proposal.target_path, final_value.as_ref())
                {
                    return Ok(self.reject(state, proposal, reject_reason(&error), error.to_string()));
                }

                let operation = Operation {
                    idempotency_id: proposal.idempotency_id,
                    room_id: self.room_id,
                    kind: proposal.kind,
                    previous_value: previous_value(&state.document, proposal.kind, &proposal.target_path),
                    target_path: proposal.target_path,
                    new_value: proposal.new_value,
                    final_value,
                    participant_id,
                    sequence_number: stamp.sequence_number,
                    vector_clock: stamp.vector_clock,
                    timestamp: now,
                };
                let displaced = self.commit(state, &operation, Some(&superseded)).await?;

                let message = ServerMessage::OperationAccepted {
                    operation: operation.clone(),
                    superseded: superseded.clone(),
                };
                self.broadcaster.broadcast(&message, Some(participant_id)).await;
                self.broadcaster.send_to(participant_id, &message).await;
                self.announce_displaced(displaced).await;
                Ok(SubmitOutcome::Accepted { operation, superseded })
            }
        }
    }

    /// Log append, then document, counter and index. The append comes
    /// first so a storage failure leaves the room untouched.
    ///
    /// Returns the pending conflicts whose target the operation removed,
    /// replaced or shifted; they are closed without a resolution.
    async fn commit(
        &self,
        state: &mut RoomState,
        operation: &Operation,
        superseded: Option<&[i64]>,
    ) -> Result<Vec<Uuid>, RoomError> {
        self.deps.log.append(operation, superseded.unwrap_or_default()).await?;
        if let Err(error) = state.document.apply_operation(operation) {
            error!(
                sequence_number = operation.sequence_number,
                error = %error,
                "logged operation failed to apply"
            );
            return Err(anyhow!("operation {} failed to apply: {error}", operation.sequence_number).into());
        }
        state.sequencer.commit(operation)?;
        state.targets.record(operation, superseded);
        let displaced = take_displaced(&mut state.pending, operation);

        let head = state.sequencer.head();
        if self.deps.settings.snapshot_policy.should_snapshot(
            state.last_snapshot_seq,
            head,
            state.last_snapshot_at,
            operation.timestamp,
        ) {
            self.schedule_snapshot(state, SnapshotTrigger::Policy, operation.timestamp);
        }
        Ok(displaced)
    }

    async fn announce_displaced(&self, conflict_ids: Vec<Uuid>) {
        for conflict_id in conflict_ids {
            info!(room_id = %self.room_id, conflict_id = %conflict_id, "manual conflict dropped with its target");
            let message = ServerMessage::ConflictResolved { conflict_id, operation: None };
            self.broadcaster.broadcast(&message, None).await;
        }
    }

    fn reject(
        &self,
        state: &RoomState,
        proposal: ProposedOperation,
        reason: RejectReason,
        detail: String,
    ) -> SubmitOutcome {
        metrics::increment_operations_rejected(reason.as_str());
        let current_value = state.document.get(&proposal.target_path).cloned();
        SubmitOutcome::Rejected { proposal, reason, detail, current_value }
    }

    /// Sends an outcome to the connection that submitted it.
    async fn deliver(&self, origin: Origin, outcome: &SubmitOutcome) {
        let Some(connection_id) = origin.connection_id else {
            return;
        };
        let message = match outcome.clone() {
            SubmitOutcome::Accepted { operation, superseded } => {
                ServerMessage::OperationAccepted { operation, superseded }
            }
            SubmitOutcome::Rejected { proposal, reason, detail, current_value } => {
                ServerMessage::OperationRejected { operation: proposal, reason, detail, current_value }
            }
            SubmitOutcome::Pending { conflict } => ServerMessage::ConflictPending { conflict },
        };
        self.broadcaster.send_to_connection(origin.participant_id, connection_id, message).await;
    }

    /// Settles a pending manual conflict with one of its variants. The
    /// variant is emitted as a new accepted operation by the resolver; it is
    /// `None` when the chosen variant is a delete whose target is already gone.
    pub async fn resolve_conflict(
        &self,
        participant_id: Uuid,
        conflict_id: Uuid,
        variant: usize,
    ) -> Result<Option<Operation>, RoomError> {
        let mut state = self.state.lock().await;
        self.ensure_open()?;

        let can_edit = self
            .presence
            .read()
            .await
            .active(participant_id)
            .map(|participant| participant.can_edit)
            .ok_or(RoomError::UnknownParticipant(participant_id))?;
        if !can_edit {
            return Err(RoomError::PermissionDenied);
        }

        let index = state
            .pending
            .iter()
            .position(|conflict| conflict.conflict_id == conflict_id)
            .ok_or(RoomError::ConflictNotFound(conflict_id))?;
        let chosen = state.pending[index]
            .variants
            .get(variant)
            .cloned()
            .ok_or(RoomError::InvalidVariant { conflict_id, variant })?;
        let path = state.pending[index].target_path.clone();

        let exists = state.document.contains(&path);
        let kind = match (chosen.kind, exists) {
            (OperationKind::DeleteField, false) => None,
            (OperationKind::DeleteField, true) => Some(OperationKind::DeleteField),
            (OperationKind::MoveField, _) => Some(OperationKind::MoveField),
            (OperationKind::UpdateSetting, _) => Some(OperationKind::UpdateSetting),
            (_, true) => Some(OperationKind::UpdateField),
            (_, false) => Some(OperationKind::InsertField),
        };

        let mut displaced = Vec::new();
        let operation = match kind {
            None => None,
            Some(kind) => {
                state.document.check(kind, &path, chosen.value.as_ref())?;
                let observed = state.pending[index]
                    .variants
                    .iter()
                    .fold(VectorClock::new(), |clock, variant| clock.merged(&variant.vector_clock));
                let stamp = state.sequencer.stamp(participant_id, &observed);
                let operation = Operation {
                    idempotency_id: Uuid::new_v4(),
                    room_id: self.room_id,
                    kind,
                    previous_value: previous_value(&state.document, kind, &path),
                    target_path: path.clone(),
                    new_value: chosen.value.clone(),
                    final_value: chosen.value,
                    participant_id,
                    sequence_number: stamp.sequence_number,
                    vector_clock: stamp.vector_clock,
                    timestamp: Utc::now(),
                };
                displaced = self.commit(&mut state, &operation, None).await?;
                metrics::increment_operations_accepted();
                Some(operation)
            }
        };

        state.pending.retain(|conflict| conflict.conflict_id != conflict_id);
        info!(
            room_id = %self.room_id,
            conflict_id = %conflict_id,
            variant,
            resolved_by = %participant_id,
            "manual conflict resolved"
        );
        let message = ServerMessage::ConflictResolved { conflict_id, operation: operation.clone() };
        self.broadcaster.broadcast(&message, None).await;
        self.announce_displaced(displaced).await;
        Ok(operation)
    }

    // ── Comments ────────────────────────────────────────────────────

    pub async fn add_comment(
        &self,
        author_id: Uuid,
        target_path: TargetPath,
        content: String,
        parent_comment_id: Option<Uuid>,
        mentions: Vec<Uuid>,
    ) -> Result<Comment, RoomError> {
        self.ensure_open()?;
        self.require_commenter(author_id).await?;

        let comment = {
            let _thread_positions = self.comment_threads.lock().await;
            comments::create_comment(
                &self.deps.log,
                CommentDraft {
                    room_id: self.room_id,
                    author_id,
                    target_path,
                    content,
                    parent_comment_id,
                    mentions,
                },
                Utc::now(),
            )
            .await?
        };

        for mentioned in &comment.mentions {
            self.deps.notifier.notify_mention(*mentioned, &comment);
        }
        let message = ServerMessage::CommentAdded { comment: comment.clone() };
        self.broadcaster.broadcast(&message, None).await;
        Ok(comment)
    }

    pub async fn resolve_comment(&self, resolver_id: Uuid, comment_id: Uuid) -> Result<Comment, RoomError> {
        self.ensure_open()?;
        self.require_commenter(resolver_id).await?;

        let comment = {
            let _thread_positions = self.comment_threads.lock().await;
            comments::resolve_comment(&self.deps.log, self.room_id, comment_id, resolver_id, Utc::now())
                .await?
        };
        let message = ServerMessage::CommentResolved { comment: comment.clone() };
        self.broadcaster.broadcast(&message, None).await;
        Ok(comment)
    }

    async fn require_commenter(&self, participant_id: Uuid) -> Result<(), RoomError> {
        let can_comment = self
            .presence
            .read()
            .await
            .active(participant_id)
            .map(|participant| participant.can_comment)
            .ok_or(RoomError::UnknownParticipant(participant_id))?;
        if can_comment {
            Ok(())
        } else {
            Err(CommentError::PermissionDenied.into())
        }
    }
}

/// Removes the pending conflicts an accepted operation invalidated: those
/// below its path and, for inserts, deletes and moves of an array element,
/// those under the array whose indices shifted. A conflict on the exact path
/// is only ever settled by its own resolution.
fn take_displaced(pending: &mut Vec<PendingConflict>, operation: &Operation) -> Vec<Uuid> {
    let path = &operation.target_path;
    let shifted_array = match (operation.kind, path.last()) {
        (
            OperationKind::InsertField | OperationKind::DeleteField | OperationKind::MoveField,
            Some(Segment::Index(_)),
        ) => path.parent(),
        _ => None,
    };
    let displaced = |conflict: &PendingConflict| {
        let target = &conflict.target_path;
        target != path
            && (target.is_descendant_of(path)
                || shifted_array.as_ref().is_some_and(|array| target.is_descendant_of(array)))
    };

    let mut dropped = Vec::new();
    pending.retain(|conflict| {
        if displaced(conflict) {
            dropped.push(conflict.conflict_id);
            false
        } else {
            true
        }
    });
    dropped
}

/// Value an operation replaces: the source index for moves, otherwise the
/// value currently at the target.
fn previous_value(document: &FormDocument, kind: OperationKind, path: &TargetPath) -> Option<Value> {
    match (kind, path.last()) {
        (OperationKind::MoveField, Some(Segment::Index(index))) => Some(json!(index)),
        _ => document.get(path).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use formcollab_common::types::Identity;

    use super::*;
    use crate::config::RoomSettings;
    use crate::notify::testing::RecordingNotifier;
    use crate::rooms::registry::RoomRegistry;

    struct Fixture {
        room: Arc<Room>,
        ada: Uuid,
        bob: Uuid,
    }

    fn path(raw: &str) -> TargetPath {
        TargetPath::parse(raw).expect("path should parse")
    }

    fn proposal(kind: OperationKind, target: &str, value: Option<Value>, clock: VectorClock) -> ProposedOperation {
        ProposedOperation {
            idempotency_id: Uuid::new_v4(),
            kind,
            target_path: path(target),
            new_value: value,
            client_vector_clock: clock,
        }
    }

    fn origin(participant_id: Uuid) -> Origin {
        Origin { participant_id, connection_id: None }
    }

    async fn fixture(strategy: ConflictStrategy, deps: RoomDeps) -> Fixture {
        let registry = RoomRegistry::new(deps);
        let room_id = Uuid::new_v4();
        let join = |n: u128| JoinRequest {
            identity: Identity::User { user_id: Uuid::from_u128(n) },
            display_name: format!("user {n}"),
            conflict_strategy: Some(strategy),
            last_sequence: None,
        };
        let (room, ada) = registry.join(room_id, join(1), None).await.expect("ada joins");
        let (_, bob) = registry.join(room_id, join(2), None).await.expect("bob joins");
        Fixture { room, ada: ada.participant.participant_id, bob: bob.participant.participant_id }
    }

    async fn seeded(strategy: ConflictStrategy) -> Fixture {
        let fx = fixture(strategy, RoomDeps::in_memory(RoomSettings::default())).await;
        let outcome = fx
            .room
            .submit(
                origin(fx.ada),
                proposal(OperationKind::InsertField, "f1", Some(json!({ "label": "Email" })), VectorClock::new()),
            )
            .await
            .expect("seed insert");
        assert!(outcome.is_accepted());
        fx
    }

    fn accepted(outcome: &SubmitOutcome) -> &Operation {
        match outcome {
            SubmitOutcome::Accepted { operation, .. } => operation,
            other => panic!("expected accepted outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lww_concurrent_label_edits_converge_on_the_later_one() {
        let fx = seeded(ConflictStrategy::LastWriteWins).await;
        let base = accepted(
            &fx.room
                .submit(origin(fx.ada), proposal(OperationKind::UpdateField, "f1.label", Some(json!("x")), VectorClock::new()))
                .await
                .expect("submit"),
        )
        .vector_clock
        .clone();

        let first = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Name")), base.clone()))
            .await
            .expect("submit");
        let second = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Full Name")), base))
            .await
            .expect("submit");

        let first = accepted(&first);
        let second = accepted(&second);
        assert_eq!(second.sequence_number, first.sequence_number + 1);
        assert!(first.vector_clock.is_concurrent_with(&second.vector_clock));

        let (_, document) = fx.room.document().await;
        assert_eq!(document["f1"]["label"], json!("Full Name"));
        let replayed = FormDocument::replay(&fx.room.deps.log.read_since(fx.room.room_id(), 0).await.expect("read"))
            .expect("replay");
        assert_eq!(replayed.as_value(), &document);
    }

    #[tokio::test]
    async fn resubmission_returns_the_original_outcome_once_logged() {
        let fx = seeded(ConflictStrategy::LastWriteWins).await;
        let edit = proposal(OperationKind::UpdateField, "f1.label", Some(json!("Name")), VectorClock::new());

        let first = fx.room.submit(origin(fx.ada), edit.clone()).await.expect("submit");
        let replay = fx.room.submit(origin(fx.ada), edit.clone()).await.expect("replay");
        assert_eq!(accepted(&first), accepted(&replay));
        assert_eq!(fx.room.head_sequence().await, 2);

        let mut altered = edit;
        altered.new_value = Some(json!("Other"));
        let mismatch = fx.room.submit(origin(fx.ada), altered).await.expect("mismatch");
        assert!(matches!(mismatch, SubmitOutcome::Rejected { reason: RejectReason::IdempotencyMismatch, .. }));
        assert_eq!(fx.room.head_sequence().await, 2);
    }

    #[tokio::test]
    async fn logged_operations_replay_after_the_cache_is_gone() {
        let fx = seeded(ConflictStrategy::LastWriteWins).await;
        let label = proposal(OperationKind::UpdateField, "f1.label", Some(json!("Name")), VectorClock::new());
        fx.room.submit(origin(fx.ada), label).await.expect("submit");
        let edit = proposal(OperationKind::UpdateField, "f1.label", Some(json!("Full Name")), VectorClock::new());
        let first = fx.room.submit(origin(fx.ada), edit.clone()).await.expect("submit");

        fx.room.deps.idempotency.forget_room(fx.room.room_id()).await;
        let replay = fx.room.submit(origin(fx.ada), edit).await.expect("replay");
        assert_eq!(accepted(&first), accepted(&replay));
        let superseded = |outcome: &SubmitOutcome| match outcome {
            SubmitOutcome::Accepted { superseded, .. } => superseded.clone(),
            other => panic!("expected accepted outcome, got {other:?}"),
        };
        assert_eq!(superseded(&first), vec![2]);
        assert_eq!(superseded(&replay), vec![2]);
        assert_eq!(fx.room.head_sequence().await, 3);
    }

    #[tokio::test]
    async fn edits_behind_an_unseen_array_delete_are_rejected() {
        let fx = fixture(ConflictStrategy::LastWriteWins, RoomDeps::in_memory(RoomSettings::default())).await;
        let fields = json!([{ "label": "A" }, { "label": "B" }]);
        let insert = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::InsertField, "fields", Some(fields), VectorClock::new()))
            .await
            .expect("insert");
        let seen_by_bob = accepted(&insert).vector_clock.clone();

        let delete = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::DeleteField, "fields[0]", None, seen_by_bob.clone()))
            .await
            .expect("delete");
        let delete_clock = accepted(&delete).vector_clock.clone();

        let stale = fx
            .room
            .submit(
                origin(fx.bob),
                proposal(OperationKind::UpdateField, "fields[0].label", Some(json!("X")), seen_by_bob.clone()),
            )
            .await
            .expect("stale edit");
        assert!(matches!(stale, SubmitOutcome::Rejected { reason: RejectReason::TargetMissing, .. }));
        let (head, document) = fx.room.document().await;
        assert_eq!(head, 2);
        assert_eq!(document["fields"], json!([{ "label": "B" }]));

        let stale_insert = fx
            .room
            .submit(
                origin(fx.bob),
                proposal(OperationKind::InsertField, "fields[1]", Some(json!({ "label": "C" })), seen_by_bob),
            )
            .await
            .expect("stale insert");
        assert!(matches!(stale_insert, SubmitOutcome::Rejected { reason: RejectReason::TargetMissing, .. }));

        let current = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "fields[0].label", Some(json!("X")), delete_clock))
            .await
            .expect("current edit");
        assert!(current.is_accepted());
        let (_, document) = fx.room.document().await;
        assert_eq!(document["fields"], json!([{ "label": "X" }]));
    }

    #[tokio::test]
    async fn update_after_delete_is_rejected_as_target_missing() {
        let fx = fixture(ConflictStrategy::LastWriteWins, RoomDeps::in_memory(RoomSettings::default())).await;
        let inserted = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::InsertField, "f2", Some(json!({ "label": "Age" })), VectorClock::new()))
            .await
            .expect("insert");
        let observed = accepted(&inserted).vector_clock.clone();

        let deleted = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::DeleteField, "f2", None, observed.clone()))
            .await
            .expect("delete");
        assert!(deleted.is_accepted());

        let late = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "f2.label", Some(json!("Years")), observed))
            .await
            .expect("update");
        assert!(matches!(
            late,
            SubmitOutcome::Rejected { reason: RejectReason::TargetMissing, current_value: None, .. }
        ));
        assert_eq!(fx.room.head_sequence().await, 2);
    }

    #[tokio::test]
    async fn first_write_wins_rejects_concurrent_second_writer() {
        let fx = seeded(ConflictStrategy::FirstWriteWins).await;
        let observed = VectorClock::from_entries([(fx.ada, 1)]);

        let first = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Name")), observed.clone()))
            .await
            .expect("first");
        assert!(first.is_accepted());

        let second = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Full Name")), observed))
            .await
            .expect("second");
        match second {
            SubmitOutcome::Rejected { reason, current_value, .. } => {
                assert_eq!(reason, RejectReason::FirstWriteWins);
                assert_eq!(current_value, Some(json!("Name")));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn merge_keeps_concurrent_descendant_edit() {
        let fx = seeded(ConflictStrategy::Merge).await;
        let observed = VectorClock::from_entries([(fx.ada, 1)]);

        let label = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Work email")), observed.clone()))
            .await
            .expect("label");
        assert!(label.is_accepted());

        let replaced = fx
            .room
            .submit(
                origin(fx.bob),
                proposal(OperationKind::UpdateField, "f1", Some(json!({ "label": "Email", "required": true })), observed),
            )
            .await
            .expect("replace");
        let operation = accepted(&replaced);
        assert_eq!(operation.final_value, Some(json!({ "label": "Work email", "required": true })));

        let (_, document) = fx.room.document().await;
        assert_eq!(document["f1"], json!({ "label": "Work email", "required": true }));
    }

    #[tokio::test]
    async fn manual_conflict_blocks_path_until_resolved() {
        let fx = seeded(ConflictStrategy::Manual).await;
        let observed = VectorClock::from_entries([(fx.ada, 1)]);

        let first = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Name")), observed.clone()))
            .await
            .expect("first");
        assert!(first.is_accepted());

        let second = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Full Name")), observed))
            .await
            .expect("second");
        let SubmitOutcome::Pending { conflict } = second else {
            panic!("expected a pending conflict");
        };
        assert_eq!(conflict.variants.len(), 2);
        assert_eq!(fx.room.pending_conflicts().await.len(), 1);
        assert_eq!(fx.room.head_sequence().await, 2);

        let blocked = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Other")), VectorClock::new()))
            .await
            .expect("blocked");
        assert!(matches!(blocked, SubmitOutcome::Rejected { reason: RejectReason::PendingManualResolution, .. }));

        let resolution = fx
            .room
            .resolve_conflict(fx.ada, conflict.conflict_id, 1)
            .await
            .expect("resolve")
            .expect("an operation should be emitted");
        assert_eq!(resolution.final_value, Some(json!("Full Name")));
        assert_eq!(resolution.sequence_number, 3);
        assert!(fx.room.pending_conflicts().await.is_empty());

        let (_, document) = fx.room.document().await;
        assert_eq!(document["f1"]["label"], json!("Full Name"));
        assert!(matches!(
            fx.room.resolve_conflict(fx.ada, conflict.conflict_id, 0).await,
            Err(RoomError::ConflictNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_the_parent_drops_its_pending_conflicts() {
        let fx = seeded(ConflictStrategy::Manual).await;
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        fx.room.broadcaster.attach(fx.bob, bob_tx).await;
        let observed = VectorClock::from_entries([(fx.ada, 1)]);

        let first = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Name")), observed.clone()))
            .await
            .expect("first");
        let ada_clock = accepted(&first).vector_clock.clone();
        let second = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Full Name")), observed))
            .await
            .expect("second");
        let SubmitOutcome::Pending { conflict } = second else {
            panic!("expected a pending conflict");
        };

        let delete = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::DeleteField, "f1", None, ada_clock))
            .await
            .expect("delete");
        assert!(delete.is_accepted());
        assert!(fx.room.pending_conflicts().await.is_empty());
        assert!(matches!(
            fx.room.resolve_conflict(fx.ada, conflict.conflict_id, 0).await,
            Err(RoomError::ConflictNotFound(_))
        ));

        let mut messages = Vec::new();
        while let Ok(message) = bob_rx.try_recv() {
            messages.push(message);
        }
        assert!(matches!(messages.last(), Some(ServerMessage::ConflictResolved { conflict_id, operation: None })
            if *conflict_id == conflict.conflict_id));

        let delete_clock = accepted(&delete).vector_clock.clone();
        let reinsert = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::InsertField, "f1", Some(json!({ "label": "Email" })), delete_clock))
            .await
            .expect("reinsert");
        let reinsert_clock = accepted(&reinsert).vector_clock.clone();
        let edit = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "f1.label", Some(json!("Phone")), reinsert_clock))
            .await
            .expect("edit");
        assert!(edit.is_accepted());
    }

    #[tokio::test]
    async fn shifting_an_array_drops_conflicts_under_it() {
        let fx = fixture(ConflictStrategy::Manual, RoomDeps::in_memory(RoomSettings::default())).await;
        let insert = fx
            .room
            .submit(
                origin(fx.ada),
                proposal(OperationKind::InsertField, "fields", Some(json!([{ "label": "A" }, { "label": "B" }])), VectorClock::new()),
            )
            .await
            .expect("insert");
        let observed = accepted(&insert).vector_clock.clone();

        let first = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::UpdateField, "fields[1].label", Some(json!("Name")), observed.clone()))
            .await
            .expect("first");
        let ada_clock = accepted(&first).vector_clock.clone();
        let second = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "fields[1].label", Some(json!("Full Name")), observed))
            .await
            .expect("second");
        assert!(matches!(second, SubmitOutcome::Pending { .. }));

        let shift = fx
            .room
            .submit(origin(fx.ada), proposal(OperationKind::InsertField, "fields[0]", Some(json!({ "label": "Z" })), ada_clock))
            .await
            .expect("shift");
        assert!(shift.is_accepted());
        assert!(fx.room.pending_conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn guests_cannot_edit_without_permission() {
        let registry = RoomRegistry::new(RoomDeps::in_memory(RoomSettings::default()));
        let (room, guest) = registry
            .join(
                Uuid::new_v4(),
                JoinRequest {
                    identity: Identity::Guest { guest_id: "visitor".to_string() },
                    display_name: "Visitor".to_string(),
                    conflict_strategy: None,
                    last_sequence: None,
                },
                None,
            )
            .await
            .expect("guest joins");

        let outcome = room
            .submit(
                origin(guest.participant.participant_id),
                proposal(OperationKind::InsertField, "f1", Some(json!({})), VectorClock::new()),
            )
            .await
            .expect("submit");
        assert!(matches!(outcome, SubmitOutcome::Rejected { reason: RejectReason::PermissionDenied, .. }));
        assert_eq!(room.head_sequence().await, 0);

        let comment = room
            .add_comment(guest.participant.participant_id, path("f1"), "looks good".to_string(), None, Vec::new())
            .await
            .expect("guests may comment");
        assert_eq!(comment.position, 1);
    }

    #[tokio::test]
    async fn departed_participants_cannot_submit() {
        let fx = seeded(ConflictStrategy::LastWriteWins).await;
        fx.room.leave(fx.bob).await.expect("bob leaves");
        let error = fx
            .room
            .submit(origin(fx.bob), proposal(OperationKind::UpdateField, "f1.label", Some(json!("x")), VectorClock::new()))
            .await
            .expect_err("left participant must not submit");
        assert!(matches!(error, RoomError::UnknownParticipant(id) if id == fx.bob));
    }

    #[tokio::test]
    async fn broadcasts_reach_others_and_the_sender_sees_its_ack() {
        let fx = seeded(ConflictStrategy::LastWriteWins).await;
        let (ada_tx, mut ada_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let ada_conn = fx.room.broadcaster.attach(fx.ada, ada_tx).await;
        fx.room.broadcaster.attach(fx.bob, bob_tx).await;

        let outcome = fx
            .room
            .submit(
                Origin { participant_id: fx.ada, connection_id: Some(ada_conn) },
                proposal(OperationKind::UpdateField, "f1.label", Some(json!("Name")), VectorClock::new()),
            )
            .await
            .expect("submit");
        let sequence_number = accepted(&outcome).sequence_number;

        for rx in [&mut ada_rx, &mut bob_rx] {
            match rx.try_recv().expect("message expected") {
                ServerMessage::OperationAccepted { operation, .. } => {
                    assert_eq!(operation.sequence_number, sequence_number);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }

        let rejected = fx
            .room
            .submit(
                Origin { participant_id: fx.ada, connection_id: Some(ada_conn) },
                proposal(OperationKind::DeleteField, "missing", None, VectorClock::new()),
            )
            .await
            .expect("submit");
        assert!(matches!(rejected, SubmitOutcome::Rejected { .. }));
        assert!(matches!(ada_rx.try_recv(), Ok(ServerMessage::OperationRejected { .. })));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn comments_notify_mentions_and_resolve_once() {
        let notifier = Arc::new(RecordingNotifier::default());
        let deps = RoomDeps::in_memory(RoomSettings::default()).with_notifier(notifier.clone());
        let fx = fixture(ConflictStrategy::LastWriteWins, deps).await;

        let comment = fx
            .room
            .add_comment(fx.ada, path("f1.label"), "@bob please check".to_string(), None, vec![fx.bob, fx.bob])
            .await
            .expect("comment");
        assert_eq!(comment.mentions, vec![fx.bob]);
        assert_eq!(
            notifier.mentions.lock().expect("lock").as_slice(),
            &[(fx.bob, comment.comment_id)]
        );

        let reply = fx
            .room
            .add_comment(fx.bob, path("ignored"), "done".to_string(), Some(comment.comment_id), Vec::new())
            .await
            .expect("reply");
        assert_eq!(reply.thread_id, comment.comment_id);
        assert_eq!(reply.position, 2);

        fx.room.resolve_comment(fx.bob, comment.comment_id).await.expect("resolve");
        assert!(matches!(
            fx.room.resolve_comment(fx.bob, comment.comment_id).await,
            Err(RoomError::Comment(CommentError::AlreadyResolved(_)))
        ));
    }

    #[tokio::test]
    async fn presence_is_broadcast_with_increasing_sequence() {
        let fx = fixture(ConflictStrategy::LastWriteWins, RoomDeps::in_memory(RoomSettings::default())).await;
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        fx.room.broadcaster.attach(fx.bob, bob_tx).await;

        assert_eq!(fx.room.update_presence(fx.ada, Some(Cursor { x: 1.0, y: 1.0 }), None).await, Some(1));
        assert_eq!(fx.room.update_presence(fx.ada, None, Some(path("f1"))).await, Some(2));
        assert!(matches!(bob_rx.try_recv(), Ok(ServerMessage::PresenceUpdate { presence_seq: 1, .. })));
        assert!(matches!(bob_rx.try_recv(), Ok(ServerMessage::PresenceUpdate { presence_seq: 2, .. })));

        fx.room.leave(fx.ada).await;
        assert_eq!(fx.room.update_presence(fx.ada, None, None).await, None);
    }

    #[tokio::test]
    async fn snapshot_policy_schedules_jobs_after_enough_operations() {
        let (scheduler, mut jobs) = crate::sync::snapshot::SnapshotScheduler::channel();
        let settings = RoomSettings {
            snapshot_policy: crate::sync::snapshot::SnapshotPolicy {
                interval_updates: 2,
                interval: Duration::from_secs(3600),
            },
            ..RoomSettings::default()
        };
        let fx = fixture(ConflictStrategy::LastWriteWins, RoomDeps::in_memory(settings).with_snapshots(scheduler)).await;

        for n in 0..4 {
            let outcome = fx
                .room
                .submit(origin(fx.ada), proposal(OperationKind::UpdateSetting, &format!("settings.s{n}"), Some(json!(n)), VectorClock::new()))
                .await
                .expect("submit");
            assert!(outcome.is_accepted());
        }

        let first = jobs.try_recv().expect("job after two operations");
        assert_eq!(first.sequence_number, 2);
        assert_eq!(first.trigger, SnapshotTrigger::Policy);
        assert_eq!(jobs.try_recv().expect("job after four operations").sequence_number, 4);
        assert!(jobs.try_recv().is_err());
    }
}
