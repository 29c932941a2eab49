// Participant registry and presence state of one room.
//
// Records are never deleted: leaving sets `left_at` and clears presence.
// An identity gets its participant id back while the participant has not
// fully left, which includes the reconnect grace after a transport drop.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use formcollab_common::path::TargetPath;
use formcollab_common::types::{Cursor, Identity, ParticipantSnapshot};
use uuid::Uuid;

use super::participants::{color_for, AccessPolicy};

#[derive(Debug, Clone)]
struct Member {
    snapshot: ParticipantSnapshot,
    presence_seq: u64,
    disconnected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedParticipant {
    pub participant: ParticipantSnapshot,
    /// False when the identity already had a live participant (another tab
    /// or a reconnect inside the grace period).
    pub newly_active: bool,
}

#[derive(Debug)]
pub struct PresenceTable {
    room_id: Uuid,
    policy: AccessPolicy,
    members: HashMap<Uuid, Member>,
    by_identity: HashMap<Identity, Uuid>,
    join_count: usize,
    idle_since: Option<DateTime<Utc>>,
}

impl PresenceTable {
    pub fn new(room_id: Uuid, policy: AccessPolicy) -> Self {
        Self {
            room_id,
            policy,
            members: HashMap::new(),
            by_identity: HashMap::new(),
            join_count: 0,
            idle_since: None,
        }
    }

    /// Continues color assignment after participants recorded in earlier
    /// lifetimes of the room.
    pub fn with_join_count(mut self, join_count: usize) -> Self {
        self.join_count = join_count;
        self
    }

    pub fn join(&mut self, identity: Identity, display_name: String, now: DateTime<Utc>) -> JoinedParticipant {
        self.idle_since = None;
        if let Some(member) = self
            .by_identity
            .get(&identity)
            .and_then(|participant_id| self.members.get_mut(participant_id))
            .filter(|member| member.snapshot.left_at.is_none())
        {
            member.snapshot.display_name = display_name;
            member.snapshot.last_activity_at = now;
            member.disconnected_at = None;
            return JoinedParticipant { participant: member.snapshot.clone(), newly_active: false };
        }

        let permissions = self.policy.permissions_for(&identity);
        let participant = ParticipantSnapshot {
            participant_id: Uuid::new_v4(),
            room_id: self.room_id,
            identity: identity.clone(),
            display_name,
            color: color_for(self.join_count).to_string(),
            cursor: None,
            active_field: None,
            can_edit: permissions.can_edit,
            can_comment: permissions.can_comment,
            joined_at: now,
            last_activity_at: now,
            left_at: None,
        };
        self.join_count += 1;
        self.by_identity.insert(identity, participant.participant_id);
        self.members.insert(
            participant.participant_id,
            Member { snapshot: participant.clone(), presence_seq: 0, disconnected_at: None },
        );
        JoinedParticipant { participant, newly_active: true }
    }

    /// Marks the participant left. Returns the final record, or `None` when
    /// it was unknown or already gone.
    pub fn leave(&mut self, participant_id: Uuid, now: DateTime<Utc>) -> Option<ParticipantSnapshot> {
        let member = self.members.get_mut(&participant_id)?;
        if member.snapshot.left_at.is_some() {
            return None;
        }
        member.snapshot.left_at = Some(now);
        member.snapshot.last_activity_at = now;
        member.snapshot.cursor = None;
        member.snapshot.active_field = None;
        member.disconnected_at = None;
        let left = member.snapshot.clone();
        if self.active_count() == 0 {
            self.idle_since = Some(now);
        }
        Some(left)
    }

    /// When the room last became empty. `None` while anyone is active.
    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        self.idle_since
    }

    pub fn mark_idle(&mut self, now: DateTime<Utc>) {
        if self.active_count() == 0 {
            self.idle_since.get_or_insert(now);
        }
    }

    /// Records a transport drop. The participant stays active until the
    /// reconnect grace expires.
    pub fn mark_disconnected(&mut self, participant_id: Uuid, now: DateTime<Utc>) -> bool {
        match self.members.get_mut(&participant_id) {
            Some(member) if member.snapshot.left_at.is_none() => {
                member.disconnected_at.get_or_insert(now);
                true
            }
            _ => false,
        }
    }

    /// Participants whose reconnect grace has run out.
    pub fn expired_disconnects(&self, now: DateTime<Utc>, grace: Duration) -> Vec<Uuid> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        self.members
            .values()
            .filter(|member| member.snapshot.left_at.is_none())
            .filter(|member| {
                member.disconnected_at.is_some_and(|dropped_at| now.signed_duration_since(dropped_at) >= grace)
            })
            .map(|member| member.snapshot.participant_id)
            .collect()
    }

    /// Applies a presence update and returns its sequence number. Ignored
    /// when the room is empty or the participant has left.
    pub fn update(
        &mut self,
        participant_id: Uuid,
        cursor: Option<Cursor>,
        active_field: Option<TargetPath>,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        if self.active_count() == 0 {
            return None;
        }
        let member = self.members.get_mut(&participant_id)?;
        if member.snapshot.left_at.is_some() {
            return None;
        }
        member.snapshot.cursor = cursor;
        member.snapshot.active_field = active_field;
        member.snapshot.last_activity_at = now;
        member.presence_seq += 1;
        Some(member.presence_seq)
    }

    pub fn touch(&mut self, participant_id: Uuid, now: DateTime<Utc>) {
        if let Some(member) = self.members.get_mut(&participant_id) {
            member.snapshot.last_activity_at = now;
        }
    }

    pub fn get(&self, participant_id: Uuid) -> Option<&ParticipantSnapshot> {
        self.members.get(&participant_id).map(|member| &member.snapshot)
    }

    /// The participant, only while it has not left.
    pub fn active(&self, participant_id: Uuid) -> Option<&ParticipantSnapshot> {
        self.get(participant_id).filter(|participant| participant.left_at.is_none())
    }

    pub fn active_participants(&self) -> Vec<ParticipantSnapshot> {
        let mut active: Vec<ParticipantSnapshot> = self
            .members
            .values()
            .filter(|member| member.snapshot.left_at.is_none())
            .map(|member| member.snapshot.clone())
            .collect();
        active.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.participant_id.cmp(&b.participant_id)));
        active
    }

    pub fn active_ids(&self) -> Vec<Uuid> {
        self.members
            .values()
            .filter(|member| member.snapshot.left_at.is_none())
            .map(|member| member.snapshot.participant_id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.members.values().filter(|member| member.snapshot.left_at.is_none()).count()
    }
}
