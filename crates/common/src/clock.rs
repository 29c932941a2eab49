// Vector clocks keyed by participant id.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Causal relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Per-participant operation counts. Missing entries read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<Uuid, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (Uuid, u64)>) -> Self {
        let entries = entries.into_iter().filter(|(_, count)| *count > 0).collect();
        Self { entries }
    }

    pub fn get(&self, participant_id: Uuid) -> u64 {
        self.entries.get(&participant_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, participant_id: Uuid, count: u64) {
        if count == 0 {
            self.entries.remove(&participant_id);
        } else {
            self.entries.insert(participant_id, count);
        }
    }

    /// Bumps the participant's entry and returns the new count.
    pub fn increment(&mut self, participant_id: Uuid) -> u64 {
        let entry = self.entries.entry(participant_id).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    /// Entry-wise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (participant_id, count) in &other.entries {
            let entry = self.entries.entry(*participant_id).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }

    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    /// Entry-wise minimum against `ceiling`; entries the ceiling lacks are dropped.
    pub fn clamped_to(&self, ceiling: &VectorClock) -> VectorClock {
        VectorClock::from_entries(
            self.entries
                .iter()
                .map(|(participant_id, count)| (*participant_id, (*count).min(ceiling.get(*participant_id)))),
        )
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for participant_id in self.entries.keys().chain(other.entries.keys()) {
            match self.get(*participant_id).cmp(&other.get(*participant_id)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when every event in `other` is also known to `self`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::After | ClockOrdering::Equal)
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Uuid, u64)> + '_ {
        self.entries.iter().map(|(participant_id, count)| (*participant_id, *count))
    }
}
