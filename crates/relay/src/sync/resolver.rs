// Conflict resolution for a stamped candidate against the operations that
// are current on its path, its ancestors and its descendants.
//
// A prior operation is concurrent with the candidate when the candidate's
// clock does not dominate it. Each strategy is one function over the same
// inputs; none of them touch the document or the log.

use std::time::Duration;

use chrono::{DateTime, Utc};
use formcollab_common::clock::VectorClock;
use formcollab_common::document::FormDocument;
use formcollab_common::path::TargetPath;
use formcollab_common::types::{ConflictStrategy, Operation, OperationKind, RejectReason};
use serde_json::Value;

/// The candidate after stamping.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub kind: OperationKind,
    pub target_path: &'a TargetPath,
    pub new_value: Option<&'a Value>,
    pub vector_clock: &'a VectorClock,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply `final_value`; the listed sequence numbers stop being current.
    Accept { final_value: Option<Value>, superseded: Vec<i64> },
    Reject { reason: RejectReason, winner: Operation },
    /// Manual strategy: park both variants until a participant picks one.
    Pending { against: Operation },
}

pub fn resolve(
    strategy: ConflictStrategy,
    first_write_window: Duration,
    candidate: &Candidate<'_>,
    priors: &[&Operation],
    now: DateTime<Utc>,
) -> Resolution {
    match strategy {
        ConflictStrategy::LastWriteWins => last_write_wins(candidate, priors),
        ConflictStrategy::FirstWriteWins => {
            first_write_wins(first_write_window, candidate, priors, now)
        }
        ConflictStrategy::Merge => merge(candidate, priors),
        ConflictStrategy::Manual => manual(candidate, priors),
    }
}

fn is_concurrent(candidate: &Candidate<'_>, prior: &Operation) -> bool {
    !candidate.vector_clock.dominates(&prior.vector_clock)
}

/// Sequence numbers of priors at the candidate path or below it.
fn covered(candidate: &Candidate<'_>, priors: &[&Operation]) -> Vec<i64> {
    let mut superseded: Vec<i64> = priors
        .iter()
        .filter(|prior| candidate.target_path.is_prefix_of(&prior.target_path))
        .map(|prior| prior.sequence_number)
        .collect();
    superseded.sort_unstable();
    superseded
}

fn exact_concurrent<'p>(candidate: &Candidate<'_>, priors: &[&'p Operation]) -> Option<&'p Operation> {
    priors
        .iter()
        .copied()
        .filter(|prior| prior.target_path == *candidate.target_path)
        .filter(|prior| is_concurrent(candidate, prior))
        .max_by_key(|prior| prior.sequence_number)
}

fn last_write_wins(candidate: &Candidate<'_>, priors: &[&Operation]) -> Resolution {
    Resolution::Accept {
        final_value: candidate.new_value.cloned(),
        superseded: covered(candidate, priors),
    }
}

fn first_write_wins(
    window: Duration,
    candidate: &Candidate<'_>,
    priors: &[&Operation],
    now: DateTime<Utc>,
) -> Resolution {
    let winner = priors
        .iter()
        .copied()
        .filter(|prior| prior.target_path == *candidate.target_path)
        .filter(|prior| is_concurrent(candidate, prior))
        .filter(|prior| {
            // A prior stamped after `now` (clock skew) counts as inside the window.
            now.signed_duration_since(prior.timestamp).to_std().map_or(true, |elapsed| elapsed <= window)
        })
        .min_by_key(|prior| prior.sequence_number);

    match winner {
        Some(winner) => {
            Resolution::Reject { reason: RejectReason::FirstWriteWins, winner: winner.clone() }
        }
        None => last_write_wins(candidate, priors),
    }
}

fn merge(candidate: &Candidate<'_>, priors: &[&Operation]) -> Resolution {
    let replaces_composite = matches!(
        candidate.kind,
        OperationKind::InsertField | OperationKind::UpdateField | OperationKind::UpdateSetting
    ) && matches!(candidate.new_value, Some(Value::Object(_) | Value::Array(_)));

    if !replaces_composite {
        return last_write_wins(candidate, priors);
    }

    let mut concurrent_descendants: Vec<&Operation> = priors
        .iter()
        .copied()
        .filter(|prior| prior.target_path.is_descendant_of(candidate.target_path))
        .filter(|prior| is_concurrent(candidate, prior))
        .collect();
    concurrent_descendants.sort_by_key(|prior| prior.sequence_number);

    let mut merged = FormDocument::from_value(candidate.new_value.cloned().unwrap_or(Value::Null));
    let mut kept = Vec::new();
    for prior in concurrent_descendants {
        let Some(relative) = prior.target_path.strip_prefix(candidate.target_path) else {
            continue;
        };
        // A descendant edit that no longer fits the new shape is dropped.
        if merged.apply(prior.kind, &relative, prior.final_value.as_ref()).is_ok() {
            kept.push(prior.sequence_number);
        }
    }

    let superseded =
        covered(candidate, priors).into_iter().filter(|seq| !kept.contains(seq)).collect();
    Resolution::Accept { final_value: Some(merged.into_value()), superseded }
}

fn manual(candidate: &Candidate<'_>, priors: &[&Operation]) -> Resolution {
    match exact_concurrent(candidate, priors) {
        Some(against) => Resolution::Pending { against: against.clone() },
        None => last_write_wins(candidate, priors),
    }
}
