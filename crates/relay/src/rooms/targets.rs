// Index of the operation currently in effect on each target path.

use std::collections::BTreeMap;

use formcollab_common::clock::VectorClock;
use formcollab_common::path::{Segment, TargetPath};
use formcollab_common::types::{Operation, OperationKind};

#[derive(Debug, Clone, Default)]
pub(crate) struct TargetIndex {
    current: BTreeMap<TargetPath, Operation>,
    /// Latest insert, delete or move of an element, keyed by the array path.
    reshaped: BTreeMap<TargetPath, Operation>,
}

impl TargetIndex {
    /// Rebuilds the index from a log, treating every entry as last-write-wins.
    pub(crate) fn replay<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Self {
        let mut index = Self::default();
        for operation in operations {
            index.record(operation, None);
        }
        index
    }

    /// Current operations on `path`, its ancestors and its descendants.
    pub(crate) fn related(&self, path: &TargetPath) -> Vec<&Operation> {
        let mut related = Vec::new();
        let mut ancestor = path.parent();
        while let Some(current) = ancestor {
            if let Some(operation) = self.current.get(&current) {
                related.push(operation);
            }
            ancestor = current.parent();
        }
        related.extend(
            self.current
                .range(path.clone()..)
                .take_while(|(key, _)| path.is_prefix_of(key))
                .map(|(_, operation)| operation),
        );
        related
    }

    /// The structural edit on an array enclosing `path` (or holding it as an
    /// element) that `clock` has not observed. Indices under that array may
    /// have shifted since the submitter last saw it.
    pub(crate) fn unseen_reshape(&self, path: &TargetPath, clock: &VectorClock) -> Option<&Operation> {
        let mut element = Some(path.clone());
        let mut unseen: Option<&Operation> = None;
        while let Some(current) = element {
            let parent = current.parent();
            if matches!(current.last(), Some(Segment::Index(_))) {
                let reshape = parent.as_ref().and_then(|array| self.reshaped.get(array));
                if let Some(reshape) = reshape.filter(|op| !clock.dominates(&op.vector_clock)) {
                    if unseen.map_or(true, |seen| reshape.sequence_number > seen.sequence_number) {
                        unseen = Some(reshape);
                    }
                }
            }
            element = parent;
        }
        unseen
    }

    pub(crate) fn get(&self, path: &TargetPath) -> Option<&Operation> {
        self.current.get(path)
    }

    /// Makes `operation` current on its path.
    ///
    /// With `superseded = None` everything at or below the path is replaced.
    /// Otherwise only the listed sequence numbers and the exact path are, so
    /// descendant edits a merge kept stay current. Structural edits on array
    /// elements shift their siblings: every entry under the array is dropped
    /// and the edit is remembered on the array path.
    pub(crate) fn record(&mut self, operation: &Operation, superseded: Option<&[i64]>) {
        let path = &operation.target_path;
        let replaced = |key: &TargetPath, existing: &Operation| {
            key == path || superseded.map_or(true, |listed| listed.contains(&existing.sequence_number))
        };
        let stale = under(&self.current, path, replaced);
        for key in stale {
            self.current.remove(&key);
        }
        let stale = under(&self.reshaped, path, replaced);
        for key in stale {
            self.reshaped.remove(&key);
        }

        let shifts_siblings = matches!(
            operation.kind,
            OperationKind::InsertField | OperationKind::DeleteField | OperationKind::MoveField
        ) && matches!(path.last(), Some(Segment::Index(_)));
        if shifts_siblings {
            if let Some(array) = path.parent() {
                let shifted = under(&self.current, &array, |key, _| key.is_descendant_of(&array));
                for key in shifted {
                    self.current.remove(&key);
                }
                self.reshaped.insert(array, operation.clone());
            }
        }

        self.current.insert(path.clone(), operation.clone());
    }

    pub(crate) fn len(&self) -> usize {
        self.current.len()
    }
}

/// Keys at or below `path` accepted by `keep`.
fn under(
    map: &BTreeMap<TargetPath, Operation>,
    path: &TargetPath,
    keep: impl Fn(&TargetPath, &Operation) -> bool,
) -> Vec<TargetPath> {
    map.range(path.clone()..)
        .take_while(|(key, _)| path.is_prefix_of(key))
        .filter(|(key, existing)| keep(*key, *existing))
        .map(|(key, _)| key.clone())
        .collect()
}
