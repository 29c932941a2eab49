// Materialized form document: a JSON tree mutated by sequenced operations.
//
// Every apply validates before it mutates, so a failed operation leaves the
// document untouched.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::path::{Segment, TargetPath};
use crate::types::{Operation, OperationKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("target missing: {0}")]
    TargetMissing(String),

    #[error("target already exists: {0}")]
    TargetExists(String),

    #[error("target is not addressable: {0}")]
    InvalidTarget(String),

    #[error("operation requires a value")]
    MissingValue,

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormDocument {
    root: Value,
}

impl Default for FormDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl FormDocument {
    pub fn new() -> Self {
        Self { root: Value::Object(Map::new()) }
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Rebuilds a document by applying operations in sequence order.
    pub fn replay<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Result<Self, ApplyError> {
        let mut document = Self::new();
        for operation in operations {
            document.apply_operation(operation)?;
        }
        Ok(document)
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        match &self.root {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    pub fn get(&self, path: &TargetPath) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.segments() {
            current = child(current, segment)?;
        }
        Some(current)
    }

    pub fn contains(&self, path: &TargetPath) -> bool {
        self.get(path).is_some()
    }

    /// Applies an accepted operation using its final value.
    pub fn apply_operation(&mut self, operation: &Operation) -> Result<Option<Value>, ApplyError> {
        self.apply(operation.kind, &operation.target_path, operation.final_value.as_ref())
    }

    /// Checks that `apply` would succeed without mutating anything.
    pub fn check(
        &self,
        kind: OperationKind,
        path: &TargetPath,
        value: Option<&Value>,
    ) -> Result<(), ApplyError> {
        match kind {
            OperationKind::InsertField => self.check_insert(path, value),
            OperationKind::DeleteField => self.check_existing(path).map(|_| ()),
            OperationKind::UpdateField => {
                require_value(value)?;
                self.check_existing(path).map(|_| ())
            }
            OperationKind::MoveField => self.check_move(path, value).map(|_| ()),
            OperationKind::UpdateSetting => {
                require_value(value)?;
                self.check_setting(path)
            }
        }
    }

    /// Applies one edit and returns the value it replaced (the source index for moves).
    pub fn apply(
        &mut self,
        kind: OperationKind,
        path: &TargetPath,
        value: Option<&Value>,
    ) -> Result<Option<Value>, ApplyError> {
        self.check(kind, path, value)?;

        match kind {
            OperationKind::InsertField => {
                let value = require_value(value)?.clone();
                let Some(last) = path.last() else {
                    self.root = value;
                    return Ok(None);
                };
                let parent = self.parent_mut(path)?;
                match (parent, last) {
                    (Value::Object(map), Segment::Key(key)) => {
                        map.insert(key.clone(), value);
                    }
                    (Value::Array(items), Segment::Index(index)) => items.insert(*index, value),
                    _ => return Err(ApplyError::InvalidTarget(path.to_string())),
                }
                Ok(None)
            }
            OperationKind::DeleteField => {
                let last = path.last().ok_or_else(|| ApplyError::InvalidTarget(path.to_string()))?;
                let parent = self.parent_mut(path)?;
                let removed = match (parent, last) {
                    (Value::Object(map), Segment::Key(key)) => map.remove(key),
                    (Value::Array(items), Segment::Index(index)) => Some(items.remove(*index)),
                    _ => None,
                };
                removed.map(Some).ok_or_else(|| ApplyError::TargetMissing(path.to_string()))
            }
            OperationKind::UpdateField => {
                let value = require_value(value)?.clone();
                let slot = self.get_mut(path).ok_or_else(|| ApplyError::TargetMissing(path.to_string()))?;
                Ok(Some(std::mem::replace(slot, value)))
            }
            OperationKind::MoveField => {
                let (from, to) = self.check_move(path, value)?;
                let parent = self.parent_mut(path)?;
                let Value::Array(items) = parent else {
                    return Err(ApplyError::InvalidTarget(path.to_string()));
                };
                let item = items.remove(from);
                items.insert(to, item);
                Ok(Some(Value::from(from as u64)))
            }
            OperationKind::UpdateSetting => {
                let value = require_value(value)?.clone();
                let previous = self.get(path).cloned();
                let mut current = &mut self.root;
                for segment in path.segments() {
                    current = match (current, segment) {
                        (Value::Object(map), Segment::Key(key)) => {
                            map.entry(key.clone()).or_insert_with(|| Value::Object(Map::new()))
                        }
                        (Value::Array(items), Segment::Index(index)) => items
                            .get_mut(*index)
                            .ok_or_else(|| ApplyError::TargetMissing(path.to_string()))?,
                        _ => return Err(ApplyError::InvalidTarget(path.to_string())),
                    };
                }
                *current = value;
                Ok(previous)
            }
        }
    }

    fn check_insert(&self, path: &TargetPath, value: Option<&Value>) -> Result<(), ApplyError> {
        require_value(value)?;
        let Some(last) = path.last() else {
            return if self.is_empty() {
                Ok(())
            } else {
                Err(ApplyError::TargetExists(path.to_string()))
            };
        };

        let parent = self.parent(path)?;
        match (parent, last) {
            (Value::Object(map), Segment::Key(key)) => {
                if map.contains_key(key) {
                    Err(ApplyError::TargetExists(path.to_string()))
                } else {
                    Ok(())
                }
            }
            (Value::Array(items), Segment::Index(index)) => {
                if *index <= items.len() {
                    Ok(())
                } else {
                    Err(ApplyError::InvalidTarget(path.to_string()))
                }
            }
            _ => Err(ApplyError::InvalidTarget(path.to_string())),
        }
    }

    fn check_existing(&self, path: &TargetPath) -> Result<&Value, ApplyError> {
        if path.is_root() {
            return Err(ApplyError::InvalidTarget(path.to_string()));
        }
        self.parent(path)?;
        self.get(path).ok_or_else(|| ApplyError::TargetMissing(path.to_string()))
    }

    fn check_move(&self, path: &TargetPath, value: Option<&Value>) -> Result<(usize, usize), ApplyError> {
        let destination = require_value(value)?
            .as_u64()
            .ok_or_else(|| ApplyError::InvalidValue("move destination must be an index".into()))?;
        let Some(Segment::Index(from)) = path.last() else {
            return Err(ApplyError::InvalidTarget(path.to_string()));
        };

        let Value::Array(items) = self.parent(path)? else {
            return Err(ApplyError::InvalidTarget(path.to_string()));
        };
        if *from >= items.len() {
            return Err(ApplyError::TargetMissing(path.to_string()));
        }
        let to = usize::try_from(destination)
            .ok()
            .filter(|to| *to < items.len())
            .ok_or_else(|| ApplyError::InvalidValue(format!("move destination {destination} out of range")))?;

        Ok((*from, to))
    }

    fn check_setting(&self, path: &TargetPath) -> Result<(), ApplyError> {
        if path.is_root() {
            return Err(ApplyError::InvalidTarget(path.to_string()));
        }

        let mut current = Some(&self.root);
        for segment in path.segments() {
            let Some(node) = current else {
                // Missing intermediates are created, but only as objects.
                if matches!(segment, Segment::Index(_)) {
                    return Err(ApplyError::TargetMissing(path.to_string()));
                }
                continue;
            };
            match (node, segment) {
                (Value::Object(map), Segment::Key(key)) => current = map.get(key),
                (Value::Array(items), Segment::Index(index)) => match items.get(*index) {
                    Some(item) => current = Some(item),
                    None => return Err(ApplyError::TargetMissing(path.to_string())),
                },
                _ => return Err(ApplyError::InvalidTarget(path.to_string())),
            }
        }
        Ok(())
    }

    fn parent(&self, path: &TargetPath) -> Result<&Value, ApplyError> {
        let parent_path = path.parent().ok_or_else(|| ApplyError::InvalidTarget(path.to_string()))?;
        self.get(&parent_path).ok_or_else(|| ApplyError::TargetMissing(path.to_string()))
    }

    fn parent_mut(&mut self, path: &TargetPath) -> Result<&mut Value, ApplyError> {
        let parent_path = path.parent().ok_or_else(|| ApplyError::InvalidTarget(path.to_string()))?;
        self.get_mut(&parent_path).ok_or_else(|| ApplyError::TargetMissing(path.to_string()))
    }

    fn get_mut(&mut self, path: &TargetPath) -> Option<&mut Value> {
        let mut current = &mut self.root;
        for segment in path.segments() {
            current = match (current, segment) {
                (Value::Object(map), Segment::Key(key)) => map.get_mut(key)?,
                (Value::Array(items), Segment::Index(index)) => items.get_mut(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn child<'a>(value: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (value, segment) {
        (Value::Object(map), Segment::Key(key)) => map.get(key),
        (Value::Array(items), Segment::Index(index)) => items.get(*index),
        _ => None,
    }
}

fn require_value(value: Option<&Value>) -> Result<&Value, ApplyError> {
    value.ok_or(ApplyError::MissingValue)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn path(input: &str) -> TargetPath {
        TargetPath::parse(input).expect("path should parse")
    }

    fn form() -> FormDocument {
        FormDocument::from_value(json!({
            "fields": [
                { "id": "f1", "label": "Name" },
                { "id": "f2", "label": "Email" },
                { "id": "f3", "label": "Phone" }
            ],
            "f1": { "label": "" },
            "settings": { "theme": "light" }
        }))
    }

    #[test]
    fn insert_into_object_and_array() {
        let mut doc = form();
        doc.apply(OperationKind::InsertField, &path("f2"), Some(&json!({ "label": "Age" })))
            .expect("insert object key should apply");
        doc.apply(OperationKind::InsertField, &path("fields[1]"), Some(&json!({ "id": "f9" })))
            .expect("insert array element should apply");

        assert_eq!(doc.get(&path("f2.label")), Some(&json!("Age")));
        assert_eq!(doc.get(&path("fields[1].id")), Some(&json!("f9")));
        assert_eq!(doc.get(&path("fields[2].id")), Some(&json!("f2")));
    }

    #[test]
    fn insert_rejects_existing_key_and_missing_parent() {
        let mut doc = form();
        assert_eq!(
            doc.apply(OperationKind::InsertField, &path("f1"), Some(&json!({}))),
            Err(ApplyError::TargetExists("f1".into()))
        );
        assert_eq!(
            doc.apply(OperationKind::InsertField, &path("f7.label"), Some(&json!("x"))),
            Err(ApplyError::TargetMissing("f7.label".into()))
        );
        assert_eq!(doc, form());
    }

    #[test]
    fn root_insert_only_seeds_an_empty_document() {
        let mut empty = FormDocument::new();
        empty
            .apply(OperationKind::InsertField, &TargetPath::root(), Some(&json!({ "a": 1 })))
            .expect("root insert into empty document should apply");
        assert_eq!(empty.as_value(), &json!({ "a": 1 }));

        assert_eq!(
            empty.apply(OperationKind::InsertField, &TargetPath::root(), Some(&json!({}))),
            Err(ApplyError::TargetExists(String::new()))
        );
    }

    #[test]
    fn delete_then_update_child_is_target_missing() {
        let mut doc = form();
        let previous = doc
            .apply(OperationKind::DeleteField, &path("f1"), None)
            .expect("delete should apply");
        assert_eq!(previous, Some(json!({ "label": "" })));

        assert_eq!(
            doc.apply(OperationKind::UpdateField, &path("f1.label"), Some(&json!("Name"))),
            Err(ApplyError::TargetMissing("f1.label".into()))
        );
        assert_eq!(
            doc.apply(OperationKind::UpdateField, &path("f1"), Some(&json!({ "label": "x" }))),
            Err(ApplyError::TargetMissing("f1".into()))
        );
    }

    #[test]
    fn update_replaces_and_returns_previous() {
        let mut doc = form();
        let previous = doc
            .apply(OperationKind::UpdateField, &path("fields[0].label"), Some(&json!("Full Name")))
            .expect("update should apply");
        assert_eq!(previous, Some(json!("Name")));
        assert_eq!(doc.get(&path("fields[0].label")), Some(&json!("Full Name")));
    }

    #[test]
    fn update_requires_value() {
        let mut doc = form();
        assert_eq!(
            doc.apply(OperationKind::UpdateField, &path("f1.label"), None),
            Err(ApplyError::MissingValue)
        );
    }

    #[test]
    fn move_reorders_array_elements() {
        let mut doc = form();
        let previous = doc
            .apply(OperationKind::MoveField, &path("fields[0]"), Some(&json!(2)))
            .expect("move should apply");
        assert_eq!(previous, Some(json!(0)));

        let ids: Vec<_> = doc
            .get(&path("fields"))
            .and_then(Value::as_array)
            .expect("fields should be an array")
            .iter()
            .map(|field| field["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("f2"), json!("f3"), json!("f1")]);
    }

    #[test]
    fn move_validates_source_and_destination() {
        let mut doc = form();
        assert!(matches!(
            doc.apply(OperationKind::MoveField, &path("fields[0]"), Some(&json!(3))),
            Err(ApplyError::InvalidValue(_))
        ));
        assert_eq!(
            doc.apply(OperationKind::MoveField, &path("fields[5]"), Some(&json!(0))),
            Err(ApplyError::TargetMissing("fields[5]".into()))
        );
        assert_eq!(
            doc.apply(OperationKind::MoveField, &path("f1"), Some(&json!(0))),
            Err(ApplyError::InvalidTarget("f1".into()))
        );
        assert_eq!(doc, form());
    }

    #[test]
    fn update_setting_creates_missing_objects() {
        let mut doc = form();
        let previous = doc
            .apply(OperationKind::UpdateSetting, &path("settings.branding.color"), Some(&json!("#fff")))
            .expect("setting should apply");
        assert_eq!(previous, None);
        assert_eq!(doc.get(&path("settings.branding.color")), Some(&json!("#fff")));

        let previous = doc
            .apply(OperationKind::UpdateSetting, &path("settings.theme"), Some(&json!("dark")))
            .expect("setting should apply");
        assert_eq!(previous, Some(json!("light")));
    }

    #[test]
    fn update_setting_rejects_scalar_intermediates() {
        let mut doc = form();
        assert_eq!(
            doc.apply(OperationKind::UpdateSetting, &path("settings.theme.mode"), Some(&json!("x"))),
            Err(ApplyError::InvalidTarget("settings.theme.mode".into()))
        );
        assert_eq!(doc, form());
    }

    #[test]
    fn root_cannot_be_deleted_or_updated() {
        let mut doc = form();
        assert!(matches!(
            doc.apply(OperationKind::DeleteField, &TargetPath::root(), None),
            Err(ApplyError::InvalidTarget(_))
        ));
        assert!(matches!(
            doc.apply(OperationKind::UpdateField, &TargetPath::root(), Some(&json!({}))),
            Err(ApplyError::InvalidTarget(_))
        ));
    }
}
