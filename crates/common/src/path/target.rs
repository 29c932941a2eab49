// Target paths: `fields[3].label`, `f1.label`, `settings.theme`, or "" for the root.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum allowed path length in characters.
pub const MAX_PATH_CHARS: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path contains an empty key segment")]
    EmptySegment,

    #[error("path contains invalid index: {0}")]
    InvalidIndex(String),

    #[error("path contains unbalanced brackets: {0}")]
    UnbalancedBracket(String),

    #[error("path contains null byte")]
    NullByte,
}

/// One step into the document tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Address of a node inside a form document.
///
/// Paths are totally ordered so they can key ordered maps; ancestors sort
/// before their descendants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetPath {
    segments: Vec<Segment>,
}

impl TargetPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Parse the textual form.
    ///
    /// Rules:
    /// - `.` separates keys
    /// - each key may be followed by any number of `[n]` array indexes
    /// - a leading `[n]` indexes into a root array
    /// - the empty string is the root
    pub fn parse(input: &str) -> Result<Self, PathError> {
        if input.chars().count() > MAX_PATH_CHARS {
            return Err(PathError::TooLong);
        }
        if input.contains('\0') {
            return Err(PathError::NullByte);
        }

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for raw in trimmed.split('.') {
            let first = segments.is_empty();
            parse_component(raw, &mut segments, first)?;
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// `None` for the root.
    pub fn parent(&self) -> Option<TargetPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self { segments: self.segments[..self.segments.len() - 1].to_vec() })
    }

    /// True when `self` equals `other` or lies above it in the tree.
    pub fn is_prefix_of(&self, other: &TargetPath) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn is_ancestor_of(&self, other: &TargetPath) -> bool {
        self.segments.len() < other.segments.len() && self.is_prefix_of(other)
    }

    pub fn is_descendant_of(&self, other: &TargetPath) -> bool {
        other.is_ancestor_of(self)
    }

    /// Two paths overlap when one contains the other.
    pub fn overlaps(&self, other: &TargetPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Path of `self` relative to `prefix`.
    pub fn strip_prefix(&self, prefix: &TargetPath) -> Option<TargetPath> {
        if !prefix.is_prefix_of(self) {
            return None;
        }
        Some(Self { segments: self.segments[prefix.segments.len()..].to_vec() })
    }

    pub fn join(&self, relative: &TargetPath) -> TargetPath {
        let mut segments = self.segments.clone();
        segments.extend(relative.segments.iter().cloned());
        Self { segments }
    }

    pub fn child_key(&self, key: impl Into<String>) -> TargetPath {
        let mut segments = self.segments.clone();
        segments.push(Segment::Key(key.into()));
        Self { segments }
    }

    pub fn child_index(&self, index: usize) -> TargetPath {
        let mut segments = self.segments.clone();
        segments.push(Segment::Index(index));
        Self { segments }
    }
}

fn parse_component(raw: &str, segments: &mut Vec<Segment>, first: bool) -> Result<(), PathError> {
    let (key, mut rest) = match raw.find('[') {
        Some(position) => (&raw[..position], &raw[position..]),
        None => (raw, ""),
    };

    if key.contains(']') {
        return Err(PathError::UnbalancedBracket(raw.to_string()));
    }

    if key.is_empty() {
        // Only a root array may be addressed without a leading key.
        if !(first && !rest.is_empty()) {
            return Err(PathError::EmptySegment);
        }
    } else {
        segments.push(Segment::Key(key.to_string()));
    }

    while !rest.is_empty() {
        let Some(stripped) = rest.strip_prefix('[') else {
            return Err(PathError::UnbalancedBracket(raw.to_string()));
        };
        let Some(close) = stripped.find(']') else {
            return Err(PathError::UnbalancedBracket(raw.to_string()));
        };
        let digits = &stripped[..close];
        if digits.is_empty() || !digits.chars().all(|character| character.is_ascii_digit()) {
            return Err(PathError::InvalidIndex(digits.to_string()));
        }
        let index =
            digits.parse::<usize>().map_err(|_| PathError::InvalidIndex(digits.to_string()))?;
        segments.push(Segment::Index(index));
        rest = &stripped[close + 1..];
    }

    Ok(())
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(key) => {
                    if position > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(key)?;
                }
                Segment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for TargetPath {
    type Err = PathError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

impl TryFrom<String> for TargetPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TargetPath> for String {
    fn from(value: TargetPath) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(input: &str) -> TargetPath {
        TargetPath::parse(input).expect("path should parse")
    }

    #[test]
    fn parses_keys_and_indexes() {
        let parsed = path("fields[3].label");
        assert_eq!(
            parsed.segments(),
            &[Segment::Key("fields".into()), Segment::Index(3), Segment::Key("label".into())]
        );
        assert_eq!(parsed.to_string(), "fields[3].label");
    }

    #[test]
    fn parses_nested_indexes_and_root_array() {
        assert_eq!(
            path("grid[1][2]").segments(),
            &[Segment::Key("grid".into()), Segment::Index(1), Segment::Index(2)]
        );
        assert_eq!(path("[0].name").to_string(), "[0].name");
    }

    #[test]
    fn empty_input_is_root() {
        assert!(path("").is_root());
        assert!(path("   ").is_root());
        assert_eq!(TargetPath::root().to_string(), "");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(TargetPath::parse("a..b"), Err(PathError::EmptySegment));
        assert_eq!(TargetPath::parse(".a"), Err(PathError::EmptySegment));
        assert_eq!(TargetPath::parse("a[x]"), Err(PathError::InvalidIndex("x".into())));
        assert_eq!(TargetPath::parse("a[]"), Err(PathError::InvalidIndex(String::new())));
        assert!(matches!(TargetPath::parse("a[1"), Err(PathError::UnbalancedBracket(_))));
        assert!(matches!(TargetPath::parse("a]b"), Err(PathError::UnbalancedBracket(_))));
        assert!(matches!(TargetPath::parse("a[1]b"), Err(PathError::UnbalancedBracket(_))));
        assert_eq!(TargetPath::parse("a\0b"), Err(PathError::NullByte));
    }

    #[test]
    fn enforces_max_length() {
        let long = "a".repeat(MAX_PATH_CHARS + 1);
        assert_eq!(TargetPath::parse(&long), Err(PathError::TooLong));
        assert!(TargetPath::parse(&"a".repeat(MAX_PATH_CHARS)).is_ok());
    }

    #[test]
    fn ancestry_relations() {
        let field = path("f2");
        let label = path("f2.label");
        let other = path("f20.label");

        assert!(field.is_ancestor_of(&label));
        assert!(label.is_descendant_of(&field));
        assert!(!field.is_ancestor_of(&field));
        assert!(field.is_prefix_of(&field));
        assert!(field.overlaps(&label));
        assert!(label.overlaps(&field));
        assert!(!field.overlaps(&other));
        assert!(TargetPath::root().is_ancestor_of(&field));
    }

    #[test]
    fn parent_strip_and_join() {
        let label = path("fields[3].label");
        assert_eq!(label.parent(), Some(path("fields[3]")));
        assert_eq!(TargetPath::root().parent(), None);

        let relative = label.strip_prefix(&path("fields")).expect("fields is a prefix");
        assert_eq!(relative.to_string(), "[3].label");
        assert_eq!(path("fields").join(&relative), label);
        assert_eq!(label.strip_prefix(&path("settings")), None);
    }

    #[test]
    fn serializes_as_plain_string() {
        let value = serde_json::to_value(path("f1.label")).expect("path should serialize");
        assert_eq!(value, serde_json::json!("f1.label"));

        let parsed: TargetPath =
            serde_json::from_value(serde_json::json!("fields[0]")).expect("path should decode");
        assert_eq!(parsed, path("fields[0]"));

        let invalid = serde_json::from_value::<TargetPath>(serde_json::json!("a..b"));
        assert!(invalid.is_err());
    }
}
