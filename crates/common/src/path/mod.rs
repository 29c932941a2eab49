// Target path addressing for form documents.

mod target;

pub use target::{PathError, Segment, TargetPath, MAX_PATH_CHARS};
