// formcollab-common: shared types and utilities for collaborative form editing

pub mod clock;
pub mod document;
pub mod path;
pub mod protocol;
pub mod types;
