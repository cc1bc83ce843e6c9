//! Automerge value layer.
//!
//! Element values are JSON at the API boundary and automerge structure in
//! the document. [`value`] converts between the two; [`patch`] applies
//! path-scoped edits recorded by a [`Draft`].

pub mod patch;
pub mod value;

pub use patch::{Counters, Draft, Patch, Path, Segment};
pub use value::{insert_json, put_json, read_object, read_prop};
