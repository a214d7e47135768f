//! Metadata files and structural matching.
//!
//! Every dataset, identity and datapoint can carry a YAML metadata document.
//! This module provides:
//!
//! - **store**: loading and saving metadata documents
//! - **attributes**: the read-through attribute cache used by identities and datapoints
//! - **matcher**: recursive structural comparison of metadata trees
//!
//! Metadata trees use [`serde_yaml::Value`] as their tagged value type
//! (scalar, mapping or sequence).

pub mod attributes;
pub mod matcher;
pub mod store;

pub use attributes::AttributeCache;
pub use matcher::{explain, matches, Mismatch};
pub use store::{load, load_as, save, save_as, DOCUMENT_MARKER};

pub use serde_yaml::{Mapping, Value};

/// Builds a mapping key from a string.
pub fn key(name: &str) -> Value {
    Value::String(name.to_string())
}
