//! Dataset store: lineage-tracked collections of identities and datapoints.
//!
//! This module provides:
//! - Typed dataset metadata documents and lineage records
//! - Identity and datapoint discovery by directory scan
//! - Non-destructive derivation (copy or symlink) and deletion
//! - Maintenance operations: rename, merge, split, difference, retention

pub mod collection;
pub mod meta;
pub mod motion;
pub mod point;
pub mod store;

pub use collection::Dataset;
pub use meta::{DatasetMeta, Lineage, Modality, Origin, StageKind, PARENT_SEPARATOR};
pub use motion::{channel_range, MotionSequence, POSITION_RANGE_KEY, ROTATION_RANGE_KEY};
pub use point::{point_key, Datapoint, FileRole, Identity, PointKind};
pub use store::{
    DatasetStore, DeriveOptions, DerivationGuard, DiffLevel, PruneDecision, RetentionPolicy,
    META_SUFFIX,
};
