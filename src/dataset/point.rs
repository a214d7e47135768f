//! Identities and datapoints discovered in a dataset directory.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::error::{DatasetError, MetadataError};
use crate::metadata::{AttributeCache, Mapping};

use super::motion::MotionSequence;

/// Extension of identity and datapoint attribute files.
pub const ATTRIBUTE_EXTENSION: &str = "yaml";

/// Kind of a datapoint, selected by its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PointKind {
    Image,
    LosslessImage,
    MotionSequence,
}

impl PointKind {
    pub const ALL: [PointKind; 3] = [
        PointKind::Image,
        PointKind::LosslessImage,
        PointKind::MotionSequence,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            PointKind::Image => "jpg",
            PointKind::LosslessImage => "png",
            PointKind::MotionSequence => "mocap",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        PointKind::ALL.into_iter().find(|k| k.extension() == ext)
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointKind::Image => write!(f, "image"),
            PointKind::LosslessImage => write!(f, "lossless image"),
            PointKind::MotionSequence => write!(f, "motion sequence"),
        }
    }
}

/// What a file inside a dataset directory represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRole {
    /// `<identity>.yaml`
    IdentityAttributes { identity: String },
    /// `<identity>.<point>.yaml`
    PointAttributes { identity: String, point: String },
    /// `<identity>.<point>.<ext>`
    Point {
        identity: String,
        point: String,
        kind: PointKind,
    },
}

impl FileRole {
    /// Classifies a file name. Unknown layouts and extensions yield `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let parts: Vec<&str> = file_name.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [identity, ext] if *ext == ATTRIBUTE_EXTENSION => Some(FileRole::IdentityAttributes {
                identity: identity.to_string(),
            }),
            [identity, point, ext] if *ext == ATTRIBUTE_EXTENSION => {
                Some(FileRole::PointAttributes {
                    identity: identity.to_string(),
                    point: point.to_string(),
                })
            }
            [identity, point, ext] => PointKind::from_extension(ext).map(|kind| FileRole::Point {
                identity: identity.to_string(),
                point: point.to_string(),
                kind,
            }),
            _ => None,
        }
    }

    /// Identity the file belongs to.
    pub fn identity(&self) -> &str {
        match self {
            FileRole::IdentityAttributes { identity }
            | FileRole::PointAttributes { identity, .. }
            | FileRole::Point { identity, .. } => identity,
        }
    }

    /// Datapoint key (`<identity>.<point>`), `None` for identity attributes.
    pub fn point_key(&self) -> Option<String> {
        match self {
            FileRole::IdentityAttributes { .. } => None,
            FileRole::PointAttributes { identity, point }
            | FileRole::Point {
                identity, point, ..
            } => Some(point_key(identity, point)),
        }
    }
}

/// Key of a datapoint within its dataset.
pub fn point_key(identity: &str, point: &str) -> String {
    format!("{}.{}", identity, point)
}

/// A subject grouping datapoints.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    point_count: usize,
    attributes: AttributeCache,
}

impl Identity {
    pub(crate) fn new(folder: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            point_count: 0,
            attributes: AttributeCache::new(
                folder.join(format!("{}.{}", name, ATTRIBUTE_EXTENSION)),
            ),
        }
    }

    pub(crate) fn add_point(&mut self) {
        self.point_count += 1;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    /// Lazily loaded `<identity>.yaml` attributes.
    pub fn attributes(&self) -> &AttributeCache {
        &self.attributes
    }
}

/// A single biometric sample file.
#[derive(Debug, Clone)]
pub struct Datapoint {
    identity: String,
    name: String,
    kind: PointKind,
    path: PathBuf,
    attributes: AttributeCache,
}

impl Datapoint {
    pub(crate) fn new(folder: &Path, identity: &str, name: &str, kind: PointKind) -> Self {
        Self {
            identity: identity.to_string(),
            name: name.to_string(),
            kind,
            path: folder.join(format!("{}.{}.{}", identity, name, kind.extension())),
            attributes: AttributeCache::new(
                folder.join(format!("{}.{}.{}", identity, name, ATTRIBUTE_EXTENSION)),
            ),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<identity>.<point>`
    pub fn key(&self) -> String {
        point_key(&self.identity, &self.name)
    }

    pub fn kind(&self) -> PointKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily loaded `<identity>.<point>.yaml` attributes.
    pub fn attributes(&self) -> &AttributeCache {
        &self.attributes
    }

    /// Reads one attribute, loading the attribute file on first use.
    pub fn attribute(&self, key: &str) -> Result<Option<Value>, MetadataError> {
        self.attributes.get(key)
    }

    /// All attributes of this datapoint.
    pub fn all_attributes(&self) -> Result<Mapping, MetadataError> {
        Ok(self.attributes.all()?.as_ref().clone())
    }

    /// Loads the motion sequence stored in this datapoint.
    pub fn load_motion(&self) -> Result<MotionSequence, DatasetError> {
        self.require_motion()?;
        MotionSequence::load(&self.path)
    }

    /// Replaces the motion sequence stored in this datapoint.
    pub fn save_motion(&self, sequence: &MotionSequence) -> Result<(), DatasetError> {
        self.require_motion()?;
        sequence.save(&self.path)
    }

    fn require_motion(&self) -> Result<(), DatasetError> {
        if self.kind == PointKind::MotionSequence {
            Ok(())
        } else {
            Err(DatasetError::InvalidArgument(format!(
                "datapoint '{}' is a {}, not a motion sequence",
                self.key(),
                self.kind
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_role_parsing() {
        assert_eq!(
            FileRole::parse("alice.yaml"),
            Some(FileRole::IdentityAttributes {
                identity: "alice".to_string()
            })
        );
        assert_eq!(
            FileRole::parse("alice.0001.yaml"),
            Some(FileRole::PointAttributes {
                identity: "alice".to_string(),
                point: "0001".to_string()
            })
        );
        assert_eq!(
            FileRole::parse("alice.0001.png"),
            Some(FileRole::Point {
                identity: "alice".to_string(),
                point: "0001".to_string(),
                kind: PointKind::LosslessImage
            })
        );
        assert_eq!(FileRole::parse("alice.0001.txt"), None);
        assert_eq!(FileRole::parse("README"), None);
        assert_eq!(FileRole::parse("a.b.c.jpg"), None);
        assert_eq!(FileRole::parse(".hidden.yaml"), None);
    }

    #[test]
    fn test_point_key_of_roles() {
        let role = FileRole::parse("bob.7.mocap").unwrap();
        assert_eq!(role.identity(), "bob");
        assert_eq!(role.point_key().as_deref(), Some("bob.7"));
        assert_eq!(FileRole::parse("bob.yaml").unwrap().point_key(), None);
    }

    #[test]
    fn test_datapoint_paths() {
        let folder = Path::new("/data/faces");
        let point = Datapoint::new(folder, "alice", "0001", PointKind::Image);
        assert_eq!(point.key(), "alice.0001");
        assert_eq!(point.path(), Path::new("/data/faces/alice.0001.jpg"));
        assert_eq!(
            point.attributes().path(),
            Path::new("/data/faces/alice.0001.yaml")
        );
        assert!(point.load_motion().is_err());
    }
}
