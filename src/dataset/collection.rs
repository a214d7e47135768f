//! An opened dataset: metadata plus the identity and datapoint indexes
//! discovered by scanning its directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::DatasetError;
use crate::metadata;

use super::meta::DatasetMeta;
use super::point::{Datapoint, FileRole, Identity};

/// A named, lineage-tracked collection of identities and datapoints.
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    folder: PathBuf,
    meta_path: PathBuf,
    meta: DatasetMeta,
    identities: BTreeMap<String, Identity>,
    datapoints: BTreeMap<String, Datapoint>,
}

impl Dataset {
    /// Scans `folder` in file-name order and builds the indexes.
    pub(crate) fn scan(
        name: &str,
        folder: PathBuf,
        meta_path: PathBuf,
        meta: DatasetMeta,
    ) -> Result<Self, DatasetError> {
        let mut file_names = Vec::new();
        for entry in fs::read_dir(&folder)? {
            let entry = entry?;
            file_names.push(entry.file_name().to_string_lossy().into_owned());
        }
        file_names.sort();

        let mut identities = BTreeMap::new();
        let mut datapoints = BTreeMap::new();
        for file_name in &file_names {
            let Some(FileRole::Point {
                identity,
                point,
                kind,
            }) = FileRole::parse(file_name)
            else {
                continue;
            };
            let datapoint = Datapoint::new(&folder, &identity, &point, kind);
            // A softlinked view whose parent is gone points nowhere.
            if !datapoint.path().exists() {
                return Err(DatasetError::Inconsistent(format!(
                    "datapoint '{}' of dataset '{}' is a dangling link",
                    file_name, name
                )));
            }
            identities
                .entry(identity.clone())
                .or_insert_with(|| Identity::new(&folder, &identity))
                .add_point();
            datapoints.insert(datapoint.key(), datapoint);
        }

        debug!(
            dataset = name,
            identities = identities.len(),
            datapoints = datapoints.len(),
            "Scanned dataset"
        );

        Ok(Self {
            name: name.to_string(),
            folder,
            meta_path,
            meta,
            identities,
            datapoints,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    /// Mutable metadata; call [`Dataset::save_meta`] to persist changes.
    pub fn meta_mut(&mut self) -> &mut DatasetMeta {
        &mut self.meta
    }

    pub fn is_original(&self) -> bool {
        self.meta.is_original()
    }

    pub fn is_softlinked(&self) -> bool {
        self.meta.softlinked
    }

    pub fn identities(&self) -> &BTreeMap<String, Identity> {
        &self.identities
    }

    pub fn identity(&self, name: &str) -> Option<&Identity> {
        self.identities.get(name)
    }

    /// Identity names in sorted order.
    pub fn identity_names(&self) -> Vec<String> {
        self.identities.keys().cloned().collect()
    }

    pub fn datapoints(&self) -> &BTreeMap<String, Datapoint> {
        &self.datapoints
    }

    /// Looks up a datapoint by its `<identity>.<point>` key.
    pub fn point(&self, key: &str) -> Result<&Datapoint, DatasetError> {
        self.datapoints
            .get(key)
            .ok_or_else(|| DatasetError::PointNotFound {
                dataset: self.name.clone(),
                point: key.to_string(),
            })
    }

    /// Datapoint keys in sorted order.
    pub fn point_keys(&self) -> Vec<String> {
        self.datapoints.keys().cloned().collect()
    }

    pub fn point_count(&self) -> usize {
        self.datapoints.len()
    }

    /// Datapoint keys grouped by identity, both levels sorted.
    pub fn points_by_identity(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for point in self.datapoints.values() {
            grouped
                .entry(point.identity().to_string())
                .or_default()
                .push(point.key());
        }
        grouped
    }

    /// Datapoints of one identity.
    pub fn points_of<'a>(&'a self, identity: &'a str) -> impl Iterator<Item = &'a Datapoint> + 'a {
        self.datapoints
            .values()
            .filter(move |p| p.identity() == identity)
    }

    /// Writes the metadata document.
    pub fn save_meta(&self) -> Result<(), DatasetError> {
        metadata::save_as(&self.meta_path, &self.meta)?;
        Ok(())
    }

    /// Re-reads the metadata document, dropping unsaved changes.
    pub fn reload_meta(&mut self) -> Result<(), DatasetError> {
        self.meta = metadata::load_as(&self.meta_path)?;
        Ok(())
    }

    /// Sets a shared metadata key after re-reading the document, so that
    /// entries written by other pipelines since open are kept.
    pub fn update_shared_key(&mut self, key: &str, value: Value) -> Result<(), DatasetError> {
        self.reload_meta()?;
        self.meta.extra.insert(key.to_string(), value);
        self.save_meta()
    }

    /// SHA-256 over the sorted file names and contents of the dataset.
    ///
    /// Symbolic links are followed, so a softlinked view has the same
    /// digest as a copy of the same files.
    pub fn content_digest(&self) -> Result<String, DatasetError> {
        let mut file_names = Vec::new();
        for entry in fs::read_dir(&self.folder)? {
            file_names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        file_names.sort();

        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        for file_name in &file_names {
            hasher.update(file_name.as_bytes());
            hasher.update([0u8]);
            let mut file = fs::File::open(self.folder.join(file_name))?;
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
