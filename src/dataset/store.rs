//! Filesystem-backed dataset store.
//!
//! Every dataset lives in `<root>/<name>/` with its metadata document in
//! `<root>/<name>.meta.yaml`. Derivation never touches the parent: files are
//! either copied or symlinked into a fresh directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::DatasetError;
use crate::metadata;

use super::collection::Dataset;
use super::meta::{DatasetMeta, Modality, Origin};
use super::point::FileRole;

/// Suffix of dataset metadata documents.
pub const META_SUFFIX: &str = ".meta.yaml";

/// Which files a derivation carries over and how.
#[derive(Debug, Clone, Default)]
pub struct DeriveOptions {
    /// Datapoint keys to keep; `None` keeps all.
    pub only_points: Option<BTreeSet<String>>,
    /// Identities to keep; `None` keeps all.
    pub only_identities: Option<BTreeSet<String>>,
    /// Name of the new dataset; a random UUID when unset.
    pub new_name: Option<String>,
    /// Symlink files instead of copying them.
    pub softlink: bool,
}

impl DeriveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_points = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn identities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_identities = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.new_name = Some(name.into());
        self
    }

    pub fn softlinked(mut self, softlink: bool) -> Self {
        self.softlink = softlink;
        self
    }

    fn keeps(&self, role: &FileRole) -> bool {
        if let Some(identities) = &self.only_identities {
            if !identities.contains(role.identity()) {
                return false;
            }
        }
        match (&self.only_points, role.point_key()) {
            (Some(points), Some(key)) => points.contains(&key),
            // Identity attribute files pass the point filter.
            _ => true,
        }
    }
}

/// Granularity of [`DatasetStore::difference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffLevel {
    /// Datapoints of `full` missing from `part`.
    Point,
    /// Identities of `full` missing from `part`.
    Identity,
}

/// Which datasets a retention sweep keeps.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    /// Anonymization/de-anonymization strategy names whose outputs are kept.
    pub keep_stage_names: BTreeSet<String>,
    /// Datasets whose name contains any of these are kept.
    pub keep_name_patterns: Vec<String>,
}

impl RetentionPolicy {
    fn judge(&self, meta: &DatasetMeta) -> (bool, String) {
        if meta.is_original() {
            return (true, "original".to_string());
        }
        if let Some(pattern) = self
            .keep_name_patterns
            .iter()
            .find(|p| meta.name.contains(p.as_str()))
        {
            return (true, format!("named {}", pattern));
        }
        match &meta.lineage {
            Some(lineage) if lineage.stage_kind.is_mutating() => {
                let reason = format!("{}:{}", lineage.stage_kind, lineage.stage_name);
                (self.keep_stage_names.contains(&lineage.stage_name), reason)
            }
            Some(lineage) => (false, lineage.stage_kind.to_string()),
            None => (false, "unknown".to_string()),
        }
    }
}

/// Outcome of a retention sweep for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneDecision {
    pub name: String,
    pub keep: bool,
    pub reason: String,
}

/// Store of all datasets under one data root.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    /// Create a store over `root` without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a store, creating the data root if needed.
    pub fn open_or_create(root: impl Into<PathBuf>) -> Result<Self, DatasetError> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, META_SUFFIX))
    }

    /// Whether a metadata document for `name` exists.
    pub fn exists(&self, name: &str) -> bool {
        self.meta_path(name).is_file()
    }

    /// Opens a dataset by name.
    ///
    /// # Errors
    /// `NotFound` if there is no metadata document, `Inconsistent` if the
    /// document exists without its directory.
    pub fn open(&self, name: &str) -> Result<Dataset, DatasetError> {
        validate_name(name)?;
        let meta_path = self.meta_path(name);
        if !meta_path.is_file() {
            return Err(DatasetError::NotFound(name.to_string()));
        }
        let folder = self.folder(name);
        if !folder.is_dir() {
            return Err(DatasetError::Inconsistent(format!(
                "metadata for '{}' exists but its directory is missing",
                name
            )));
        }
        let meta: DatasetMeta = metadata::load_as(&meta_path)?;
        if meta.name != name {
            return Err(DatasetError::InvalidMetadata {
                name: name.to_string(),
                message: format!("document names dataset '{}'", meta.name),
            });
        }
        Dataset::scan(name, folder, meta_path, meta)
    }

    /// Registers a root dataset, creating its directory if needed.
    ///
    /// Used by importers that place datapoint files themselves.
    pub fn create_root(
        &self,
        name: &str,
        modality: Modality,
        attributes: BTreeMap<String, Value>,
    ) -> Result<Dataset, DatasetError> {
        validate_name(name)?;
        if self.exists(name) {
            return Err(DatasetError::AlreadyExists(name.to_string()));
        }
        fs::create_dir_all(self.folder(name))?;
        let mut meta = DatasetMeta::root(name, modality);
        meta.extra = attributes;
        metadata::save_as(&self.meta_path(name), &meta)?;
        info!(dataset = name, trait_ = %modality, "Registered root dataset");
        self.open(name)
    }

    /// Derives a new dataset from `parent`.
    ///
    /// The new dataset records `parent` as its origin and inherits the root
    /// metadata. On any failure the partially written dataset is removed.
    pub fn derive(&self, parent: &Dataset, options: &DeriveOptions) -> Result<Dataset, DatasetError> {
        let name = match &options.new_name {
            Some(name) => name.clone(),
            None => Uuid::new_v4().to_string(),
        };
        validate_name(&name)?;
        let folder = self.folder(&name);
        if self.exists(&name) || folder.exists() {
            return Err(DatasetError::AlreadyExists(name));
        }

        fs::create_dir_all(&folder)?;
        match self.populate(parent, &name, &folder, options) {
            Ok(count) => {
                debug!(
                    parent = parent.name(),
                    dataset = %name,
                    files = count,
                    softlink = options.softlink,
                    "Derived dataset"
                );
                self.open(&name)
            }
            Err(e) => {
                warn!(dataset = %name, error = %e, "Derivation failed, removing partial dataset");
                self.remove_files(&name);
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        parent: &Dataset,
        name: &str,
        folder: &Path,
        options: &DeriveOptions,
    ) -> Result<usize, DatasetError> {
        // Absolute link targets keep views valid regardless of the cwd.
        let source = fs::canonicalize(parent.folder())?;
        let mut file_names = Vec::new();
        for entry in fs::read_dir(&source)? {
            file_names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        file_names.sort();

        let mut count = 0;
        for file_name in file_names {
            let Some(role) = FileRole::parse(&file_name) else {
                continue;
            };
            if !options.keeps(&role) {
                continue;
            }
            let from = source.join(&file_name);
            let to = folder.join(&file_name);
            if options.softlink {
                // Link the real file so views of views survive their parent.
                link_file(&fs::canonicalize(&from)?, &to)?;
            } else {
                fs::copy(&from, &to)?;
            }
            count += 1;
        }

        let meta = DatasetMeta {
            name: name.to_string(),
            modality: parent.meta().modality,
            original: Origin::Derived(parent.name().to_string()),
            lineage: None,
            original_metadata: parent.meta().root_metadata(),
            softlinked: options.softlink,
            extra: BTreeMap::new(),
        };
        metadata::save_as(&self.meta_path(name), &meta)?;
        Ok(count)
    }

    /// Removes a dataset's directory and metadata document.
    pub fn delete(&self, dataset: Dataset) -> Result<(), DatasetError> {
        self.delete_by_name(dataset.name())
    }

    /// Removes a dataset by name.
    pub fn delete_by_name(&self, name: &str) -> Result<(), DatasetError> {
        validate_name(name)?;
        if !self.exists(name) && !self.folder(name).exists() {
            return Err(DatasetError::NotFound(name.to_string()));
        }
        warn!(dataset = name, "Deleting dataset");
        let folder = self.folder(name);
        if folder.exists() {
            // remove_dir_all does not follow symlinks, parents stay intact.
            fs::remove_dir_all(&folder)?;
        }
        let meta_path = self.meta_path(name);
        if meta_path.exists() {
            fs::remove_file(&meta_path)?;
        }
        Ok(())
    }

    fn remove_files(&self, name: &str) {
        let _ = fs::remove_dir_all(self.folder(name));
        let _ = fs::remove_file(self.meta_path(name));
    }

    /// Names of all datasets with a metadata document, sorted.
    pub fn list_names(&self) -> Result<Vec<String>, DatasetError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let file_name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(name) = file_name.strip_suffix(META_SUFFIX) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// All metadata documents, sorted by dataset name.
    ///
    /// # Errors
    /// `Inconsistent` when a document has no directory or a directory has
    /// no document.
    pub fn list_metadata(&self) -> Result<Vec<(String, Value)>, DatasetError> {
        let names = self.list_names()?;
        let known: BTreeSet<&str> = names.iter().map(String::as_str).collect();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir()
                && !file_name.starts_with('.')
                && !known.contains(file_name.as_str())
            {
                return Err(DatasetError::Inconsistent(format!(
                    "directory '{}' has no metadata document",
                    file_name
                )));
            }
        }

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if !self.folder(&name).is_dir() {
                return Err(DatasetError::Inconsistent(format!(
                    "metadata for '{}' exists but its directory is missing",
                    name
                )));
            }
            let document = metadata::load(&self.meta_path(&name))?;
            records.push((name, Value::Mapping(document)));
        }
        Ok(records)
    }

    /// Writes a dataset's metadata document.
    pub fn save_meta(&self, dataset: &Dataset) -> Result<(), DatasetError> {
        dataset.save_meta()
    }

    /// Renames a dataset. The destination must not exist.
    pub fn rename(&self, old: &str, new: &str) -> Result<Dataset, DatasetError> {
        validate_name(new)?;
        let mut dataset = self.open(old)?;
        if self.exists(new) || self.folder(new).exists() {
            return Err(DatasetError::AlreadyExists(new.to_string()));
        }
        fs::rename(self.folder(old), self.folder(new))?;
        dataset.meta_mut().name = new.to_string();
        metadata::save_as(&self.meta_path(new), dataset.meta())?;
        fs::remove_file(self.meta_path(old))?;
        info!(from = old, to = new, "Renamed dataset");
        self.open(new)
    }

    /// Creates a dataset holding the files of all `names`.
    ///
    /// The first dataset is derived as a copy; files of the others are added
    /// on top, later datasets winning on name clashes.
    pub fn merge(&self, names: &[String], new_name: Option<&str>) -> Result<Dataset, DatasetError> {
        let Some(first_name) = names.first() else {
            return Err(DatasetError::InvalidArgument(
                "merge needs at least one dataset".to_string(),
            ));
        };
        let first = self.open(first_name)?;
        let new_name = match new_name {
            Some(name) => name.to_string(),
            None => format!("{}-merged", strip_part_suffix(first_name)),
        };
        let merged = self.derive(&first, &DeriveOptions::new().named(&new_name))?;

        for name in &names[1..] {
            let other = self.open(name)?;
            if other.meta().modality != merged.meta().modality {
                self.remove_files(&new_name);
                return Err(DatasetError::InvalidArgument(format!(
                    "cannot merge {} dataset '{}' into {} dataset",
                    other.meta().modality,
                    name,
                    merged.meta().modality
                )));
            }
            for entry in WalkDir::new(other.folder()).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| DatasetError::Io(e.into()))?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if FileRole::parse(&file_name).is_some() {
                    fs::copy(entry.path(), merged.folder().join(&file_name))?;
                }
            }
        }

        let mut merged = self.open(&new_name)?;
        merged.meta_mut().original = Origin::from_parents(names);
        merged.save_meta()?;
        info!(dataset = %new_name, sources = names.len(), "Merged datasets");
        Ok(merged)
    }

    /// Splits a dataset into `parts` contiguous chunks of datapoints named
    /// `<name>-pt<i>`.
    pub fn split_into_parts(&self, name: &str, parts: usize) -> Result<Vec<Dataset>, DatasetError> {
        if parts == 0 {
            return Err(DatasetError::InvalidArgument(
                "number of parts must be positive".to_string(),
            ));
        }
        let dataset = self.open(name)?;
        let keys = dataset.point_keys();
        let chunk = keys.len().div_ceil(parts).max(1);

        let mut created = Vec::with_capacity(parts);
        for i in 0..parts {
            let start = (i * chunk).min(keys.len());
            let end = ((i + 1) * chunk).min(keys.len());
            let options = DeriveOptions::new()
                .points(keys[start..end].iter().cloned())
                .named(format!("{}-pt{}", name, i));
            match self.derive(&dataset, &options) {
                Ok(part) => created.push(part),
                Err(e) => {
                    for part in created {
                        let _ = self.delete(part);
                    }
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    /// Derives the part of `full` not contained in `part`.
    pub fn difference(
        &self,
        full: &str,
        part: &str,
        level: DiffLevel,
        new_name: Option<&str>,
    ) -> Result<Dataset, DatasetError> {
        let full_set = self.open(full)?;
        let part_set = self.open(part)?;
        let mut options = match level {
            DiffLevel::Point => {
                let removed: BTreeSet<String> = part_set.point_keys().into_iter().collect();
                DeriveOptions::new().points(
                    full_set
                        .point_keys()
                        .into_iter()
                        .filter(|k| !removed.contains(k)),
                )
            }
            DiffLevel::Identity => {
                let removed: BTreeSet<String> = part_set.identity_names().into_iter().collect();
                DeriveOptions::new().identities(
                    full_set
                        .identity_names()
                        .into_iter()
                        .filter(|i| !removed.contains(i)),
                )
            }
        };
        if let Some(name) = new_name {
            options = options.named(name);
        }
        self.derive(&full_set, &options)
    }

    /// Turns a derived dataset into a root under a new name.
    ///
    /// The root document is rebuilt from the inherited root metadata, so
    /// import keys such as `fps` survive while lineage is dropped.
    pub fn promote_to_original(&self, name: &str, new_name: &str) -> Result<Dataset, DatasetError> {
        let dataset = self.open(name)?;
        if dataset.is_original() {
            return Err(DatasetError::InvalidArgument(format!(
                "dataset '{}' is already original",
                name
            )));
        }
        if dataset.is_softlinked() {
            return Err(DatasetError::InvalidArgument(format!(
                "dataset '{}' is a softlinked view and cannot become original",
                name
            )));
        }
        let inherited = Value::Mapping(dataset.meta().original_metadata.clone());
        let mut root: DatasetMeta = match serde_yaml::from_value(inherited) {
            Ok(meta) => meta,
            Err(_) => DatasetMeta::root(new_name, dataset.meta().modality),
        };
        root.name = new_name.to_string();
        root.original = Origin::Root(true);
        root.lineage = None;
        root.original_metadata.clear();
        root.softlinked = false;

        let mut renamed = self.rename(name, new_name)?;
        *renamed.meta_mut() = root;
        renamed.save_meta()?;
        info!(from = name, dataset = new_name, "Promoted dataset to original");
        Ok(renamed)
    }

    /// Retention sweep over all datasets.
    ///
    /// Parents of kept softlinked views are kept as well. With `dry_run`
    /// nothing is deleted.
    pub fn prune(&self, policy: &RetentionPolicy, dry_run: bool) -> Result<Vec<PruneDecision>, DatasetError> {
        let mut metas = BTreeMap::new();
        for name in self.list_names()? {
            let meta: DatasetMeta = metadata::load_as(&self.meta_path(&name))?;
            metas.insert(name, meta);
        }

        let mut decisions: BTreeMap<String, PruneDecision> = metas
            .iter()
            .map(|(name, meta)| {
                let (keep, reason) = policy.judge(meta);
                (
                    name.clone(),
                    PruneDecision {
                        name: name.clone(),
                        keep,
                        reason,
                    },
                )
            })
            .collect();

        loop {
            let mut protected = Vec::new();
            for (name, meta) in &metas {
                if meta.softlinked && decisions[name].keep {
                    for parent in meta.parents() {
                        if matches!(decisions.get(parent), Some(d) if !d.keep) {
                            protected.push(parent.to_string());
                        }
                    }
                }
            }
            if protected.is_empty() {
                break;
            }
            for parent in protected {
                if let Some(decision) = decisions.get_mut(&parent) {
                    decision.keep = true;
                    decision.reason = format!("{} (linked)", decision.reason);
                }
            }
        }

        for decision in decisions.values() {
            info!(
                dataset = %decision.name,
                reason = %decision.reason,
                keep = decision.keep,
                dry_run,
                "Retention decision"
            );
            if !decision.keep && !dry_run {
                self.delete_by_name(&decision.name)?;
            }
        }
        Ok(decisions.into_values().collect())
    }

    /// Arms a guard that deletes `dataset` unless committed.
    pub fn guard(&self, dataset: &Dataset, cleanup: bool) -> DerivationGuard<'_> {
        DerivationGuard {
            store: self,
            name: Some(dataset.name().to_string()),
            cleanup,
        }
    }
}

/// Deletes a freshly derived dataset when dropped uncommitted.
///
/// With cleanup disabled the dataset is left on disk for inspection.
#[derive(Debug)]
#[must_use = "an uncommitted guard deletes its dataset when dropped"]
pub struct DerivationGuard<'a> {
    store: &'a DatasetStore,
    name: Option<String>,
    cleanup: bool,
}

impl DerivationGuard<'_> {
    /// Name of the guarded dataset.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Keeps the dataset.
    pub fn commit(mut self) {
        self.name = None;
    }
}

impl Drop for DerivationGuard<'_> {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        if !self.cleanup {
            warn!(dataset = %name, "Leaving partially built dataset in place");
            return;
        }
        if let Err(e) = self.store.delete_by_name(&name) {
            warn!(dataset = %name, error = %e, "Failed to remove partially built dataset");
        }
    }
}

fn validate_name(name: &str) -> Result<(), DatasetError> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains(super::meta::PARENT_SEPARATOR)
    {
        return Err(DatasetError::InvalidArgument(format!(
            "invalid dataset name '{}'",
            name
        )));
    }
    Ok(())
}

fn strip_part_suffix(name: &str) -> &str {
    match name.rfind("-pt") {
        Some(idx) if name[idx + 3..].chars().all(|c| c.is_ascii_digit()) && idx + 3 < name.len() => {
            &name[..idx]
        }
        _ => name,
    }
}

#[cfg(unix)]
pub(crate) fn link_file(from: &Path, to: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(from, to)
}

#[cfg(windows)]
pub(crate) fn link_file(from: &Path, to: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::meta::{Lineage, StageKind};
    use serde_yaml::Mapping;
    use tempfile::TempDir;

    fn seeded_store(identities: usize, points: usize) -> (TempDir, DatasetStore) {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::open_or_create(dir.path().join("data")).unwrap();
        let root = store.create_root("faces", Modality::Face, BTreeMap::new()).unwrap();
        for i in 0..identities {
            fs::write(root.folder().join(format!("id{}.yaml", i)), "---\nage: 30\n").unwrap();
            for p in 0..points {
                fs::write(root.folder().join(format!("id{}.{}.jpg", i, p)), format!("{}-{}", i, p))
                    .unwrap();
            }
        }
        (dir, store)
    }

    #[test]
    fn test_open_scans_identities_and_points() {
        let (_dir, store) = seeded_store(3, 2);
        let faces = store.open("faces").unwrap();
        assert!(faces.is_original());
        assert_eq!(faces.identity_names(), vec!["id0", "id1", "id2"]);
        assert_eq!(faces.point_count(), 6);
        assert_eq!(faces.identity("id1").unwrap().point_count(), 2);
        assert_eq!(
            faces.identity("id1").unwrap().attributes().get("age").unwrap(),
            Some(Value::from(30))
        );
    }

    #[test]
    fn test_open_missing_and_inconsistent() {
        let (_dir, store) = seeded_store(1, 1);
        assert!(matches!(store.open("nope"), Err(DatasetError::NotFound(_))));

        fs::write(store.meta_path("ghost"), "---\nname: ghost\ntrait: face\noriginal: true\n").unwrap();
        assert!(matches!(store.open("ghost"), Err(DatasetError::Inconsistent(_))));
        assert!(matches!(store.list_metadata(), Err(DatasetError::Inconsistent(_))));
    }

    #[test]
    fn test_orphan_directory_is_inconsistent() {
        let (_dir, store) = seeded_store(1, 1);
        fs::create_dir(store.folder("orphan")).unwrap();
        assert!(matches!(store.list_metadata(), Err(DatasetError::Inconsistent(_))));
    }

    #[test]
    fn test_derive_filters_and_inherits_root_metadata() {
        let (_dir, store) = seeded_store(3, 2);
        let faces = store.open("faces").unwrap();
        let before = faces.content_digest().unwrap();

        let child = store
            .derive(&faces, &DeriveOptions::new().points(["id0.0", "id2.1"]))
            .unwrap();
        assert!(Uuid::parse_str(child.name()).is_ok());
        assert_eq!(child.point_keys(), vec!["id0.0", "id2.1"]);
        // Identity attribute files pass the point filter.
        assert!(child.folder().join("id1.yaml").exists());
        assert_eq!(child.meta().original, Origin::Derived("faces".to_string()));
        assert_eq!(
            child.meta().original_metadata.get("name"),
            Some(&Value::from("faces"))
        );

        let grandchild = store
            .derive(&child, &DeriveOptions::new().identities(["id0"]).named("g"))
            .unwrap();
        assert_eq!(grandchild.point_keys(), vec!["id0.0"]);
        assert_eq!(
            grandchild.meta().original_metadata.get("name"),
            Some(&Value::from("faces"))
        );

        store.delete(grandchild).unwrap();
        store.delete(child).unwrap();
        assert_eq!(store.open("faces").unwrap().content_digest().unwrap(), before);
    }

    #[test]
    fn test_derive_existing_target_fails() {
        let (_dir, store) = seeded_store(1, 1);
        let faces = store.open("faces").unwrap();
        store.derive(&faces, &DeriveOptions::new().named("copy")).unwrap();
        assert!(matches!(
            store.derive(&faces, &DeriveOptions::new().named("copy")),
            Err(DatasetError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_softlinked_view_survives_delete_without_touching_parent() {
        let (_dir, store) = seeded_store(2, 2);
        let faces = store.open("faces").unwrap();
        let view = store
            .derive(&faces, &DeriveOptions::new().softlinked(true))
            .unwrap();
        assert!(view.is_softlinked());
        assert_eq!(view.content_digest().unwrap(), faces.content_digest().unwrap());

        store.delete(view).unwrap();
        assert_eq!(store.open("faces").unwrap().point_count(), 4);
    }

    #[test]
    fn test_list_metadata_is_sorted() {
        let (_dir, store) = seeded_store(1, 1);
        let faces = store.open("faces").unwrap();
        store.derive(&faces, &DeriveOptions::new().named("b")).unwrap();
        store.derive(&faces, &DeriveOptions::new().named("a")).unwrap();
        let names: Vec<String> = store
            .list_metadata()
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["a", "b", "faces"]);
    }

    #[test]
    fn test_rename_and_merge() {
        let (_dir, store) = seeded_store(2, 2);
        let faces = store.open("faces").unwrap();
        store.derive(&faces, &DeriveOptions::new().identities(["id0"]).named("x-pt0")).unwrap();
        store.derive(&faces, &DeriveOptions::new().identities(["id1"]).named("x-pt1")).unwrap();

        let merged = store
            .merge(&["x-pt0".to_string(), "x-pt1".to_string()], None)
            .unwrap();
        assert_eq!(merged.name(), "x-merged");
        assert_eq!(merged.point_count(), 4);
        assert_eq!(merged.meta().parents(), vec!["x-pt0", "x-pt1"]);

        let renamed = store.rename("x-merged", "y").unwrap();
        assert_eq!(renamed.meta().name, "y");
        assert!(!store.exists("x-merged"));
        assert!(matches!(store.rename("y", "faces"), Err(DatasetError::AlreadyExists(_))));
    }

    #[test]
    fn test_split_into_parts_and_difference() {
        let (_dir, store) = seeded_store(3, 3);
        let parts = store.split_into_parts("faces", 2).unwrap();
        assert_eq!(parts[0].name(), "faces-pt0");
        assert_eq!(parts[0].point_count() + parts[1].point_count(), 9);

        let rest = store
            .difference("faces", "faces-pt0", DiffLevel::Point, Some("rest"))
            .unwrap();
        assert_eq!(rest.point_keys(), parts[1].point_keys());

        let other_ids = store
            .difference("faces", "faces-pt0", DiffLevel::Identity, None)
            .unwrap();
        let removed = parts[0].identity_names();
        assert!(other_ids.identity_names().iter().all(|i| !removed.contains(i)));
    }

    #[test]
    fn test_promote_to_original() {
        let (_dir, store) = seeded_store(1, 1);
        let faces = store.open("faces").unwrap();
        store.derive(&faces, &DeriveOptions::new().named("tmp")).unwrap();

        let promoted = store.promote_to_original("tmp", "faces2").unwrap();
        assert!(promoted.is_original());
        assert!(promoted.meta().original_metadata.is_empty());
        assert!(store.open("faces2").unwrap().is_original());
    }

    #[test]
    fn test_prune_keeps_originals_and_linked_parents() {
        let (_dir, store) = seeded_store(1, 1);
        let faces = store.open("faces").unwrap();

        let mut anon = store.derive(&faces, &DeriveOptions::new().named("anon")).unwrap();
        anon.meta_mut().lineage = Some(Lineage::new(StageKind::Anonymization, "blur", Mapping::new()));
        anon.save_meta().unwrap();

        let mut split = store.derive(&faces, &DeriveOptions::new().named("split")).unwrap();
        split.meta_mut().lineage = Some(Lineage::new(StageKind::Splitter, "anon", Mapping::new()));
        split.save_meta().unwrap();

        let mut view = store
            .derive(&split, &DeriveOptions::new().named("view-keep").softlinked(true))
            .unwrap();
        view.meta_mut().lineage = Some(Lineage::new(StageKind::Selector, "full", Mapping::new()));
        view.save_meta().unwrap();

        let policy = RetentionPolicy {
            keep_stage_names: ["blur".to_string()].into_iter().collect(),
            keep_name_patterns: vec!["-keep".to_string()],
        };
        let decisions = store.prune(&policy, true).unwrap();
        let kept: Vec<&str> = decisions
            .iter()
            .filter(|d| d.keep)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(kept, vec!["anon", "faces", "split", "view-keep"]);

        store.delete_by_name("view-keep").unwrap();
        store.prune(&policy, false).unwrap();
        assert!(!store.exists("split"));
        assert!(store.exists("anon"));
    }

    #[test]
    fn test_guard_rolls_back_unless_committed() {
        let (_dir, store) = seeded_store(1, 1);
        let faces = store.open("faces").unwrap();

        let dropped = store.derive(&faces, &DeriveOptions::new().named("dropped")).unwrap();
        {
            let _guard = store.guard(&dropped, true);
        }
        assert!(!store.exists("dropped"));
        assert!(!store.folder("dropped").exists());

        let kept = store.derive(&faces, &DeriveOptions::new().named("kept")).unwrap();
        store.guard(&kept, true).commit();
        assert!(store.exists("kept"));

        let left = store.derive(&faces, &DeriveOptions::new().named("left")).unwrap();
        drop(store.guard(&left, false));
        assert!(store.exists("left"));
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let (_dir, store) = seeded_store(1, 1);
        assert!(store.open("../etc").is_err());
        assert!(store.open("a|b").is_err());
        assert_eq!(strip_part_suffix("x-pt12"), "x");
        assert_eq!(strip_part_suffix("x-ptx"), "x-ptx");
    }
}
