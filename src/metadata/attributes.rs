//! Read-through attribute cache for identities and datapoints.
//!
//! Attributes live in a sibling YAML file next to the entity they describe.
//! The cache starts unloaded, reads the file on first access and keeps the
//! mapping until [`AttributeCache::reload`] or [`AttributeCache::invalidate`]
//! is called. A missing file is an empty mapping, never an error.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_yaml::{Mapping, Value};

use super::store;
use crate::error::MetadataError;

/// Lazily loaded attribute mapping backed by a metadata file.
#[derive(Debug)]
pub struct AttributeCache {
    path: PathBuf,
    state: RwLock<Option<Arc<Mapping>>>,
}

impl AttributeCache {
    /// Creates an unloaded cache for the document at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(None),
        }
    }

    /// Path of the backing metadata file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the attributes have been read from disk.
    pub fn is_loaded(&self) -> bool {
        self.read_state().is_some()
    }

    /// Returns the full attribute mapping, loading it on first access.
    pub fn all(&self) -> Result<Arc<Mapping>, MetadataError> {
        {
            let state = self.read_state();
            if let Some(loaded) = state.as_ref() {
                return Ok(Arc::clone(loaded));
            }
        }

        let mut state = self.write_state();
        // Another reader may have loaded it between the two locks.
        if let Some(loaded) = state.as_ref() {
            return Ok(Arc::clone(loaded));
        }
        let loaded = Arc::new(store::load(&self.path)?);
        *state = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Returns a single attribute, or `None` if it is not set.
    pub fn get(&self, key: &str) -> Result<Option<Value>, MetadataError> {
        Ok(self.all()?.get(key).cloned())
    }

    /// Forces a re-read of the backing file.
    pub fn reload(&self) -> Result<Arc<Mapping>, MetadataError> {
        let loaded = Arc::new(store::load(&self.path)?);
        *self.write_state() = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Drops the cached mapping; the next access reads the file again.
    pub fn invalidate(&self) {
        *self.write_state() = None;
    }

    /// Sets one attribute and writes the document.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), MetadataError> {
        self.set_many([(key.to_string(), value.into())])
    }

    /// Sets several attributes and writes the document once.
    pub fn set_many<I>(&self, attributes: I) -> Result<(), MetadataError>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut mapping = (*self.all()?).clone();
        for (key, value) in attributes {
            mapping.insert(Value::String(key), value);
        }
        store::save(&self.path, &mapping)?;
        *self.write_state() = Some(Arc::new(mapping));
        Ok(())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Option<Arc<Mapping>>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<Arc<Mapping>>> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clone for AttributeCache {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            state: RwLock::new(Option::clone(&self.read_state())),
        }
    }
}
