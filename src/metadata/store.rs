//! Loading and saving YAML metadata documents.
//!
//! Documents are written with a leading `---` marker so they stay
//! readable by other YAML tooling. A missing document is an empty
//! mapping; a document that cannot be parsed is a hard error.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::error::MetadataError;

/// Leading document marker written before every metadata document.
pub const DOCUMENT_MARKER: &str = "---\n";

/// Loads the metadata mapping stored at `path`.
///
/// Returns an empty mapping if the file does not exist.
pub fn load(path: &Path) -> Result<Mapping, MetadataError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Mapping::new()),
        Err(source) => {
            return Err(MetadataError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let body = contents.trim();
    if body.is_empty() || body == "---" {
        return Ok(Mapping::new());
    }

    let value: Value = serde_yaml::from_str(&contents).map_err(|e| MetadataError::Malformed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(MetadataError::NotAMapping(path.to_path_buf())),
    }
}

/// Saves `mapping` to `path`, replacing any previous document.
pub fn save(path: &Path, mapping: &Mapping) -> Result<(), MetadataError> {
    write_document(path, serde_yaml::to_string(mapping)?)
}

/// Loads and deserializes a typed metadata document.
///
/// Unlike [`load`], a missing file is an error here: typed documents
/// always have required fields.
pub fn load_as<T: DeserializeOwned>(path: &Path) -> Result<T, MetadataError> {
    let contents = fs::read_to_string(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_yaml::from_str(&contents).map_err(|e| MetadataError::Malformed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Serializes and saves a typed metadata document.
pub fn save_as<T: Serialize>(path: &Path, document: &T) -> Result<(), MetadataError> {
    write_document(path, serde_yaml::to_string(document)?)
}

fn write_document(path: &Path, body: String) -> Result<(), MetadataError> {
    let mut contents = String::with_capacity(body.len() + DOCUMENT_MARKER.len());
    contents.push_str(DOCUMENT_MARKER);
    contents.push_str(&body);

    fs::write(path, contents).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_mapping() {
        let dir = TempDir::new().unwrap();
        let mapping = load(&dir.path().join("absent.yaml")).unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_save_writes_document_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("id.yaml");

        let mut mapping = Mapping::new();
        mapping.insert("age".into(), 42.into());
        save(&path, &mapping).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("---\n"));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.get("age"), Some(&Value::from(42)));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        fs::write(&path, "---\nkey: [unclosed\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, MetadataError::Malformed { .. }));
    }

    #[test]
    fn test_scalar_document_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scalar.yaml");
        fs::write(&path, "---\njust a string\n").unwrap();

        assert!(matches!(
            load(&path).unwrap_err(),
            MetadataError::NotAMapping(_)
        ));
    }

    #[test]
    fn test_empty_document_marker_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.yaml");
        fs::write(&path, "---\n").unwrap();
        assert!(load(&path).unwrap().is_empty());
    }
}
