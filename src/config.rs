//! Runtime settings for the benchmark.
//!
//! Settings cover where datasets and results live and how stages use the
//! machine. They are separate from run configurations, which describe
//! experiments and are read from YAML files.

use std::path::PathBuf;

use thiserror::Error;

use crate::stage::{StageContext, DEFAULT_BATCH_SIZE};

/// Errors that can occur while building settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Settings validation failed.
    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct Settings {
    // Storage
    /// Directory holding `<name>/` dataset folders and `<name>.meta.yaml` files.
    pub data_root: PathBuf,
    /// Directory receiving `<id>.results.txt` files.
    pub results_dir: PathBuf,
    /// The results summary (`results.yaml`).
    pub summary_path: PathBuf,

    // Execution
    /// Upper bound on concurrent per-datapoint work within a stage.
    pub workers: usize,
    /// Datapoints handed to an external tool at once.
    pub batch_size: usize,

    // Policy
    /// Delete partially built datasets when a stage fails.
    pub cleanup: bool,
    /// Stream per-datapoint result files to disk.
    pub save_results: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            results_dir: PathBuf::from("./results"),
            summary_path: PathBuf::from("./results.yaml"),
            workers: 4,
            batch_size: DEFAULT_BATCH_SIZE,
            cleanup: false,
            save_results: true,
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ANONBENCH_DATA_ROOT`: dataset directory (default: ./data)
    /// - `ANONBENCH_RESULTS_DIR`: result file directory (default: ./results)
    /// - `ANONBENCH_SUMMARY`: results summary file (default: ./results.yaml)
    /// - `ANONBENCH_WORKERS`: concurrent workers per stage (default: 4)
    /// - `ANONBENCH_BATCH_SIZE`: external tool batch size (default: 2000)
    /// - `ANONBENCH_CLEANUP`: delete partial datasets on failure (default: false)
    /// - `ANONBENCH_SAVE_RESULTS`: write result files (default: true)
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        if let Ok(val) = std::env::var("ANONBENCH_DATA_ROOT") {
            settings.data_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ANONBENCH_RESULTS_DIR") {
            settings.results_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ANONBENCH_SUMMARY") {
            settings.summary_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ANONBENCH_WORKERS") {
            settings.workers = parse_env_value(&val, "ANONBENCH_WORKERS")?;
        }

        if let Ok(val) = std::env::var("ANONBENCH_BATCH_SIZE") {
            settings.batch_size = parse_env_value(&val, "ANONBENCH_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("ANONBENCH_CLEANUP") {
            settings.cleanup = parse_env_bool(&val, "ANONBENCH_CLEANUP")?;
        }

        if let Ok(val) = std::env::var("ANONBENCH_SAVE_RESULTS") {
            settings.save_results = parse_env_bool(&val, "ANONBENCH_SAVE_RESULTS")?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::ValidationFailed` if any value is invalid.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.workers == 0 {
            return Err(SettingsError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(SettingsError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.data_root.as_os_str().is_empty() {
            return Err(SettingsError::ValidationFailed(
                "data_root cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Execution context for stages run under these settings.
    pub fn stage_context(&self) -> StageContext {
        StageContext::new(self.workers, self.batch_size)
    }

    pub fn with_data_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_root = path.into();
        self
    }

    pub fn with_results_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_dir = path.into();
        self
    }

    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = path.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_save_results(mut self, save: bool) -> Self {
        self.save_results = save;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, SettingsError> {
    value.parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, SettingsError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.batch_size, 2000);
        assert!(!settings.cleanup);
        assert!(settings.save_results);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_builder() {
        let settings = Settings::new()
            .with_data_root("/srv/data")
            .with_workers(16)
            .with_batch_size(50)
            .with_cleanup(true)
            .with_save_results(false);

        assert_eq!(settings.data_root, PathBuf::from("/srv/data"));
        assert_eq!(settings.stage_context().pool.workers(), 16);
        assert_eq!(settings.stage_context().batch_size, 50);
        assert!(settings.cleanup);
        assert!(!settings.save_results);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let result = Settings::default().with_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("workers"));
    }

    #[test]
    fn test_validation_rejects_zero_batch_size() {
        let result = Settings::default().with_batch_size(0).validate();
        assert!(result.unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("Yes", "K").unwrap());
        assert!(!parse_env_bool("off", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
    }
}
