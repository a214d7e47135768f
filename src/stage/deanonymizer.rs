//! De-anonymizers: attempt to undo an anonymization on a derived dataset.

use async_trait::async_trait;
use serde_yaml::Mapping;
use tracing::info;

use crate::cache::strip_operational;
use crate::dataset::{Dataset, DatasetStore, DeriveOptions, Lineage, StageKind};
use crate::error::StageError;

use super::{ensure_mutable, StageContext};

/// Restores datapoints of an anonymized dataset in place.
///
/// Implementations may be trained first on an attacker's clear dataset and
/// its anonymized counterpart.
#[async_trait]
pub trait Deanonymizer: Send + Sync {
    fn name(&self) -> &str;

    fn params(&self) -> &Mapping;

    async fn train(
        &mut self,
        _ctx: &StageContext,
        _clear: &Dataset,
        _anonymized: &Dataset,
    ) -> Result<(), StageError> {
        Ok(())
    }

    async fn deanonymize(&self, ctx: &StageContext, dataset: &Dataset) -> Result<(), StageError>;

    /// Releases training state once the stage is done.
    fn cleanup(&mut self) {}
}

/// Derives a copy of `parent` and de-anonymizes it.
///
/// The copy is deleted again on failure when `cleanup` is set.
pub async fn deanonymize_derived(
    store: &DatasetStore,
    deanonymizer: &dyn Deanonymizer,
    ctx: &StageContext,
    parent: &Dataset,
    new_name: Option<&str>,
    cleanup: bool,
) -> Result<Dataset, StageError> {
    let mut options = DeriveOptions::new();
    if let Some(name) = new_name {
        options = options.named(name);
    }
    let mut dataset = store.derive(parent, &options)?;
    let guard = store.guard(&dataset, cleanup);
    ensure_mutable(&dataset)?;

    info!(
        deanonymizer = deanonymizer.name(),
        parent = parent.name(),
        dataset = dataset.name(),
        "Running de-anonymization"
    );
    deanonymizer.deanonymize(ctx, &dataset).await?;

    dataset.meta_mut().lineage = Some(Lineage::new(
        StageKind::Deanonymization,
        deanonymizer.name(),
        strip_operational(deanonymizer.params()),
    ));
    dataset.save_meta()?;
    guard.commit();
    Ok(dataset)
}

/// `noop`: leaves the dataset as it is.
#[derive(Debug, Clone, Default)]
pub struct NoopDeanonymizer {
    params: Mapping,
}

impl NoopDeanonymizer {
    pub const NAME: &'static str = "noop";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        Ok(Self {
            params: raw.clone(),
        })
    }
}

#[async_trait]
impl Deanonymizer for NoopDeanonymizer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    async fn deanonymize(&self, _ctx: &StageContext, _dataset: &Dataset) -> Result<(), StageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Modality;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    struct Failing;

    #[async_trait]
    impl Deanonymizer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn params(&self) -> &Mapping {
            static EMPTY: std::sync::OnceLock<Mapping> = std::sync::OnceLock::new();
            EMPTY.get_or_init(Mapping::new)
        }

        async fn deanonymize(&self, _ctx: &StageContext, _dataset: &Dataset) -> Result<(), StageError> {
            Err(StageError::Failed {
                stage: "failing".to_string(),
                message: "model diverged".to_string(),
            })
        }
    }

    fn store_with_root() -> (TempDir, DatasetStore, Dataset) {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::open_or_create(dir.path()).unwrap();
        let root = store.create_root("faces", Modality::Face, BTreeMap::new()).unwrap();
        fs::write(root.folder().join("alice.1.jpg"), b"jpg").unwrap();
        let root = store.open("faces").unwrap();
        (dir, store, root)
    }

    #[tokio::test]
    async fn test_noop_records_lineage() {
        let (_dir, store, root) = store_with_root();
        let mut noop = NoopDeanonymizer::from_params(&Mapping::new()).unwrap();
        noop.train(&StageContext::default(), &root, &root).await.unwrap();

        let out = deanonymize_derived(&store, &noop, &StageContext::default(), &root, Some("restored"), true)
            .await
            .unwrap();
        let lineage = out.meta().lineage.as_ref().unwrap();
        assert_eq!(lineage.stage_kind, StageKind::Deanonymization);
        assert_eq!(lineage.stage_name, "noop");
        assert_eq!(out.point_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_when_cleanup_is_set() {
        let (_dir, store, root) = store_with_root();
        let result = deanonymize_derived(&store, &Failing, &StageContext::default(), &root, Some("x"), true).await;
        assert!(matches!(result, Err(StageError::Failed { .. })));
        assert!(!store.exists("x"));

        let result = deanonymize_derived(&store, &Failing, &StageContext::default(), &root, Some("kept"), false).await;
        assert!(result.is_err());
        assert!(store.exists("kept"));
    }
}
