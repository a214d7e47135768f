//! Strategy registry: resolves stage names from run configurations to
//! constructors.
//!
//! Splitters and selectors work on any modality. Anonymizers,
//! de-anonymizers and evaluations are registered per modality, since the
//! same name may mean different algorithms for faces and for motion.

use std::collections::BTreeMap;

use serde_yaml::Mapping;

use crate::dataset::Modality;
use crate::error::StageError;
use crate::stage::anonymizer::{
    CoarseningAnonymizer, NoiseInjectionAnonymizer, NoopAnonymizer, RollingAverageAnonymizer,
};
use crate::stage::deanonymizer::NoopDeanonymizer;
use crate::stage::evaluation::{NearestMean, TimeSeriesDistance};
use crate::stage::external::{ExternalAnonymizer, ExternalDeanonymizer};
use crate::stage::selector::{DatapointTypeSelector, FullSelector, MostpointsSelector, RandomSelector};
use crate::stage::splitter::{
    AnonSplitter, AnonbgSplitter, CompareSplitter, DeanonCompareSplitter, DeanonSplitter,
    IdSplitter, Interid1to3Splitter, Intraid2to2Splitter,
};
use crate::stage::{Anonymizer, Deanonymizer, Evaluation, Selector, Splitter};

pub type SplitterResult = Result<Box<dyn Splitter>, StageError>;
pub type SelectorResult = Result<Box<dyn Selector>, StageError>;
pub type AnonymizerResult = Result<Box<dyn Anonymizer>, StageError>;
pub type DeanonymizerResult = Result<Box<dyn Deanonymizer>, StageError>;
pub type EvaluationResult = Result<Box<dyn Evaluation>, StageError>;

/// Builds a strategy from its raw parameters, validating them and filling
/// in defaults.
pub type SplitterFactory = fn(&Mapping) -> SplitterResult;
pub type SelectorFactory = fn(&Mapping) -> SelectorResult;
pub type AnonymizerFactory = fn(&Mapping) -> AnonymizerResult;
pub type DeanonymizerFactory = fn(&Mapping) -> DeanonymizerResult;
pub type EvaluationFactory = fn(&Mapping) -> EvaluationResult;

const BOTH: [Modality; 2] = [Modality::Face, Modality::Gait];

/// Maps `(kind, name[, modality])` to strategy constructors.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    splitters: BTreeMap<String, SplitterFactory>,
    selectors: BTreeMap<String, SelectorFactory>,
    anonymizers: BTreeMap<(String, Modality), AnonymizerFactory>,
    deanonymizers: BTreeMap<(String, Modality), DeanonymizerFactory>,
    evaluations: BTreeMap<(String, Modality), EvaluationFactory>,
}

fn unknown(kind: &str, name: &str, modality: Option<Modality>) -> StageError {
    StageError::UnknownStrategy {
        kind: match modality {
            Some(m) => format!("{} {}", m, kind),
            None => kind.to_string(),
        },
        name: name.to_string(),
    }
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in strategy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_splitter(AnonbgSplitter::NAME, |p: &Mapping| -> SplitterResult {
            Ok(Box::new(AnonbgSplitter::from_params(p)?))
        });
        registry.register_splitter(Interid1to3Splitter::NAME, |p: &Mapping| -> SplitterResult {
            Ok(Box::new(Interid1to3Splitter::from_params(p)?))
        });
        registry.register_splitter(Intraid2to2Splitter::NAME, |p: &Mapping| -> SplitterResult {
            Ok(Box::new(Intraid2to2Splitter::from_params(p)?))
        });
        registry.register_splitter(AnonSplitter::NAME, |p: &Mapping| -> SplitterResult {
            Ok(Box::new(AnonSplitter::from_params(p)?))
        });
        registry.register_splitter(IdSplitter::NAME, |p: &Mapping| -> SplitterResult {
            Ok(Box::new(IdSplitter::from_params(p)?))
        });
        registry.register_splitter(CompareSplitter::NAME, |p: &Mapping| -> SplitterResult {
            Ok(Box::new(CompareSplitter::from_params(p)?))
        });
        registry.register_splitter(DeanonSplitter::NAME, |p: &Mapping| -> SplitterResult {
            Ok(Box::new(DeanonSplitter::from_params(p)?))
        });
        registry.register_splitter(DeanonCompareSplitter::NAME, |p: &Mapping| -> SplitterResult {
            Ok(Box::new(DeanonCompareSplitter::from_params(p)?))
        });

        registry.register_selector(FullSelector::NAME, |p: &Mapping| -> SelectorResult {
            Ok(Box::new(FullSelector::from_params(p)?))
        });
        registry.register_selector(RandomSelector::NAME, |p: &Mapping| -> SelectorResult {
            Ok(Box::new(RandomSelector::from_params(p)?))
        });
        registry.register_selector(MostpointsSelector::NAME, |p: &Mapping| -> SelectorResult {
            Ok(Box::new(MostpointsSelector::from_params(p)?))
        });
        registry.register_selector(DatapointTypeSelector::NAME, |p: &Mapping| -> SelectorResult {
            Ok(Box::new(DatapointTypeSelector::from_params(p)?))
        });

        registry.register_anonymizer(NoopAnonymizer::NAME, &BOTH, |p: &Mapping| -> AnonymizerResult {
            Ok(Box::new(NoopAnonymizer::from_params(p)?))
        });
        registry.register_anonymizer(ExternalAnonymizer::NAME, &BOTH, |p: &Mapping| -> AnonymizerResult {
            Ok(Box::new(ExternalAnonymizer::from_params(p)?))
        });
        registry.register_anonymizer(
            NoiseInjectionAnonymizer::NAME,
            &[Modality::Gait],
            |p: &Mapping| -> AnonymizerResult { Ok(Box::new(NoiseInjectionAnonymizer::from_params(p)?)) },
        );
        registry.register_anonymizer(
            RollingAverageAnonymizer::NAME,
            &[Modality::Gait],
            |p: &Mapping| -> AnonymizerResult { Ok(Box::new(RollingAverageAnonymizer::from_params(p)?)) },
        );
        registry.register_anonymizer(
            CoarseningAnonymizer::NAME,
            &[Modality::Gait],
            |p: &Mapping| -> AnonymizerResult { Ok(Box::new(CoarseningAnonymizer::from_params(p)?)) },
        );

        registry.register_deanonymizer(NoopDeanonymizer::NAME, &BOTH, |p: &Mapping| -> DeanonymizerResult {
            Ok(Box::new(NoopDeanonymizer::from_params(p)?))
        });
        registry.register_deanonymizer(
            ExternalDeanonymizer::NAME,
            &BOTH,
            |p: &Mapping| -> DeanonymizerResult { Ok(Box::new(ExternalDeanonymizer::from_params(p)?)) },
        );

        registry.register_evaluation(NearestMean::NAME, &[Modality::Gait], |p: &Mapping| -> EvaluationResult {
            Ok(Box::new(NearestMean::from_params(p)?))
        });
        registry.register_evaluation(
            TimeSeriesDistance::NAME,
            &[Modality::Gait],
            |p: &Mapping| -> EvaluationResult { Ok(Box::new(TimeSeriesDistance::from_params(p)?)) },
        );

        registry
    }

    pub fn register_splitter(&mut self, name: &str, factory: SplitterFactory) {
        self.splitters.insert(name.to_string(), factory);
    }

    pub fn register_selector(&mut self, name: &str, factory: SelectorFactory) {
        self.selectors.insert(name.to_string(), factory);
    }

    pub fn register_anonymizer(&mut self, name: &str, modalities: &[Modality], factory: AnonymizerFactory) {
        for modality in modalities {
            self.anonymizers.insert((name.to_string(), *modality), factory);
        }
    }

    pub fn register_deanonymizer(
        &mut self,
        name: &str,
        modalities: &[Modality],
        factory: DeanonymizerFactory,
    ) {
        for modality in modalities {
            self.deanonymizers.insert((name.to_string(), *modality), factory);
        }
    }

    pub fn register_evaluation(&mut self, name: &str, modalities: &[Modality], factory: EvaluationFactory) {
        for modality in modalities {
            self.evaluations.insert((name.to_string(), *modality), factory);
        }
    }

    /// Builds the splitter called `name`.
    ///
    /// # Errors
    /// `UnknownStrategy` for unregistered names; the factory's own error
    /// for invalid parameters.
    pub fn splitter(&self, name: &str, params: &Mapping) -> SplitterResult {
        let factory = self.splitters.get(name).ok_or_else(|| unknown("splitter", name, None))?;
        factory(params)
    }

    pub fn selector(&self, name: &str, params: &Mapping) -> SelectorResult {
        let factory = self.selectors.get(name).ok_or_else(|| unknown("selector", name, None))?;
        factory(params)
    }

    pub fn anonymizer(&self, name: &str, modality: Modality, params: &Mapping) -> AnonymizerResult {
        let factory = self
            .anonymizers
            .get(&(name.to_string(), modality))
            .ok_or_else(|| unknown("anonymization", name, Some(modality)))?;
        factory(params)
    }

    pub fn deanonymizer(&self, name: &str, modality: Modality, params: &Mapping) -> DeanonymizerResult {
        let factory = self
            .deanonymizers
            .get(&(name.to_string(), modality))
            .ok_or_else(|| unknown("deanonymization", name, Some(modality)))?;
        factory(params)
    }

    pub fn evaluation(&self, name: &str, modality: Modality, params: &Mapping) -> EvaluationResult {
        let factory = self
            .evaluations
            .get(&(name.to_string(), modality))
            .ok_or_else(|| unknown("evaluation", name, Some(modality)))?;
        factory(params)
    }

    /// Registered names per stage kind, for listings.
    pub fn names(&self) -> BTreeMap<&'static str, Vec<String>> {
        fn modal<V>(map: &BTreeMap<(String, Modality), V>) -> Vec<String> {
            map.keys().map(|(name, m)| format!("{} ({})", name, m)).collect()
        }
        BTreeMap::from([
            ("splitter", self.splitters.keys().cloned().collect()),
            ("selector", self.selectors.keys().cloned().collect()),
            ("anonymization", modal(&self.anonymizers)),
            ("deanonymization", modal(&self.deanonymizers)),
            ("evaluation", modal(&self.evaluations)),
        ])
    }
}
