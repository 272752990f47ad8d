//! Long-shot (upset) classifier.
//!
//! Scores only entrants inside a popularity band (7th-12th favorite by
//! default), averages the probabilities of K sub-models and optionally passes
//! the mean through a calibrator fitted elsewhere. Whether a probability is
//! high enough to bet is decided by the betting policy, not here.

use anyhow::Context;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;

use crate::calibration::{Calibrate, Calibrator};
use crate::config::UpsetConfig;
use crate::error::PipelineError;
use crate::model::{load_probability_model, ModelBundle, ProbabilityModel};
use crate::types::{Entrant, HorseNumber, Race};

/// Neutral value used when an upset feature is missing.
///
/// Missing values mean the horse, jockey or trainer has no history yet, so
/// rates fall back to an uninformative 0.5 and counts to 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureKind {
    Rate,
    Count,
    Fixed(f64),
}

impl FeatureKind {
    /// Infer the kind from the column name: `*rate*`, `*ratio*` and `*pct*` are rates.
    pub fn infer(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("rate") || name.contains("ratio") || name.contains("pct") {
            FeatureKind::Rate
        } else {
            FeatureKind::Count
        }
    }

    pub fn neutral_value(&self) -> f64 {
        match self {
            FeatureKind::Rate => 0.5,
            FeatureKind::Count => 0.0,
            FeatureKind::Fixed(v) => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSpec {
    pub name: String,
    pub kind: FeatureKind,
}

impl FeatureSpec {
    pub fn inferred(names: &[String]) -> Vec<FeatureSpec> {
        names
            .iter()
            .map(|name| FeatureSpec {
                name: name.clone(),
                kind: FeatureKind::infer(name),
            })
            .collect()
    }
}

/// Inclusive popularity-rank band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopularityBand {
    pub min: u32,
    pub max: u32,
}

impl PopularityBand {
    pub fn contains(&self, popularity_rank: u32) -> bool {
        popularity_rank >= self.min && popularity_rank <= self.max
    }
}

impl From<&UpsetConfig> for PopularityBand {
    fn from(config: &UpsetConfig) -> Self {
        Self {
            min: config.popularity_min,
            max: config.popularity_max,
        }
    }
}

/// Where each classifier feature sits in `Entrant::upset_features`.
#[derive(Debug, Clone, PartialEq)]
struct InputLayout {
    /// `None` for a feature the loaded table does not carry.
    index: Vec<Option<usize>>,
    width: usize,
}

pub struct UpsetClassifier {
    models: Vec<Box<dyn ProbabilityModel>>,
    features: Vec<FeatureSpec>,
    calibrator: Calibrator,
    band: PopularityBand,
    layout: Option<InputLayout>,
}

impl UpsetClassifier {
    pub fn new(
        models: Vec<Box<dyn ProbabilityModel>>,
        features: Vec<FeatureSpec>,
        band: PopularityBand,
    ) -> Result<Self, PipelineError> {
        if models.is_empty() {
            return Err(PipelineError::Model(
                "upset classifier needs at least one model".to_string(),
            ));
        }
        if band.min > band.max {
            return Err(PipelineError::InvalidPolicy(format!(
                "popularity band {}-{} is empty",
                band.min, band.max
            )));
        }
        Ok(Self {
            models,
            features,
            calibrator: Calibrator::None,
            band,
            layout: None,
        })
    }

    pub fn with_calibrator(mut self, calibrator: Calibrator) -> Self {
        self.calibrator = calibrator;
        self
    }

    /// Read features by name from entrants loaded with `columns`.
    ///
    /// Without this, `Entrant::upset_features` must hold exactly the
    /// classifier's features in order. With it, the loaded columns may be a
    /// superset in any order, and features the table lacks take their
    /// neutral value.
    pub fn with_input_columns(mut self, columns: &[String]) -> Self {
        let index: Vec<Option<usize>> = self
            .features
            .iter()
            .map(|spec| columns.iter().position(|c| c == &spec.name))
            .collect();
        let missing: Vec<&str> = self
            .features
            .iter()
            .zip(&index)
            .filter(|(_, slot)| slot.is_none())
            .map(|(spec, _)| spec.name.as_str())
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                "Upset features not in loaded data, using neutral defaults: {}",
                missing.join(", ")
            );
        }
        self.layout = Some(InputLayout {
            index,
            width: columns.len(),
        });
        self
    }

    pub fn feature_names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name.as_str()).collect()
    }

    /// Resolve a bundle manifest into a classifier.
    ///
    /// Legacy bundles have no feature list and use `default_features`.
    pub fn from_bundle(
        bundle: &ModelBundle,
        default_features: &[String],
        band: PopularityBand,
    ) -> anyhow::Result<Self> {
        let models = bundle
            .model_paths()
            .iter()
            .map(|p| load_probability_model(p))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let names = bundle.feature_cols().unwrap_or(default_features);
        let mut classifier = Self::new(models, FeatureSpec::inferred(names), band)?;
        if let Some(calibrator) = bundle.calibrator() {
            classifier = classifier.with_calibrator(calibrator.clone());
        }
        Ok(classifier)
    }

    pub fn from_bundle_file<P: AsRef<Path>>(
        path: P,
        default_features: &[String],
        band: PopularityBand,
    ) -> anyhow::Result<Self> {
        let bundle = ModelBundle::from_file(path.as_ref())?;
        Self::from_bundle(&bundle, default_features, band)
            .with_context(|| format!("Failed to build upset classifier from {}", path.as_ref().display()))
    }

    pub fn band(&self) -> PopularityBand {
        self.band
    }

    pub fn n_models(&self) -> usize {
        self.models.len()
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    /// Probability per horse number. Entrants outside the band get 0.
    pub fn predict_upset_probability(
        &self,
        race: &Race,
    ) -> Result<BTreeMap<HorseNumber, f64>, PipelineError> {
        let eligible: Vec<&Entrant> = race
            .entrants
            .iter()
            .filter(|e| self.band.contains(e.popularity_rank))
            .collect();

        let mut out: BTreeMap<HorseNumber, f64> = race
            .entrants
            .iter()
            .map(|e| (e.horse_number, 0.0))
            .collect();
        if eligible.is_empty() {
            return Ok(out);
        }

        let features = self.feature_matrix(race, &eligible)?;
        let mut sums = vec![0.0; eligible.len()];
        for model in &self.models {
            let probs = model
                .predict_proba(features.view())
                .map_err(|e| PipelineError::Model(format!("{}: {}", race.key, e)))?;
            if probs.len() != eligible.len() {
                return Err(PipelineError::feature_shape(
                    &race.key,
                    format!(
                        "upset model returned {} probabilities for {} entrants",
                        probs.len(),
                        eligible.len()
                    ),
                ));
            }
            for (sum, p) in sums.iter_mut().zip(probs) {
                *sum += p;
            }
        }

        let k = self.models.len() as f64;
        let raw: BTreeMap<HorseNumber, f64> = eligible
            .iter()
            .zip(sums)
            .map(|(e, sum)| (e.horse_number, sum / k))
            .collect();
        for (horse, p) in self.calibrator.calibrate_map(&raw) {
            let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
            out.insert(horse, p);
        }
        Ok(out)
    }

    /// Write probabilities onto the race; out-of-band entrants stay `None`.
    pub fn apply(&self, race: &mut Race) -> Result<(), PipelineError> {
        let probs = self.predict_upset_probability(race)?;
        for entrant in race.entrants.iter_mut() {
            entrant.upset_probability = if self.band.contains(entrant.popularity_rank) {
                probs.get(&entrant.horse_number).copied()
            } else {
                None
            };
        }
        Ok(())
    }

    fn feature_matrix(&self, race: &Race, eligible: &[&Entrant]) -> Result<Array2<f64>, PipelineError> {
        let n_features = self.features.len();
        let positional: Vec<Option<usize>>;
        let (index, width) = match &self.layout {
            Some(layout) => (layout.index.as_slice(), layout.width),
            None => {
                positional = (0..n_features).map(Some).collect();
                (positional.as_slice(), n_features)
            }
        };

        let mut features = Array2::<f64>::zeros((eligible.len(), n_features));
        for (i, entrant) in eligible.iter().enumerate() {
            if entrant.upset_features.len() != width {
                return Err(PipelineError::feature_shape(
                    &race.key,
                    format!(
                        "horse {} has {} upset features, expected {}",
                        entrant.horse_number,
                        entrant.upset_features.len(),
                        width
                    ),
                ));
            }
            for (j, (slot, spec)) in index.iter().zip(&self.features).enumerate() {
                let value = slot.and_then(|k| entrant.upset_features[k]);
                features[[i, j]] = match value {
                    Some(v) if v.is_finite() => v,
                    _ => spec.kind.neutral_value(),
                };
            }
        }
        Ok(features)
    }
}
