//! Model capabilities and their implementations.
//!
//! The pipeline only needs two narrow capabilities: a ranking model that maps a
//! feature matrix to one score per row, and a probability model that maps a
//! feature matrix to one probability per row. ONNX exports of the trained
//! gradient-boosted models satisfy both; `LinearModel` is a lightweight
//! fallback loaded from JSON.

use anyhow::{Context, Result};
use ndarray::{Array2, ArrayView2};
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::calibration::Calibrator;

/// Raw within-race scores, higher is better.
pub trait RankingModel: Send + Sync {
    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Vec<f64>>;
}

/// Positive-class probability per row.
pub trait ProbabilityModel: Send + Sync {
    fn predict_proba(&self, features: ArrayView2<'_, f64>) -> Result<Vec<f64>>;
}

/// ONNX model wrapper.
pub struct OnnxModel {
    session: Mutex<Session>,
    path: PathBuf,
}

impl OnnxModel {
    /// Load ONNX model from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path.as_ref())
            .with_context(|| format!("Failed to load ONNX model {}", path.as_ref().display()))?;

        Ok(Self {
            session: Mutex::new(session),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the session and return `(n_cols, values)` of the requested output.
    ///
    /// Falls back to output 0 when the model has fewer outputs.
    fn run(&self, features: ArrayView2<'_, f64>, output_index: usize) -> Result<(usize, Vec<f64>)> {
        let n_rows = features.nrows();
        let input: Array2<f32> = features.mapv(|v| v as f32);
        let input_tensor = Tensor::from_array(input)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to lock session: {}", e))?;

        let outputs = session.run(ort::inputs![input_tensor])?;
        if outputs.len() == 0 {
            anyhow::bail!("Model {} produced no outputs", self.path.display());
        }
        let index = if output_index < outputs.len() { output_index } else { 0 };

        let (shape, data) = outputs[index]
            .try_extract_tensor::<f32>()
            .context("Failed to extract output tensor")?;

        let dims: Vec<i64> = shape.iter().copied().collect();
        let n_cols = match dims.as_slice() {
            [rows] if *rows as usize == n_rows => 1,
            [rows, cols] if *rows as usize == n_rows && *cols > 0 => *cols as usize,
            _ => anyhow::bail!(
                "Unexpected output shape {:?} for {} rows",
                dims,
                n_rows
            ),
        };

        Ok((n_cols, data.iter().map(|v| *v as f64).collect()))
    }
}

impl RankingModel for OnnxModel {
    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        let (n_cols, data) = self.run(features, 0)?;
        Ok(data.chunks(n_cols).map(|row| row[0]).collect())
    }
}

impl ProbabilityModel for OnnxModel {
    fn predict_proba(&self, features: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        // Classifier exports put labels at output 0 and probabilities at output 1.
        let (n_cols, data) = self.run(features, 1)?;
        let positive = if n_cols >= 2 { 1 } else { 0 };
        Ok(data.chunks(n_cols).map(|row| row[positive]).collect())
    }
}

/// Linear scorer `w·x + b`; as a probability model the score goes through a sigmoid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,
}

impl LinearModel {
    pub fn new(weights: Vec<f64>, bias: f64) -> Self {
        Self { weights, bias }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read model {}", path.as_ref().display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn scores(&self, features: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        if features.ncols() != self.weights.len() {
            anyhow::bail!(
                "Linear model expects {} features, got {}",
                self.weights.len(),
                features.ncols()
            );
        }
        Ok(features
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .zip(&self.weights)
                    .map(|(x, w)| x * w)
                    .sum::<f64>()
                    + self.bias
            })
            .collect())
    }
}

impl RankingModel for LinearModel {
    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        self.scores(features)
    }
}

impl ProbabilityModel for LinearModel {
    fn predict_proba(&self, features: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        Ok(self
            .scores(features)?
            .into_iter()
            .map(|s| 1.0 / (1.0 + (-s).exp()))
            .collect())
    }
}

/// Load a model by file extension: `.onnx` via ort, `.json` as a linear model.
pub fn load_ranking_model<P: AsRef<Path>>(path: P) -> Result<Box<dyn RankingModel>> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Box::new(LinearModel::from_file(path)?)),
        _ => Ok(Box::new(OnnxModel::load(path)?)),
    }
}

/// See [`load_ranking_model`].
pub fn load_probability_model<P: AsRef<Path>>(path: P) -> Result<Box<dyn ProbabilityModel>> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Box::new(LinearModel::from_file(path)?)),
        _ => Ok(Box::new(OnnxModel::load(path)?)),
    }
}

/// Upset model bundle manifest.
///
/// Current bundles are an object with sub-model paths, feature column order and
/// an optional calibrator. Legacy bundles are a bare list of model paths and
/// rely on the configured feature columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelBundle {
    Ensemble {
        models: Vec<PathBuf>,
        feature_cols: Vec<String>,
        #[serde(default)]
        calibrator: Option<Calibrator>,
    },
    Legacy(Vec<PathBuf>),
}

impl ModelBundle {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model bundle {}", path.display()))?;
        let mut bundle: ModelBundle = serde_json::from_str(&content)
            .with_context(|| format!("Malformed model bundle {}", path.display()))?;

        // Sub-model paths are relative to the manifest.
        if let Some(dir) = path.parent() {
            for model in bundle.model_paths_mut() {
                if model.is_relative() {
                    *model = dir.join(&*model);
                }
            }
        }
        Ok(bundle)
    }

    pub fn model_paths(&self) -> &[PathBuf] {
        match self {
            ModelBundle::Ensemble { models, .. } => models,
            ModelBundle::Legacy(models) => models,
        }
    }

    fn model_paths_mut(&mut self) -> &mut Vec<PathBuf> {
        match self {
            ModelBundle::Ensemble { models, .. } => models,
            ModelBundle::Legacy(models) => models,
        }
    }

    /// Feature columns declared by the bundle, if any.
    pub fn feature_cols(&self) -> Option<&[String]> {
        match self {
            ModelBundle::Ensemble { feature_cols, .. } => Some(feature_cols),
            ModelBundle::Legacy(_) => None,
        }
    }

    pub fn calibrator(&self) -> Option<&Calibrator> {
        match self {
            ModelBundle::Ensemble { calibrator, .. } => calibrator.as_ref(),
            ModelBundle::Legacy(_) => None,
        }
    }
}
