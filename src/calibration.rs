//! Post-hoc probability calibration for upset probabilities.
//!
//! Calibrators are fitted offline on a held-out fold and loaded from JSON.
//! They are pure transforms: nothing here looks at the races being scored.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A monotone probability mapping.
pub trait Calibrate {
    fn calibrate(&self, prob: f64) -> f64;

    fn calibrate_vec(&self, probs: &[f64]) -> Vec<f64> {
        probs.iter().map(|p| self.calibrate(*p)).collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Temperature scaling: `sigmoid(logit(p) / temperature)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureScaling {
    pub temperature: f64,
}

impl Default for TemperatureScaling {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

impl TemperatureScaling {
    pub fn new(temperature: f64) -> Self {
        Self {
            temperature: temperature.clamp(0.1, 10.0),
        }
    }
}

impl Calibrate for TemperatureScaling {
    fn calibrate(&self, prob: f64) -> f64 {
        let eps = 1e-10;
        let p = prob.clamp(eps, 1.0 - eps);
        let logit = (p / (1.0 - p)).ln();
        sigmoid(logit / self.temperature)
    }
}

/// Histogram binning over equal-width bins on [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinningCalibration {
    pub n_bins: usize,
    pub bin_edges: Vec<f64>,
    pub bin_values: Vec<f64>,
}

impl BinningCalibration {
    pub fn from_values(bin_values: Vec<f64>) -> Self {
        let n_bins = bin_values.len();
        let bin_edges: Vec<f64> = (0..=n_bins).map(|i| i as f64 / n_bins as f64).collect();
        Self {
            n_bins,
            bin_edges,
            bin_values,
        }
    }

    fn find_bin(&self, prob: f64) -> Option<usize> {
        if self.bin_values.is_empty() {
            return None;
        }
        let idx = (0..self.n_bins)
            .find(|&i| prob >= self.bin_edges[i] && prob < self.bin_edges[i + 1])
            .unwrap_or(self.n_bins - 1);
        Some(idx.min(self.bin_values.len() - 1))
    }
}

impl Calibrate for BinningCalibration {
    fn calibrate(&self, prob: f64) -> f64 {
        match self.find_bin(prob) {
            Some(idx) => self.bin_values[idx],
            None => prob,
        }
    }
}

/// Platt scaling: `sigmoid(a * p + b)` fitted on raw probabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlattScaling {
    pub a: f64,
    pub b: f64,
}

impl Calibrate for PlattScaling {
    fn calibrate(&self, prob: f64) -> f64 {
        sigmoid(self.a * prob + self.b)
    }
}

/// Isotonic regression as a step table, interpolated linearly between
/// thresholds and flat beyond the ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsotonicCalibration {
    pub x_thresholds: Vec<f64>,
    pub y_thresholds: Vec<f64>,
}

impl Calibrate for IsotonicCalibration {
    fn calibrate(&self, prob: f64) -> f64 {
        let xs = &self.x_thresholds;
        let ys = &self.y_thresholds;
        let n = xs.len().min(ys.len());
        if n == 0 {
            return prob;
        }
        if prob <= xs[0] {
            return ys[0].clamp(0.0, 1.0);
        }
        if prob >= xs[n - 1] {
            return ys[n - 1].clamp(0.0, 1.0);
        }
        let upper = xs[..n].partition_point(|&x| x <= prob);
        let (x0, x1) = (xs[upper - 1], xs[upper]);
        let (y0, y1) = (ys[upper - 1], ys[upper]);
        let y = if x1 > x0 {
            y0 + (y1 - y0) * (prob - x0) / (x1 - x0)
        } else {
            y0
        };
        y.clamp(0.0, 1.0)
    }
}

/// Calibrator selected at load time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Calibrator {
    Temperature(TemperatureScaling),
    Binning(BinningCalibration),
    Platt(PlattScaling),
    Isotonic(IsotonicCalibration),
    #[default]
    None,
}

impl Calibrate for Calibrator {
    fn calibrate(&self, prob: f64) -> f64 {
        match self {
            Calibrator::Temperature(t) => t.calibrate(prob),
            Calibrator::Binning(b) => b.calibrate(prob),
            Calibrator::Platt(p) => p.calibrate(prob),
            Calibrator::Isotonic(i) => i.calibrate(prob),
            Calibrator::None => prob,
        }
    }
}

impl Calibrator {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Calibrator::None)
    }

    /// Calibrate a probability map keyed by horse number.
    pub fn calibrate_map<K: Clone + Ord>(&self, probs: &BTreeMap<K, f64>) -> BTreeMap<K, f64> {
        probs
            .iter()
            .map(|(k, v)| (k.clone(), self.calibrate(*v)))
            .collect()
    }

    /// Load a calibrator from JSON, e.g. `{"type": "platt", "a": 4.2, "b": -2.9}`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read calibrator {}", path.as_ref().display()))?;
        let calibrator: Calibrator = serde_json::from_str(&content)?;
        Ok(calibrator)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
