//! Within-race ranking from raw model scores.

use ndarray::Array2;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::PipelineError;
use crate::model::RankingModel;
use crate::types::{HorseNumber, Race};

/// Wraps a ranking model and turns its scores into a deterministic order.
pub struct RankingScorer {
    model: Box<dyn RankingModel>,
    n_features: usize,
}

impl RankingScorer {
    pub fn new(model: Box<dyn RankingModel>, n_features: usize) -> Self {
        Self { model, n_features }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Score every entrant and assign `predicted_rank` 1..=N.
    ///
    /// Ranks follow descending score, ties broken by ascending horse number.
    /// On error the race is left untouched.
    pub fn score_and_rank(&self, race: &mut Race) -> Result<(), PipelineError> {
        let features = self.feature_matrix(race)?;
        let scores = self
            .model
            .predict(features.view())
            .map_err(|e| PipelineError::Model(format!("{}: {}", race.key, e)))?;

        if scores.len() != race.entrants.len() {
            return Err(PipelineError::feature_shape(
                &race.key,
                format!(
                    "model returned {} scores for {} entrants",
                    scores.len(),
                    race.entrants.len()
                ),
            ));
        }
        if let Some(pos) = scores.iter().position(|s| !s.is_finite()) {
            return Err(PipelineError::Model(format!(
                "{}: non-finite score for horse {}",
                race.key, race.entrants[pos].horse_number
            )));
        }

        let ranks = rank_scores(
            &scores,
            &race
                .entrants
                .iter()
                .map(|e| e.horse_number)
                .collect::<Vec<_>>(),
        );
        for ((entrant, score), rank) in race.entrants.iter_mut().zip(scores).zip(ranks) {
            entrant.raw_model_score = Some(score);
            entrant.predicted_rank = Some(rank);
        }
        Ok(())
    }

    fn feature_matrix(&self, race: &Race) -> Result<Array2<f64>, PipelineError> {
        let n = race.entrants.len();
        if n == 0 {
            return Err(PipelineError::feature_shape(&race.key, "race has no entrants"));
        }

        let mut features = Array2::<f64>::zeros((n, self.n_features));
        for (i, entrant) in race.entrants.iter().enumerate() {
            if entrant.ranking_features.len() != self.n_features {
                return Err(PipelineError::feature_shape(
                    &race.key,
                    format!(
                        "horse {} has {} features, model expects {}",
                        entrant.horse_number,
                        entrant.ranking_features.len(),
                        self.n_features
                    ),
                ));
            }
            for (j, &val) in entrant.ranking_features.iter().enumerate() {
                if !val.is_finite() {
                    return Err(PipelineError::feature_shape(
                        &race.key,
                        format!("horse {} feature {} is not finite", entrant.horse_number, j),
                    ));
                }
                features[[i, j]] = val;
            }
        }
        Ok(features)
    }
}

/// Dense 1-based ranks for `scores`, descending, ties by ascending horse number.
pub fn rank_scores(scores: &[f64], horse_numbers: &[u8]) -> Vec<u32> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| match scores[b].total_cmp(&scores[a]) {
        Ordering::Equal => horse_numbers[a].cmp(&horse_numbers[b]),
        other => other,
    });

    let mut ranks = vec![0u32; scores.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        ranks[idx] = rank as u32 + 1;
    }
    ranks
}

/// Gap between the two highest raw scores; 0 with fewer than two scored entrants.
pub fn score_separation(race: &Race) -> f64 {
    let mut scores: Vec<f64> = race
        .entrants
        .iter()
        .filter_map(|e| e.raw_model_score)
        .collect();
    if scores.len() < 2 {
        return 0.0;
    }
    scores.sort_by(|a, b| b.total_cmp(a));
    scores[0] - scores[1]
}

/// Win probability per horse: softmax of the raw scores within the race.
///
/// Empty when no entrant has been scored.
pub fn win_probabilities(race: &Race) -> BTreeMap<HorseNumber, f64> {
    let scored: Vec<(HorseNumber, f64)> = race
        .entrants
        .iter()
        .filter_map(|e| e.raw_model_score.map(|s| (e.horse_number, s)))
        .collect();
    let Some(max) = scored.iter().map(|(_, s)| *s).reduce(f64::max) else {
        return BTreeMap::new();
    };
    let total: f64 = scored.iter().map(|(_, s)| (s - max).exp()).sum();
    scored
        .into_iter()
        .map(|(h, s)| (h, (s - max).exp() / total))
        .collect()
}
