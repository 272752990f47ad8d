//! Prediction phase: score, rank, then classify upsets for each race.

use rayon::prelude::*;
use serde::Serialize;

use crate::error::PipelineError;
use crate::ranking::RankingScorer;
use crate::types::{Race, RaceKey};
use crate::upset::UpsetClassifier;

/// A race dropped before betting, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRace {
    pub race: RaceKey,
    pub reason: String,
}

/// Ranking scorer plus optional upset classifier for one training window.
pub struct Predictor {
    pub scorer: RankingScorer,
    pub upset: Option<UpsetClassifier>,
}

impl Predictor {
    pub fn new(scorer: RankingScorer, upset: Option<UpsetClassifier>) -> Self {
        Self { scorer, upset }
    }

    /// Fill score, rank and upset probability, in that order.
    ///
    /// Only a ranking failure fails the race. If the upset classifier fails,
    /// the race keeps its ranking and gets no upset probabilities.
    pub fn predict_race(&self, race: &mut Race) -> Result<(), PipelineError> {
        self.scorer.score_and_rank(race)?;
        if let Some(upset) = &self.upset {
            if let Err(e) = upset.apply(race) {
                tracing::warn!("{}: upset classifier failed, ranking only: {}", race.key, e);
                for entrant in race.entrants.iter_mut() {
                    entrant.upset_probability = None;
                }
            }
        }
        Ok(())
    }

    /// Predict every race. Races that fail are dropped and reported, never fatal.
    pub fn prepare(&self, races: Vec<Race>, parallel: bool) -> (Vec<Race>, Vec<SkippedRace>) {
        let outcomes: Vec<Result<Race, SkippedRace>> = if parallel {
            races.into_par_iter().map(|race| self.prepare_one(race)).collect()
        } else {
            races.into_iter().map(|race| self.prepare_one(race)).collect()
        };

        let mut prepared = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(race) => prepared.push(race),
                Err(skip) => skipped.push(skip),
            }
        }
        if !skipped.is_empty() {
            tracing::warn!("{} races skipped during prediction", skipped.len());
        }
        (prepared, skipped)
    }

    fn prepare_one(&self, mut race: Race) -> Result<Race, SkippedRace> {
        match self.predict_race(&mut race) {
            Ok(()) => Ok(race),
            Err(e) => {
                tracing::debug!("Skipping race {}: {}", race.key, e);
                Err(SkippedRace {
                    race: race.key,
                    reason: e.to_string(),
                })
            }
        }
    }
}
