//! Betting policy: turns a scored race into bet tickets.
//!
//! Two strategies share one rule set:
//! - ranker tickets are built from the "favorite" set (entrants passing the
//!   predicted-rank, popularity and odds rules), gated per race by the score
//!   separation between the top two entrants;
//! - upset tickets pair the ranker's top entrants (anchors) with long-shots
//!   whose upset probability clears the threshold.
//!
//! WIN tickets can additionally be screened by expected value and sized by
//! fractional Kelly, using the softmax of the race's raw scores as the win
//! probability.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::config::{KellyConfig, PolicyConfig, StakeSizing};
use crate::error::PipelineError;
use crate::ranking::{score_separation, win_probabilities};
use crate::types::{BetTicket, BetType, Entrant, HorseNumber, Race, RaceKey, TicketSource};

/// Largest favorite set or anchor set that may be boxed.
pub const MAX_BOX_SIZE: u32 = 6;

/// Why an entrant was left out of the favorite set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    LowPredictedRank,
    LowPopularity,
    OddsTooLow,
    OddsTooHigh,
    MissingOdds,
    MultipleConditions,
}

impl SkipReason {
    pub fn name(&self) -> &'static str {
        match self {
            SkipReason::LowPredictedRank => "low_predicted_rank",
            SkipReason::LowPopularity => "low_popularity",
            SkipReason::OddsTooLow => "odds_too_low",
            SkipReason::OddsTooHigh => "odds_too_high",
            SkipReason::MissingOdds => "missing_odds",
            SkipReason::MultipleConditions => "multiple_conditions",
        }
    }
}

/// Why rank-based tickets were not generated for a whole race.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RaceSkip {
    LowScoreDiff { separation: f64 },
    NotScored,
}

impl RaceSkip {
    pub fn name(&self) -> &'static str {
        match self {
            RaceSkip::LowScoreDiff { .. } => "low_score_diff",
            RaceSkip::NotScored => "not_scored",
        }
    }
}

/// Everything the policy decided for one race.
#[derive(Debug, Clone, Serialize)]
pub struct RaceDecision {
    pub race: RaceKey,
    pub tickets: Vec<BetTicket>,
    pub race_skip: Option<RaceSkip>,
    pub entrant_skips: Vec<(HorseNumber, SkipReason)>,
    pub favorites: Vec<HorseNumber>,
    pub candidates: Vec<HorseNumber>,
    /// WIN tickets dropped by the expected-value gate or a zero Kelly stake.
    pub screened: usize,
    /// Tickets not bought because of partial staking.
    pub unstaked: usize,
}

impl PolicyConfig {
    /// Reject configurations that cannot be run. Called before any race is processed.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidPolicy(msg));

        if self.stake == 0 {
            return invalid("stake must be positive".to_string());
        }
        let p = self.staking.probability;
        if !(p > 0.0 && p <= 1.0) {
            return invalid(format!("staking probability {} not in (0, 1]", p));
        }
        if let (Some(lo), Some(hi)) = (self.odds_min, self.odds_max) {
            if lo > hi {
                return invalid(format!("odds_min {} exceeds odds_max {}", lo, hi));
            }
        }
        if let (Some(lo), Some(hi)) = (self.popularity_rank_min, self.popularity_rank_max) {
            if lo > hi {
                return invalid(format!(
                    "popularity_rank_min {} exceeds popularity_rank_max {}",
                    lo, hi
                ));
            }
        }
        if let Some(t) = self.upset_threshold {
            if !(0.0..=1.0).contains(&t) {
                return invalid(format!("upset_threshold {} not in [0, 1]", t));
            }
        }
        if let Some(sep) = self.min_score_separation {
            if !sep.is_finite() || sep < 0.0 {
                return invalid(format!("min_score_separation {} must be >= 0", sep));
            }
        }
        if self.predicted_rank_max == Some(0) {
            return invalid("predicted_rank_max must be at least 1".to_string());
        }

        let needs_box = self.bet_types.iter().any(|b| b.legs() > 1);
        if needs_box {
            match self.predicted_rank_max {
                None => {
                    return invalid(
                        "predicted_rank_max is required for multi-horse bet types".to_string(),
                    )
                }
                Some(n) if n > MAX_BOX_SIZE => {
                    return invalid(format!(
                        "predicted_rank_max {} exceeds box limit {}",
                        n, MAX_BOX_SIZE
                    ))
                }
                _ => {}
            }
        }
        if self.pair_anchors as u32 > MAX_BOX_SIZE || self.trio_anchors as u32 > MAX_BOX_SIZE {
            return invalid(format!("anchor counts must not exceed {}", MAX_BOX_SIZE));
        }
        if self.upset_bet_types.contains(&BetType::TrifectaBox) && self.trio_anchors < 2 {
            return invalid("trifecta box upset tickets need at least 2 anchors".to_string());
        }
        if let Some(ev) = self.min_expected_value {
            if !ev.is_finite() || ev < 0.0 {
                return invalid(format!("min_expected_value {} must be >= 0", ev));
            }
        }
        if let StakeSizing::Kelly(k) = &self.sizing {
            if !(k.fraction > 0.0 && k.fraction <= 1.0) {
                return invalid(format!("kelly fraction {} not in (0, 1]", k.fraction));
            }
            if !(k.max_bet_pct > 0.0 && k.max_bet_pct <= 1.0) {
                return invalid(format!("kelly max_bet_pct {} not in (0, 1]", k.max_bet_pct));
            }
            if k.bankroll == 0 {
                return invalid("kelly bankroll must be positive".to_string());
            }
            if k.min_stake < 100 || k.min_stake > k.max_stake {
                return invalid(format!(
                    "kelly stakes must satisfy 100 <= min_stake ({}) <= max_stake ({})",
                    k.min_stake, k.max_stake
                ));
            }
        }
        Ok(())
    }
}

/// Validated betting policy.
#[derive(Debug, Clone)]
pub struct BettingPolicy {
    config: PolicyConfig,
}

impl BettingPolicy {
    pub fn new(config: PolicyConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Seed recorded with the run when partial staking is active.
    pub fn staking_seed(&self) -> Option<u64> {
        self.config
            .staking
            .is_probabilistic()
            .then_some(self.config.staking.seed)
    }

    /// Decide tickets for one race.
    pub fn decide(&self, race: &Race) -> RaceDecision {
        let mut decision = RaceDecision {
            race: race.key.clone(),
            tickets: Vec::new(),
            race_skip: None,
            entrant_skips: Vec::new(),
            favorites: Vec::new(),
            candidates: Vec::new(),
            screened: 0,
            unstaked: 0,
        };

        let ranked = race.by_predicted_rank();
        if ranked.is_empty() || ranked.len() != race.entrants.len() {
            decision.race_skip = Some(RaceSkip::NotScored);
            return decision;
        }

        if let Some(min_sep) = self.config.min_score_separation {
            let separation = score_separation(race);
            if separation < min_sep {
                tracing::debug!(
                    "{}: low_score_diff ({:.4} < {:.4})",
                    race.key,
                    separation,
                    min_sep
                );
                decision.race_skip = Some(RaceSkip::LowScoreDiff { separation });
            }
        }
        let rank_gate_open = decision.race_skip.is_none();

        if rank_gate_open {
            for entrant in &ranked {
                match self.favorite_check(entrant) {
                    None => decision.favorites.push(entrant.horse_number),
                    Some(reason) => decision.entrant_skips.push((entrant.horse_number, reason)),
                }
            }
            let favorites = decision.favorites.clone();
            self.ranker_tickets(race, &favorites, &mut decision.tickets);
        }

        if let Some(threshold) = self.config.upset_threshold {
            let anchor_count = self.config.pair_anchors.max(self.config.trio_anchors);
            let anchors: Vec<HorseNumber> = ranked
                .iter()
                .take(anchor_count)
                .map(|e| e.horse_number)
                .collect();
            decision.candidates = self.upset_candidates(&ranked, &anchors, threshold);
            let candidates = decision.candidates.clone();
            self.upset_tickets(race, &anchors, &candidates, rank_gate_open, &mut decision.tickets);
        }

        decision.screened = self.size_win_tickets(race, &mut decision.tickets);

        if self.config.staking.is_probabilistic() {
            let before = decision.tickets.len();
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.staking.seed ^ race_seed(&race.key));
            let p = self.config.staking.probability;
            decision.tickets.retain(|_| rng.gen::<f64>() < p);
            decision.unstaked = before - decision.tickets.len();
        }

        decision
    }

    /// `None` if the entrant qualifies as a favorite.
    fn favorite_check(&self, entrant: &Entrant) -> Option<SkipReason> {
        let c = &self.config;
        let mut failures = Vec::new();

        if let (Some(max), Some(rank)) = (c.predicted_rank_max, entrant.predicted_rank) {
            if rank > max {
                failures.push(SkipReason::LowPredictedRank);
            }
        }
        let pop = entrant.popularity_rank;
        if c.popularity_rank_min.is_some_and(|min| pop < min)
            || c.popularity_rank_max.is_some_and(|max| pop > max)
        {
            failures.push(SkipReason::LowPopularity);
        }
        if c.odds_min.is_some() || c.odds_max.is_some() {
            match entrant.win_odds {
                None => failures.push(SkipReason::MissingOdds),
                Some(odds) => {
                    if c.odds_min.is_some_and(|min| odds < min) {
                        failures.push(SkipReason::OddsTooLow);
                    }
                    if c.odds_max.is_some_and(|max| odds > max) {
                        failures.push(SkipReason::OddsTooHigh);
                    }
                }
            }
        }

        match failures.as_slice() {
            [] => None,
            [one] => Some(*one),
            _ => Some(SkipReason::MultipleConditions),
        }
    }

    fn ranker_tickets(&self, race: &Race, favorites: &[HorseNumber], out: &mut Vec<BetTicket>) {
        for bet_type in dedup(&self.config.bet_types) {
            let combos: Vec<Vec<HorseNumber>> = match bet_type {
                BetType::Win | BetType::Place => favorites.iter().map(|h| vec![*h]).collect(),
                BetType::Quinella | BetType::Wide | BetType::TrifectaBox => {
                    combinations(favorites, bet_type.legs())
                }
                BetType::Exacta => permutations_of_two(favorites),
            };
            for horses in combos {
                out.push(self.ticket(race, bet_type, TicketSource::Ranker, horses));
            }
        }
    }

    fn upset_candidates(
        &self,
        ranked: &[&Entrant],
        anchors: &[HorseNumber],
        threshold: f64,
    ) -> Vec<HorseNumber> {
        let mut candidates: Vec<HorseNumber> = ranked
            .iter()
            .filter(|e| matches!(e.upset_probability, Some(p) if p >= threshold))
            .filter(|e| !anchors.contains(&e.horse_number))
            .filter(|e| match (self.config.candidate_predicted_rank_max, e.predicted_rank) {
                (Some(max), Some(rank)) => rank <= max,
                _ => true,
            })
            .map(|e| e.horse_number)
            .collect();
        candidates.sort_unstable();
        candidates
    }

    fn upset_tickets(
        &self,
        race: &Race,
        anchors: &[HorseNumber],
        candidates: &[HorseNumber],
        rank_gate_open: bool,
        out: &mut Vec<BetTicket>,
    ) {
        if candidates.is_empty() {
            return;
        }
        let pair_anchors = &anchors[..self.config.pair_anchors.min(anchors.len())];
        let trio_anchors = &anchors[..self.config.trio_anchors.min(anchors.len())];

        for bet_type in dedup(&self.config.upset_bet_types) {
            let mut combos: Vec<Vec<HorseNumber>> = Vec::new();
            match bet_type {
                BetType::Win | BetType::Place => {
                    combos.extend(candidates.iter().map(|c| vec![*c]));
                }
                // Anchored tickets depend on the ranker and respect its race gate.
                BetType::Quinella | BetType::Wide if rank_gate_open => {
                    for &a in pair_anchors {
                        combos.extend(candidates.iter().map(|&c| vec![a, c]));
                    }
                }
                BetType::Exacta if rank_gate_open => {
                    for &a in pair_anchors {
                        combos.extend(candidates.iter().map(|&c| vec![a, c]));
                    }
                }
                BetType::TrifectaBox if rank_gate_open => {
                    for pair in combinations(trio_anchors, 2) {
                        combos.extend(candidates.iter().map(|&c| vec![pair[0], pair[1], c]));
                    }
                }
                _ => {}
            }
            for horses in combos {
                out.push(self.ticket(race, bet_type, TicketSource::Upset, horses));
            }
        }
    }

    /// Expected-value gate and Kelly sizing for WIN tickets. Returns the
    /// number of WIN tickets dropped.
    ///
    /// Kelly fractions are capped per ticket at `max_bet_pct` and scaled
    /// down together when the race total exceeds it.
    fn size_win_tickets(&self, race: &Race, tickets: &mut Vec<BetTicket>) -> usize {
        let kelly = match &self.config.sizing {
            StakeSizing::Kelly(k) => Some(k),
            StakeSizing::Fixed => None,
        };
        if kelly.is_none() && self.config.min_expected_value.is_none() {
            return 0;
        }

        let probs = win_probabilities(race);
        let edge = |t: &BetTicket| -> Option<(f64, f64)> {
            let horse = *t.horses.first()?;
            Some((*probs.get(&horse)?, race.entrant(horse)?.win_odds?))
        };

        let before = tickets.len();
        tickets.retain(|t| {
            if t.bet_type != BetType::Win {
                return true;
            }
            let Some((p, odds)) = edge(t) else {
                return false;
            };
            if self.config.min_expected_value.is_some_and(|min| p * odds < min) {
                return false;
            }
            kelly.is_none() || kelly_fraction(p, odds) > 0.0
        });
        let screened = before - tickets.len();

        if let Some(k) = kelly {
            let mut sized: Vec<(usize, f64)> = tickets
                .iter()
                .enumerate()
                .filter(|(_, t)| t.bet_type == BetType::Win)
                .filter_map(|(i, t)| {
                    edge(t).map(|(p, odds)| (i, (kelly_fraction(p, odds) * k.fraction).min(k.max_bet_pct)))
                })
                .collect();
            let total: f64 = sized.iter().map(|(_, f)| f).sum();
            if total > k.max_bet_pct {
                let scale = k.max_bet_pct / total;
                for (_, f) in sized.iter_mut() {
                    *f *= scale;
                }
            }
            for (i, f) in sized {
                tickets[i].stake = kelly_stake(k, f);
            }
        }
        screened
    }

    fn ticket(
        &self,
        race: &Race,
        bet_type: BetType,
        source: TicketSource,
        mut horses: Vec<HorseNumber>,
    ) -> BetTicket {
        if !bet_type.is_ordered() {
            horses.sort_unstable();
        }
        BetTicket {
            race: race.key.clone(),
            bet_type,
            source,
            horses,
            stake: self.config.stake,
        }
    }
}

/// Full Kelly fraction `(p * odds - 1) / (odds - 1)`, 0 when the edge is not positive.
pub fn kelly_fraction(probability: f64, odds: f64) -> f64 {
    if !(probability > 0.0 && probability < 1.0) || odds <= 1.0 {
        return 0.0;
    }
    ((probability * odds - 1.0) / (odds - 1.0)).max(0.0)
}

/// Bankroll share in yen, clamped to the stake limits and rounded to 100 yen.
fn kelly_stake(config: &KellyConfig, fraction: f64) -> u64 {
    let amount = (config.bankroll as f64 * fraction)
        .clamp(config.min_stake as f64, config.max_stake as f64);
    (amount / 100.0).round() as u64 * 100
}

fn dedup(bet_types: &[BetType]) -> Vec<BetType> {
    let mut out: Vec<BetType> = Vec::with_capacity(bet_types.len());
    for b in bet_types {
        if !out.contains(b) {
            out.push(*b);
        }
    }
    out
}

/// All k-combinations of `items`, preserving input order within each.
pub fn combinations<T: Copy>(items: &[T], k: usize) -> Vec<Vec<T>> {
    if k == 0 {
        return vec![Vec::new()];
    }
    if items.len() < k {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (i, &first) in items.iter().enumerate() {
        for mut rest in combinations(&items[i + 1..], k - 1) {
            rest.insert(0, first);
            out.push(rest);
        }
    }
    out
}

fn permutations_of_two<T: Copy>(items: &[T]) -> Vec<Vec<T>> {
    let mut out = Vec::new();
    for (i, &a) in items.iter().enumerate() {
        for (j, &b) in items.iter().enumerate() {
            if i != j {
                out.push(vec![a, b]);
            }
        }
    }
    out
}

/// FNV-1a over the race key, stable across platforms and runs.
fn race_seed(key: &RaceKey) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.to_string().bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KellyConfig, StakingConfig};
    use chrono::NaiveDate;

    /// (horse, popularity, odds, score, upset probability)
    type Row = (u8, u32, Option<f64>, f64, Option<f64>);

    fn scored_race(rows: &[Row]) -> Race {
        let key = RaceKey::new("05", NaiveDate::from_ymd_opt(2024, 11, 24).unwrap(), 12);
        let scores: Vec<f64> = rows.iter().map(|r| r.3).collect();
        let horses: Vec<u8> = rows.iter().map(|r| r.0).collect();
        let ranks = crate::ranking::rank_scores(&scores, &horses);
        let entrants = rows
            .iter()
            .zip(ranks)
            .map(|(&(h, pop, odds, score, upset), rank)| {
                let mut e = Entrant::new(h, pop);
                e.win_odds = odds;
                e.raw_model_score = Some(score);
                e.predicted_rank = Some(rank);
                e.upset_probability = upset;
                e
            })
            .collect();
        Race::new(key, entrants)
    }

    fn only(bet_types: &[BetType]) -> PolicyConfig {
        PolicyConfig {
            bet_types: bet_types.to_vec(),
            upset_threshold: None,
            ..Default::default()
        }
    }

    fn count(decision: &RaceDecision, bet_type: BetType, source: TicketSource) -> usize {
        decision
            .tickets
            .iter()
            .filter(|t| t.bet_type == bet_type && t.source == source)
            .count()
    }

    #[test]
    fn test_single_win_ticket_for_top_pick() {
        let config = PolicyConfig {
            predicted_rank_max: Some(1),
            popularity_rank_max: Some(3),
            ..only(&[BetType::Win])
        };
        let policy = BettingPolicy::new(config).unwrap();
        let race = scored_race(&[
            (1, 2, Some(4.0), 0.9, None),
            (2, 1, Some(2.0), 0.5, None),
            (3, 3, Some(6.0), 0.2, None),
        ]);

        let decision = policy.decide(&race);
        assert_eq!(decision.tickets.len(), 1);
        assert_eq!(decision.tickets[0].horses, vec![1]);
        assert_eq!(decision.tickets[0].stake, 100);
    }

    #[test]
    fn test_top_pick_outside_popularity_band_gives_no_ticket() {
        let config = PolicyConfig {
            predicted_rank_max: Some(1),
            popularity_rank_max: Some(3),
            ..only(&[BetType::Win])
        };
        let policy = BettingPolicy::new(config).unwrap();
        let race = scored_race(&[
            (1, 5, Some(9.0), 0.9, None),
            (2, 1, Some(2.0), 0.5, None),
            (3, 2, Some(3.0), 0.2, None),
        ]);

        let decision = policy.decide(&race);
        assert!(decision.tickets.is_empty());
        assert!(decision
            .entrant_skips
            .contains(&(1, SkipReason::LowPopularity)));
    }

    #[test]
    fn test_low_score_diff_skips_race() {
        let config = PolicyConfig {
            min_score_separation: Some(0.10),
            ..only(&BetType::ALL)
        };
        let policy = BettingPolicy::new(config).unwrap();
        let race = scored_race(&[
            (1, 1, Some(2.0), 0.60, None),
            (2, 2, Some(3.0), 0.55, None),
            (3, 3, Some(5.0), 0.10, None),
        ]);

        let decision = policy.decide(&race);
        assert!(decision.tickets.is_empty());
        assert_eq!(decision.race_skip.map(|s| s.name()), Some("low_score_diff"));
    }

    #[test]
    fn test_skip_reasons() {
        let config = PolicyConfig {
            predicted_rank_max: Some(2),
            popularity_rank_max: Some(3),
            min_score_separation: None,
            ..only(&[BetType::Win])
        };
        let policy = BettingPolicy::new(config).unwrap();
        let race = scored_race(&[
            (1, 1, Some(1.2), 0.9, None),  // odds too low
            (2, 2, None, 0.8, None),       // missing odds
            (3, 3, Some(5.0), 0.7, None),  // rank 3
            (4, 9, Some(30.0), 0.6, None), // rank, popularity and odds
        ]);

        let decision = policy.decide(&race);
        assert!(decision.tickets.is_empty());
        assert_eq!(
            decision.entrant_skips,
            vec![
                (1, SkipReason::OddsTooLow),
                (2, SkipReason::MissingOdds),
                (3, SkipReason::LowPredictedRank),
                (4, SkipReason::MultipleConditions),
            ]
        );
    }

    #[test]
    fn test_combination_ticket_counts() {
        let config = PolicyConfig {
            predicted_rank_max: Some(3),
            popularity_rank_max: None,
            odds_min: None,
            odds_max: None,
            min_score_separation: None,
            ..only(&BetType::ALL)
        };
        let policy = BettingPolicy::new(config).unwrap();
        let race = scored_race(&[
            (1, 1, Some(2.0), 0.9, None),
            (2, 2, Some(3.0), 0.8, None),
            (3, 3, Some(5.0), 0.7, None),
            (4, 4, Some(9.0), 0.1, None),
        ]);

        let d = policy.decide(&race);
        let r = TicketSource::Ranker;
        assert_eq!(count(&d, BetType::Win, r), 3);
        assert_eq!(count(&d, BetType::Place, r), 3);
        assert_eq!(count(&d, BetType::Quinella, r), 3);
        assert_eq!(count(&d, BetType::Wide, r), 3);
        assert_eq!(count(&d, BetType::Exacta, r), 6);
        assert_eq!(count(&d, BetType::TrifectaBox, r), 1);
    }

    #[test]
    fn test_trifecta_box_needs_three_favorites() {
        let config = PolicyConfig {
            predicted_rank_max: Some(2),
            popularity_rank_max: None,
            min_score_separation: None,
            ..only(&[BetType::TrifectaBox])
        };
        let policy = BettingPolicy::new(config).unwrap();
        let race = scored_race(&[
            (1, 1, Some(2.0), 0.9, None),
            (2, 2, Some(3.0), 0.8, None),
            (3, 3, Some(5.0), 0.7, None),
        ]);
        assert!(policy.decide(&race).tickets.is_empty());
    }

    #[test]
    fn test_box_limit_is_enforced() {
        let config = PolicyConfig {
            predicted_rank_max: Some(7),
            ..only(&[BetType::Quinella])
        };
        assert!(matches!(
            BettingPolicy::new(config),
            Err(PipelineError::InvalidPolicy(_))
        ));

        // WIN alone has no combinatorial blow-up
        let config = PolicyConfig {
            predicted_rank_max: Some(10),
            ..only(&[BetType::Win])
        };
        assert!(BettingPolicy::new(config).is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let bad = [
            PolicyConfig { stake: 0, ..Default::default() },
            PolicyConfig { odds_min: Some(30.0), odds_max: Some(20.0), ..Default::default() },
            PolicyConfig { upset_threshold: Some(1.5), ..Default::default() },
            PolicyConfig { predicted_rank_max: None, ..Default::default() },
            PolicyConfig { trio_anchors: 1, ..Default::default() },
            PolicyConfig {
                staking: StakingConfig { probability: 0.0, seed: 1 },
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?}", config);
        }
        assert!(PolicyConfig::default().validate().is_ok());
    }

    fn upset_race() -> Race {
        scored_race(&[
            (1, 1, Some(2.0), 0.90, None),
            (2, 2, Some(3.5), 0.70, None),
            (3, 3, Some(5.0), 0.50, None),
            (4, 8, Some(25.0), 0.30, Some(0.40)),
            (5, 9, Some(30.0), 0.20, Some(0.20)),
            (6, 10, Some(45.0), 0.10, Some(0.05)),
        ])
    }

    fn upset_config(threshold: f64) -> PolicyConfig {
        PolicyConfig {
            bet_types: Vec::new(),
            upset_threshold: Some(threshold),
            upset_bet_types: BetType::ALL.to_vec(),
            min_score_separation: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_upset_augmented_tickets() {
        let policy = BettingPolicy::new(upset_config(0.15)).unwrap();
        let d = policy.decide(&upset_race());
        let u = TicketSource::Upset;

        assert_eq!(d.candidates, vec![4, 5]);
        assert_eq!(count(&d, BetType::Place, u), 2);
        assert_eq!(count(&d, BetType::Win, u), 2);
        // 1 anchor x 2 candidates
        assert_eq!(count(&d, BetType::Quinella, u), 2);
        assert_eq!(count(&d, BetType::Wide, u), 2);
        assert_eq!(count(&d, BetType::Exacta, u), 2);
        // C(2,2) anchor pairs x 2 candidates
        assert_eq!(count(&d, BetType::TrifectaBox, u), 2);

        let exacta: Vec<_> = d
            .tickets
            .iter()
            .filter(|t| t.bet_type == BetType::Exacta)
            .map(|t| t.horses.clone())
            .collect();
        assert_eq!(exacta, vec![vec![1, 4], vec![1, 5]]);
        assert!(d
            .tickets
            .iter()
            .any(|t| t.bet_type == BetType::TrifectaBox && t.horses == vec![1, 2, 5]));
    }

    #[test]
    fn test_anchors_are_never_candidates() {
        let race = scored_race(&[
            (1, 7, Some(20.0), 0.90, Some(0.9)),
            (2, 1, Some(2.0), 0.70, None),
            (3, 8, Some(25.0), 0.50, Some(0.3)),
        ]);
        let policy = BettingPolicy::new(upset_config(0.15)).unwrap();
        let d = policy.decide(&race);
        assert_eq!(d.candidates, vec![3]);
    }

    #[test]
    fn test_raising_threshold_never_adds_tickets() {
        let race = upset_race();
        let mut previous = usize::MAX;
        for threshold in [0.0, 0.05, 0.1, 0.2, 0.3, 0.5, 1.0] {
            let policy = BettingPolicy::new(upset_config(threshold)).unwrap();
            let n = policy.decide(&race).tickets.len();
            assert!(n <= previous, "threshold {} increased tickets", threshold);
            previous = n;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_low_score_diff_keeps_unanchored_upset_tickets() {
        let config = PolicyConfig {
            min_score_separation: Some(0.5),
            ..upset_config(0.15)
        };
        let policy = BettingPolicy::new(config).unwrap();
        let d = policy.decide(&upset_race());
        assert!(d.race_skip.is_some());
        assert!(d
            .tickets
            .iter()
            .all(|t| matches!(t.bet_type, BetType::Win | BetType::Place)));
        assert_eq!(d.tickets.len(), 4);
    }

    #[test]
    fn test_unscored_race_is_skipped() {
        let mut race = upset_race();
        race.entrants[0].predicted_rank = None;
        let policy = BettingPolicy::new(PolicyConfig::default()).unwrap();
        let d = policy.decide(&race);
        assert_eq!(d.race_skip, Some(RaceSkip::NotScored));
        assert!(d.tickets.is_empty());
    }

    #[test]
    fn test_decisions_are_deterministic() {
        let policy = BettingPolicy::new(upset_config(0.1)).unwrap();
        let race = upset_race();
        assert_eq!(policy.decide(&race).tickets, policy.decide(&race).tickets);
        assert_eq!(policy.staking_seed(), None);
    }

    #[test]
    fn test_partial_staking_is_replayable() {
        let mut config = upset_config(0.0);
        config.staking = StakingConfig { probability: 0.5, seed: 7 };
        let policy = BettingPolicy::new(config.clone()).unwrap();
        let race = upset_race();

        let first = policy.decide(&race);
        let second = policy.decide(&race);
        assert_eq!(first.tickets, second.tickets);
        assert_eq!(first.unstaked, second.unstaked);
        assert_eq!(policy.staking_seed(), Some(7));

        let full = BettingPolicy::new(upset_config(0.0)).unwrap().decide(&race);
        assert_eq!(first.tickets.len() + first.unstaked, full.tickets.len());
    }

    #[test]
    fn test_combinations() {
        assert_eq!(combinations(&[1, 2, 3], 2), vec![vec![1, 2], vec![1, 3], vec![2, 3]]);
        assert_eq!(combinations(&[1, 2], 3), Vec::<Vec<i32>>::new());
        assert_eq!(permutations_of_two(&[1, 2]).len(), 2);
    }

    /// Two favorites with softmax win probabilities 0.75 and 0.25.
    fn value_race() -> Race {
        scored_race(&[
            (1, 1, Some(2.0), 3.0_f64.ln(), None),
            (2, 2, Some(4.0), 0.0, None),
        ])
    }

    fn kelly() -> StakeSizing {
        StakeSizing::Kelly(KellyConfig {
            fraction: 0.25,
            max_bet_pct: 0.05,
            bankroll: 1_000_000,
            min_stake: 100,
            max_stake: 50_000,
        })
    }

    #[test]
    fn test_kelly_fraction() {
        assert!((kelly_fraction(0.25, 5.0) - 0.0625).abs() < 1e-12);
        assert_eq!(kelly_fraction(0.10, 5.0), 0.0);
        assert_eq!(kelly_fraction(0.5, 1.0), 0.0);
        assert_eq!(kelly_fraction(1.0, 3.0), 0.0);
    }

    #[test]
    fn test_expected_value_gate() {
        let config = PolicyConfig {
            min_score_separation: None,
            min_expected_value: Some(1.2),
            ..only(&[BetType::Win, BetType::Place])
        };
        let d = BettingPolicy::new(config).unwrap().decide(&value_race());

        // EV 1.5 for horse 1, 1.0 for horse 2; PLACE is not screened
        let win: Vec<_> = d.tickets.iter().filter(|t| t.bet_type == BetType::Win).collect();
        assert_eq!(win.len(), 1);
        assert_eq!(win[0].horses, vec![1]);
        assert_eq!(win[0].stake, 100);
        assert_eq!(count(&d, BetType::Place, TicketSource::Ranker), 2);
        assert_eq!(d.screened, 1);
    }

    #[test]
    fn test_kelly_sizing_caps_and_drops() {
        let config = PolicyConfig {
            min_score_separation: None,
            sizing: kelly(),
            ..only(&[BetType::Win])
        };
        let d = BettingPolicy::new(config).unwrap().decide(&value_race());

        // horse 1: 0.5 x 0.25 capped at 5%; horse 2 has no edge
        assert_eq!(d.tickets.len(), 1);
        assert_eq!(d.tickets[0].horses, vec![1]);
        assert_eq!(d.tickets[0].stake, 50_000);
        assert_eq!(d.screened, 1);
    }

    #[test]
    fn test_kelly_allocation_across_horses() {
        let race = scored_race(&[
            (1, 1, Some(4.0), 0.0, None),
            (2, 2, Some(3.0), 0.0, None),
        ]);
        let config = PolicyConfig {
            min_score_separation: None,
            sizing: kelly(),
            ..only(&[BetType::Win, BetType::Place])
        };
        let d = BettingPolicy::new(config).unwrap().decide(&race);

        // both capped at 5%, scaled to a 5% race total
        let stakes: Vec<(BetType, u64)> = d.tickets.iter().map(|t| (t.bet_type, t.stake)).collect();
        assert_eq!(
            stakes,
            vec![
                (BetType::Win, 25_000),
                (BetType::Win, 25_000),
                (BetType::Place, 100),
                (BetType::Place, 100),
            ]
        );
    }

    #[test]
    fn test_invalid_sizing() {
        let bad_kelly = |k: KellyConfig| PolicyConfig {
            sizing: StakeSizing::Kelly(k),
            ..Default::default()
        };
        let bad = [
            bad_kelly(KellyConfig { fraction: 0.0, ..Default::default() }),
            bad_kelly(KellyConfig { max_bet_pct: 1.5, ..Default::default() }),
            bad_kelly(KellyConfig { min_stake: 50, ..Default::default() }),
            bad_kelly(KellyConfig { min_stake: 1_000, max_stake: 500, ..Default::default() }),
            PolicyConfig { min_expected_value: Some(-1.0), ..Default::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?}", config);
        }
        assert!(PolicyConfig { sizing: kelly(), ..Default::default() }.validate().is_ok());
    }
}
