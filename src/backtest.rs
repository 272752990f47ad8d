//! Backtest runner.
//!
//! Applies the betting policy and settlement to a list of scored races and
//! accumulates hit-rate and ROI per strategy (ticket source x bet type) and,
//! optionally, per user-defined condition bucket. All money is whole yen, so
//! accumulation is exactly commutative and the sequential and parallel paths
//! produce identical results.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::betting::{BettingPolicy, RaceSkip};
use crate::config::{BacktestConfig, PolicyConfig};
use crate::error::PipelineError;
use crate::pipeline::{Predictor, SkippedRace};
use crate::settlement::settle_all;
use crate::types::{BetTicket, BetType, Race, RaceKey, SettledTicket, TicketSource};

/// Grouping key function for the per-condition breakdown.
/// Returning `None` leaves the ticket out of the breakdown.
pub type ConditionFn = Box<dyn Fn(&Race, &BetTicket) -> Option<String> + Send + Sync>;

/// Strategy bucket: which policy branch produced the ticket and its bet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StrategyKey {
    pub source: TicketSource,
    pub bet_type: BetType,
}

impl StrategyKey {
    pub fn new(source: TicketSource, bet_type: BetType) -> Self {
        Self { source, bet_type }
    }
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source.name(), self.bet_type.name())
    }
}

/// A hit whose payout was missing from the source data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PayoutGap {
    pub race: RaceKey,
    pub combination: String,
}

/// Aggregate counters for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub tickets: u64,
    pub hits: u64,
    pub stake: u64,
    pub returned: u64,
    pub data_quality_flags: Vec<PayoutGap>,
}

impl BucketStats {
    fn record(&mut self, settled: &SettledTicket) {
        self.tickets += 1;
        self.stake += settled.ticket.stake;
        if settled.is_hit() {
            self.hits += 1;
            self.returned += settled.payout;
        }
        if settled.payout_missing {
            self.data_quality_flags.push(PayoutGap {
                race: settled.ticket.race.clone(),
                combination: settled.ticket.combination(),
            });
        }
    }

    fn merge(&mut self, other: BucketStats) {
        self.tickets += other.tickets;
        self.hits += other.hits;
        self.stake += other.stake;
        self.returned += other.returned;
        self.data_quality_flags.extend(other.data_quality_flags);
    }

    fn finish(&mut self) {
        self.data_quality_flags.sort();
    }

    pub fn profit(&self) -> i64 {
        self.returned as i64 - self.stake as i64
    }

    /// hits / tickets
    pub fn precision(&self) -> f64 {
        if self.tickets > 0 {
            self.hits as f64 / self.tickets as f64
        } else {
            0.0
        }
    }

    /// (return - stake) / stake x 100
    pub fn roi(&self) -> f64 {
        if self.stake > 0 {
            self.profit() as f64 / self.stake as f64 * 100.0
        } else {
            0.0
        }
    }

    pub fn payout_missing(&self) -> usize {
        self.data_quality_flags.len()
    }
}

/// Upset candidate quality. Actual upsets are in-band entrants finishing top 3.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsetStats {
    pub actual_upsets: u64,
    pub candidates: u64,
    pub candidate_hits: u64,
}

impl UpsetStats {
    pub fn precision(&self) -> f64 {
        if self.candidates > 0 {
            self.candidate_hits as f64 / self.candidates as f64
        } else {
            0.0
        }
    }

    pub fn recall(&self) -> f64 {
        if self.actual_upsets > 0 {
            self.candidate_hits as f64 / self.actual_upsets as f64
        } else {
            0.0
        }
    }

    fn merge(&mut self, other: UpsetStats) {
        self.actual_upsets += other.actual_upsets;
        self.candidates += other.candidates;
        self.candidate_hits += other.candidate_hits;
    }
}

/// Bankroll replayed race by race in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BankrollSummary {
    pub initial: i64,
    pub final_balance: i64,
    pub peak: i64,
    pub max_drawdown: i64,
}

impl BankrollSummary {
    fn replay(initial: i64, race_profits: &[(RaceKey, i64)]) -> Self {
        let mut balance = initial;
        let mut peak = initial;
        let mut max_drawdown = 0;
        for (_, profit) in race_profits {
            balance += profit;
            peak = peak.max(balance);
            max_drawdown = max_drawdown.max(peak - balance);
        }
        Self {
            initial,
            final_balance: balance,
            peak,
            max_drawdown,
        }
    }
}

/// Result of one backtest run.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestResult {
    pub strategies: BTreeMap<StrategyKey, BucketStats>,
    pub conditions: BTreeMap<(StrategyKey, String), BucketStats>,
    pub races_total: u64,
    pub races_with_tickets: u64,
    /// WIN tickets dropped by the expected-value gate or Kelly sizing
    pub screened_tickets: u64,
    pub unstaked_tickets: u64,
    pub skipped_races: Vec<SkippedRace>,
    /// Race-level gates that suppressed rank-based tickets, by reason
    pub race_skips: BTreeMap<&'static str, u64>,
    /// Entrants excluded from favorite sets, by reason
    pub entrant_skips: BTreeMap<&'static str, u64>,
    pub upset: UpsetStats,
    pub bankroll: BankrollSummary,
    pub min_bucket_tickets: u64,
    pub staking_seed: Option<u64>,
}

impl BacktestResult {
    pub fn get(&self, source: TicketSource, bet_type: BetType) -> Option<&BucketStats> {
        self.strategies.get(&StrategyKey::new(source, bet_type))
    }

    /// Totals over every strategy.
    pub fn totals(&self) -> BucketStats {
        let mut total = BucketStats::default();
        for stats in self.strategies.values() {
            total.merge(stats.clone());
        }
        total.finish();
        total
    }

    /// Condition buckets with enough tickets to act on.
    pub fn actionable_buckets(&self) -> impl Iterator<Item = (&(StrategyKey, String), &BucketStats)> {
        let min = self.min_bucket_tickets;
        self.conditions.iter().filter(move |(_, s)| s.tickets >= min)
    }

    /// Condition buckets below the minimum sample size; still part of the totals.
    pub fn insufficient_buckets(&self) -> impl Iterator<Item = (&(StrategyKey, String), &BucketStats)> {
        let min = self.min_bucket_tickets;
        self.conditions.iter().filter(move |(_, s)| s.tickets < min)
    }

    pub fn payout_gaps(&self) -> usize {
        self.strategies.values().map(|s| s.payout_missing()).sum()
    }

    /// JSON report.
    pub fn to_json(&self) -> serde_json::Value {
        let bucket = |key: &StrategyKey, s: &BucketStats| {
            serde_json::json!({
                "source": key.source,
                "bet_type": key.bet_type,
                "tickets": s.tickets,
                "hits": s.hits,
                "stake": s.stake,
                "return": s.returned,
                "precision": s.precision(),
                "roi": s.roi(),
                "data_quality_flags": s.data_quality_flags,
            })
        };
        let totals = self.totals();

        serde_json::json!({
            "races_total": self.races_total,
            "races_with_tickets": self.races_with_tickets,
            "screened_tickets": self.screened_tickets,
            "unstaked_tickets": self.unstaked_tickets,
            "staking_seed": self.staking_seed,
            "totals": {
                "tickets": totals.tickets,
                "hits": totals.hits,
                "stake": totals.stake,
                "return": totals.returned,
                "roi": totals.roi(),
                "payout_missing": totals.payout_missing(),
            },
            "strategies": self.strategies.iter().map(|(k, s)| bucket(k, s)).collect::<Vec<_>>(),
            "conditions": self.actionable_buckets().map(|((k, c), s)| {
                let mut v = bucket(k, s);
                v["condition"] = serde_json::Value::from(c.as_str());
                v
            }).collect::<Vec<_>>(),
            "insufficient_buckets": self.insufficient_buckets().count(),
            "min_bucket_tickets": self.min_bucket_tickets,
            "race_skips": self.race_skips,
            "entrant_skips": self.entrant_skips,
            "skipped_races": self.skipped_races,
            "upset": {
                "actual_upsets": self.upset.actual_upsets,
                "candidates": self.upset.candidates,
                "candidate_hits": self.upset.candidate_hits,
                "precision": self.upset.precision(),
                "recall": self.upset.recall(),
            },
            "bankroll": self.bankroll,
        })
    }
}

/// Per-worker partial accumulator.
#[derive(Default)]
struct Accumulator {
    strategies: BTreeMap<StrategyKey, BucketStats>,
    conditions: BTreeMap<(StrategyKey, String), BucketStats>,
    races_total: u64,
    races_with_tickets: u64,
    screened_tickets: u64,
    unstaked_tickets: u64,
    skipped_races: Vec<SkippedRace>,
    race_skips: BTreeMap<&'static str, u64>,
    entrant_skips: BTreeMap<&'static str, u64>,
    upset: UpsetStats,
    race_profits: Vec<(RaceKey, i64)>,
}

impl Accumulator {
    fn merge(mut self, other: Accumulator) -> Accumulator {
        for (k, v) in other.strategies {
            self.strategies.entry(k).or_default().merge(v);
        }
        for (k, v) in other.conditions {
            self.conditions.entry(k).or_default().merge(v);
        }
        self.races_total += other.races_total;
        self.races_with_tickets += other.races_with_tickets;
        self.screened_tickets += other.screened_tickets;
        self.unstaked_tickets += other.unstaked_tickets;
        self.skipped_races.extend(other.skipped_races);
        for (k, v) in other.race_skips {
            *self.race_skips.entry(k).or_default() += v;
        }
        for (k, v) in other.entrant_skips {
            *self.entrant_skips.entry(k).or_default() += v;
        }
        self.upset.merge(other.upset);
        self.race_profits.extend(other.race_profits);
        self
    }

    fn finish(mut self, config: &BacktestConfig, staking_seed: Option<u64>) -> BacktestResult {
        for stats in self.strategies.values_mut() {
            stats.finish();
        }
        for stats in self.conditions.values_mut() {
            stats.finish();
        }
        self.skipped_races
            .sort_by(|a, b| a.race.cmp(&b.race).then_with(|| a.reason.cmp(&b.reason)));
        self.race_profits.sort();

        BacktestResult {
            strategies: self.strategies,
            conditions: self.conditions,
            races_total: self.races_total,
            races_with_tickets: self.races_with_tickets,
            screened_tickets: self.screened_tickets,
            unstaked_tickets: self.unstaked_tickets,
            skipped_races: self.skipped_races,
            race_skips: self.race_skips,
            entrant_skips: self.entrant_skips,
            upset: self.upset,
            bankroll: BankrollSummary::replay(config.initial_bankroll, &self.race_profits),
            min_bucket_tickets: config.min_bucket_tickets,
            staking_seed,
        }
    }
}

/// Runs a betting policy over historical races.
pub struct BacktestRunner {
    policy: BettingPolicy,
    config: BacktestConfig,
    condition: Option<ConditionFn>,
}

impl BacktestRunner {
    pub fn new(policy: BettingPolicy, config: BacktestConfig) -> Self {
        Self {
            policy,
            config,
            condition: None,
        }
    }

    /// Add a per-condition breakdown keyed by `condition`.
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Race, &BetTicket) -> Option<String> + Send + Sync + 'static,
    {
        self.condition = Some(Box::new(condition));
        self
    }

    pub fn policy(&self) -> &BettingPolicy {
        &self.policy
    }

    /// Run on races that already carry scores, ranks and upset probabilities.
    pub fn run(&self, races: &[Race]) -> BacktestResult {
        let acc = if self.config.parallel {
            races
                .par_iter()
                .fold(Accumulator::default, |mut acc, race| {
                    self.process(race, &mut acc);
                    acc
                })
                .reduce(Accumulator::default, Accumulator::merge)
        } else {
            let mut ordered: Vec<&Race> = races.iter().collect();
            ordered.sort_by(|a, b| a.key.cmp(&b.key));
            let mut acc = Accumulator::default();
            for race in ordered {
                self.process(race, &mut acc);
            }
            acc
        };

        let result = acc.finish(&self.config, self.policy.staking_seed());
        let totals = result.totals();
        tracing::info!(
            "Backtest: {} races, {} tickets, hit rate {:.2}%, ROI {:.2}%",
            result.races_total,
            totals.tickets,
            totals.precision() * 100.0,
            totals.roi()
        );
        if totals.payout_missing() > 0 {
            tracing::warn!(
                "{} winning tickets had no payout data; ROI is understated",
                totals.payout_missing()
            );
        }
        result
    }

    /// Predict then run. Races the predictor rejects are listed as skipped.
    pub fn run_with(&self, predictor: &Predictor, races: Vec<Race>) -> BacktestResult {
        let n_input = races.len() as u64;
        let (prepared, skipped) = predictor.prepare(races, self.config.parallel);
        let mut result = self.run(&prepared);
        result.races_total = n_input;
        result.skipped_races.extend(skipped);
        result
            .skipped_races
            .sort_by(|a, b| a.race.cmp(&b.race).then_with(|| a.reason.cmp(&b.reason)));
        result
    }

    fn process(&self, race: &Race, acc: &mut Accumulator) {
        acc.races_total += 1;

        if !race.is_resolved() {
            tracing::debug!("Skipping race {}: no official result", race.key);
            acc.skipped_races.push(SkippedRace {
                race: race.key.clone(),
                reason: "unresolved: no official result".to_string(),
            });
            return;
        }

        let decision = self.policy.decide(race);
        if let Some(skip) = decision.race_skip {
            *acc.race_skips.entry(skip.name()).or_default() += 1;
            if skip == RaceSkip::NotScored {
                acc.skipped_races.push(SkippedRace {
                    race: race.key.clone(),
                    reason: "not scored".to_string(),
                });
                return;
            }
        }
        for (_, reason) in &decision.entrant_skips {
            *acc.entrant_skips.entry(reason.name()).or_default() += 1;
        }
        acc.screened_tickets += decision.screened as u64;
        acc.unstaked_tickets += decision.unstaked as u64;

        let upset_positions = race
            .entrants
            .iter()
            .filter(|e| e.upset_probability.is_some() && e.finished_within(3))
            .count() as u64;
        acc.upset.actual_upsets += upset_positions;
        acc.upset.candidates += decision.candidates.len() as u64;
        acc.upset.candidate_hits += decision
            .candidates
            .iter()
            .filter(|h| race.entrant(**h).is_some_and(|e| e.finished_within(3)))
            .count() as u64;

        if decision.tickets.is_empty() {
            return;
        }
        acc.races_with_tickets += 1;

        let mut race_profit = 0i64;
        for settled in settle_all(&decision.tickets, race) {
            let ticket = &settled.ticket;
            race_profit += settled.profit();
            let key = StrategyKey::new(ticket.source, ticket.bet_type);
            acc.strategies.entry(key).or_default().record(&settled);

            if let Some(condition) = &self.condition {
                if let Some(bucket) = condition(race, ticket) {
                    acc.conditions
                        .entry((key, bucket))
                        .or_default()
                        .record(&settled);
                }
            }
        }
        acc.race_profits.push((race.key.clone(), race_profit));
    }
}

/// Upset strategy results at one candidate threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdPoint {
    pub threshold: f64,
    pub candidates: u64,
    pub candidate_hits: u64,
    pub precision: f64,
    pub recall: f64,
    pub tickets: u64,
    pub hits: u64,
    pub stake: u64,
    pub returned: u64,
    pub roi: f64,
}

/// Rerun the backtest on already predicted races once per upset threshold.
///
/// Only the threshold changes between runs; ticket and money figures cover
/// upset tickets only.
pub fn sweep_upset_thresholds(
    policy: &PolicyConfig,
    config: &BacktestConfig,
    races: &[Race],
    thresholds: &[f64],
) -> Result<Vec<ThresholdPoint>, PipelineError> {
    thresholds
        .iter()
        .map(|&threshold| {
            let policy = BettingPolicy::new(PolicyConfig {
                upset_threshold: Some(threshold),
                ..policy.clone()
            })?;
            let result = BacktestRunner::new(policy, config.clone()).run(races);

            let mut upset = BucketStats::default();
            for (key, stats) in &result.strategies {
                if key.source == TicketSource::Upset {
                    upset.merge(stats.clone());
                }
            }
            upset.finish();
            tracing::info!(
                "Threshold {:.3}: {} candidates, {} tickets, ROI {:.2}%",
                threshold,
                result.upset.candidates,
                upset.tickets,
                upset.roi()
            );

            Ok(ThresholdPoint {
                threshold,
                candidates: result.upset.candidates,
                candidate_hits: result.upset.candidate_hits,
                precision: result.upset.precision(),
                recall: result.upset.recall(),
                tickets: upset.tickets,
                hits: upset.hits,
                stake: upset.stake,
                returned: upset.returned,
                roi: upset.roi(),
            })
        })
        .collect()
}

pub fn print_threshold_sweep(points: &[ThresholdPoint]) {
    println!("=== Upset Threshold Sweep ===");
    println!();
    println!(
        "  {:>9} {:>10} {:>9} {:>8} {:>8} {:>8} {:>9}",
        "Threshold", "Candidates", "Precision", "Recall", "Tickets", "Hits", "ROI"
    );
    println!("  {}", "-".repeat(67));
    for p in points {
        println!(
            "  {:>9.3} {:>10} {:>8.1}% {:>7.1}% {:>8} {:>8} {:>8.1}%",
            p.threshold,
            p.candidates,
            p.precision * 100.0,
            p.recall * 100.0,
            p.tickets,
            p.hits,
            p.roi
        );
    }
}

/// Built-in condition keys.
pub mod conditions {
    use crate::types::{BetTicket, Entrant, Race, TicketSource};

    /// Track code x surface.
    pub fn track_surface(race: &Race, _ticket: &BetTicket) -> Option<String> {
        Some(format!(
            "{}/{}",
            race.key.track_code,
            race.surface.as_deref().unwrap_or("unknown")
        ))
    }

    /// Popularity band x predicted-rank band x odds band of the ticket's key horse:
    /// the top pick for ranker tickets, the long-shot for upset tickets.
    pub fn market_bands(race: &Race, ticket: &BetTicket) -> Option<String> {
        let horse = match ticket.source {
            TicketSource::Ranker => ticket.horses.first(),
            TicketSource::Upset => ticket.horses.last(),
        }?;
        let entrant: &Entrant = race.entrant(*horse)?;
        Some(format!(
            "pop {} | pred {} | odds {}",
            popularity_band(entrant.popularity_rank),
            predicted_band(entrant.predicted_rank),
            odds_band(entrant.win_odds)
        ))
    }

    pub fn popularity_band(rank: u32) -> &'static str {
        match rank {
            0..=3 => "1-3",
            4..=6 => "4-6",
            7..=9 => "7-9",
            10..=12 => "10-12",
            _ => "13+",
        }
    }

    pub fn predicted_band(rank: Option<u32>) -> &'static str {
        match rank {
            Some(1) => "1",
            Some(2..=3) => "2-3",
            Some(4..=6) => "4-6",
            Some(_) => "7+",
            None => "n/a",
        }
    }

    pub fn odds_band(odds: Option<f64>) -> &'static str {
        match odds {
            None => "n/a",
            Some(o) if o < 2.0 => "<2",
            Some(o) if o < 5.0 => "2-5",
            Some(o) if o < 10.0 => "5-10",
            Some(o) if o < 20.0 => "10-20",
            Some(_) => "20+",
        }
    }
}

/// Print backtest results in table format.
pub fn print_backtest_table(results: &BacktestResult) {
    let totals = results.totals();

    println!("=== Backtest Results ===");
    println!();
    println!("Overall Statistics:");
    println!("  Races:         {}", results.races_total);
    println!("  Races Bet:     {}", results.races_with_tickets);
    println!("  Skipped Races: {}", results.skipped_races.len());
    println!("  Total Tickets: {}", totals.tickets);
    println!("  Total Hits:    {}", totals.hits);
    println!("  Hit Rate:      {:.2}%", totals.precision() * 100.0);
    println!("  Total Stake:   ¥{}", totals.stake);
    println!("  Total Return:  ¥{}", totals.returned);
    println!("  Profit:        ¥{}", totals.profit());
    println!("  ROI:           {:.2}%", totals.roi());
    println!("  Final Bankroll: ¥{}", results.bankroll.final_balance);
    println!("  Max Drawdown:  ¥{}", results.bankroll.max_drawdown);
    if results.screened_tickets > 0 {
        println!("  Screened WIN:  {}", results.screened_tickets);
    }
    if let Some(seed) = results.staking_seed {
        println!("  Staking Seed:  {}", seed);
    }
    println!();

    println!("By Strategy:");
    println!(
        "  {:22} {:>8} {:>6} {:>9} {:>9} {:>8}",
        "Strategy", "Tickets", "Hits", "Hit Rate", "ROI", "Missing"
    );
    println!("  {}", "-".repeat(67));
    for (key, s) in &results.strategies {
        println!(
            "  {:22} {:>8} {:>6} {:>8.1}% {:>8.1}% {:>8}",
            key.to_string(),
            s.tickets,
            s.hits,
            s.precision() * 100.0,
            s.roi(),
            s.payout_missing()
        );
    }
    println!();

    let actionable: Vec<_> = results.actionable_buckets().collect();
    if !actionable.is_empty() || results.insufficient_buckets().next().is_some() {
        println!(
            "By Condition (min {} tickets, {} buckets below minimum):",
            results.min_bucket_tickets,
            results.insufficient_buckets().count()
        );
        for ((key, condition), s) in actionable {
            println!(
                "  {:22} {:34} {:>6} {:>8.1}% {:>8.1}%",
                key.to_string(),
                condition,
                s.tickets,
                s.precision() * 100.0,
                s.roi()
            );
        }
        println!();
    }

    if results.upset.candidates > 0 || results.upset.actual_upsets > 0 {
        println!("Upset Candidates:");
        println!("  Flagged:       {}", results.upset.candidates);
        println!("  Hits:          {}", results.upset.candidate_hits);
        println!("  Precision:     {:.2}%", results.upset.precision() * 100.0);
        println!("  Recall:        {:.2}%", results.upset.recall() * 100.0);
        println!();
    }

    if !results.race_skips.is_empty() || !results.entrant_skips.is_empty() {
        println!("Skip Reasons:");
        for (reason, n) in results.race_skips.iter().chain(results.entrant_skips.iter()) {
            println!("  {:22} {:>8}", reason, n);
        }
    }

    let gaps = results.payout_gaps();
    if gaps > 0 {
        println!();
        println!("WARNING: {} winning tickets had no payout data", gaps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::types::{Entrant, PayoutTable};
    use chrono::NaiveDate;

    /// Three-runner race where horse 1 is the top pick.
    fn race(day: u32, winner: u8, win_odds: f64, with_payouts: bool) -> Race {
        let key = RaceKey::new("05", NaiveDate::from_ymd_opt(2024, 4, day).unwrap(), 1);
        let entrants = (1..=3u8)
            .map(|h| {
                let mut e = Entrant::new(h, h as u32);
                e.win_odds = Some(if h == 1 { win_odds } else { 8.0 });
                e.raw_model_score = Some(1.0 - h as f64 * 0.2);
                e.predicted_rank = Some(h as u32);
                e.finish_position = Some(if h == winner {
                    1
                } else if h < winner {
                    h as u32 + 1
                } else {
                    h as u32
                });
                e
            })
            .collect();
        let mut race = Race::new(key, entrants);
        if with_payouts {
            let mut p = PayoutTable::default();
            for h in 1..=3u8 {
                p.insert(BetType::Place, &[h], 1.5);
            }
            race.payouts = p;
        }
        race
    }

    fn win_place_runner() -> BacktestRunner {
        let policy = BettingPolicy::new(PolicyConfig {
            predicted_rank_max: Some(1),
            bet_types: vec![BetType::Win, BetType::Place],
            upset_threshold: None,
            ..Default::default()
        })
        .unwrap();
        BacktestRunner::new(policy, BacktestConfig::default())
    }

    fn sample_races() -> Vec<Race> {
        vec![
            race(1, 1, 5.0, true),
            race(2, 2, 3.0, true),
            race(3, 1, 2.5, true),
            race(4, 3, 4.0, false),
        ]
    }

    #[test]
    fn test_upset_threshold_sweep() {
        let mut races = sample_races();
        for (i, race) in races.iter_mut().enumerate() {
            race.entrants[2].upset_probability = Some(if i < 2 { 0.2 } else { 0.4 });
        }
        let policy = PolicyConfig {
            predicted_rank_max: Some(1),
            bet_types: Vec::new(),
            upset_threshold: None,
            upset_bet_types: vec![BetType::Place],
            ..Default::default()
        };

        let points =
            sweep_upset_thresholds(&policy, &BacktestConfig::default(), &races, &[0.1, 0.3, 0.5])
                .unwrap();
        assert_eq!(points.len(), 3);

        // horse 3 always places; the last race has no payouts
        assert_eq!((points[0].candidates, points[0].tickets, points[0].hits), (4, 4, 4));
        assert_eq!((points[0].stake, points[0].returned), (400, 450));
        assert!((points[0].roi - 12.5).abs() < 1e-9);
        assert!((points[0].recall - 1.0).abs() < 1e-12);

        assert_eq!((points[1].candidates, points[1].stake, points[1].returned), (2, 200, 150));
        assert!((points[1].roi + 25.0).abs() < 1e-9);
        assert!((points[1].recall - 0.5).abs() < 1e-12);

        assert_eq!((points[2].candidates, points[2].tickets), (0, 0));
        assert_eq!(points[2].roi, 0.0);

        assert!(sweep_upset_thresholds(&policy, &BacktestConfig::default(), &races, &[1.5]).is_err());
    }

    #[test]
    fn test_bucket_stats_metrics() {
        let s = BucketStats {
            tickets: 100,
            hits: 10,
            stake: 10_000,
            returned: 12_000,
            data_quality_flags: Vec::new(),
        };
        assert_eq!(s.profit(), 2_000);
        assert!((s.roi() - 20.0).abs() < 0.01);
        assert!((s.precision() - 0.1).abs() < 0.01);
        assert_eq!(BucketStats::default().roi(), 0.0);
    }

    #[test]
    fn test_win_and_place_accumulation() {
        let result = win_place_runner().run(&sample_races());

        let win = result.get(TicketSource::Ranker, BetType::Win).unwrap();
        assert_eq!(win.tickets, 4);
        assert_eq!(win.hits, 2);
        assert_eq!(win.stake, 400);
        assert_eq!(win.returned, 500 + 250);

        let place = result.get(TicketSource::Ranker, BetType::Place).unwrap();
        assert_eq!(place.tickets, 4);
        // horse 1 finishes 1st, 2nd, 1st, 2nd
        assert_eq!(place.hits, 4);
        assert_eq!(place.returned, 450);
        assert_eq!(place.payout_missing(), 1);
        assert_eq!(result.payout_gaps(), 1);
        assert_eq!(place.data_quality_flags[0].race.meeting_date.format("%d").to_string(), "04");
    }

    #[test]
    fn test_bankroll_and_drawdown() {
        let result = win_place_runner().run(&sample_races());
        // per race profit: +450, -50, +200, -200
        assert_eq!(result.bankroll.final_balance, 100_000 + 400);
        assert_eq!(result.bankroll.peak, 100_600);
        assert_eq!(result.bankroll.max_drawdown, 200);
    }

    #[test]
    fn test_order_independent_and_parallel_identical() {
        let races = sample_races();
        let mut reversed = races.clone();
        reversed.reverse();

        let runner = win_place_runner().with_condition(conditions::market_bands);
        let a = runner.run(&races);
        let b = runner.run(&reversed);
        assert_eq!(a, b);

        let policy = runner.policy().clone();
        let parallel = BacktestRunner::new(
            policy,
            BacktestConfig {
                parallel: true,
                ..Default::default()
            },
        )
        .with_condition(conditions::market_bands);
        assert_eq!(parallel.run(&reversed), a);
    }

    #[test]
    fn test_minimum_sample_gate() {
        let runner = win_place_runner().with_condition(|race: &Race, _t: &BetTicket| {
            Some(if race.key.meeting_date.format("%d").to_string() == "01" {
                "opening".to_string()
            } else {
                "rest".to_string()
            })
        });
        let mut races = sample_races();
        for day in 5..=9 {
            races.push(race(day, 1, 2.0, true));
        }
        let result = runner.run(&races);

        let actionable: Vec<String> = result
            .actionable_buckets()
            .map(|((k, c), _)| format!("{} {}", k, c))
            .collect();
        assert_eq!(actionable, vec!["ranker/win rest", "ranker/place rest"]);
        assert_eq!(result.insufficient_buckets().count(), 2);

        // raw totals still include the small buckets
        assert_eq!(result.get(TicketSource::Ranker, BetType::Win).unwrap().tickets, 9);
    }

    #[test]
    fn test_unresolved_races_are_skipped() {
        let mut races = sample_races();
        for e in races[0].entrants.iter_mut() {
            e.finish_position = None;
        }
        let result = win_place_runner().run(&races);
        assert_eq!(result.races_total, 4);
        assert_eq!(result.skipped_races.len(), 1);
        assert_eq!(result.get(TicketSource::Ranker, BetType::Win).unwrap().tickets, 3);
    }

    #[test]
    fn test_low_score_diff_counted() {
        let mut races = sample_races();
        races[1].entrants[0].raw_model_score = Some(0.61);
        races[1].entrants[1].raw_model_score = Some(0.60);
        let result = win_place_runner().run(&races);
        assert_eq!(result.race_skips.get("low_score_diff"), Some(&1));
        assert_eq!(result.get(TicketSource::Ranker, BetType::Win).unwrap().tickets, 3);
    }

    #[test]
    fn test_upset_recall() {
        let mut r = race(1, 3, 5.0, true);
        r.entrants[1].upset_probability = Some(0.4);
        r.entrants[2].upset_probability = Some(0.1);
        let policy = BettingPolicy::new(PolicyConfig {
            bet_types: Vec::new(),
            upset_bet_types: vec![BetType::Place],
            pair_anchors: 1,
            trio_anchors: 1,
            upset_threshold: Some(0.2),
            min_score_separation: None,
            ..Default::default()
        });
        let runner = BacktestRunner::new(policy.unwrap(), BacktestConfig::default());
        let result = runner.run(&[r]);

        assert_eq!(result.upset.actual_upsets, 2);
        assert_eq!(result.upset.candidates, 1);
        assert_eq!(result.upset.candidate_hits, 1);
        assert!((result.upset.recall() - 0.5).abs() < 1e-9);
        assert!((result.upset.precision() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_json_report() {
        let result = win_place_runner()
            .with_condition(conditions::track_surface)
            .run(&sample_races());
        let json = result.to_json();
        assert_eq!(json["races_total"], 4);
        assert_eq!(json["strategies"].as_array().unwrap().len(), 2);
        assert_eq!(json["strategies"][0]["bet_type"], "win");
        assert_eq!(json["totals"]["payout_missing"], 1);
    }

    #[test]
    fn test_condition_bands() {
        assert_eq!(conditions::popularity_band(8), "7-9");
        assert_eq!(conditions::predicted_band(Some(3)), "2-3");
        assert_eq!(conditions::odds_band(Some(12.0)), "10-20");
        assert_eq!(conditions::odds_band(None), "n/a");
    }
}
