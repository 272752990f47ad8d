//! Walk-forward validation.
//!
//! Each fold asks an external trainer for a predictor fitted on
//! `train_start..=train_end`, backtests it on `test_year`, and records the
//! primary metric. Folds whose trainer fails or returns nothing are skipped
//! with a reason and left out of the aggregate statistics.

use rayon::prelude::*;
use serde::Serialize;
use std::fmt;

use crate::backtest::BacktestRunner;
use crate::betting::BettingPolicy;
use crate::config::{
    BacktestConfig, MetricKind, PrimaryMetric, StabilityLevel, StabilityThresholds,
    WalkForwardConfig, WindowMode,
};
use crate::error::PipelineError;
use crate::pipeline::Predictor;
use crate::types::Race;

/// CV reported when the mean is not positive.
pub const UNDEFINED_CV: f64 = 999.0;

/// Training years and the year they are evaluated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrainWindow {
    pub train_start: i32,
    pub train_end: i32,
    pub test_year: i32,
}

impl TrainWindow {
    /// Build a window, refusing any that would train on the test year or later.
    pub fn new(train_start: i32, train_end: i32, test_year: i32) -> Result<Self, PipelineError> {
        if train_start > train_end {
            return Err(PipelineError::InvalidWindow(format!(
                "train_start {} is after train_end {}",
                train_start, train_end
            )));
        }
        if train_end >= test_year {
            return Err(PipelineError::LeakageViolation {
                train_end,
                test_year,
            });
        }
        Ok(Self {
            train_start,
            train_end,
            test_year,
        })
    }

    /// Window for `test_year`. Expanding windows start at `anchor_start`.
    pub fn for_test_year(
        test_year: i32,
        window_years: u32,
        mode: WindowMode,
        anchor_start: i32,
    ) -> Result<Self, PipelineError> {
        if window_years == 0 {
            return Err(PipelineError::InvalidWindow(
                "window length must be at least one year".to_string(),
            ));
        }
        let train_end = test_year - 1;
        let train_start = match mode {
            WindowMode::Rolling => test_year - window_years as i32,
            WindowMode::Expanding => anchor_start.min(test_year - window_years as i32),
        };
        Self::new(train_start, train_end, test_year)
    }

    pub fn contains(&self, year: i32) -> bool {
        (self.train_start..=self.train_end).contains(&year)
    }

    /// "2020-2022", as used in per-window model file names.
    pub fn label(&self) -> String {
        format!("{}-{}", self.train_start, self.train_end)
    }
}

impl fmt::Display for TrainWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] -> {}", self.label(), self.test_year)
    }
}

/// Fits a predictor for one training window.
///
/// `Ok(None)` means no model is available for the window (for example too
/// little data); the fold is skipped.
pub trait Trainer: Sync {
    fn fit(&self, window: &TrainWindow) -> anyhow::Result<Option<Predictor>>;
}

impl<F> Trainer for F
where
    F: Fn(&TrainWindow) -> anyhow::Result<Option<Predictor>> + Sync,
{
    fn fit(&self, window: &TrainWindow) -> anyhow::Result<Option<Predictor>> {
        self(window)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FoldStatus {
    Ok {
        metric: f64,
        races: u64,
        tickets: u64,
        hits: u64,
        roi: f64,
        skipped_races: usize,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoldResult {
    pub window: TrainWindow,
    #[serde(flatten)]
    pub status: FoldStatus,
}

impl FoldResult {
    fn skipped(window: TrainWindow, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::warn!("Fold {} skipped: {}", window, reason);
        Self {
            window,
            status: FoldStatus::Skipped { reason },
        }
    }

    pub fn metric(&self) -> Option<f64> {
        match self.status {
            FoldStatus::Ok { metric, .. } => Some(metric),
            FoldStatus::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, FoldStatus::Skipped { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Marginal,
    Unstable,
    InsufficientFolds,
}

impl Stability {
    pub fn name(&self) -> &'static str {
        match self {
            Stability::Stable => "stable",
            Stability::Marginal => "marginal",
            Stability::Unstable => "unstable",
            Stability::InsufficientFolds => "insufficient_folds",
        }
    }
}

/// Aggregate of the primary metric over completed folds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StabilitySummary {
    pub n_folds: usize,
    pub mean: f64,
    /// Sample standard deviation (n - 1)
    pub std: f64,
    pub cv: f64,
    /// mean - 2 * std
    pub lower_bound: f64,
    pub stability: Stability,
}

impl StabilitySummary {
    pub fn from_values(values: &[f64], thresholds: &StabilityThresholds) -> Self {
        let n = values.len();
        let mean = if n > 0 {
            values.iter().sum::<f64>() / n as f64
        } else {
            0.0
        };
        let std = if n > 1 {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        let cv = if mean > 0.0 { std / mean } else { UNDEFINED_CV };
        let lower_bound = mean - 2.0 * std;

        let meets = |level: &StabilityLevel| {
            cv < level.max_cv && mean > level.min_mean && lower_bound > level.min_lower_bound
        };
        let stability = if n < 2 {
            Stability::InsufficientFolds
        } else if meets(&thresholds.stable) {
            Stability::Stable
        } else if meets(&thresholds.marginal) {
            Stability::Marginal
        } else {
            Stability::Unstable
        };

        Self {
            n_folds: n,
            mean,
            std,
            cv,
            lower_bound,
            stability,
        }
    }
}

/// Result of one walk-forward run.
#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardReport {
    pub window_years: u32,
    pub mode: WindowMode,
    pub metric: PrimaryMetric,
    pub folds: Vec<FoldResult>,
    pub summary: StabilitySummary,
}

impl WalkForwardReport {
    pub fn ok_folds(&self) -> impl Iterator<Item = &FoldResult> {
        self.folds.iter().filter(|f| !f.is_skipped())
    }

    pub fn skipped_folds(&self) -> impl Iterator<Item = &FoldResult> {
        self.folds.iter().filter(|f| f.is_skipped())
    }
}

/// Repeats a backtest over successive training windows.
pub struct WalkForwardValidator {
    config: WalkForwardConfig,
    policy: BettingPolicy,
    backtest: BacktestConfig,
    windows: Vec<TrainWindow>,
}

impl WalkForwardValidator {
    /// Build every fold window up front; a leaking or empty window fails here,
    /// before any training or data processing.
    pub fn new(
        config: WalkForwardConfig,
        policy: BettingPolicy,
        backtest: BacktestConfig,
    ) -> Result<Self, PipelineError> {
        let Some(first_test) = config.test_years.iter().min().copied() else {
            return Err(PipelineError::InvalidWindow("no test years".to_string()));
        };
        let anchor_start = first_test - config.window_years as i32;

        let windows = config
            .test_years
            .iter()
            .map(|&year| {
                TrainWindow::for_test_year(year, config.window_years, config.mode, anchor_start)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            policy,
            backtest,
            windows,
        })
    }

    pub fn windows(&self) -> &[TrainWindow] {
        &self.windows
    }

    /// Run every fold. `races` must carry finish positions and payouts;
    /// scores are filled per fold by the trained predictor.
    pub fn run<T: Trainer + ?Sized>(&self, races: &[Race], trainer: &T) -> WalkForwardReport {
        tracing::info!(
            "Walk-forward: {} folds, {}-year {:?} windows",
            self.windows.len(),
            self.config.window_years,
            self.config.mode
        );

        let folds: Vec<FoldResult> = if self.config.parallel {
            self.windows
                .par_iter()
                .map(|w| self.run_fold(*w, races, trainer))
                .collect()
        } else {
            self.windows
                .iter()
                .map(|w| self.run_fold(*w, races, trainer))
                .collect()
        };

        let values: Vec<f64> = folds.iter().filter_map(|f| f.metric()).collect();
        let summary = StabilitySummary::from_values(&values, &self.config.thresholds);
        tracing::info!(
            "Walk-forward summary: mean {:.4}, std {:.4}, CV {:.3}, lower {:.4} ({})",
            summary.mean,
            summary.std,
            summary.cv,
            summary.lower_bound,
            summary.stability.name()
        );

        WalkForwardReport {
            window_years: self.config.window_years,
            mode: self.config.mode,
            metric: self.config.metric,
            folds,
            summary,
        }
    }

    fn run_fold<T: Trainer + ?Sized>(
        &self,
        window: TrainWindow,
        races: &[Race],
        trainer: &T,
    ) -> FoldResult {
        let predictor = match trainer.fit(&window) {
            Ok(Some(p)) => p,
            Ok(None) => return FoldResult::skipped(window, "no model for training window"),
            Err(e) => return FoldResult::skipped(window, format!("trainer failed: {:#}", e)),
        };

        let test_races: Vec<Race> = races
            .iter()
            .filter(|r| r.key.meeting_year == window.test_year)
            .cloned()
            .collect();
        if test_races.is_empty() {
            return FoldResult::skipped(window, "no races in test year");
        }

        let runner = BacktestRunner::new(self.policy.clone(), self.backtest.clone());
        let result = runner.run_with(&predictor, test_races);

        let metric = self.config.metric;
        let stats = result
            .get(metric.source, metric.bet_type)
            .cloned()
            .unwrap_or_default();
        if stats.tickets == 0 {
            return FoldResult::skipped(
                window,
                format!(
                    "no {} {} tickets in test year",
                    metric.source.name(),
                    metric.bet_type
                ),
            );
        }

        let value = match metric.kind {
            MetricKind::HitRate => stats.precision(),
            MetricKind::Roi => stats.roi() / 100.0,
        };
        tracing::info!(
            "Fold {}: {} tickets, metric {:.4}, ROI {:.2}%",
            window,
            stats.tickets,
            value,
            stats.roi()
        );

        FoldResult {
            window,
            status: FoldStatus::Ok {
                metric: value,
                races: result.races_total,
                tickets: stats.tickets,
                hits: stats.hits,
                roi: stats.roi(),
                skipped_races: result.skipped_races.len(),
            },
        }
    }
}

/// Walk-forward reports for several window lengths and the recommended one.
#[derive(Debug, Clone, Serialize)]
pub struct WindowComparison {
    pub reports: Vec<WalkForwardReport>,
    pub recommended: Option<u32>,
}

/// Run the validator once per candidate window length.
///
/// Recommends the stable window with the lowest CV, else the lowest CV among
/// windows with at least two completed folds.
pub fn compare_windows<T: Trainer + ?Sized>(
    config: &WalkForwardConfig,
    policy: &BettingPolicy,
    backtest: &BacktestConfig,
    races: &[Race],
    trainer: &T,
) -> Result<WindowComparison, PipelineError> {
    let validators = config
        .candidate_windows
        .iter()
        .map(|&years| {
            let config = WalkForwardConfig {
                window_years: years,
                ..config.clone()
            };
            WalkForwardValidator::new(config, policy.clone(), backtest.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;

    let reports: Vec<WalkForwardReport> = validators.iter().map(|v| v.run(races, trainer)).collect();

    let lowest_cv = |stable_only: bool| {
        reports
            .iter()
            .filter(|r| r.summary.stability != Stability::InsufficientFolds)
            .filter(|r| !stable_only || r.summary.stability == Stability::Stable)
            .min_by(|a, b| a.summary.cv.total_cmp(&b.summary.cv))
            .map(|r| r.window_years)
    };
    let recommended = lowest_cv(true).or_else(|| lowest_cv(false));
    if let Some(years) = recommended {
        tracing::info!("Recommended training window: {} years", years);
    }

    Ok(WindowComparison {
        reports,
        recommended,
    })
}

/// Print a walk-forward report in table format.
pub fn print_walk_forward_table(report: &WalkForwardReport) {
    println!(
        "=== Walk-Forward ({} years, {:?}) ===",
        report.window_years, report.mode
    );
    println!(
        "Metric: {:?} of {}/{}",
        report.metric.kind,
        report.metric.source.name(),
        report.metric.bet_type
    );
    println!();
    println!(
        "  {:>11} {:>6} {:>8} {:>8} {:>9}  {}",
        "Train", "Test", "Tickets", "Metric", "ROI", "Status"
    );
    println!("  {}", "-".repeat(60));
    for fold in &report.folds {
        match &fold.status {
            FoldStatus::Ok {
                metric,
                tickets,
                roi,
                ..
            } => println!(
                "  {:>11} {:>6} {:>8} {:>8.4} {:>8.1}%  ok",
                fold.window.label(),
                fold.window.test_year,
                tickets,
                metric,
                roi
            ),
            FoldStatus::Skipped { reason } => println!(
                "  {:>11} {:>6} {:>8} {:>8} {:>9}  skipped: {}",
                fold.window.label(),
                fold.window.test_year,
                "-",
                "-",
                "-",
                reason
            ),
        }
    }
    println!();

    let s = &report.summary;
    println!("Summary ({} folds):", s.n_folds);
    println!("  Mean:        {:.4}", s.mean);
    println!("  Std:         {:.4}", s.std);
    println!("  CV:          {:.3}", s.cv);
    println!("  Lower Bound: {:.4}", s.lower_bound);
    println!("  Stability:   {}", s.stability.name());
}

/// Print a window comparison.
pub fn print_window_comparison(comparison: &WindowComparison) {
    println!("=== Training Window Comparison ===");
    println!();
    println!(
        "  {:>7} {:>6} {:>8} {:>8} {:>7} {:>8}  {}",
        "Window", "Folds", "Mean", "Std", "CV", "Lower", "Stability"
    );
    println!("  {}", "-".repeat(64));
    for report in &comparison.reports {
        let s = &report.summary;
        println!(
            "  {:>6}y {:>6} {:>8.4} {:>8.4} {:>7.3} {:>8.4}  {}",
            report.window_years,
            s.n_folds,
            s.mean,
            s.std,
            s.cv,
            s.lower_bound,
            s.stability.name()
        );
    }
    println!();
    match comparison.recommended {
        Some(years) => println!("Recommended: {} years", years),
        None => println!("Recommended: none (fewer than two completed folds everywhere)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::model::LinearModel;
    use crate::ranking::RankingScorer;
    use crate::types::{BetType, Entrant, RaceKey};
    use chrono::NaiveDate;

    fn policy() -> BettingPolicy {
        BettingPolicy::new(PolicyConfig {
            predicted_rank_max: Some(1),
            bet_types: vec![BetType::Win],
            upset_threshold: None,
            min_score_separation: None,
            ..Default::default()
        })
        .unwrap()
    }

    fn config(window_years: u32) -> WalkForwardConfig {
        WalkForwardConfig {
            window_years,
            test_years: vec![2023, 2024, 2025],
            ..Default::default()
        }
    }

    /// Horse 1 always has the highest feature; it wins `wins` of 4 races.
    fn year_races(year: i32, wins: usize) -> Vec<Race> {
        (0..4)
            .map(|i| {
                let date = NaiveDate::from_ymd_opt(year, 5, 1 + i as u32).unwrap();
                let key = RaceKey::new("05", date, 1);
                let entrants = (1..=3u8)
                    .map(|h| {
                        let mut e = Entrant::new(h, h as u32);
                        e.win_odds = Some(2.0 + h as f64);
                        e.ranking_features = vec![1.0 / h as f64];
                        e.finish_position = Some(match (h, i < wins) {
                            (1, true) => 1,
                            (1, false) => 2,
                            (2, true) => 2,
                            (2, false) => 1,
                            _ => 3,
                        });
                        e
                    })
                    .collect();
                Race::new(key, entrants)
            })
            .collect()
    }

    fn predictor() -> Predictor {
        Predictor::new(
            RankingScorer::new(Box::new(LinearModel::new(vec![1.0], 0.0)), 1),
            None,
        )
    }

    #[test]
    fn test_rolling_windows() {
        let v = WalkForwardValidator::new(config(3), policy(), BacktestConfig::default()).unwrap();
        let windows: Vec<(i32, i32, i32)> = v
            .windows()
            .iter()
            .map(|w| (w.train_start, w.train_end, w.test_year))
            .collect();
        assert_eq!(
            windows,
            vec![(2020, 2022, 2023), (2021, 2023, 2024), (2022, 2024, 2025)]
        );
        assert!(v.windows().iter().all(|w| !w.contains(w.test_year)));
    }

    #[test]
    fn test_expanding_windows() {
        let cfg = WalkForwardConfig {
            mode: WindowMode::Expanding,
            ..config(3)
        };
        let v = WalkForwardValidator::new(cfg, policy(), BacktestConfig::default()).unwrap();
        let starts: Vec<i32> = v.windows().iter().map(|w| w.train_start).collect();
        assert_eq!(starts, vec![2020, 2020, 2020]);
        assert_eq!(v.windows()[2].train_end, 2024);
    }

    #[test]
    fn test_leakage_is_refused() {
        assert!(matches!(
            TrainWindow::new(2020, 2023, 2023),
            Err(PipelineError::LeakageViolation {
                train_end: 2023,
                test_year: 2023
            })
        ));
        assert!(TrainWindow::new(2023, 2020, 2024).is_err());
        assert!(WalkForwardValidator::new(config(0), policy(), BacktestConfig::default()).is_err());

        let empty = WalkForwardConfig {
            test_years: Vec::new(),
            ..config(3)
        };
        assert!(WalkForwardValidator::new(empty, policy(), BacktestConfig::default()).is_err());
    }

    #[test]
    fn test_failed_fold_is_excluded() {
        let mut races = year_races(2023, 2);
        races.extend(year_races(2024, 4));
        races.extend(year_races(2025, 3));

        let trainer = |w: &TrainWindow| -> anyhow::Result<Option<Predictor>> {
            if w.test_year == 2024 {
                anyhow::bail!("not enough data");
            }
            Ok(Some(predictor()))
        };

        let v = WalkForwardValidator::new(config(3), policy(), BacktestConfig::default()).unwrap();
        let report = v.run(&races, &trainer);

        assert_eq!(report.folds.len(), 3);
        assert_eq!(report.ok_folds().count(), 2);
        let skipped: Vec<&FoldResult> = report.skipped_folds().collect();
        assert_eq!(skipped[0].window.test_year, 2024);
        match &skipped[0].status {
            FoldStatus::Skipped { reason } => assert!(reason.contains("not enough data")),
            other => panic!("unexpected status {:?}", other),
        }

        assert_eq!(report.summary.n_folds, 2);
        assert!((report.summary.mean - 0.625).abs() < 1e-9);
        assert_eq!(report.folds[0].metric(), Some(0.5));
        assert_eq!(report.folds[2].metric(), Some(0.75));
    }

    #[test]
    fn test_missing_model_skips_fold() {
        let races = year_races(2023, 2);
        let trainer = |w: &TrainWindow| -> anyhow::Result<Option<Predictor>> {
            Ok((w.test_year == 2023).then(predictor))
        };
        let v = WalkForwardValidator::new(config(3), policy(), BacktestConfig::default()).unwrap();
        let report = v.run(&races, &trainer);

        assert_eq!(report.ok_folds().count(), 1);
        assert_eq!(report.summary.stability, Stability::InsufficientFolds);
    }

    #[test]
    fn test_parallel_folds_match_sequential() {
        let mut races = year_races(2023, 1);
        races.extend(year_races(2024, 2));
        races.extend(year_races(2025, 3));
        let trainer = |_: &TrainWindow| -> anyhow::Result<Option<Predictor>> { Ok(Some(predictor())) };

        let seq = WalkForwardValidator::new(config(3), policy(), BacktestConfig::default())
            .unwrap()
            .run(&races, &trainer);
        let par_cfg = WalkForwardConfig {
            parallel: true,
            ..config(3)
        };
        let par = WalkForwardValidator::new(par_cfg, policy(), BacktestConfig::default())
            .unwrap()
            .run(&races, &trainer);
        assert_eq!(seq.folds, par.folds);
    }

    #[test]
    fn test_stability_summary() {
        let t = StabilityThresholds::default();

        let s = StabilitySummary::from_values(&[0.30, 0.32, 0.31], &t);
        assert!((s.mean - 0.31).abs() < 1e-9);
        assert!((s.std - 0.01).abs() < 1e-9);
        assert_eq!(s.stability, Stability::Stable);

        let s = StabilitySummary::from_values(&[0.2, 0.3], &t);
        assert!((s.std - 0.070710678).abs() < 1e-6);
        assert_eq!(s.stability, Stability::Unstable);

        let s = StabilitySummary::from_values(&[0.12, 0.14, 0.13], &t);
        assert_eq!(s.stability, Stability::Marginal);

        let s = StabilitySummary::from_values(&[-0.1, 0.0], &t);
        assert_eq!(s.cv, UNDEFINED_CV);

        let s = StabilitySummary::from_values(&[0.4], &t);
        assert_eq!(s.stability, Stability::InsufficientFolds);
    }

    #[test]
    fn test_compare_windows_recommends_lowest_cv() {
        let mut races = year_races(2023, 2);
        races.extend(year_races(2024, 2));
        races.extend(year_races(2025, 2));

        // The 10-year window starts before 2015 for its first two folds.
        let trainer = |w: &TrainWindow| -> anyhow::Result<Option<Predictor>> {
            Ok((w.train_start >= 2015).then(predictor))
        };
        let cfg = WalkForwardConfig {
            candidate_windows: vec![5, 7, 10],
            ..config(5)
        };
        let cmp = compare_windows(&cfg, &policy(), &BacktestConfig::default(), &races, &trainer)
            .unwrap();

        assert_eq!(cmp.reports.len(), 3);
        assert_eq!(cmp.reports[2].summary.n_folds, 1);
        // 5 and 7 both have zero spread; the first wins the tie
        assert_eq!(cmp.recommended, Some(5));
    }
}
