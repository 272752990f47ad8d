//! Configuration for the backtest pipeline.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{BetType, TicketSource};

/// Data source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_features_path")]
    pub features_path: String,
    #[serde(default = "default_payouts_path")]
    pub payouts_path: String,
    /// Ranking model input columns, in model order
    #[serde(default = "default_ranking_features")]
    pub ranking_features: Vec<String>,
    /// Upset classifier input columns, used when the bundle does not declare its own
    #[serde(default = "default_upset_features")]
    pub upset_features: Vec<String>,
}

fn default_features_path() -> String {
    "data/features.parquet".to_string()
}

fn default_payouts_path() -> String {
    "data/payouts.csv".to_string()
}

fn default_ranking_features() -> Vec<String> {
    RANKING_FEATURES.iter().map(|s| s.to_string()).collect()
}

fn default_upset_features() -> Vec<String> {
    UPSET_FEATURES.iter().map(|s| s.to_string()).collect()
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            features_path: default_features_path(),
            payouts_path: default_payouts_path(),
            ranking_features: default_ranking_features(),
            upset_features: default_upset_features(),
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Ranking model for single-period backtests
    #[serde(default = "default_ranking_path")]
    pub ranking_path: String,
    /// Directory holding per-window models for walk-forward runs
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    /// Per-window ranking model stem: `{stem}_{start}-{end}.onnx`
    #[serde(default = "default_ranking_stem")]
    pub ranking_stem: String,
    /// Per-window upset bundle stem: `{stem}_{start}-{end}.json`
    #[serde(default = "default_upset_stem")]
    pub upset_stem: String,
    /// Upset bundle manifest for single-period backtests
    #[serde(default)]
    pub upset_bundle: Option<String>,
    /// Calibrator JSON applied when the bundle carries none
    #[serde(default)]
    pub calibration_file: Option<String>,
}

fn default_ranking_path() -> String {
    "data/models/ranker.onnx".to_string()
}

fn default_model_dir() -> String {
    "data/models".to_string()
}

fn default_ranking_stem() -> String {
    "ranker".to_string()
}

fn default_upset_stem() -> String {
    "upset_classifier".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            ranking_path: default_ranking_path(),
            model_dir: default_model_dir(),
            ranking_stem: default_ranking_stem(),
            upset_stem: default_upset_stem(),
            upset_bundle: None,
            calibration_file: None,
        }
    }
}

/// Long-shot population scored by the upset classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsetConfig {
    #[serde(default = "default_band_min")]
    pub popularity_min: u32,
    #[serde(default = "default_band_max")]
    pub popularity_max: u32,
}

fn default_band_min() -> u32 {
    7
}

fn default_band_max() -> u32 {
    12
}

impl Default for UpsetConfig {
    fn default() -> Self {
        Self {
            popularity_min: default_band_min(),
            popularity_max: default_band_max(),
        }
    }
}

/// Partial staking: each ticket is bought with `probability`.
/// A probability of 1.0 means every ticket is bought.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingConfig {
    #[serde(default = "default_stake_probability")]
    pub probability: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_stake_probability() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    42
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            probability: default_stake_probability(),
            seed: default_seed(),
        }
    }
}

impl StakingConfig {
    pub fn is_probabilistic(&self) -> bool {
        self.probability < 1.0
    }
}

/// Fractional Kelly sizing for WIN tickets.
///
/// Stakes are a share of a fixed reference bankroll, so a race's tickets do
/// not depend on the order races are processed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KellyConfig {
    /// Share of the full Kelly fraction (0.25 = quarter Kelly)
    #[serde(default = "default_kelly_fraction")]
    pub fraction: f64,
    /// Cap on the bankroll share staked per race
    #[serde(default = "default_max_bet_pct")]
    pub max_bet_pct: f64,
    #[serde(default = "default_kelly_bankroll")]
    pub bankroll: u64,
    #[serde(default = "default_min_stake")]
    pub min_stake: u64,
    #[serde(default = "default_max_stake")]
    pub max_stake: u64,
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_max_bet_pct() -> f64 {
    0.05
}

fn default_kelly_bankroll() -> u64 {
    1_000_000
}

fn default_min_stake() -> u64 {
    100
}

fn default_max_stake() -> u64 {
    50_000
}

impl Default for KellyConfig {
    fn default() -> Self {
        Self {
            fraction: default_kelly_fraction(),
            max_bet_pct: default_max_bet_pct(),
            bankroll: default_kelly_bankroll(),
            min_stake: default_min_stake(),
            max_stake: default_max_stake(),
        }
    }
}

/// How ticket stakes are sized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum StakeSizing {
    /// Every ticket stakes `stake`
    #[default]
    Fixed,
    /// WIN tickets sized by fractional Kelly; other bet types stay fixed
    Kelly(KellyConfig),
}

/// Betting policy rules. A rule set to `None` is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_predicted_rank_max")]
    pub predicted_rank_max: Option<u32>,
    #[serde(default)]
    pub popularity_rank_min: Option<u32>,
    #[serde(default = "default_popularity_rank_max")]
    pub popularity_rank_max: Option<u32>,
    #[serde(default = "default_odds_min")]
    pub odds_min: Option<f64>,
    #[serde(default = "default_odds_max")]
    pub odds_max: Option<f64>,
    #[serde(default = "default_min_score_separation")]
    pub min_score_separation: Option<f64>,
    #[serde(default = "default_upset_threshold")]
    pub upset_threshold: Option<f64>,
    /// Bet types built from the favorite set
    #[serde(default = "default_bet_types")]
    pub bet_types: Vec<BetType>,
    /// Bet types built from upset candidates
    #[serde(default = "default_upset_bet_types")]
    pub upset_bet_types: Vec<BetType>,
    /// Ranker anchors paired with each candidate (quinella, exacta, wide)
    #[serde(default = "default_pair_anchors")]
    pub pair_anchors: usize,
    /// Ranker anchors boxed with each candidate (trifecta box)
    #[serde(default = "default_trio_anchors")]
    pub trio_anchors: usize,
    /// Only keep upset candidates the ranker also rates within this rank
    #[serde(default)]
    pub candidate_predicted_rank_max: Option<u32>,
    #[serde(default = "default_stake")]
    pub stake: u64,
    #[serde(default)]
    pub sizing: StakeSizing,
    /// Drop WIN tickets whose expected value (win probability x odds) is below this
    #[serde(default)]
    pub min_expected_value: Option<f64>,
    #[serde(default)]
    pub staking: StakingConfig,
}

fn default_predicted_rank_max() -> Option<u32> {
    Some(3)
}

fn default_popularity_rank_max() -> Option<u32> {
    Some(3)
}

fn default_odds_min() -> Option<f64> {
    Some(1.5)
}

fn default_odds_max() -> Option<f64> {
    Some(20.0)
}

fn default_min_score_separation() -> Option<f64> {
    Some(0.05)
}

fn default_upset_threshold() -> Option<f64> {
    Some(0.15)
}

fn default_bet_types() -> Vec<BetType> {
    BetType::ALL.to_vec()
}

fn default_upset_bet_types() -> Vec<BetType> {
    vec![
        BetType::Place,
        BetType::Quinella,
        BetType::Wide,
        BetType::TrifectaBox,
    ]
}

fn default_pair_anchors() -> usize {
    1
}

fn default_trio_anchors() -> usize {
    2
}

fn default_stake() -> u64 {
    100
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            predicted_rank_max: default_predicted_rank_max(),
            popularity_rank_min: None,
            popularity_rank_max: default_popularity_rank_max(),
            odds_min: default_odds_min(),
            odds_max: default_odds_max(),
            min_score_separation: default_min_score_separation(),
            upset_threshold: default_upset_threshold(),
            bet_types: default_bet_types(),
            upset_bet_types: default_upset_bet_types(),
            pair_anchors: default_pair_anchors(),
            trio_anchors: default_trio_anchors(),
            candidate_predicted_rank_max: None,
            stake: default_stake(),
            sizing: StakeSizing::default(),
            min_expected_value: None,
            staking: StakingConfig::default(),
        }
    }
}

/// Backtest runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Condition buckets below this ticket count are not actionable
    #[serde(default = "default_min_bucket_tickets")]
    pub min_bucket_tickets: u64,
    #[serde(default = "default_initial_bankroll")]
    pub initial_bankroll: i64,
    #[serde(default)]
    pub parallel: bool,
}

fn default_min_bucket_tickets() -> u64 {
    5
}

fn default_initial_bankroll() -> i64 {
    100_000
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            min_bucket_tickets: default_min_bucket_tickets(),
            initial_bankroll: default_initial_bankroll(),
            parallel: false,
        }
    }
}

/// How training windows advance across folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Fixed-length window ending the year before the test year
    Rolling,
    /// Window starting at the first fold's start year and growing
    Expanding,
}

/// Per-fold metric used for stability analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    HitRate,
    Roi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryMetric {
    #[serde(default = "default_metric_kind")]
    pub kind: MetricKind,
    #[serde(default = "default_metric_bet_type")]
    pub bet_type: BetType,
    #[serde(default = "default_metric_source")]
    pub source: TicketSource,
}

fn default_metric_kind() -> MetricKind {
    MetricKind::HitRate
}

fn default_metric_bet_type() -> BetType {
    BetType::Win
}

fn default_metric_source() -> TicketSource {
    TicketSource::Ranker
}

impl Default for PrimaryMetric {
    fn default() -> Self {
        Self {
            kind: default_metric_kind(),
            bet_type: default_metric_bet_type(),
            source: default_metric_source(),
        }
    }
}

/// Stability thresholds. A level is met when CV is below `max_cv`, the mean
/// is above `min_mean` and the lower bound is above `min_lower_bound`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StabilityLevel {
    pub max_cv: f64,
    pub min_mean: f64,
    pub min_lower_bound: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StabilityThresholds {
    #[serde(default = "default_stable")]
    pub stable: StabilityLevel,
    #[serde(default = "default_marginal")]
    pub marginal: StabilityLevel,
}

fn default_stable() -> StabilityLevel {
    StabilityLevel {
        max_cv: 0.15,
        min_mean: 0.15,
        min_lower_bound: 0.10,
    }
}

fn default_marginal() -> StabilityLevel {
    StabilityLevel {
        max_cv: 0.25,
        min_mean: 0.10,
        min_lower_bound: 0.05,
    }
}

impl Default for StabilityThresholds {
    fn default() -> Self {
        Self {
            stable: default_stable(),
            marginal: default_marginal(),
        }
    }
}

/// Walk-forward validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    #[serde(default = "default_window_years")]
    pub window_years: u32,
    #[serde(default = "default_test_years")]
    pub test_years: Vec<i32>,
    #[serde(default = "default_window_mode")]
    pub mode: WindowMode,
    #[serde(default)]
    pub metric: PrimaryMetric,
    #[serde(default)]
    pub thresholds: StabilityThresholds,
    /// Window lengths tried by `compare-windows`
    #[serde(default = "default_candidate_windows")]
    pub candidate_windows: Vec<u32>,
    #[serde(default)]
    pub parallel: bool,
}

fn default_window_years() -> u32 {
    5
}

fn default_test_years() -> Vec<i32> {
    vec![2023, 2024, 2025]
}

fn default_window_mode() -> WindowMode {
    WindowMode::Rolling
}

fn default_candidate_windows() -> Vec<u32> {
    vec![5, 7, 10]
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            window_years: default_window_years(),
            test_years: default_test_years(),
            mode: default_window_mode(),
            metric: PrimaryMetric::default(),
            thresholds: StabilityThresholds::default(),
            candidate_windows: default_candidate_windows(),
            parallel: false,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub upset: UpsetConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub walk_forward: WalkForwardConfig,
}

impl AppConfig {
    /// Load configuration from defaults, `config.*` and the environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, reading `path` instead of `config.*` when given.
    ///
    /// Environment variables use a double underscore between levels,
    /// e.g. `KEIBA_POLICY__ODDS_MAX=30`.
    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("config").required(false),
        };

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("KEIBA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Default ranking model inputs
pub const RANKING_FEATURES: [&str; 23] = [
    "horse_age_num",
    "horse_sex_encoded",
    "post_position_num",
    "weight_carried",
    "horse_weight",
    "jockey_win_rate",
    "jockey_place_rate",
    "trainer_win_rate",
    "jockey_races",
    "trainer_races",
    "distance_num",
    "is_turf",
    "is_dirt",
    "track_condition_num",
    "avg_position_last_3",
    "avg_position_last_5",
    "win_rate_last_3",
    "win_rate_last_5",
    "place_rate_last_3",
    "place_rate_last_5",
    "last_position",
    "career_races",
    "odds_log",
];

/// Default upset classifier inputs
pub const UPSET_FEATURES: [&str; 12] = [
    "popularity_rank",
    "odds_log",
    "jockey_win_rate",
    "jockey_place_rate",
    "trainer_win_rate",
    "place_rate_last_3",
    "place_rate_last_5",
    "avg_position_last_5",
    "last_position",
    "career_races",
    "days_since_last_race",
    "class_change_score",
];
