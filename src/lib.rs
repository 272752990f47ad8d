//! Keiba backtest - ranking and upset betting strategies on historical races
//!
//! This library provides:
//! - Within-race ranking from a pluggable ranking model (ONNX or linear)
//! - Long-shot upset probabilities from a calibrated model ensemble
//! - A rule-based betting policy over six bet types
//! - Settlement against official payouts and aggregate backtests
//! - Walk-forward validation with stability classification
//!
//! # Example
//!
//! ```no_run
//! use keiba_backtest::data::load_races;
//! use keiba_backtest::{
//!     BacktestConfig, BacktestRunner, BettingPolicy, LinearModel, PolicyConfig, Predictor,
//!     RankingScorer,
//! };
//! use std::path::Path;
//!
//! let features = vec!["speed_index".to_string()];
//! let races = load_races(Path::new("races.parquet"), &features, &[]).unwrap();
//!
//! let scorer = RankingScorer::new(Box::new(LinearModel::new(vec![1.0], 0.0)), 1);
//! let predictor = Predictor::new(scorer, None);
//! let policy = BettingPolicy::new(PolicyConfig::default()).unwrap();
//!
//! let result = BacktestRunner::new(policy, BacktestConfig::default()).run_with(&predictor, races);
//! println!("ROI: {:.1}%", result.totals().roi());
//! ```

pub mod backtest;
pub mod betting;
pub mod calibration;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod ranking;
pub mod settlement;
pub mod types;
pub mod upset;
pub mod walkforward;

// Re-export commonly used types
pub use backtest::{BacktestResult, BacktestRunner, BucketStats, StrategyKey};
pub use betting::{BettingPolicy, RaceDecision, RaceSkip, SkipReason};
pub use calibration::Calibrator;
pub use config::{AppConfig, BacktestConfig, PolicyConfig, WalkForwardConfig};
pub use error::PipelineError;
pub use model::{LinearModel, ModelBundle, OnnxModel, ProbabilityModel, RankingModel};
pub use pipeline::{Predictor, SkippedRace};
pub use ranking::RankingScorer;
pub use settlement::settle;
pub use types::{BetTicket, BetType, Entrant, Race, RaceKey, SettledTicket, TicketSource};
pub use upset::UpsetClassifier;
pub use walkforward::{
    compare_windows, StabilitySummary, TrainWindow, Trainer, WalkForwardReport,
    WalkForwardValidator,
};
