//! CLI commands for keiba-backtest.
//!
//! Supports single-period backtests, walk-forward validation over per-window
//! model files, and training window comparison.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::backtest::{
    conditions, print_backtest_table, print_threshold_sweep, sweep_upset_thresholds, BacktestRunner,
};
use crate::betting::BettingPolicy;
use crate::calibration::Calibrator;
use crate::config::{AppConfig, DataConfig, WindowMode};
use crate::data::load_dataset;
use crate::model::{load_ranking_model, ModelBundle};
use crate::pipeline::Predictor;
use crate::ranking::RankingScorer;
use crate::types::BetType;
use crate::upset::{PopularityBand, UpsetClassifier};
use crate::walkforward::{
    compare_windows, print_walk_forward_table, print_window_comparison, TrainWindow, Trainer,
    WalkForwardValidator,
};

#[derive(Parser)]
#[command(name = "keiba-backtest")]
#[command(version, about = "Keiba backtest: ranking and upset betting strategies on historical races", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./config.{toml,yaml,json} when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Inputs shared by every command.
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Entrant feature table (parquet or CSV)
    #[arg(long)]
    pub features: Option<PathBuf>,

    /// Payout table (CSV or parquet)
    #[arg(long)]
    pub payouts: Option<PathBuf>,

    /// Process races and folds on the rayon thread pool
    #[arg(long)]
    pub parallel: bool,

    /// Output format (json, table)
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Backtest one ranking model (and optional upset bundle) over all races
    Backtest {
        #[command(flatten)]
        input: InputArgs,

        /// Ranking model path override (.onnx or linear .json)
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Upset classifier bundle manifest
        #[arg(short, long)]
        upset_bundle: Option<PathBuf>,

        /// Calibrator JSON for upset probabilities
        #[arg(long)]
        calibration: Option<PathBuf>,

        /// Ranker bet types (win, place, quinella, exacta, wide, trifecta_box)
        #[arg(short, long, value_delimiter = ',')]
        bet_types: Vec<String>,

        /// Upset probability threshold
        #[arg(long)]
        upset_threshold: Option<f64>,

        /// Per-condition breakdown (none, track-surface, market)
        #[arg(long, default_value = "none")]
        condition: String,

        /// Report upset results for each of these thresholds instead
        #[arg(long, value_delimiter = ',')]
        sweep_thresholds: Vec<f64>,
    },

    /// Walk-forward validation with per-window models from the model directory
    WalkForward {
        #[command(flatten)]
        input: InputArgs,

        /// Directory with `{stem}_{start}-{end}.onnx` models
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Training window length in years
        #[arg(short, long)]
        window_years: Option<u32>,

        /// Test years
        #[arg(short, long, value_delimiter = ',')]
        test_years: Vec<i32>,

        /// Window mode (rolling, expanding)
        #[arg(long)]
        mode: Option<String>,
    },

    /// Compare walk-forward stability across training window lengths
    CompareWindows {
        #[command(flatten)]
        input: InputArgs,

        /// Directory with `{stem}_{start}-{end}.onnx` models
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Window lengths to compare
        #[arg(short, long, value_delimiter = ',')]
        windows: Vec<u32>,

        /// Test years
        #[arg(short, long, value_delimiter = ',')]
        test_years: Vec<i32>,
    },
}

/// Run a command.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = AppConfig::load_from(cli.config.as_deref())?;

    match cli.command {
        Commands::Backtest {
            input,
            model,
            upset_bundle,
            calibration,
            bet_types,
            upset_threshold,
            condition,
            sweep_thresholds,
        } => {
            apply_input(&mut config, &input);
            if let Some(path) = model {
                config.model.ranking_path = path.to_string_lossy().to_string();
            }
            if let Some(path) = upset_bundle {
                config.model.upset_bundle = Some(path.to_string_lossy().to_string());
            }
            if let Some(path) = calibration {
                config.model.calibration_file = Some(path.to_string_lossy().to_string());
            }
            if !bet_types.is_empty() {
                config.policy.bet_types = parse_bet_types(&bet_types)?;
            }
            if let Some(t) = upset_threshold {
                config.policy.upset_threshold = Some(t);
            }
            if sweep_thresholds.is_empty() {
                run_backtest(&config, &condition, &input.format)
            } else {
                run_threshold_sweep(&config, &sweep_thresholds, &input.format)
            }
        }
        Commands::WalkForward {
            input,
            model_dir,
            window_years,
            test_years,
            mode,
        } => {
            apply_input(&mut config, &input);
            if let Some(dir) = model_dir {
                config.model.model_dir = dir.to_string_lossy().to_string();
            }
            if let Some(years) = window_years {
                config.walk_forward.window_years = years;
            }
            if !test_years.is_empty() {
                config.walk_forward.test_years = test_years;
            }
            if let Some(mode) = mode {
                config.walk_forward.mode = parse_mode(&mode)?;
            }
            run_walk_forward(&config, &input.format)
        }
        Commands::CompareWindows {
            input,
            model_dir,
            windows,
            test_years,
        } => {
            apply_input(&mut config, &input);
            if let Some(dir) = model_dir {
                config.model.model_dir = dir.to_string_lossy().to_string();
            }
            if !windows.is_empty() {
                config.walk_forward.candidate_windows = windows;
            }
            if !test_years.is_empty() {
                config.walk_forward.test_years = test_years;
            }
            run_compare_windows(&config, &input.format)
        }
    }
}

fn apply_input(config: &mut AppConfig, input: &InputArgs) {
    if let Some(path) = &input.features {
        config.data.features_path = path.to_string_lossy().to_string();
    }
    if let Some(path) = &input.payouts {
        config.data.payouts_path = path.to_string_lossy().to_string();
    }
    if input.parallel {
        config.backtest.parallel = true;
        config.walk_forward.parallel = true;
    }
}

fn parse_bet_types(names: &[String]) -> anyhow::Result<Vec<BetType>> {
    names
        .iter()
        .map(|s| BetType::from_str(s).with_context(|| format!("Unknown bet type: {}", s)))
        .collect()
}

fn parse_mode(s: &str) -> anyhow::Result<WindowMode> {
    match s.to_lowercase().as_str() {
        "rolling" => Ok(WindowMode::Rolling),
        "expanding" => Ok(WindowMode::Expanding),
        other => anyhow::bail!("Unknown window mode: {}", other),
    }
}

/// Calibrator configured by file, used when a bundle carries none.
fn fallback_calibrator(config: &AppConfig) -> anyhow::Result<Calibrator> {
    match &config.model.calibration_file {
        Some(path) => {
            let calibrator = Calibrator::from_file(path)?;
            tracing::info!("Calibrator loaded: {:?}", calibrator);
            Ok(calibrator)
        }
        None => Ok(Calibrator::None),
    }
}

/// Load a bundle and bind it to the upset columns the data was loaded with.
fn load_upset(
    path: &Path,
    loaded_columns: &[String],
    band: PopularityBand,
    fallback: &Calibrator,
) -> anyhow::Result<UpsetClassifier> {
    let classifier = UpsetClassifier::from_bundle_file(path, loaded_columns, band)?
        .with_input_columns(loaded_columns);
    if classifier.calibrator().is_enabled() {
        Ok(classifier)
    } else {
        Ok(classifier.with_calibrator(fallback.clone()))
    }
}

/// Ranking model and optional upset bundle for a single-period run.
///
/// Returns the config with the upset columns the bundle declares, so races
/// are loaded with them.
fn single_period_predictor(config: &AppConfig) -> anyhow::Result<(AppConfig, Predictor)> {
    let mut config = config.clone();

    // A bundle that declares its columns decides which upset features are loaded.
    let bundle = match &config.model.upset_bundle {
        Some(path) => Some((PathBuf::from(path), ModelBundle::from_file(path)?)),
        None => None,
    };
    if let Some(cols) = bundle.as_ref().and_then(|(_, b)| b.feature_cols()) {
        config.data.upset_features = cols.to_vec();
    }

    tracing::info!("Loading ranking model from: {}", config.model.ranking_path);
    let ranker = load_ranking_model(&config.model.ranking_path)?;
    let scorer = RankingScorer::new(ranker, config.data.ranking_features.len());

    let upset = match &bundle {
        Some((path, _)) => {
            tracing::info!("Loading upset bundle from: {}", path.display());
            let classifier = load_upset(
                path,
                &config.data.upset_features,
                PopularityBand::from(&config.upset),
                &fallback_calibrator(&config)?,
            )?;
            tracing::info!("Upset ensemble of {} models", classifier.n_models());
            Some(classifier)
        }
        None => None,
    };

    Ok((config, Predictor::new(scorer, upset)))
}

/// Run a single-period backtest.
pub fn run_backtest(config: &AppConfig, condition: &str, format: &str) -> anyhow::Result<()> {
    let policy = BettingPolicy::new(config.policy.clone())?;
    let (config, predictor) = single_period_predictor(config)?;
    let races = load_dataset(&config.data)?;

    let runner = BacktestRunner::new(policy, config.backtest.clone());
    let runner = match condition {
        "none" => runner,
        "track-surface" => runner.with_condition(conditions::track_surface),
        "market" => runner.with_condition(conditions::market_bands),
        other => anyhow::bail!("Unknown condition: {}", other),
    };
    let result = runner.run_with(&predictor, races);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result.to_json())?),
        _ => print_backtest_table(&result),
    }
    Ok(())
}

/// Predict once, then backtest the upset strategy at each threshold.
pub fn run_threshold_sweep(config: &AppConfig, thresholds: &[f64], format: &str) -> anyhow::Result<()> {
    BettingPolicy::new(config.policy.clone())?;
    let (config, predictor) = single_period_predictor(config)?;
    if predictor.upset.is_none() {
        anyhow::bail!("Threshold sweep needs an upset bundle (--upset-bundle)");
    }
    let races = load_dataset(&config.data)?;
    let (prepared, skipped) = predictor.prepare(races, config.backtest.parallel);
    tracing::info!("{} races predicted, {} skipped", prepared.len(), skipped.len());

    let points = sweep_upset_thresholds(&config.policy, &config.backtest, &prepared, thresholds)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&points)?),
        _ => print_threshold_sweep(&points),
    }
    Ok(())
}

/// Run walk-forward validation.
pub fn run_walk_forward(config: &AppConfig, format: &str) -> anyhow::Result<()> {
    let policy = BettingPolicy::new(config.policy.clone())?;
    let validator = WalkForwardValidator::new(
        config.walk_forward.clone(),
        policy,
        config.backtest.clone(),
    )?;
    let trainer = ModelDirTrainer::from_config(config)?;
    let races = load_dataset(&trainer.data_config(&config.data))?;

    let report = validator.run(&races, &trainer);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_walk_forward_table(&report),
    }
    Ok(())
}

/// Run the training window comparison.
pub fn run_compare_windows(config: &AppConfig, format: &str) -> anyhow::Result<()> {
    let policy = BettingPolicy::new(config.policy.clone())?;
    let trainer = ModelDirTrainer::from_config(config)?;
    let races = load_dataset(&trainer.data_config(&config.data))?;

    let comparison = compare_windows(
        &config.walk_forward,
        &policy,
        &config.backtest,
        &races,
        &trainer,
    )?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&comparison)?),
        _ => print_window_comparison(&comparison),
    }
    Ok(())
}

/// Trainer backed by models already fitted offline, one file per window:
/// `{ranking_stem}_{start}-{end}.onnx` (or `.json` for a linear model) and an
/// optional `{upset_stem}_{start}-{end}.json` bundle.
///
/// Window bundles may declare different feature columns. Races are loaded
/// with the union of the configured columns and every bundle's columns, and
/// each classifier picks its own by name.
pub struct ModelDirTrainer {
    dir: PathBuf,
    ranking_stem: String,
    upset_stem: String,
    ranking_features: usize,
    upset_columns: Vec<String>,
    band: PopularityBand,
    calibrator: Calibrator,
}

impl ModelDirTrainer {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let mut trainer = Self {
            dir: PathBuf::from(&config.model.model_dir),
            ranking_stem: config.model.ranking_stem.clone(),
            upset_stem: config.model.upset_stem.clone(),
            ranking_features: config.data.ranking_features.len(),
            upset_columns: config.data.upset_features.clone(),
            band: PopularityBand::from(&config.upset),
            calibrator: fallback_calibrator(config)?,
        };
        trainer.add_bundle_columns()?;
        Ok(trainer)
    }

    /// Upset columns races must be loaded with.
    pub fn upset_columns(&self) -> &[String] {
        &self.upset_columns
    }

    /// `data` with the upset columns replaced by [`Self::upset_columns`].
    pub fn data_config(&self, data: &DataConfig) -> DataConfig {
        DataConfig {
            upset_features: self.upset_columns.clone(),
            ..data.clone()
        }
    }

    fn add_bundle_columns(&mut self) -> anyhow::Result<()> {
        if !self.dir.is_dir() {
            return Ok(());
        }
        let prefix = format!("{}_", self.upset_stem);
        let mut manifests: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list model directory {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().is_some_and(|e| e == "json")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();
        manifests.sort();

        for path in manifests {
            let bundle = match ModelBundle::from_file(&path) {
                Ok(bundle) => bundle,
                Err(e) => {
                    tracing::debug!("Not an upset bundle, ignored: {:#}", e);
                    continue;
                }
            };
            for col in bundle.feature_cols().unwrap_or_default() {
                if !self.upset_columns.contains(col) {
                    tracing::debug!("Upset column {} added from {}", col, path.display());
                    self.upset_columns.push(col.clone());
                }
            }
        }
        Ok(())
    }

    fn ranking_path(&self, window: &TrainWindow) -> Option<PathBuf> {
        ["onnx", "json"]
            .iter()
            .map(|ext| {
                self.dir
                    .join(format!("{}_{}.{}", self.ranking_stem, window.label(), ext))
            })
            .find(|p| p.exists())
    }
}

impl Trainer for ModelDirTrainer {
    fn fit(&self, window: &TrainWindow) -> anyhow::Result<Option<Predictor>> {
        let Some(ranking_path) = self.ranking_path(window) else {
            tracing::debug!("No ranking model for {} in {}", window, self.dir.display());
            return Ok(None);
        };
        let ranker = load_ranking_model(&ranking_path)?;

        let upset_path = self
            .dir
            .join(format!("{}_{}.json", self.upset_stem, window.label()));
        let upset = if upset_path.exists() {
            Some(load_upset(
                &upset_path,
                &self.upset_columns,
                self.band,
                &self.calibrator,
            )?)
        } else {
            None
        };

        Ok(Some(Predictor::new(
            RankingScorer::new(ranker, self.ranking_features),
            upset,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricKind, PolicyConfig, PrimaryMetric, UpsetConfig, WalkForwardConfig};
    use crate::model::LinearModel;
    use crate::types::{Entrant, PayoutTable, Race, RaceKey, TicketSource};
    use crate::walkforward::FoldStatus;
    use chrono::NaiveDate;

    fn trainer(dir: &Path) -> ModelDirTrainer {
        ModelDirTrainer {
            dir: dir.to_path_buf(),
            ranking_stem: "ranker".to_string(),
            upset_stem: "upset_classifier".to_string(),
            ranking_features: 1,
            upset_columns: vec!["win_rate".to_string()],
            band: PopularityBand::from(&UpsetConfig::default()),
            calibrator: Calibrator::None,
        }
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) {
        std::fs::write(path, serde_json::to_string(value).unwrap()).unwrap();
    }

    #[test]
    fn test_model_dir_trainer() {
        let dir = tempfile::tempdir().unwrap();
        write_json(
            &dir.path().join("ranker_2020-2022.json"),
            &LinearModel::new(vec![1.0], 0.0),
        );
        write_json(
            &dir.path().join("upset_2020-2022.json"),
            &LinearModel::new(vec![0.5], -1.0),
        );
        write_json(
            &dir.path().join("upset_classifier_2020-2022.json"),
            &vec!["upset_2020-2022.json"],
        );
        let trainer = trainer(dir.path());

        let window = TrainWindow::new(2020, 2022, 2023).unwrap();
        let predictor = trainer.fit(&window).unwrap().unwrap();
        assert!(predictor.upset.is_some());
        assert_eq!(predictor.scorer.n_features(), 1);

        // no file for this window
        let window = TrainWindow::new(2021, 2023, 2024).unwrap();
        assert!(trainer.fit(&window).unwrap().is_none());
    }

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    /// Horse 8 (8th favorite) has upset values a=0, b=1 and always finishes 2nd.
    fn race(year: i32, index: u32) -> Race {
        let key = RaceKey::new("09", NaiveDate::from_ymd_opt(year, 4, 1 + index).unwrap(), 11);
        let entrants = (1..=8u8)
            .map(|h| {
                let mut e = Entrant::new(h, h as u32);
                e.win_odds = Some(2.0 + h as f64);
                e.ranking_features = vec![10.0 - h as f64];
                e.upset_features = if h == 8 {
                    vec![Some(0.0), Some(1.0)]
                } else {
                    vec![Some(1.0), Some(0.0)]
                };
                e.finish_position = Some(match h {
                    1 => 1,
                    8 => 2,
                    _ => h as u32 + 1,
                });
                e
            })
            .collect();
        let mut race = Race::new(key, entrants);
        let mut payouts = PayoutTable::default();
        payouts.insert(BetType::Place, &[1], 1.1);
        payouts.insert(BetType::Place, &[8], 4.5);
        payouts.insert(BetType::Place, &[2], 1.3);
        race.payouts = payouts;
        race
    }

    /// Ranker and upset bundle per window; each bundle declares its own columns.
    fn write_window_models(dir: &Path, label: &str, feature_cols: &[&str], weights: Vec<f64>) {
        write_json(
            &dir.join(format!("ranker_{}.json", label)),
            &LinearModel::new(vec![1.0], 0.0),
        );
        let sub_model = format!("upset_lgbm_{}.json", label);
        write_json(&dir.join(&sub_model), &LinearModel::new(weights, -2.0));
        write_json(
            &dir.join(format!("upset_classifier_{}.json", label)),
            &serde_json::json!({ "models": [sub_model], "feature_cols": feature_cols }),
        );
    }

    fn app_config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.model.model_dir = dir.to_string_lossy().to_string();
        config.model.calibration_file = None;
        config.data.ranking_features = vec!["score".to_string()];
        config.data.upset_features = vec!["a".to_string()];
        config
    }

    #[test]
    fn test_bundle_reads_its_own_columns() {
        let dir = tempfile::tempdir().unwrap();
        write_window_models(dir.path(), "2022-2022", &["b"], vec![4.0]);

        let mut trainer = trainer(dir.path());
        trainer.upset_columns = vec!["a".to_string(), "b".to_string()];
        let window = TrainWindow::new(2022, 2022, 2023).unwrap();
        let predictor = trainer.fit(&window).unwrap().unwrap();
        assert_eq!(predictor.upset.as_ref().unwrap().feature_names(), vec!["b"]);

        let mut r = race(2023, 0);
        predictor.predict_race(&mut r).unwrap();
        assert_eq!(r.entrant(1).unwrap().predicted_rank, Some(1));
        let p8 = r.entrant(8).unwrap().upset_probability.unwrap();
        let p7 = r.entrant(7).unwrap().upset_probability.unwrap();
        assert!((p8 - sigmoid(2.0)).abs() < 1e-12);
        assert!((p7 - sigmoid(-2.0)).abs() < 1e-12);
        assert_eq!(r.entrant(6).unwrap().upset_probability, None);
    }

    #[test]
    fn test_data_loaded_with_union_of_bundle_columns() {
        let dir = tempfile::tempdir().unwrap();
        write_window_models(dir.path(), "2022-2022", &["b"], vec![4.0]);
        write_window_models(dir.path(), "2023-2023", &["b", "a"], vec![4.0, 0.0]);

        let config = app_config(dir.path());
        let trainer = ModelDirTrainer::from_config(&config).unwrap();
        assert_eq!(trainer.upset_columns(), ["a".to_string(), "b".to_string()]);
        assert_eq!(trainer.data_config(&config.data).upset_features, trainer.upset_columns());
    }

    #[test]
    fn test_walk_forward_with_window_bundles() {
        let dir = tempfile::tempdir().unwrap();
        write_window_models(dir.path(), "2022-2022", &["b"], vec![4.0]);
        write_window_models(dir.path(), "2023-2023", &["b", "a"], vec![4.0, 0.0]);
        let trainer = ModelDirTrainer::from_config(&app_config(dir.path())).unwrap();

        let policy = BettingPolicy::new(PolicyConfig {
            predicted_rank_max: Some(1),
            bet_types: vec![BetType::Win],
            upset_threshold: Some(0.3),
            upset_bet_types: vec![BetType::Place],
            ..Default::default()
        })
        .unwrap();
        let config = WalkForwardConfig {
            window_years: 1,
            test_years: vec![2023, 2024],
            metric: PrimaryMetric {
                kind: MetricKind::HitRate,
                bet_type: BetType::Place,
                source: TicketSource::Upset,
            },
            ..Default::default()
        };
        let validator =
            WalkForwardValidator::new(config, policy, Default::default()).unwrap();

        let races: Vec<Race> = [2023, 2024]
            .iter()
            .flat_map(|&y| (0..3).map(move |i| race(y, i)))
            .collect();
        let report = validator.run(&races, &trainer);

        assert_eq!(report.ok_folds().count(), 2);
        for fold in &report.folds {
            match &fold.status {
                FoldStatus::Ok { tickets, hits, skipped_races, .. } => {
                    assert_eq!((*tickets, *hits, *skipped_races), (3, 3, 0));
                }
                FoldStatus::Skipped { reason } => panic!("fold skipped: {}", reason),
            }
        }
        assert!((report.summary.mean - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_backtest_sweep_flag() {
        let cli = Cli::try_parse_from([
            "keiba-backtest",
            "backtest",
            "--upset-bundle",
            "bundle.json",
            "--sweep-thresholds",
            "0.1,0.15,0.2",
        ])
        .unwrap();
        match cli.command {
            Commands::Backtest { sweep_thresholds, upset_bundle, .. } => {
                assert_eq!(sweep_thresholds, vec![0.1, 0.15, 0.2]);
                assert_eq!(upset_bundle, Some(PathBuf::from("bundle.json")));
            }
            _ => panic!("expected backtest"),
        }
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(
            parse_bet_types(&["win".to_string(), "umaren".to_string()]).unwrap(),
            vec![BetType::Win, BetType::Quinella]
        );
        assert!(parse_bet_types(&["sanrentan".to_string()]).is_err());
        assert_eq!(parse_mode("Expanding").unwrap(), WindowMode::Expanding);
        assert!(parse_mode("monthly").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "keiba-backtest",
            "walk-forward",
            "--window-years",
            "3",
            "--test-years",
            "2023,2024,2025",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::WalkForward {
                window_years,
                test_years,
                input,
                ..
            } => {
                assert_eq!(window_years, Some(3));
                assert_eq!(test_years, vec![2023, 2024, 2025]);
                assert_eq!(input.format, "json");
            }
            _ => panic!("expected walk-forward"),
        }
    }
}
