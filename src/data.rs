//! Loaders for the entrant feature table and the long-format payout table.

use anyhow::{bail, Context};
use chrono::NaiveDate;
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::config::DataConfig;
use crate::types::{BetType, Entrant, HorseNumber, PayoutTable, Race, RaceKey};

/// (track code, meeting date, race number)
pub type PayoutKey = (String, NaiveDate, u8);

/// Read a parquet or CSV file into a DataFrame, by extension.
pub fn read_table(path: &Path) -> anyhow::Result<DataFrame> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let df = match ext.as_str() {
        "parquet" => LazyFrame::scan_parquet(path, Default::default())
            .and_then(|lf| lf.collect())
            .with_context(|| format!("Failed to read parquet: {}", path.display()))?,
        "csv" => CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))
            .and_then(|reader| reader.finish())
            .with_context(|| format!("Failed to read CSV: {}", path.display()))?,
        other => bail!("Unsupported table format '{}': {}", other, path.display()),
    };
    Ok(df)
}

/// Load races and attach payouts as configured.
pub fn load_dataset(config: &DataConfig) -> anyhow::Result<Vec<Race>> {
    let mut races = load_races(
        Path::new(&config.features_path),
        &config.ranking_features,
        &config.upset_features,
    )?;
    let payouts = load_payouts(Path::new(&config.payouts_path))?;
    attach_payouts(&mut races, payouts);
    Ok(races)
}

/// Load the entrant table and group rows into races ordered by race key.
pub fn load_races(
    path: &Path,
    ranking_features: &[String],
    upset_features: &[String],
) -> anyhow::Result<Vec<Race>> {
    let df = read_table(path)?;
    let races = races_from_frame(&df, ranking_features, upset_features)
        .with_context(|| format!("Invalid entrant table: {}", path.display()))?;
    tracing::info!(
        "Loaded {} races ({} entrants) from {}",
        races.len(),
        df.height(),
        path.display()
    );
    Ok(races)
}

/// Build races from an entrant DataFrame.
///
/// Missing ranking feature values become NaN, so the scorer skips that race.
/// Missing upset feature columns or values are left for the classifier's
/// neutral defaults. Rows without a popularity rank (scratched entries) are dropped.
pub fn races_from_frame(
    df: &DataFrame,
    ranking_features: &[String],
    upset_features: &[String],
) -> anyhow::Result<Vec<Race>> {
    let n = df.height();
    let tracks = string_values(df, "track_code")?;
    let dates = string_values(df, "meeting_date")?;
    let years = optional(df, "meeting_year", i64_values)?;
    let race_numbers = i64_values(df, "race_number")?;
    let horses = i64_values(df, "horse_number")?;
    let popularity = i64_values(df, "popularity_rank")?;
    let odds = f64_values(df, "win_odds")?;
    let finishes = i64_values(df, "finish_position")?;
    let surfaces = optional(df, "surface", string_values)?;

    let ranking = ranking_features
        .iter()
        .map(|name| f64_values(df, name))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut upset = Vec::with_capacity(upset_features.len());
    for name in upset_features {
        match optional(df, name, f64_values)? {
            Some(values) => upset.push(values),
            None => {
                tracing::debug!("Upset feature '{}' not in table; using neutral default", name);
                upset.push(vec![None; n]);
            }
        }
    }

    let mut races: BTreeMap<RaceKey, Race> = BTreeMap::new();
    let mut scratched = 0usize;

    for i in 0..n {
        let row = i + 1;
        let track = tracks[i]
            .as_deref()
            .map(normalize_track_code)
            .with_context(|| format!("row {}: missing track_code", row))?;
        let date = dates[i]
            .as_deref()
            .and_then(parse_date)
            .with_context(|| format!("row {}: invalid meeting_date {:?}", row, dates[i]))?;
        let race_number = race_numbers[i]
            .and_then(|v| u8::try_from(v).ok())
            .with_context(|| format!("row {}: invalid race_number", row))?;
        let horse = horses[i]
            .and_then(|v| HorseNumber::try_from(v).ok())
            .filter(|h| *h > 0)
            .with_context(|| format!("row {}: invalid horse_number", row))?;
        let Some(pop) = popularity[i]
            .and_then(|v| u32::try_from(v).ok())
            .filter(|p| *p > 0)
        else {
            scratched += 1;
            continue;
        };

        let mut key = RaceKey::new(track, date, race_number);
        if let Some(year) = years
            .as_ref()
            .and_then(|y| y[i])
            .and_then(|y| i32::try_from(y).ok())
        {
            key.meeting_year = year;
        }

        let mut entrant = Entrant::new(horse, pop);
        entrant.win_odds = odds[i].filter(|o| o.is_finite() && *o > 0.0);
        entrant.finish_position = finishes[i]
            .and_then(|p| u32::try_from(p).ok())
            .filter(|p| *p > 0);
        entrant.ranking_features = ranking.iter().map(|c| c[i].unwrap_or(f64::NAN)).collect();
        entrant.upset_features = upset
            .iter()
            .map(|c| c[i].filter(|v| v.is_finite()))
            .collect();

        let race = races
            .entry(key.clone())
            .or_insert_with(|| Race::new(key, Vec::new()));
        if race.surface.is_none() {
            race.surface = surfaces.as_ref().and_then(|s| s[i].clone());
        }
        if race.entrant(horse).is_some() {
            bail!("row {}: duplicate horse {} in race {}", row, horse, race.key);
        }
        race.entrants.push(entrant);
    }

    if scratched > 0 {
        tracing::debug!("Dropped {} rows without popularity rank", scratched);
    }

    let mut races: Vec<Race> = races.into_values().collect();
    for race in races.iter_mut() {
        race.entrants.sort_by_key(|e| e.horse_number);
    }
    Ok(races)
}

/// Load the payout table.
pub fn load_payouts(path: &Path) -> anyhow::Result<HashMap<PayoutKey, PayoutTable>> {
    let df = read_table(path)?;
    let payouts = payouts_from_frame(&df)
        .with_context(|| format!("Invalid payout table: {}", path.display()))?;
    tracing::info!("Loaded payouts for {} races from {}", payouts.len(), path.display());
    Ok(payouts)
}

/// Build payout tables from a long-format DataFrame, one row per paid combination.
///
/// Rows with unknown bet types (e.g. ordered trifecta) or the wrong number of
/// horses are ignored; missing payouts are left out so settlement flags them.
pub fn payouts_from_frame(df: &DataFrame) -> anyhow::Result<HashMap<PayoutKey, PayoutTable>> {
    let n = df.height();
    let tracks = string_values(df, "track_code")?;
    let dates = string_values(df, "meeting_date")?;
    let race_numbers = i64_values(df, "race_number")?;
    let bet_types = string_values(df, "bet_type")?;
    let first = i64_values(df, "horse_1")?;
    let second = optional(df, "horse_2", i64_values)?.unwrap_or_else(|| vec![None; n]);
    let third = optional(df, "horse_3", i64_values)?.unwrap_or_else(|| vec![None; n]);
    let multipliers = f64_values(df, "payout")?;

    let mut tables: HashMap<PayoutKey, PayoutTable> = HashMap::new();
    let mut ignored = 0usize;

    for i in 0..n {
        let row = i + 1;
        let track = tracks[i]
            .as_deref()
            .map(normalize_track_code)
            .with_context(|| format!("row {}: missing track_code", row))?;
        let date = dates[i]
            .as_deref()
            .and_then(parse_date)
            .with_context(|| format!("row {}: invalid meeting_date {:?}", row, dates[i]))?;
        let race_number = race_numbers[i]
            .and_then(|v| u8::try_from(v).ok())
            .with_context(|| format!("row {}: invalid race_number", row))?;

        let Some(bet_type) = bet_types[i].as_deref().and_then(BetType::from_str) else {
            ignored += 1;
            continue;
        };
        let horses: Vec<HorseNumber> = [first[i], second[i], third[i]]
            .into_iter()
            .flatten()
            .filter_map(|h| HorseNumber::try_from(h).ok())
            .filter(|h| *h > 0)
            .collect();
        let multiplier = multipliers[i].filter(|m| m.is_finite() && *m > 0.0);

        match multiplier {
            Some(m) if horses.len() == bet_type.legs() => {
                tables
                    .entry((track, date, race_number))
                    .or_default()
                    .insert(bet_type, &horses, m);
            }
            _ => ignored += 1,
        }
    }

    if ignored > 0 {
        tracing::debug!("Ignored {} payout rows", ignored);
    }
    Ok(tables)
}

/// Attach payout tables to races. Returns how many races had none.
pub fn attach_payouts(races: &mut [Race], mut payouts: HashMap<PayoutKey, PayoutTable>) -> usize {
    let mut missing = 0;
    for race in races.iter_mut() {
        let key = (
            race.key.track_code.clone(),
            race.key.meeting_date,
            race.key.race_number,
        );
        match payouts.remove(&key) {
            Some(table) => race.payouts = table,
            None => missing += 1,
        }
    }
    if missing > 0 {
        tracing::warn!("{} races have no payout data", missing);
    }
    missing
}

/// Track codes are two-digit strings; CSV readers may infer them as integers.
fn normalize_track_code(raw: &str) -> String {
    let raw = raw.trim();
    if !raw.is_empty() && raw.len() < 2 && raw.chars().all(|c| c.is_ascii_digit()) {
        format!("{:0>2}", raw)
    } else {
        raw.to_string()
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.trim().split([' ', 'T']).next()?;
    ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

fn column<'a>(df: &'a DataFrame, name: &str) -> anyhow::Result<&'a Column> {
    df.column(name)
        .with_context(|| format!("Missing column '{}'", name))
}

fn optional<T>(
    df: &DataFrame,
    name: &str,
    read: fn(&DataFrame, &str) -> anyhow::Result<Vec<T>>,
) -> anyhow::Result<Option<Vec<T>>> {
    if df.column(name).is_ok() {
        read(df, name).map(Some)
    } else {
        Ok(None)
    }
}

fn f64_values(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<f64>>> {
    let col = column(df, name)?.cast(&DataType::Float64)?;
    Ok(col.f64()?.into_iter().collect())
}

fn i64_values(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<i64>>> {
    let col = column(df, name)?.cast(&DataType::Int64)?;
    Ok(col.i64()?.into_iter().collect())
}

fn string_values(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<String>>> {
    let col = column(df, name)?.cast(&DataType::String)?;
    Ok(col
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.to_string()))
        .collect())
}
