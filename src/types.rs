//! Core data model: entrants, races, payouts and bet tickets.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Horse number on the race card (馬番).
pub type HorseNumber = u8;

/// Identity of a race: (track, year, date, race number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaceKey {
    pub meeting_date: NaiveDate,
    pub track_code: String,
    pub meeting_year: i32,
    pub race_number: u8,
}

impl RaceKey {
    pub fn new(track_code: impl Into<String>, meeting_date: NaiveDate, race_number: u8) -> Self {
        use chrono::Datelike;
        Self {
            meeting_date,
            track_code: track_code.into(),
            meeting_year: meeting_date.year(),
            race_number,
        }
    }
}

impl fmt::Display for RaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_R{}",
            self.track_code,
            self.meeting_year,
            self.meeting_date.format("%m%d"),
            self.race_number
        )
    }
}

/// One horse's participation in one race.
///
/// `raw_model_score`, `predicted_rank` and `upset_probability` start empty and
/// are filled by the pipeline in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entrant {
    pub horse_number: HorseNumber,
    pub popularity_rank: u32,
    pub win_odds: Option<f64>,
    /// `None` when the horse did not finish or the race is unresolved.
    pub finish_position: Option<u32>,
    pub ranking_features: Vec<f64>,
    /// Upset classifier inputs; `None` marks a missing value.
    pub upset_features: Vec<Option<f64>>,
    #[serde(default)]
    pub raw_model_score: Option<f64>,
    #[serde(default)]
    pub predicted_rank: Option<u32>,
    /// `None` for entrants outside the classifier's popularity band.
    #[serde(default)]
    pub upset_probability: Option<f64>,
}

impl Entrant {
    pub fn new(horse_number: HorseNumber, popularity_rank: u32) -> Self {
        Self {
            horse_number,
            popularity_rank,
            win_odds: None,
            finish_position: None,
            ranking_features: Vec::new(),
            upset_features: Vec::new(),
            raw_model_score: None,
            predicted_rank: None,
            upset_probability: None,
        }
    }

    /// Upset probability, 0 when the entrant was not eligible.
    pub fn upset_probability(&self) -> f64 {
        self.upset_probability.unwrap_or(0.0)
    }

    pub fn finished_within(&self, position: u32) -> bool {
        matches!(self.finish_position, Some(p) if p >= 1 && p <= position)
    }
}

/// Payout multipliers per unit stake, keyed by combination
/// ("1-2", "1-2-3"). Unordered combinations use ascending horse numbers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayoutTable {
    /// Up to three (horse_number, multiplier) place slots, in no particular order.
    pub place: Vec<(HorseNumber, f64)>,
    pub quinella: HashMap<String, f64>,
    pub exacta: HashMap<String, f64>,
    pub wide: HashMap<String, f64>,
    pub trio: HashMap<String, f64>,
}

impl PayoutTable {
    /// Look up the payout multiplier for a combination.
    ///
    /// Returns `None` when the table has no entry; WIN is never looked up here.
    pub fn lookup(&self, bet_type: BetType, horses: &[HorseNumber]) -> Option<f64> {
        match bet_type {
            BetType::Win => None,
            BetType::Place => {
                let horse = *horses.first()?;
                self.place
                    .iter()
                    .find(|(h, _)| *h == horse)
                    .map(|(_, m)| *m)
            }
            BetType::Quinella => self.quinella.get(&combination_key(horses, false)).copied(),
            BetType::Exacta => self.exacta.get(&combination_key(horses, true)).copied(),
            BetType::Wide => self.wide.get(&combination_key(horses, false)).copied(),
            BetType::TrifectaBox => self.trio.get(&combination_key(horses, false)).copied(),
        }
    }

    /// Insert a payout, normalizing unordered combinations.
    pub fn insert(&mut self, bet_type: BetType, horses: &[HorseNumber], multiplier: f64) {
        match bet_type {
            BetType::Win => {}
            BetType::Place => {
                if let Some(&h) = horses.first() {
                    self.place.push((h, multiplier));
                }
            }
            BetType::Quinella => {
                self.quinella.insert(combination_key(horses, false), multiplier);
            }
            BetType::Exacta => {
                self.exacta.insert(combination_key(horses, true), multiplier);
            }
            BetType::Wide => {
                self.wide.insert(combination_key(horses, false), multiplier);
            }
            BetType::TrifectaBox => {
                self.trio.insert(combination_key(horses, false), multiplier);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.place.is_empty()
            && self.quinella.is_empty()
            && self.exacta.is_empty()
            && self.wide.is_empty()
            && self.trio.is_empty()
    }
}

/// Build a lookup key such as "3-7". Unordered keys are sorted ascending.
pub fn combination_key(horses: &[HorseNumber], ordered: bool) -> String {
    let mut horses = horses.to_vec();
    if !ordered {
        horses.sort_unstable();
    }
    horses
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// All entrants sharing one race key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Race {
    pub key: RaceKey,
    #[serde(default)]
    pub surface: Option<String>,
    pub entrants: Vec<Entrant>,
    #[serde(default)]
    pub payouts: PayoutTable,
}

impl Race {
    pub fn new(key: RaceKey, entrants: Vec<Entrant>) -> Self {
        Self {
            key,
            surface: None,
            entrants,
            payouts: PayoutTable::default(),
        }
    }

    pub fn entrant(&self, horse_number: HorseNumber) -> Option<&Entrant> {
        self.entrants.iter().find(|e| e.horse_number == horse_number)
    }

    /// A race is resolved once a winner is known.
    pub fn is_resolved(&self) -> bool {
        self.entrants.iter().any(|e| e.finish_position == Some(1))
    }

    /// Entrants ordered by predicted rank; unscored entrants are omitted.
    pub fn by_predicted_rank(&self) -> Vec<&Entrant> {
        let mut ranked: Vec<&Entrant> = self
            .entrants
            .iter()
            .filter(|e| e.predicted_rank.is_some())
            .collect();
        ranked.sort_by_key(|e| (e.predicted_rank, e.horse_number));
        ranked
    }
}

/// Bet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetType {
    Win,         // 単勝 - 1st
    Place,       // 複勝 - top 3
    Quinella,    // 馬連 - 1st and 2nd any order
    Exacta,      // 馬単 - 1st and 2nd in order
    Wide,        // ワイド - 2 horses in top 3
    TrifectaBox, // 三連複 - top 3 any order
}

impl BetType {
    pub const ALL: [BetType; 6] = [
        BetType::Win,
        BetType::Place,
        BetType::Quinella,
        BetType::Exacta,
        BetType::Wide,
        BetType::TrifectaBox,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "win" | "tansho" | "単勝" => Some(BetType::Win),
            "place" | "fukusho" | "複勝" => Some(BetType::Place),
            "quinella" | "umaren" | "馬連" => Some(BetType::Quinella),
            "exacta" | "umatan" | "馬単" => Some(BetType::Exacta),
            "wide" | "ワイド" => Some(BetType::Wide),
            "trifecta_box" | "trio" | "sanrenpuku" | "三連複" | "３連複" => {
                Some(BetType::TrifectaBox)
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BetType::Win => "win",
            BetType::Place => "place",
            BetType::Quinella => "quinella",
            BetType::Exacta => "exacta",
            BetType::Wide => "wide",
            BetType::TrifectaBox => "trifecta_box",
        }
    }

    /// Number of horses on one ticket.
    pub fn legs(&self) -> usize {
        match self {
            BetType::Win | BetType::Place => 1,
            BetType::Quinella | BetType::Exacta | BetType::Wide => 2,
            BetType::TrifectaBox => 3,
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, BetType::Exacta)
    }
}

impl fmt::Display for BetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which strategy produced a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketSource {
    /// Built from the ranker's favorite set.
    Ranker,
    /// Built from upset candidates, optionally anchored on ranker favorites.
    Upset,
}

impl TicketSource {
    pub fn name(&self) -> &'static str {
        match self {
            TicketSource::Ranker => "ranker",
            TicketSource::Upset => "upset",
        }
    }
}

/// One wagered combination in one race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetTicket {
    pub race: RaceKey,
    pub bet_type: BetType,
    pub source: TicketSource,
    /// Horse numbers; in finishing order for EXACTA, ascending otherwise.
    pub horses: Vec<HorseNumber>,
    /// Stake in yen.
    pub stake: u64,
}

impl BetTicket {
    pub fn combination(&self) -> String {
        combination_key(&self.horses, self.bet_type.is_ordered())
    }
}

/// Resolution of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Hit,
    Miss,
}

/// A settled ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledTicket {
    pub ticket: BetTicket,
    pub outcome: Outcome,
    /// Return in yen; 0 on a miss or when payout data is missing.
    pub payout: u64,
    /// A hit whose payout could not be found.
    pub payout_missing: bool,
}

impl SettledTicket {
    pub fn is_hit(&self) -> bool {
        self.outcome == Outcome::Hit
    }

    pub fn profit(&self) -> i64 {
        self.payout as i64 - self.ticket.stake as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_bet_type_parsing() {
        assert_eq!(BetType::from_str("win"), Some(BetType::Win));
        assert_eq!(BetType::from_str("fukusho"), Some(BetType::Place));
        assert_eq!(BetType::from_str("umaren"), Some(BetType::Quinella));
        assert_eq!(BetType::from_str("umatan"), Some(BetType::Exacta));
        assert_eq!(BetType::from_str("WIDE"), Some(BetType::Wide));
        assert_eq!(BetType::from_str("sanrenpuku"), Some(BetType::TrifectaBox));
        assert_eq!(BetType::from_str("三連複"), Some(BetType::TrifectaBox));
        assert_eq!(BetType::from_str("sanrentan"), None);
    }

    #[test]
    fn test_bet_type_legs() {
        assert_eq!(BetType::Win.legs(), 1);
        assert_eq!(BetType::Place.legs(), 1);
        assert_eq!(BetType::Wide.legs(), 2);
        assert_eq!(BetType::TrifectaBox.legs(), 3);
        assert!(BetType::Exacta.is_ordered());
        assert!(!BetType::Quinella.is_ordered());
    }

    #[test]
    fn test_combination_key() {
        assert_eq!(combination_key(&[7, 3], false), "3-7");
        assert_eq!(combination_key(&[7, 3], true), "7-3");
        assert_eq!(combination_key(&[12, 1, 5], false), "1-5-12");
    }

    #[test]
    fn test_payout_lookup_normalizes_unordered() {
        let mut table = PayoutTable::default();
        table.insert(BetType::Quinella, &[5, 2], 12.3);
        table.insert(BetType::Exacta, &[5, 2], 25.0);
        table.insert(BetType::Place, &[9], 3.1);

        assert_eq!(table.lookup(BetType::Quinella, &[2, 5]), Some(12.3));
        assert_eq!(table.lookup(BetType::Exacta, &[5, 2]), Some(25.0));
        assert_eq!(table.lookup(BetType::Exacta, &[2, 5]), None);
        assert_eq!(table.lookup(BetType::Place, &[9]), Some(3.1));
        assert_eq!(table.lookup(BetType::Win, &[9]), None);
    }

    #[test]
    fn test_race_key_ordering_is_chronological() {
        let a = RaceKey::new("06", date(2024, 1, 6), 11);
        let b = RaceKey::new("05", date(2024, 1, 7), 1);
        assert!(a < b);
        assert_eq!(a.meeting_year, 2024);
        assert_eq!(a.to_string(), "06_2024_0106_R11");
    }

    #[test]
    fn test_race_finishers() {
        let key = RaceKey::new("05", date(2024, 5, 5), 3);
        let mut entrants: Vec<Entrant> = (1..=4).map(|h| Entrant::new(h, h as u32)).collect();
        entrants[0].finish_position = Some(2);
        entrants[1].finish_position = Some(1);
        entrants[2].finish_position = Some(3);
        let race = Race::new(key, entrants);

        assert!(race.is_resolved());
        assert!(race.entrant(3).unwrap().finished_within(3));
        assert!(!race.entrant(4).unwrap().finished_within(3));
    }
}
