//! Core data model shared by the sync pipeline

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// A (year, ISO week) key identifying one weekly chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WeekKey {
    pub year: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn new(year: i32, week: u32) -> Self {
        Self { year, week }
    }

    /// Week of the most recent Friday on or before `date`.
    ///
    /// Box office weekends open on Friday, so a Tuesday run still belongs to
    /// the weekend that just ended.
    pub fn for_weekend_of(date: NaiveDate) -> Self {
        let days_since_friday = (date.weekday().num_days_from_monday() + 7
            - Weekday::Fri.num_days_from_monday())
            % 7;
        let friday = date - Duration::days(days_since_friday as i64);
        let iso = friday.iso_week();
        Self::new(iso.year(), iso.week())
    }

    /// Week of the current box office weekend (UTC)
    pub fn current() -> Self {
        Self::for_weekend_of(Utc::now().date_naive())
    }

    /// Whether this is a real ISO week
    pub fn is_valid(&self) -> bool {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon).is_some()
    }
}

impl fmt::Display for WeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}W{:02}", self.year, self.week)
    }
}

impl FromStr for WeekKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, week) = s
            .split_once('W')
            .ok_or_else(|| format!("Invalid week key: {}", s))?;
        let key = WeekKey::new(
            year.parse().map_err(|_| format!("Invalid year in week key: {}", s))?,
            week.parse().map_err(|_| format!("Invalid week in week key: {}", s))?,
        );
        if !key.is_valid() {
            return Err(format!("No such ISO week: {}", s));
        }
        Ok(key)
    }
}

/// Third-party identifiers carried by a chart entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    /// TMDB id
    pub primary: Option<i64>,
    /// IMDb id (`tt…`)
    pub secondary: Option<String>,
}

impl ExternalIds {
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }
}

/// Lookup key into the library index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExternalId {
    Tmdb(i64),
    Imdb(String),
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalId::Tmdb(id) => write!(f, "tmdb:{}", id),
            ExternalId::Imdb(id) => write!(f, "imdb:{}", id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default)]
    pub genres: Vec<String>,
    pub certification: Option<String>,
    pub runtime: Option<u32>,
    pub rating: Option<f64>,
    pub release_date: Option<String>,
    pub overview: Option<String>,
}

/// One ranked title of the weekly chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxOfficeEntry {
    pub rank: u32,
    pub title: String,
    pub year: Option<i32>,
    pub ids: ExternalIds,
    pub revenue: Option<i64>,
    pub metadata: EntryMetadata,
}

/// Release state reported by the library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    Tba,
    Announced,
    InCinemas,
    Released,
    Deleted,
}

/// A title held by the managed library. Read-only from the pipeline's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryItem {
    pub id: i64,
    pub title: String,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub quality_profile_id: i64,
    pub has_file: bool,
    pub is_available: bool,
    pub availability: Option<Availability>,
    pub root_folder: Option<String>,
    #[serde(default)]
    pub tags: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFolder {
    pub id: i64,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Primary,
    Secondary,
    None,
}

/// Outcome of resolving one entry against the library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub rank: u32,
    pub item: Option<LibraryItem>,
    pub method: MatchMethod,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        self.item.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    Added,
    MissingExternalId,
    ReRelease,
    RatingFiltered,
    GenreFiltered,
    LimitReached,
    AddFailed,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionReason::Added => "added",
            DecisionReason::MissingExternalId => "missing-external-id",
            DecisionReason::ReRelease => "re-release",
            DecisionReason::RatingFiltered => "rating-filtered",
            DecisionReason::GenreFiltered => "genre-filtered",
            DecisionReason::LimitReached => "limit-reached",
            DecisionReason::AddFailed => "add-failed",
        };
        f.write_str(s)
    }
}

/// Auto-acquisition verdict for one unmatched entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionDecision {
    pub added: bool,
    pub reason: DecisionReason,
    pub root_folder: Option<String>,
    pub quality_profile: Option<QualityProfile>,
    /// Library item created by the add
    pub item: Option<LibraryItem>,
    /// Failure detail for `add-failed`
    pub error: Option<String>,
}

impl AcquisitionDecision {
    pub fn skipped(reason: DecisionReason) -> Self {
        Self {
            added: false,
            reason,
            root_folder: None,
            quality_profile: None,
            item: None,
            error: None,
        }
    }
}

/// What fired a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    Backfill,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Scheduled => write!(f, "scheduled"),
            TriggerKind::Manual => write!(f, "manual"),
            TriggerKind::Backfill => write!(f, "backfill"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub found: usize,
    pub matched: usize,
    pub added: usize,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// The week is already stored; nothing was written
    AlreadyExists,
    /// The source has no data for the week
    NoData,
    Failed,
}

/// One entry of the in-memory run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: uuid::Uuid,
    pub trigger: TriggerKind,
    pub week: Option<WeekKey>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub outcome: Option<RunOutcome>,
    pub error: Option<String>,
}
