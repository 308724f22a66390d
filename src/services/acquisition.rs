//! Auto-acquisition rules for unmatched chart entries
//!
//! The engine walks unmatched entries in rank order and, for each one,
//! applies the re-release, rating and genre filters, then the per-run add
//! limit, then picks a root folder and asks the library to add the title.
//! It always works from a settings snapshot taken when the run started.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::library::{LibraryClient, find_profile};
use crate::config::{AcquisitionSettings, GenreFilter, GenreFilterMode, RatingFilter};
use crate::error::RuleConfigError;
use crate::types::{
    AcquisitionDecision, BoxOfficeEntry, DecisionReason, QualityProfile, RootFolder, WeekKey,
};

/// Genre-to-folder routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFolderRule {
    pub priority: usize,
    pub genres: Vec<String>,
    pub root_folder: String,
}

impl RootFolderRule {
    fn matches(&self, genres: &[String]) -> bool {
        self.genres
            .iter()
            .any(|rule_genre| genres.iter().any(|g| g.eq_ignore_ascii_case(rule_genre)))
    }
}

/// Ordered list of root-folder rules.
///
/// Priorities are always `0..len` in list order; every mutation re-compacts
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<RootFolderRule>", into = "Vec<RootFolderRule>")]
pub struct RuleBook {
    rules: Vec<RootFolderRule>,
}

impl From<Vec<RootFolderRule>> for RuleBook {
    fn from(rules: Vec<RootFolderRule>) -> Self {
        Self::from_rules(rules)
    }
}

impl From<RuleBook> for Vec<RootFolderRule> {
    fn from(book: RuleBook) -> Self {
        book.rules
    }
}

impl RuleBook {
    /// Order rules by their stated priority and renumber them densely
    pub fn from_rules(mut rules: Vec<RootFolderRule>) -> Self {
        rules.sort_by_key(|r| r.priority);
        let mut book = Self { rules };
        book.compact();
        book
    }

    fn compact(&mut self) {
        for (idx, rule) in self.rules.iter_mut().enumerate() {
            rule.priority = idx;
        }
    }

    fn check_index(&self, priority: usize) -> Result<(), RuleConfigError> {
        if priority >= self.rules.len() {
            return Err(RuleConfigError(format!(
                "No rule at priority {} ({} rules)",
                priority,
                self.rules.len()
            )));
        }
        Ok(())
    }

    pub fn rules(&self) -> &[RootFolderRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Append a rule at the lowest priority
    pub fn push(&mut self, genres: Vec<String>, root_folder: String) {
        self.rules.push(RootFolderRule {
            priority: self.rules.len(),
            genres,
            root_folder,
        });
    }

    /// Swap with the rule above; no-op for the top rule
    pub fn move_up(&mut self, priority: usize) -> Result<(), RuleConfigError> {
        self.check_index(priority)?;
        if priority > 0 {
            self.rules.swap(priority, priority - 1);
            self.compact();
        }
        Ok(())
    }

    /// Swap with the rule below; no-op for the bottom rule
    pub fn move_down(&mut self, priority: usize) -> Result<(), RuleConfigError> {
        self.check_index(priority)?;
        if priority + 1 < self.rules.len() {
            self.rules.swap(priority, priority + 1);
            self.compact();
        }
        Ok(())
    }

    pub fn remove(&mut self, priority: usize) -> Result<RootFolderRule, RuleConfigError> {
        self.check_index(priority)?;
        let removed = self.rules.remove(priority);
        self.compact();
        Ok(removed)
    }

    pub fn validate(&self) -> Result<(), RuleConfigError> {
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.priority != idx {
                return Err(RuleConfigError(format!(
                    "Rule priorities are not contiguous: expected {}, found {}",
                    idx, rule.priority
                )));
            }
            if rule.genres.iter().all(|g| g.trim().is_empty()) {
                return Err(RuleConfigError(format!("Rule {} has no genres", idx)));
            }
            if rule.root_folder.trim().is_empty() {
                return Err(RuleConfigError(format!("Rule {} has no root folder", idx)));
            }
        }
        Ok(())
    }

    /// Folder of the first rule whose genres intersect `genres`
    pub fn select_folder(&self, genres: &[String]) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(genres))
            .map(|rule| rule.root_folder.as_str())
    }
}

/// Decides whether an entry is a re-release of an older film
pub trait ReReleaseDetector: Send + Sync {
    fn is_rerelease(&self, entry: &BoxOfficeEntry, week: WeekKey) -> bool;
}

/// Flags entries released more than `tolerance` years before the chart week
#[derive(Debug, Clone, Copy)]
pub struct YearCutoff {
    pub tolerance: i32,
}

impl Default for YearCutoff {
    fn default() -> Self {
        Self { tolerance: 1 }
    }
}

impl ReReleaseDetector for YearCutoff {
    fn is_rerelease(&self, entry: &BoxOfficeEntry, week: WeekKey) -> bool {
        entry.year.is_some_and(|year| year < week.year - self.tolerance)
    }
}

/// What the filters say about one entry, before the limit applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Skip(DecisionReason),
    Add { root_folder: String },
}

/// Rule engine bound to one settings snapshot
pub struct AcquisitionEngine {
    settings: AcquisitionSettings,
    profile: QualityProfile,
    detector: Arc<dyn ReReleaseDetector>,
}

impl AcquisitionEngine {
    /// Validate the snapshot against what the library offers.
    ///
    /// Fails when the rule list is malformed, when a rule or the default
    /// points at a folder the library doesn't have, or when the quality
    /// profile can't be resolved. Nothing is added in that case.
    pub fn prepare(
        settings: AcquisitionSettings,
        root_folders: &[RootFolder],
        profiles: &[QualityProfile],
        detector: Arc<dyn ReReleaseDetector>,
    ) -> Result<Self, RuleConfigError> {
        settings.root_folder_rules.validate()?;

        let known = |path: &str| {
            let path = path.trim_end_matches('/');
            root_folders.iter().any(|f| f.path.trim_end_matches('/') == path)
        };
        if !known(&settings.default_root_folder) {
            return Err(RuleConfigError(format!(
                "Default root folder {} is not configured in the library",
                settings.default_root_folder
            )));
        }
        if let Some(rule) = settings
            .root_folder_rules
            .rules()
            .iter()
            .find(|r| !known(&r.root_folder))
        {
            return Err(RuleConfigError(format!(
                "Rule {} routes to unknown root folder {}",
                rule.priority, rule.root_folder
            )));
        }

        let profile = find_profile(profiles, &settings.quality_profile).ok_or_else(|| {
            RuleConfigError(format!("Unknown quality profile {}", settings.quality_profile))
        })?;

        Ok(Self {
            settings,
            profile,
            detector,
        })
    }

    /// Apply the filters and folder routing to one entry
    pub fn evaluate(&self, entry: &BoxOfficeEntry, week: WeekKey) -> Verdict {
        if entry.ids.is_empty() {
            return Verdict::Skip(DecisionReason::MissingExternalId);
        }
        if self.settings.ignore_rereleases && self.detector.is_rerelease(entry, week) {
            return Verdict::Skip(DecisionReason::ReRelease);
        }
        if !rating_allows(&self.settings.rating_filter, entry.metadata.certification.as_deref()) {
            return Verdict::Skip(DecisionReason::RatingFiltered);
        }
        if !genre_allows(&self.settings.genre_filter, &entry.metadata.genres) {
            return Verdict::Skip(DecisionReason::GenreFiltered);
        }

        let root_folder = self
            .settings
            .root_folder_rules
            .select_folder(&entry.metadata.genres)
            .unwrap_or(self.settings.default_root_folder.as_str())
            .to_string();
        Verdict::Add { root_folder }
    }

    /// Decide and add, in rank order. One decision per entry, same order.
    pub async fn run(
        &self,
        entries: &[BoxOfficeEntry],
        library: &LibraryClient,
        week: WeekKey,
    ) -> Vec<AcquisitionDecision> {
        let mut added = 0;
        let mut decisions = Vec::with_capacity(entries.len());

        for entry in entries {
            let root_folder = match self.evaluate(entry, week) {
                Verdict::Skip(reason) => {
                    debug!(job = "box_office", week = %week, rank = entry.rank, title = %entry.title, reason = %reason, "Skipping auto-add");
                    decisions.push(AcquisitionDecision::skipped(reason));
                    continue;
                }
                Verdict::Add { root_folder } => root_folder,
            };

            if added >= self.settings.limit {
                decisions.push(AcquisitionDecision::skipped(DecisionReason::LimitReached));
                continue;
            }

            match library
                .add(entry, &root_folder, &self.profile, &self.settings.add_options)
                .await
            {
                Ok(item) => {
                    added += 1;
                    info!(
                        job = "box_office",
                        week = %week,
                        rank = entry.rank,
                        title = %entry.title,
                        root_folder = %root_folder,
                        "Auto-added title"
                    );
                    decisions.push(AcquisitionDecision {
                        added: true,
                        reason: DecisionReason::Added,
                        root_folder: Some(root_folder),
                        quality_profile: Some(self.profile.clone()),
                        item: Some(item),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(job = "box_office", week = %week, rank = entry.rank, title = %entry.title, error = %e, "Auto-add failed");
                    decisions.push(AcquisitionDecision {
                        added: false,
                        reason: DecisionReason::AddFailed,
                        root_folder: Some(root_folder),
                        quality_profile: Some(self.profile.clone()),
                        item: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        decisions
    }
}

/// An empty allow-list places no restriction
fn rating_allows(filter: &RatingFilter, certification: Option<&str>) -> bool {
    if !filter.enabled || filter.allowed.is_empty() {
        return true;
    }
    certification.is_some_and(|cert| filter.allowed.iter().any(|a| a.eq_ignore_ascii_case(cert)))
}

fn genre_allows(filter: &GenreFilter, genres: &[String]) -> bool {
    if !filter.enabled {
        return true;
    }
    let intersects = |list: &[String]| {
        list.iter()
            .any(|wanted| genres.iter().any(|g| g.eq_ignore_ascii_case(wanted)))
    };
    match filter.mode {
        GenreFilterMode::Whitelist => filter.whitelist.is_empty() || intersects(&filter.whitelist),
        GenreFilterMode::Blacklist => !intersects(&filter.blacklist),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::services::library::testing::FakeBackend;
    use crate::types::{EntryMetadata, ExternalIds};

    const WEEK: WeekKey = WeekKey { year: 2024, week: 10 };

    fn entry(rank: u32, genres: &[&str]) -> BoxOfficeEntry {
        BoxOfficeEntry {
            rank,
            title: format!("Entry {}", rank),
            year: Some(2024),
            ids: ExternalIds {
                primary: Some(500 + rank as i64),
                secondary: None,
            },
            revenue: None,
            metadata: EntryMetadata {
                genres: genres.iter().map(|g| g.to_string()).collect(),
                certification: Some("PG-13".into()),
                ..Default::default()
            },
        }
    }

    fn book(n: usize) -> RuleBook {
        let mut book = RuleBook::default();
        for i in 0..n {
            book.push(vec![format!("genre{}", i)], format!("/folder{}", i));
        }
        book
    }

    fn engine(settings: AcquisitionSettings) -> AcquisitionEngine {
        let backend = FakeBackend::with_items(vec![]);
        AcquisitionEngine::prepare(
            settings,
            &backend.folders,
            &backend.profiles,
            Arc::new(YearCutoff::default()),
        )
        .unwrap()
    }

    fn enabled() -> AcquisitionSettings {
        AcquisitionSettings {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_remove_recompacts_priorities() {
        let mut rules = book(5);
        let removed = rules.remove(2).unwrap();

        assert_eq!(removed.root_folder, "/folder2");
        let priorities: Vec<usize> = rules.rules().iter().map(|r| r.priority).collect();
        let folders: Vec<&str> = rules.rules().iter().map(|r| r.root_folder.as_str()).collect();
        assert_eq!(priorities, vec![0, 1, 2, 3]);
        assert_eq!(folders, vec!["/folder0", "/folder1", "/folder3", "/folder4"]);
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn test_move_up_and_down_swap_neighbours() {
        let mut rules = book(3);
        rules.move_up(2).unwrap();
        rules.move_up(0).unwrap();
        rules.move_down(2).unwrap();

        let folders: Vec<&str> = rules.rules().iter().map(|r| r.root_folder.as_str()).collect();
        assert_eq!(folders, vec!["/folder0", "/folder2", "/folder1"]);
        assert_matches!(rules.move_down(3), Err(RuleConfigError(_)));
    }

    #[test]
    fn test_from_rules_sorts_and_compacts() {
        let rules = RuleBook::from_rules(vec![
            RootFolderRule { priority: 7, genres: vec!["horror".into()], root_folder: "/horror".into() },
            RootFolderRule { priority: 3, genres: vec!["animation".into()], root_folder: "/kids".into() },
        ]);
        assert_eq!(rules.rules()[0].root_folder, "/kids");
        assert_eq!(rules.rules()[1].priority, 1);
    }

    #[test]
    fn test_rulebook_deserializes_from_plain_list() {
        let rules: RuleBook = serde_json::from_str(
            r#"[{"priority": 4, "genres": ["horror"], "root_folder": "/horror"}]"#,
        )
        .unwrap();
        assert_eq!(rules.rules()[0].priority, 0);
    }

    #[test]
    fn test_first_intersecting_rule_wins() {
        let mut rules = RuleBook::default();
        rules.push(vec!["Animation".into()], "/kids".into());
        rules.push(vec!["horror".into(), "animation".into()], "/horror".into());

        assert_eq!(rules.select_folder(&["horror".into(), "animation".into()]), Some("/kids"));
        assert_eq!(rules.select_folder(&["horror".into()]), Some("/horror"));
        assert_eq!(rules.select_folder(&["drama".into()]), None);
    }

    #[test]
    fn test_prepare_rejects_unknown_folder_and_profile() {
        let backend = FakeBackend::with_items(vec![]);
        let detector: Arc<dyn ReReleaseDetector> = Arc::new(YearCutoff::default());

        let mut settings = enabled();
        settings.root_folder_rules.push(vec!["horror".into()], "/nowhere".into());
        let result = AcquisitionEngine::prepare(settings, &backend.folders, &backend.profiles, detector.clone());
        assert!(result.is_err());

        let mut settings = enabled();
        settings.quality_profile = "Potato".into();
        let result = AcquisitionEngine::prepare(settings, &backend.folders, &backend.profiles, detector);
        assert!(result.is_err());
    }

    #[test]
    fn test_filter_order() {
        let mut settings = enabled();
        settings.ignore_rereleases = true;
        settings.rating_filter = RatingFilter {
            enabled: true,
            allowed: vec!["PG".into(), "PG-13".into()],
        };
        settings.genre_filter = GenreFilter {
            enabled: true,
            mode: GenreFilterMode::Blacklist,
            whitelist: vec![],
            blacklist: vec!["horror".into()],
        };
        settings.root_folder_rules.push(vec!["animation".into()], "/kids".into());
        let engine = engine(settings);

        let mut no_ids = entry(1, &["drama"]);
        no_ids.ids = ExternalIds::default();
        assert_eq!(engine.evaluate(&no_ids, WEEK), Verdict::Skip(DecisionReason::MissingExternalId));

        let mut old = entry(2, &["horror"]);
        old.year = Some(1982);
        old.metadata.certification = Some("R".into());
        assert_eq!(engine.evaluate(&old, WEEK), Verdict::Skip(DecisionReason::ReRelease));

        let mut rated_r = entry(3, &["horror"]);
        rated_r.metadata.certification = Some("R".into());
        assert_eq!(engine.evaluate(&rated_r, WEEK), Verdict::Skip(DecisionReason::RatingFiltered));

        let mut uncertified = entry(4, &["drama"]);
        uncertified.metadata.certification = None;
        assert_eq!(engine.evaluate(&uncertified, WEEK), Verdict::Skip(DecisionReason::RatingFiltered));

        assert_eq!(engine.evaluate(&entry(5, &["horror"]), WEEK), Verdict::Skip(DecisionReason::GenreFiltered));
        assert_eq!(
            engine.evaluate(&entry(6, &["animation"]), WEEK),
            Verdict::Add { root_folder: "/kids".into() }
        );
        assert_eq!(
            engine.evaluate(&entry(7, &["drama"]), WEEK),
            Verdict::Add { root_folder: "/movies".into() }
        );
    }

    #[test]
    fn test_whitelist_requires_intersection() {
        let mut settings = enabled();
        settings.genre_filter = GenreFilter {
            enabled: true,
            mode: GenreFilterMode::Whitelist,
            whitelist: vec!["Action".into()],
            blacklist: vec!["action".into()],
        };
        let engine = engine(settings);

        assert_eq!(engine.evaluate(&entry(1, &["drama"]), WEEK), Verdict::Skip(DecisionReason::GenreFiltered));
        assert_matches!(engine.evaluate(&entry(2, &["action"]), WEEK), Verdict::Add { .. });
    }

    #[test]
    fn test_year_cutoff_tolerance() {
        let detector = YearCutoff::default();
        let mut e = entry(1, &[]);
        e.year = Some(2023);
        assert!(!detector.is_rerelease(&e, WEEK));
        e.year = Some(2022);
        assert!(detector.is_rerelease(&e, WEEK));
        e.year = None;
        assert!(!detector.is_rerelease(&e, WEEK));
    }

    #[tokio::test]
    async fn test_limit_caps_adds() {
        let mut settings = enabled();
        settings.limit = 2;
        let engine = engine(settings);
        let backend = Arc::new(FakeBackend::with_items(vec![]));
        let library = LibraryClient::new(backend.clone(), Duration::from_secs(60));

        let entries: Vec<_> = (1..=5).map(|rank| entry(rank, &["drama"])).collect();
        let decisions = engine.run(&entries, &library, WEEK).await;

        let reasons: Vec<DecisionReason> = decisions.iter().map(|d| d.reason).collect();
        assert_eq!(
            reasons,
            vec![
                DecisionReason::Added,
                DecisionReason::Added,
                DecisionReason::LimitReached,
                DecisionReason::LimitReached,
                DecisionReason::LimitReached,
            ]
        );
        assert_eq!(backend.items.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_run_lists_library_once() {
        let mut settings = enabled();
        settings.limit = 10;
        let engine = engine(settings);
        let backend = Arc::new(FakeBackend::with_items(vec![]));
        let library = LibraryClient::new(backend.clone(), Duration::from_secs(60));
        library.index().await.unwrap();

        let entries: Vec<_> = (1..=5).map(|rank| entry(rank, &["drama"])).collect();
        let decisions = engine.run(&entries, &library, WEEK).await;

        assert!(decisions.iter().all(|d| d.reason == DecisionReason::Added));
        assert_eq!(backend.list_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_add_does_not_count_or_abort() {
        let mut settings = enabled();
        settings.limit = 1;
        let engine = engine(settings);
        let mut backend = FakeBackend::with_items(vec![]);
        backend.fail_titles = vec!["Entry 1".into()];
        let library = LibraryClient::new(Arc::new(backend), Duration::from_secs(60));

        let entries = vec![entry(1, &["drama"]), entry(2, &["drama"]), entry(3, &["drama"])];
        let decisions = engine.run(&entries, &library, WEEK).await;

        assert_eq!(decisions[0].reason, DecisionReason::AddFailed);
        assert!(decisions[0].error.is_some());
        assert_eq!(decisions[1].reason, DecisionReason::Added);
        assert_eq!(decisions[1].root_folder.as_deref(), Some("/movies"));
        assert_eq!(decisions[2].reason, DecisionReason::LimitReached);
    }

    #[tokio::test]
    async fn test_decisions_are_deterministic() {
        let mut settings = enabled();
        settings.limit = 3;
        settings.root_folder_rules.push(vec!["horror".into()], "/horror".into());
        settings.genre_filter = GenreFilter {
            enabled: true,
            mode: GenreFilterMode::Blacklist,
            whitelist: vec![],
            blacklist: vec!["documentary".into()],
        };
        let entries = vec![
            entry(1, &["horror"]),
            entry(2, &["documentary"]),
            entry(3, &["drama"]),
            entry(4, &["horror", "comedy"]),
            entry(5, &["drama"]),
        ];

        let mut runs = Vec::new();
        for _ in 0..2 {
            let engine = engine(settings.clone());
            let library = LibraryClient::new(Arc::new(FakeBackend::with_items(vec![])), Duration::from_secs(60));
            runs.push(engine.run(&entries, &library, WEEK).await);
        }

        assert_eq!(runs[0], runs[1]);
    }
}
