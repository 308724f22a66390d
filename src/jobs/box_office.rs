//! Weekly box office sync pipeline
//!
//! One run fetches a week's chart, matches it against the library, lets the
//! acquisition rules add missing titles, and writes the week's snapshot. At
//! most one run is in flight per [`Orchestrator`]; a trigger that arrives
//! while a run is active is rejected, never queued.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SettingsHandle;
use crate::error::{AlreadyRunning, PipelineError, SourceError, StoreError};
use crate::services::acquisition::{AcquisitionEngine, ReReleaseDetector, YearCutoff};
use crate::services::library::{LibraryClient, find_profile};
use crate::services::matcher::match_entries;
use crate::services::snapshots::{LiveStatus, SnapshotRow, SnapshotStore};
use crate::services::trakt::BoxOfficeSource;
use crate::types::{
    AcquisitionDecision, BoxOfficeEntry, RunCounts, RunOutcome, RunRecord, TriggerKind, WeekKey,
};

const DEFAULT_HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running {
        trigger: TriggerKind,
        week: WeekKey,
        started_at: DateTime<Utc>,
    },
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorState {
    pub phase: Phase,
    pub last_run: Option<RunRecord>,
}

/// Result handed back to whoever triggered a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub week: WeekKey,
    pub outcome: RunOutcome,
    pub counts: RunCounts,
    pub message: String,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed | RunOutcome::AlreadyExists)
    }
}

/// Resets the phase to idle on every exit path
struct RunGuard<'a> {
    phase: &'a Mutex<Phase>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock() = Phase::Idle;
    }
}

pub struct Orchestrator {
    source: Arc<dyn BoxOfficeSource>,
    library: Arc<LibraryClient>,
    store: SnapshotStore,
    settings: SettingsHandle,
    detector: Arc<dyn ReReleaseDetector>,
    retention_weeks: Option<usize>,
    history_capacity: usize,
    phase: Mutex<Phase>,
    history: Mutex<VecDeque<RunRecord>>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn BoxOfficeSource>,
        library: Arc<LibraryClient>,
        store: SnapshotStore,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            source,
            library,
            store,
            settings,
            detector: Arc::new(YearCutoff::default()),
            retention_weeks: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            phase: Mutex::new(Phase::Idle),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ReReleaseDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_retention(mut self, weeks: Option<usize>) -> Self {
        self.retention_weeks = weeks;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn library(&self) -> &Arc<LibraryClient> {
        &self.library
    }

    pub fn state(&self) -> OrchestratorState {
        OrchestratorState {
            phase: self.phase.lock().clone(),
            last_run: self.history.lock().back().cloned(),
        }
    }

    /// Finished runs, newest first
    pub fn run_history(&self) -> Vec<RunRecord> {
        self.history.lock().iter().rev().cloned().collect()
    }

    /// Run the pipeline for the current week right away
    pub async fn trigger_now(&self) -> Result<RunReport, AlreadyRunning> {
        self.trigger(TriggerKind::Manual, WeekKey::current()).await
    }

    /// Run the pipeline for a past week
    pub async fn trigger_backfill(&self, week: WeekKey) -> Result<RunReport, AlreadyRunning> {
        self.trigger(TriggerKind::Backfill, week).await
    }

    /// Entry point for the cron job; the result only goes to the log and
    /// run history
    pub async fn run_scheduled(&self) {
        match self.trigger(TriggerKind::Scheduled, WeekKey::current()).await {
            Ok(report) if report.is_success() => {
                info!(job = "box_office", week = %report.week, outcome = ?report.outcome, "{}", report.message);
            }
            Ok(report) => {
                warn!(job = "box_office", week = %report.week, outcome = ?report.outcome, "{}", report.message);
            }
            Err(e) => warn!(job = "box_office", "{}", e),
        }
    }

    fn try_begin(&self, trigger: TriggerKind, week: WeekKey) -> Result<RunGuard<'_>, AlreadyRunning> {
        let mut phase = self.phase.lock();
        if let Phase::Running { trigger: active, week: active_week, .. } = &*phase {
            warn!(job = "box_office", requested = %trigger, active = %active, week = %active_week, "Sync already running, rejecting trigger");
            return Err(AlreadyRunning);
        }
        *phase = Phase::Running {
            trigger,
            week,
            started_at: Utc::now(),
        };
        Ok(RunGuard { phase: &self.phase })
    }

    async fn trigger(&self, trigger: TriggerKind, week: WeekKey) -> Result<RunReport, AlreadyRunning> {
        let _guard = self.try_begin(trigger, week)?;

        let mut record = RunRecord {
            id: Uuid::new_v4(),
            trigger,
            week: Some(week),
            started_at: Utc::now(),
            finished_at: None,
            counts: RunCounts::default(),
            outcome: None,
            error: None,
        };
        info!(job = "box_office", run_id = %record.id, trigger = %trigger, week = %week, "Starting box office sync");

        let result = if week.is_valid() {
            self.execute(trigger, week, &mut record.counts).await
        } else {
            Err(PipelineError::InvalidWeek(week))
        };

        let (outcome, message) = match result {
            Ok(RunOutcome::AlreadyExists) => (
                RunOutcome::AlreadyExists,
                format!("Week {} is already stored", week),
            ),
            Ok(outcome) => (
                outcome,
                format!(
                    "Week {}: {} found, {} matched, {} added",
                    week, record.counts.found, record.counts.matched, record.counts.added
                ),
            ),
            Err(PipelineError::Source(SourceError::NotFound(_))) => {
                (RunOutcome::NoData, format!("No box office data for week {}", week))
            }
            Err(e) => {
                error!(job = "box_office", run_id = %record.id, week = %week, error = %e, "Box office sync failed");
                record.error = Some(e.to_string());
                (RunOutcome::Failed, e.to_string())
            }
        };

        record.outcome = Some(outcome);
        record.finished_at = Some(Utc::now());
        let report = RunReport {
            run_id: record.id,
            week,
            outcome,
            counts: record.counts,
            message,
        };
        info!(
            job = "box_office",
            run_id = %record.id,
            week = %week,
            outcome = ?outcome,
            found = record.counts.found,
            matched = record.counts.matched,
            added = record.counts.added,
            "Box office sync finished"
        );
        self.push_history(record);

        Ok(report)
    }

    fn push_history(&self, record: RunRecord) {
        let mut history = self.history.lock();
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    async fn execute(
        &self,
        trigger: TriggerKind,
        week: WeekKey,
        counts: &mut RunCounts,
    ) -> Result<RunOutcome, PipelineError> {
        if self.store.exists(week).await? {
            debug!(job = "box_office", week = %week, "Snapshot exists, skipping fetch");
            return Ok(RunOutcome::AlreadyExists);
        }

        // Edits saved from here on apply to the next run
        let settings = self.settings.acquisition();

        let requested = (trigger == TriggerKind::Backfill).then_some(week);
        let entries = self.source.fetch(requested).await?;
        counts.found = entries.len();

        let index = self.library.index().await?;
        let matches = match_entries(&entries, &index);
        counts.matched = matches.iter().filter(|m| m.is_matched()).count();
        let profiles = self.library.list_quality_profiles().await?;

        let unmatched_at: Vec<usize> = matches
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_matched())
            .map(|(i, _)| i)
            .collect();

        // One slot per entry; decisions land by position, not by rank
        let mut decisions: Vec<Option<AcquisitionDecision>> = entries.iter().map(|_| None).collect();
        if settings.enabled && !unmatched_at.is_empty() {
            let unmatched: Vec<BoxOfficeEntry> = unmatched_at.iter().map(|&i| entries[i].clone()).collect();
            let folders = self.library.list_root_folders().await?;
            let engine = AcquisitionEngine::prepare(settings.clone(), &folders, &profiles, self.detector.clone())?;
            let results = engine.run(&unmatched, &self.library, week).await;
            counts.added = results.iter().filter(|d| d.added).count();
            for (i, decision) in unmatched_at.into_iter().zip(results) {
                decisions[i] = Some(decision);
            }
        }

        let upgrade = settings
            .upgrade_quality_profile
            .as_deref()
            .and_then(|name| find_profile(&profiles, name));
        let rows: Vec<SnapshotRow> = entries
            .into_iter()
            .zip(matches)
            .zip(decisions)
            .map(|((entry, matched), decision)| {
                let mut row = SnapshotRow {
                    entry,
                    matched,
                    decision,
                    status: None,
                };
                row.status = row
                    .library_item()
                    .map(|item| LiveStatus::from_item(item, &profiles, upgrade.as_ref()));
                row
            })
            .collect();

        match self.store.create(week, rows).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists(_)) => {
                warn!(job = "box_office", week = %week, "Snapshot appeared during the run, leaving it untouched");
                return Ok(RunOutcome::AlreadyExists);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(keep) = self.retention_weeks {
            match self.store.prune(keep).await {
                Ok(pruned) if !pruned.is_empty() => {
                    info!(job = "box_office", count = pruned.len(), "Pruned old snapshots");
                }
                Ok(_) => {}
                Err(e) => warn!(job = "box_office", error = %e, "Failed to prune old snapshots"),
            }
        }

        Ok(RunOutcome::Completed)
    }
}
