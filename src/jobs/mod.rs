//! Background job scheduling

pub mod box_office;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SettingsHandle;
use crate::error::AlreadyRunning;
use crate::types::{RunRecord, WeekKey};

pub use box_office::{Orchestrator, OrchestratorState, Phase, RunReport};

/// Scheduler status as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerState {
    pub enabled: bool,
    pub cron: String,
    pub next_run: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub orchestrator: OrchestratorState,
}

/// Cron trigger for the box office sync.
///
/// Owns at most one job; [`BoxOfficeScheduler::reload`] swaps it for one
/// built from the current schedule settings.
pub struct BoxOfficeScheduler {
    scheduler: JobScheduler,
    orchestrator: Arc<Orchestrator>,
    settings: SettingsHandle,
    job_id: Mutex<Option<Uuid>>,
}

impl BoxOfficeScheduler {
    pub async fn new(orchestrator: Arc<Orchestrator>, settings: SettingsHandle) -> anyhow::Result<Self> {
        Ok(Self {
            scheduler: JobScheduler::new().await?,
            orchestrator,
            settings,
            job_id: Mutex::new(None),
        })
    }

    /// Arm the job from the current settings and start ticking
    pub async fn start(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let next = self.reload().await?;
        self.scheduler.start().await?;
        Ok(next)
    }

    /// Re-read the schedule settings and replace the cron job.
    ///
    /// Returns the next fire time, or `None` when scheduling is disabled. An
    /// invalid cron expression is rejected before the armed job is touched.
    pub async fn reload(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let schedule = self.settings.schedule();
        let cron = normalize_cron(&schedule.cron);
        let job = if schedule.enabled {
            let orchestrator = self.orchestrator.clone();
            Some(Job::new_async(cron.as_str(), move |_uuid, _l| {
                let orchestrator = orchestrator.clone();
                Box::pin(async move {
                    info!(job = "box_office", "Running scheduled box office sync");
                    orchestrator.run_scheduled().await;
                })
            })?)
        } else {
            None
        };

        let mut job_id = self.job_id.lock().await;
        if let Some(id) = job_id.take() {
            self.scheduler.remove(&id).await?;
        }

        let Some(job) = job else {
            info!(job = "box_office", "Box office schedule disabled");
            return Ok(None);
        };
        let id = self.scheduler.add(job).await?;
        *job_id = Some(id);

        let next = self.next_tick(id).await;
        info!(job = "box_office", cron = %cron, next_run = ?next, "Box office schedule armed");
        Ok(next)
    }

    async fn next_tick(&self, id: Uuid) -> Option<DateTime<Utc>> {
        let mut scheduler = self.scheduler.clone();
        match scheduler.next_tick_for_job(id).await {
            Ok(next) => next,
            Err(e) => {
                warn!(job = "box_office", error = %e, "Could not read next fire time");
                None
            }
        }
    }

    pub async fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        let id = (*self.job_id.lock().await)?;
        self.next_tick(id).await
    }

    pub async fn state(&self) -> SchedulerState {
        let schedule = self.settings.schedule();
        SchedulerState {
            enabled: schedule.enabled,
            cron: schedule.cron,
            next_run: self.next_fire_time().await,
            orchestrator: self.orchestrator.state(),
        }
    }

    pub async fn trigger_now(&self) -> Result<RunReport, AlreadyRunning> {
        self.orchestrator.trigger_now().await
    }

    pub async fn trigger_backfill(&self, year: i32, week: u32) -> Result<RunReport, AlreadyRunning> {
        self.orchestrator.trigger_backfill(WeekKey::new(year, week)).await
    }

    pub fn run_history(&self) -> Vec<RunRecord> {
        self.orchestrator.run_history()
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        info!("Job scheduler stopped");
        Ok(())
    }
}

/// Turn a crontab expression into the six-field form the scheduler parses.
///
/// Five-field expressions get a leading seconds field, and numeric weekdays
/// become names so `0`/`7` mean Sunday as in crontab.
pub fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        weekday_names(fields[4])
    )
}

fn weekday_names(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = range
                .split('-')
                .map(|day| match day {
                    "0" | "7" => "Sun",
                    "1" => "Mon",
                    "2" => "Tue",
                    "3" => "Wed",
                    "4" => "Thu",
                    "5" => "Fri",
                    "6" => "Sat",
                    other => other,
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
