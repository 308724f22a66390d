//! Trakt API client for the weekly box office chart
//!
//! Endpoint: `GET /movies/boxoffice?extended=full`
//!
//! Trakt only publishes the current weekend. Requests for any other week fail
//! with `NotFound` without touching the network.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::rate_limiter::{RateLimitedClient, ResponseExt, RetryConfig, RetryHint, Retryable, retry_async};
use crate::error::SourceError;
use crate::types::{BoxOfficeEntry, EntryMetadata, ExternalIds, WeekKey};

/// Maximum number of ranked entries kept from a chart
pub const MAX_ENTRIES: usize = 10;

/// Fallback wait when a 429 carries no `Retry-After`
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// A source of ranked weekly box office charts
#[async_trait]
pub trait BoxOfficeSource: Send + Sync {
    /// Fetch the chart for `week`, or the current weekend when `None`
    async fn fetch(&self, week: Option<WeekKey>) -> Result<Vec<BoxOfficeEntry>, SourceError>;
}

impl Retryable for SourceError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            SourceError::Transient(_) => RetryHint::Backoff,
            SourceError::RateLimited { retry_after } => RetryHint::WaitThenRetryOnce(*retry_after),
            _ => RetryHint::Fatal,
        }
    }
}

/// Box office row from Trakt
#[derive(Debug, Clone, Deserialize)]
pub struct TraktBoxOfficeItem {
    pub revenue: Option<i64>,
    pub movie: TraktMovie,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraktMovie {
    pub title: Option<String>,
    pub year: Option<i32>,
    #[serde(default)]
    pub ids: TraktIds,
    pub overview: Option<String>,
    pub runtime: Option<u32>,
    pub certification: Option<String>,
    pub genres: Option<Vec<String>>,
    pub released: Option<String>,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraktIds {
    pub trakt: Option<i64>,
    pub slug: Option<String>,
    pub imdb: Option<String>,
    pub tmdb: Option<i64>,
}

/// Trakt API client with rate limiting and retry logic
pub struct TraktClient {
    client: RateLimitedClient,
    base_url: String,
    client_id: String,
    retry_config: RetryConfig,
    /// Week considered "current"; only settable in tests
    current_week: fn() -> WeekKey,
}

impl TraktClient {
    /// Create a new Trakt client
    pub fn new(
        base_url: &str,
        client_id: String,
        retry_config: RetryConfig,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: RateLimitedClient::for_trakt()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            retry_config,
            current_week: WeekKey::current,
        })
    }

    async fn fetch_once(&self, week: WeekKey) -> Result<Vec<BoxOfficeEntry>, SourceError> {
        let url = format!("{}/movies/boxoffice", self.base_url);
        let request = self
            .client
            .inner()
            .get(&url)
            .query(&[("extended", "full")])
            .header("Content-Type", "application/json")
            .header("trakt-api-version", "2")
            .header("trakt-api-key", &self.client_id);

        let response = self.client.send(request).await.map_err(|e| {
            // connect errors, timeouts and dropped bodies are all worth another try
            SourceError::Transient(e.to_string())
        })?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(SourceError::Auth(format!("Trakt returned {}", status)));
        }
        if response.is_rate_limited() {
            return Err(SourceError::RateLimited {
                retry_after: response.retry_after().unwrap_or(DEFAULT_RATE_LIMIT_WINDOW),
            });
        }
        if status == 404 {
            return Err(SourceError::NotFound(week));
        }
        if response.is_transient_error() {
            return Err(SourceError::Transient(format!("Trakt returned {}", status)));
        }
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SourceError::Rejected {
                status,
                message: message.chars().take(300).collect(),
            });
        }

        // A body cut short in transit is a transport failure, not bad JSON
        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Transient(format!("Trakt response body: {}", e)))?;
        let items: Vec<TraktBoxOfficeItem> =
            serde_json::from_slice(&body).map_err(|e| SourceError::Decode(e.to_string()))?;

        let entries = parse_box_office(items);
        if entries.is_empty() {
            return Err(SourceError::NotFound(week));
        }
        Ok(entries)
    }
}

#[async_trait]
impl BoxOfficeSource for TraktClient {
    async fn fetch(&self, week: Option<WeekKey>) -> Result<Vec<BoxOfficeEntry>, SourceError> {
        let current = (self.current_week)();
        let week = week.unwrap_or(current);
        if week != current {
            debug!(week = %week, current = %current, "Trakt has no historical box office charts");
            return Err(SourceError::NotFound(week));
        }

        info!(week = %week, "Fetching box office chart from Trakt");
        let entries = retry_async(|| self.fetch_once(week), &self.retry_config, "trakt_box_office").await?;
        info!(week = %week, count = entries.len(), "Fetched box office chart");
        Ok(entries)
    }
}

/// Convert Trakt rows into ranked entries, keeping the first [`MAX_ENTRIES`]
pub fn parse_box_office(items: Vec<TraktBoxOfficeItem>) -> Vec<BoxOfficeEntry> {
    items
        .into_iter()
        .take(MAX_ENTRIES)
        .enumerate()
        .map(|(idx, item)| {
            let movie = item.movie;
            let title = movie.title.unwrap_or_else(|| "Unknown".to_string());
            if movie.ids.tmdb.is_none() && movie.ids.imdb.is_none() {
                warn!(title = %title, "Box office entry has no external id");
            }
            BoxOfficeEntry {
                rank: idx as u32 + 1,
                title,
                year: movie.year,
                ids: ExternalIds {
                    primary: movie.ids.tmdb,
                    secondary: movie.ids.imdb.filter(|id| !id.is_empty()),
                },
                revenue: item.revenue,
                metadata: EntryMetadata {
                    genres: movie.genres.unwrap_or_default(),
                    certification: movie.certification.filter(|c| !c.is_empty()),
                    runtime: movie.runtime,
                    rating: movie.rating,
                    release_date: movie.released,
                    overview: movie.overview,
                },
            }
        })
        .collect()
}
