//! Rate limiting and retry logic for external API calls
//!
//! Provides rate-limited HTTP clients and a retry loop that knows the
//! difference between transient failures (backoff and retry), rate limiting
//! (wait for the advertised window, retry once) and permanent failures
//! (give up immediately without touching the retry budget).

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,
    /// Burst capacity (allows short bursts above the rate)
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            burst_size: 5,
        }
    }
}

/// A rate-limited HTTP client wrapper
pub struct RateLimitedClient {
    client: Client,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    name: String,
}

impl RateLimitedClient {
    /// Create a new rate-limited client
    pub fn new(name: &str, config: RateLimitConfig) -> reqwest::Result<Self> {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            limiter: Arc::new(RateLimiter::direct(quota)),
            name: name.to_string(),
        })
    }

    /// Create a client for the Trakt API
    pub fn for_trakt() -> reqwest::Result<Self> {
        // Trakt allows 1000 GETs per 5 minutes; stay well under it
        Self::new(
            "trakt",
            RateLimitConfig {
                requests_per_second: 2,
                burst_size: 5,
            },
        )
    }

    /// Create a client for a Radarr instance
    pub fn for_radarr() -> reqwest::Result<Self> {
        // Local service, but the full movie listing is expensive
        Self::new(
            "radarr",
            RateLimitConfig {
                requests_per_second: 10,
                burst_size: 20,
            },
        )
    }

    /// Wait for rate limit and send a prepared request
    pub async fn send(&self, request: RequestBuilder) -> reqwest::Result<Response> {
        self.wait_for_permit().await;
        debug!(client = %self.name, "Making rate-limited request");
        request.send().await
    }

    /// Get a reference to the underlying client for building requests
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Wait for a rate limit permit
    pub async fn wait_for_permit(&self) {
        self.limiter.until_ready().await;
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts for transient failures
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_interval: Duration,
    /// Maximum backoff duration
    pub max_interval: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Longest rate-limit window we are willing to sleep through
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(8),
            multiplier: 2.0,
            max_rate_limit_wait: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// Create an ExponentialBackoff from this config
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// How the retry loop should treat a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Back off and retry while the budget lasts
    Backoff,
    /// Sleep for the window, then retry exactly once
    WaitThenRetryOnce(Duration),
    /// Fail immediately
    Fatal,
}

/// Errors that can tell the retry loop what to do with them
pub trait Retryable {
    fn retry_hint(&self) -> RetryHint;
}

/// Execute an async operation with retry logic
pub async fn retry_async<T, E, Fut, F>(
    operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let mut attempts = 0;
    let mut rate_limit_retry_used = false;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        match err.retry_hint() {
            RetryHint::Fatal => {
                debug!(operation = %operation_name, error = %err, "Operation failed, not retrying");
                return Err(err);
            }
            RetryHint::WaitThenRetryOnce(window) => {
                if rate_limit_retry_used {
                    warn!(operation = %operation_name, error = %err, "Still rate limited after waiting");
                    return Err(err);
                }
                rate_limit_retry_used = true;
                let wait = window.min(config.max_rate_limit_wait);
                warn!(
                    operation = %operation_name,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limited, waiting for reset window"
                );
                tokio::time::sleep(wait).await;
                // The rate-limit retry does not consume the transient budget
                attempts -= 1;
            }
            RetryHint::Backoff => {
                if attempts >= config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts = attempts,
                        error = %err,
                        "Operation failed after max retries"
                    );
                    return Err(err);
                }

                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(
                            operation = %operation_name,
                            attempt = attempts,
                            error = %err,
                            retry_in_ms = duration.as_millis() as u64,
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

/// Helper trait for classifying HTTP responses
pub trait ResponseExt {
    /// Check if the response indicates rate limiting (429)
    fn is_rate_limited(&self) -> bool;

    /// Check if the response indicates a transient error that should be retried
    fn is_transient_error(&self) -> bool;

    /// Seconds from the `Retry-After` header, if present
    fn retry_after(&self) -> Option<Duration>;
}

impl ResponseExt for Response {
    fn is_rate_limited(&self) -> bool {
        self.status().as_u16() == 429
    }

    fn is_transient_error(&self) -> bool {
        let status = self.status().as_u16();
        // 500-599 (server errors), 408 (timeout)
        status == 408 || (500..600).contains(&status)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}
