use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use waypoint_core::config::RetryConfig;
use waypoint_core::types::ProviderError;

/// Base of the exponential fallback, in seconds.
pub const RETRY_BASE_DELAY: f64 = 2.0;
/// Upper bound on any computed delay, in seconds.
pub const RETRY_MAX_DELAY: f64 = 120.0;

/// Compute how long to wait before retry `attempt` (0-based), in seconds.
///
/// Server hints win over backoff: `retry-after-ms` (milliseconds) first, then
/// `retry-after` (seconds or an HTTP-date). Negative hints clamp to zero and
/// every result is capped at `max_delay`. Without a usable hint the delay is
/// `2 * 2^attempt`.
pub fn compute_retry_delay(attempt: u32, error: Option<&ProviderError>, max_delay: f64) -> f64 {
    compute_retry_delay_with_base(attempt, error, RETRY_BASE_DELAY, max_delay)
}

pub fn compute_retry_delay_with_base(
    attempt: u32,
    error: Option<&ProviderError>,
    base_delay: f64,
    max_delay: f64,
) -> f64 {
    if let Some(hint) = error.and_then(|e| retry_hint(e, Utc::now())) {
        return hint.clamp(0.0, max_delay);
    }
    let exp = base_delay * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
    exp.min(max_delay)
}

/// Extract the server-provided delay in seconds, if any header parses.
fn retry_hint(error: &ProviderError, now: DateTime<Utc>) -> Option<f64> {
    if let Some(raw) = error.header("retry-after-ms") {
        match parse_finite(raw) {
            Some(ms) => return Some(ms / 1000.0),
            None => debug!(value = raw, "Ignoring unparsable retry-after-ms header"),
        }
    }

    let raw = error.header("retry-after")?;
    if let Some(secs) = parse_finite(raw) {
        return Some(secs);
    }
    match DateTime::parse_from_rfc2822(raw.trim()) {
        Ok(date) => {
            let delta = date.with_timezone(&Utc) - now;
            Some(delta.num_milliseconds() as f64 / 1000.0)
        }
        Err(_) => {
            debug!(value = raw, "Ignoring unparsable retry-after header");
            None
        }
    }
}

fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Bounded retry schedule for streamed model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` (0-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retrying after `attempt` failed with `error`.
    pub fn delay(&self, attempt: u32, error: Option<&ProviderError>) -> Duration {
        let secs =
            compute_retry_delay_with_base(attempt, error, self.base_delay_secs, self.max_delay_secs);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_secs: config.base_delay_secs,
            max_delay_secs: config.max_delay_secs,
        }
    }
}
