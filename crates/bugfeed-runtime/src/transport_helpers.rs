//! Retry and error-formatting helpers shared by the tracker REST client.

use std::time::Duration;

const MAX_BACKOFF_SHIFT: usize = 6;

pub fn is_retryable_tracker_status(status: u16) -> bool {
    status == 408 || status == 409 || status == 425 || status == 429 || status >= 500
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Parses a `retry-after` header expressed in whole seconds.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

/// Exponential backoff from `base_delay_ms`, floored by a server hint.
pub fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after: Option<Duration>) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    let backoff = Duration::from_millis(base_delay_ms.max(1).saturating_mul(1_u64 << shift));
    match retry_after {
        Some(retry_after) => backoff.max(retry_after),
        None => backoff,
    }
}

pub fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
