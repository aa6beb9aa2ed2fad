//! Response outcome classification for pooled accounts
//!
//! Callers making requests with a checked-out account translate each response
//! into an [`Outcome`] and hand it to [`Pool::report`](crate::Pool::report).
//! Only responses that reject the credential itself deactivate an account;
//! rate limits lock the queue and everything else releases it.

use chrono::{DateTime, TimeDelta, Utc};

/// Lock applied to a rate-limited queue when the response carries no reset time.
pub const DEFAULT_RATE_LIMIT_LOCK: TimeDelta = TimeDelta::minutes(15);

/// Phrases in a 403 body meaning the account itself is suspended or locked,
/// as opposed to the request being forbidden.
const BAN_PATTERNS: &[&str] = &[
    "suspended",
    "locked",
    "temporarily restricted",
    "could not authenticate",
];

/// What a response means for the account that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Queue exhausted for this account until `until`.
    RateLimited { until: DateTime<Utc> },
    /// Credential rejected; the reason is recorded as the account's error.
    Banned(String),
    /// Anything else. Release the account without penalty.
    Transient,
}

/// Classify a response by status code, body and optional rate-limit reset
/// (epoch seconds, e.g. from an `x-rate-limit-reset` header).
pub fn classify_status(status: u16, body: &str, rate_limit_reset: Option<i64>) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        429 => Outcome::RateLimited {
            until: rate_limit_reset
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or_else(|| Utc::now() + DEFAULT_RATE_LIMIT_LOCK),
        },
        401 => Outcome::Banned(format!("unauthorized (401): {}", preview(body))),
        403 => match ban_phrase(body) {
            Some(phrase) => Outcome::Banned(format!("{phrase} (403): {}", preview(body))),
            None => Outcome::Transient,
        },
        _ => Outcome::Transient,
    }
}

fn ban_phrase(body: &str) -> Option<&'static str> {
    let lower = body.to_lowercase();
    BAN_PATTERNS
        .iter()
        .copied()
        .find(|pattern| lower.contains(pattern))
}

fn preview(body: &str) -> String {
    body.trim().chars().take(120).collect()
}
