//! Rate limit metadata parsed from response headers.
//!
//! The retry engine only uses this to stretch its backoff: a rate-limited
//! attempt is never retried before the window the server announced has reset.

use http::HeaderMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Padding added to an announced reset time to absorb clock skew.
pub const RESET_PADDING: Duration = Duration::from_secs(1);

/// Information extracted from rate limit headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Requests allowed per window (`X-RateLimit-Limit`).
    pub limit: Option<u64>,

    /// Requests left in the current window (`X-RateLimit-Remaining`).
    pub remaining: Option<u64>,

    /// When the window resets (`X-RateLimit-Reset`, `RateLimit-Reset`).
    pub reset_at: Option<SystemTime>,

    /// How long to wait before retrying (`Retry-After`).
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// Extracts rate limit information from HTTP response headers.
    ///
    /// Parses:
    /// - `X-RateLimit-Limit` / `RateLimit-Limit`
    /// - `X-RateLimit-Remaining` / `RateLimit-Remaining`
    /// - `X-RateLimit-Reset` (Unix timestamp) / `RateLimit-Reset` (seconds from now)
    /// - `Retry-After` (seconds or HTTP date)
    ///
    /// # Examples
    ///
    /// ```
    /// use steadfast::RateLimitInfo;
    /// use http::HeaderMap;
    ///
    /// let mut headers = HeaderMap::new();
    /// headers.insert("x-ratelimit-limit", "5000".parse().unwrap());
    /// headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
    /// headers.insert("x-ratelimit-reset", "1700000000".parse().unwrap());
    ///
    /// let info = RateLimitInfo::from_headers(&headers);
    /// assert_eq!(info.limit, Some(5000));
    /// assert!(info.is_rate_limited());
    /// ```
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: parse_u64(headers, "x-ratelimit-limit")
                .or_else(|| parse_u64(headers, "ratelimit-limit")),
            remaining: parse_u64(headers, "x-ratelimit-remaining")
                .or_else(|| parse_u64(headers, "ratelimit-remaining")),
            reset_at: parse_rate_limit_reset(headers),
            retry_after: parse_retry_after(headers),
        }
    }

    /// Returns `true` if no rate limit headers were present.
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_at.is_none()
            && self.retry_after.is_none()
    }

    /// Returns `true` if this represents an active rate limit.
    ///
    /// A rate limit is active when `Retry-After` is present or no requests
    /// remain in the current window.
    pub fn is_rate_limited(&self) -> bool {
        self.retry_after.is_some() || self.remaining == Some(0)
    }

    /// Returns the time left until the window resets, or `None` if the reset
    /// time is unknown or already passed.
    pub fn time_until_reset(&self) -> Option<Duration> {
        self.reset_at?.duration_since(SystemTime::now()).ok()
    }

    /// When the window resets, estimating it from `Retry-After` if the server
    /// sent no explicit reset time.
    pub fn effective_reset(&self) -> Option<SystemTime> {
        self.reset_at
            .or_else(|| Some(SystemTime::now() + self.retry_after?))
    }

    /// Returns the minimum wait before the next attempt.
    ///
    /// With a known reset time this is the time until reset plus
    /// [`RESET_PADDING`], or `None` if even the padded reset is in the past.
    /// Without one it falls back to `Retry-After`.
    pub fn backoff_floor(&self) -> Option<Duration> {
        match self.reset_at {
            Some(reset_at) => reset_floor(reset_at),
            None => self.retry_after,
        }
    }
}

/// Time until `reset_at` plus [`RESET_PADDING`], if that is still ahead.
pub(crate) fn reset_floor(reset_at: SystemTime) -> Option<Duration> {
    if reset_at == UNIX_EPOCH {
        return None;
    }
    (reset_at + RESET_PADDING)
        .duration_since(SystemTime::now())
        .ok()
}

fn parse_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Parses the Retry-After header.
///
/// Supports both delay-seconds (integer) and HTTP-date formats.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date_time = httpdate::parse_http_date(header).ok()?;
    Some(
        date_time
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// Parses the reset time.
///
/// `X-RateLimit-Reset` carries a Unix timestamp; the draft-standard
/// `RateLimit-Reset` carries seconds until reset.
fn parse_rate_limit_reset(headers: &HeaderMap) -> Option<SystemTime> {
    if let Some(timestamp) = parse_u64(headers, "x-ratelimit-reset") {
        if timestamp > 0 {
            return Some(UNIX_EPOCH + Duration::from_secs(timestamp));
        }
    }

    parse_u64(headers, "ratelimit-reset")
        .map(|seconds| SystemTime::now() + Duration::from_secs(seconds))
}
