//! Outcome classification: decides whether an attempt should be retried.
//!
//! Rules, applied in order:
//!
//! 1. If the attempt failed with an error, retry iff [`Error::is_retryable`].
//! 2. Otherwise, if there is a response, retry on 429 and any 5xx status.
//!    Every other status, including all remaining 4xx, is final.
//! 3. With neither a response nor an error there is nothing to retry.

use crate::rate_limit::RateLimitInfo;
use crate::{Error, Result};
use http::StatusCode;

/// What the retry engine should do with an attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The outcome is transient; try again if attempts remain.
    Retry,
    /// The outcome is final, successful or not.
    Stop,
}

impl RetryDecision {
    /// Returns `true` for [`RetryDecision::Retry`].
    pub fn should_retry(self) -> bool {
        self == RetryDecision::Retry
    }
}

/// A response produced by a single attempt.
///
/// The retry engine never looks inside a response beyond its status code and
/// rate-limit metadata.
pub trait AttemptResponse {
    /// The response status.
    fn status(&self) -> StatusCode;

    /// Rate-limit metadata carried by the response, if any.
    fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        None
    }
}

impl<T> AttemptResponse for http::Response<T> {
    fn status(&self) -> StatusCode {
        http::Response::status(self)
    }

    fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        Some(RateLimitInfo::from_headers(self.headers())).filter(|info| !info.is_empty())
    }
}

impl AttemptResponse for reqwest::Response {
    fn status(&self) -> StatusCode {
        reqwest::Response::status(self)
    }

    fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        Some(RateLimitInfo::from_headers(self.headers())).filter(|info| !info.is_empty())
    }
}

/// Returns `true` if a response with this status should be retried.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Classifies the parts of an outcome.
///
/// # Examples
///
/// ```
/// use steadfast::{classify_parts, Error, RetryDecision};
/// use http::StatusCode;
///
/// assert_eq!(classify_parts(Some(StatusCode::BAD_GATEWAY), None), RetryDecision::Retry);
/// assert_eq!(classify_parts(Some(StatusCode::NOT_FOUND), None), RetryDecision::Stop);
/// assert_eq!(
///     classify_parts(None, Some(&Error::retryable("connection reset"))),
///     RetryDecision::Retry,
/// );
/// assert_eq!(classify_parts(None, None), RetryDecision::Stop);
/// ```
pub fn classify_parts(status: Option<StatusCode>, err: Option<&Error>) -> RetryDecision {
    let retry = match (err, status) {
        (Some(err), _) => err.is_retryable(),
        (None, Some(status)) => is_retryable_status(status),
        (None, None) => {
            tracing::debug!("Attempt produced neither a response nor an error");
            false
        }
    };

    if retry {
        RetryDecision::Retry
    } else {
        RetryDecision::Stop
    }
}

/// Classifies the outcome of one attempt.
pub fn classify<R: AttemptResponse>(outcome: &Result<R>) -> RetryDecision {
    match outcome {
        Ok(response) => classify_parts(Some(response.status()), None),
        Err(err) => classify_parts(None, Some(err)),
    }
}
