//! Error taxonomy for calls made through the resilience layer.
//!
//! Every failure surfaced by this crate is an [`Error`]. The taxonomy members
//! (`Authentication`, `Authorization`, `NotFound`, `Validation`, `RateLimit`,
//! `Retryable`) are mutually exclusive tags, each carrying a human-readable
//! message, kind-specific fields and an optional underlying cause. The remaining
//! variants describe conditions raised by the layer itself, such as an open
//! circuit breaker or a cancelled retry wait.
//!
//! Whether an error may be retried is decided by [`Error::is_retryable`]. Errors
//! that originate outside this crate can opt into retries by implementing
//! [`ExternalError`] and being wrapped in [`Error::External`].

use crate::rate_limit::RateLimitInfo;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// A boxed, thread-safe error used as the optional cause of taxonomy errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Retryability capability for errors defined outside this crate.
///
/// Wrap such an error in [`Error::External`] (see [`Error::external`]) and the
/// retry engine will consult [`ExternalError::is_retryable`] instead of treating
/// it as an unknown, non-retryable failure.
///
/// # Examples
///
/// ```
/// use steadfast::{Error, ExternalError};
///
/// #[derive(Debug)]
/// struct LeaseExpired;
///
/// impl std::fmt::Display for LeaseExpired {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "lease expired")
///     }
/// }
///
/// impl std::error::Error for LeaseExpired {}
///
/// impl ExternalError for LeaseExpired {
///     fn is_retryable(&self) -> bool {
///         true
///     }
/// }
///
/// assert!(Error::external(LeaseExpired).is_retryable());
/// ```
pub trait ExternalError: std::error::Error + Send + Sync + 'static {
    /// Returns `true` if the operation that produced this error may be retried.
    fn is_retryable(&self) -> bool;
}

/// A single field-level problem reported by the remote API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// The resource the field belongs to, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// The offending field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// A machine-readable code such as `missing_field` or `invalid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// A human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A structured error payload decoded from a failed response.
///
/// The remote API reports failures as JSON of the form
/// `{"message": "...", "errors": [{"field": "...", "code": "..."}]}`.
/// Bodies that are not JSON are preserved verbatim as the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    /// The top-level error message.
    #[serde(default)]
    pub message: String,
    /// Field-level errors, mostly present on validation failures.
    #[serde(default, rename = "errors")]
    pub field_errors: Vec<FieldError>,
    /// The HTTP status code the body arrived with.
    #[serde(skip)]
    pub status_code: u16,
    /// The raw body text.
    #[serde(skip)]
    pub raw: String,
}

impl ApiErrorBody {
    /// Decodes a failure payload.
    ///
    /// # Examples
    ///
    /// ```
    /// use steadfast::ApiErrorBody;
    /// use http::StatusCode;
    ///
    /// let body = ApiErrorBody::decode(
    ///     StatusCode::UNPROCESSABLE_ENTITY,
    ///     r#"{"message":"Validation Failed","errors":[{"field":"title","code":"missing_field"}]}"#,
    /// );
    /// assert_eq!(body.message, "Validation Failed");
    /// assert_eq!(body.field_errors[0].field.as_deref(), Some("title"));
    ///
    /// let body = ApiErrorBody::decode(StatusCode::BAD_GATEWAY, "upstream down");
    /// assert_eq!(body.message, "upstream down");
    /// ```
    pub fn decode(status: StatusCode, raw: &str) -> Self {
        let mut body = match serde_json::from_str::<ApiErrorBody>(raw) {
            Ok(body) => body,
            Err(_) => ApiErrorBody {
                message: raw.trim().to_string(),
                ..Default::default()
            },
        };

        if body.message.is_empty() {
            body.message = status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string();
        }
        body.status_code = status.as_u16();
        body.raw = raw.to_string();
        body
    }
}

/// The main error type for calls made through the resilience layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The credentials were missing, invalid or expired (401).
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Description reported by the API.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The credentials are valid but lack access to the resource (403).
    #[error("Not authorized to access {resource}: {message}")]
    Authorization {
        /// The resource access was denied to.
        resource: String,
        /// Description reported by the API.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The resource does not exist (404).
    #[error("{resource} not found: {message}")]
    NotFound {
        /// The resource that was looked up.
        resource: String,
        /// Description reported by the API.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The API rejected the request payload (422).
    #[error("Validation failed: {message}")]
    Validation {
        /// Description reported by the API.
        message: String,
        /// Individual field problems, in the order the API reported them.
        field_errors: Vec<FieldError>,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The API's rate limit was exhausted (429).
    #[error("Rate limit exceeded ({remaining}/{limit} remaining): {message}")]
    RateLimit {
        /// Requests allowed per window.
        limit: u64,
        /// Requests left in the current window.
        remaining: u64,
        /// When the window resets, if the API said so.
        reset_at: Option<SystemTime>,
        /// Description reported by the API.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// A transient failure that is safe to retry.
    #[error("{message}")]
    Retryable {
        /// What went wrong.
        message: String,
        /// The response status, when the failure was a response.
        status: Option<StatusCode>,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Any other non-2xx response, passed through with its details.
    #[error("HTTP error {status}: {message}")]
    Api {
        /// The HTTP status code.
        status: StatusCode,
        /// Message decoded from the body.
        message: String,
        /// The raw response body.
        raw_response: String,
    },

    /// The circuit breaker refused to let the request through.
    ///
    /// No attempt was made; this never means the backend rejected anything.
    #[error("Circuit breaker is open; request was not attempted")]
    CircuitOpen,

    /// The call was cancelled while waiting to retry.
    #[error("Request cancelled while waiting to retry")]
    Cancelled,

    /// The call's deadline passed while waiting to retry.
    #[error("Deadline exceeded while waiting to retry")]
    DeadlineExceeded,

    /// All attempts were used up.
    ///
    /// `last_error` carries the final failure. When the last attempt produced a
    /// failing response rather than an error, it is a [`Error::Retryable`]
    /// holding that response's status.
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        /// The number of attempts made.
        attempts: u32,
        /// The last failure encountered.
        last_error: Box<Error>,
    },

    /// A transport failure that is not known to be transient.
    #[error("Network error: {0}")]
    Transport(#[source] reqwest::Error),

    /// A 2xx response body did not match the expected type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize.
        raw_response: String,
        /// The serde error message.
        serde_error: String,
        /// The HTTP status code.
        status: StatusCode,
    },

    /// The request body could not be serialized.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// Invalid client or request configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// An error defined outside this crate that knows its own retryability.
    #[error("{0}")]
    External(Box<dyn ExternalError>),

    /// An error of unknown kind. Never retried.
    #[error("{0}")]
    Other(BoxError),
}

impl Error {
    /// Creates a [`Error::Retryable`] with no status or cause.
    pub fn retryable(message: impl Into<String>) -> Self {
        Error::Retryable {
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Wraps an error that implements the [`ExternalError`] capability.
    pub fn external(err: impl ExternalError) -> Self {
        Error::External(Box::new(err))
    }

    /// Wraps an error of unknown kind.
    pub fn other(err: impl Into<BoxError>) -> Self {
        Error::Other(err.into())
    }

    /// Returns `true` if this error is retryable.
    ///
    /// Only [`Error::Retryable`] and [`Error::RateLimit`] are retryable among
    /// the built-in kinds; [`Error::External`] defers to its own capability.
    /// Everything else, including [`Error::Other`], is not.
    ///
    /// # Examples
    ///
    /// ```
    /// use steadfast::Error;
    ///
    /// assert!(Error::retryable("connection reset").is_retryable());
    /// assert!(!Error::CircuitOpen.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Retryable { .. } | Error::RateLimit { .. } => true,
            Error::External(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns `true` if the circuit breaker refused the request.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen)
    }

    /// Returns the HTTP status code associated with this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Authentication { .. } => Some(StatusCode::UNAUTHORIZED),
            Error::Authorization { .. } => Some(StatusCode::FORBIDDEN),
            Error::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            Error::Validation { .. } => Some(StatusCode::UNPROCESSABLE_ENTITY),
            Error::RateLimit { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            Error::Retryable { status, .. } => *status,
            Error::Api { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::MaxRetriesExceeded { last_error, .. } => last_error.status(),
            Error::Transport(err) => err.status(),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Api { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            Error::MaxRetriesExceeded { last_error, .. } => last_error.raw_response(),
            _ => None,
        }
    }

    /// Returns when the rate limit resets, for [`Error::RateLimit`] errors.
    pub fn rate_limit_reset(&self) -> Option<SystemTime> {
        match self {
            Error::RateLimit { reset_at, .. } => *reset_at,
            Error::MaxRetriesExceeded { last_error, .. } => last_error.rate_limit_reset(),
            _ => None,
        }
    }

    /// Returns the innermost error, unwrapping [`Error::MaxRetriesExceeded`].
    pub fn last_error(&self) -> &Error {
        match self {
            Error::MaxRetriesExceeded { last_error, .. } => last_error.last_error(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::Retryable {
                message: format!("Transient network error: {}", err),
                status: None,
                source: Some(Box::new(err)),
            }
        } else {
            Error::Transport(err)
        }
    }
}

/// Returns `true` if `err` is retryable. See [`Error::is_retryable`].
pub fn classify_error(err: &Error) -> bool {
    err.is_retryable()
}

/// Maps a failed response onto the error taxonomy.
///
/// `resource` names what was being accessed (typically the request path) and
/// `rate_limit` carries any rate-limit metadata parsed from the response.
///
/// | Status | Error |
/// |---|---|
/// | 401 | [`Error::Authentication`] |
/// | 403 | [`Error::Authorization`] |
/// | 404 | [`Error::NotFound`] |
/// | 422 | [`Error::Validation`] (field errors preserved) |
/// | 429 | [`Error::RateLimit`] |
/// | other | [`Error::Api`] |
///
/// # Examples
///
/// ```
/// use steadfast::{map_status_to_error, ApiErrorBody, Error};
/// use http::StatusCode;
///
/// let body = ApiErrorBody::decode(StatusCode::NOT_FOUND, r#"{"message":"Not Found"}"#);
/// let err = map_status_to_error(StatusCode::NOT_FOUND, body, "/repos/acme/widgets", None);
/// assert!(matches!(err, Error::NotFound { .. }));
/// ```
pub fn map_status_to_error(
    status: StatusCode,
    body: ApiErrorBody,
    resource: &str,
    rate_limit: Option<&RateLimitInfo>,
) -> Error {
    let ApiErrorBody {
        message,
        field_errors,
        raw,
        ..
    } = body;

    match status.as_u16() {
        401 => Error::Authentication {
            message,
            source: None,
        },
        403 => Error::Authorization {
            resource: resource.to_string(),
            message,
            source: None,
        },
        404 => Error::NotFound {
            resource: resource.to_string(),
            message,
            source: None,
        },
        422 => Error::Validation {
            message,
            field_errors,
            source: None,
        },
        429 => Error::RateLimit {
            limit: rate_limit.and_then(|info| info.limit).unwrap_or(0),
            remaining: rate_limit.and_then(|info| info.remaining).unwrap_or(0),
            reset_at: rate_limit.and_then(|info| info.reset_at),
            message,
            source: None,
        },
        _ => Error::Api {
            status,
            message,
            raw_response: raw,
        },
    }
}

/// A specialized `Result` type for calls made through the resilience layer.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky dependency")
        }
    }

    impl std::error::Error for Flaky {}

    impl ExternalError for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    fn body(status: StatusCode, raw: &str) -> ApiErrorBody {
        ApiErrorBody::decode(status, raw)
    }

    #[test]
    fn test_retryability_by_kind() {
        assert!(Error::retryable("reset by peer").is_retryable());
        assert!(Error::RateLimit {
            limit: 5000,
            remaining: 0,
            reset_at: None,
            message: "slow down".to_string(),
            source: None,
        }
        .is_retryable());

        assert!(!Error::Authentication {
            message: "bad token".to_string(),
            source: None,
        }
        .is_retryable());
        assert!(!Error::NotFound {
            resource: "/x".to_string(),
            message: "gone".to_string(),
            source: None,
        }
        .is_retryable());
        assert!(!Error::CircuitOpen.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::other("mystery").is_retryable());
    }

    #[test]
    fn test_external_capability() {
        assert!(classify_error(&Error::external(Flaky(true))));
        assert!(!classify_error(&Error::external(Flaky(false))));
    }

    #[test]
    fn test_map_status_to_error() {
        let err = map_status_to_error(
            StatusCode::UNAUTHORIZED,
            body(StatusCode::UNAUTHORIZED, r#"{"message":"Bad credentials"}"#),
            "/user",
            None,
        );
        match err {
            Error::Authentication { message, .. } => assert_eq!(message, "Bad credentials"),
            other => panic!("Expected Authentication, got {:?}", other),
        }

        let err = map_status_to_error(
            StatusCode::FORBIDDEN,
            body(StatusCode::FORBIDDEN, "{}"),
            "/orgs/acme",
            None,
        );
        match err {
            Error::Authorization {
                resource, message, ..
            } => {
                assert_eq!(resource, "/orgs/acme");
                assert_eq!(message, "Forbidden");
            }
            other => panic!("Expected Authorization, got {:?}", other),
        }

        let err = map_status_to_error(
            StatusCode::NOT_FOUND,
            body(StatusCode::NOT_FOUND, "missing"),
            "/repos/acme/x",
            None,
        );
        assert!(matches!(err, Error::NotFound { ref resource, .. } if resource == "/repos/acme/x"));

        let err = map_status_to_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            body(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            "/x",
            None,
        );
        match err {
            Error::Api {
                status,
                raw_response,
                ..
            } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(raw_response, "boom");
            }
            other => panic!("Expected Api, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_preserves_field_errors() {
        let raw = r#"{
            "message": "Validation Failed",
            "errors": [
                {"resource": "Issue", "field": "title", "code": "missing_field"},
                {"resource": "Issue", "field": "labels", "code": "invalid", "message": "unknown label"}
            ]
        }"#;
        let err = map_status_to_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            body(StatusCode::UNPROCESSABLE_ENTITY, raw),
            "/issues",
            None,
        );

        match err {
            Error::Validation { field_errors, .. } => {
                assert_eq!(field_errors.len(), 2);
                assert_eq!(field_errors[0].field.as_deref(), Some("title"));
                assert_eq!(field_errors[1].message.as_deref(), Some("unknown label"));
            }
            other => panic!("Expected Validation, got {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_mapping_uses_metadata() {
        let reset_at = SystemTime::now() + Duration::from_secs(60);
        let info = RateLimitInfo {
            limit: Some(5000),
            remaining: Some(0),
            reset_at: Some(reset_at),
            retry_after: None,
        };
        let err = map_status_to_error(
            StatusCode::TOO_MANY_REQUESTS,
            body(StatusCode::TOO_MANY_REQUESTS, "{}"),
            "/search",
            Some(&info),
        );

        match &err {
            Error::RateLimit {
                limit,
                remaining,
                reset_at: got,
                ..
            } => {
                assert_eq!(*limit, 5000);
                assert_eq!(*remaining, 0);
                assert_eq!(*got, Some(reset_at));
            }
            other => panic!("Expected RateLimit, got {:?}", other),
        }
        assert!(err.is_retryable());
        assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_exhaustion_keeps_last_error() {
        let err = Error::MaxRetriesExceeded {
            attempts: 3,
            last_error: Box::new(Error::Retryable {
                message: "Server responded with 503 Service Unavailable".to_string(),
                status: Some(StatusCode::SERVICE_UNAVAILABLE),
                source: None,
            }),
        };

        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(err.to_string().contains("503"));
        assert!(matches!(err.last_error(), Error::Retryable { .. }));
    }

    #[test]
    fn test_source_is_exposed() {
        use std::error::Error as _;

        let err = Error::Retryable {
            message: "read failed".to_string(),
            status: None,
            source: Some(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))),
        };
        assert_eq!(err.source().map(|s| s.to_string()), Some("reset".to_string()));
    }
}
