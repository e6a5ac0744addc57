//! # Steadfast - resilient access to remote HTTP APIs
//!
//! Steadfast wraps `reqwest` with the pieces a long-running service needs
//! when talking to an API it does not control:
//!
//! - **Error taxonomy** - failures are mapped onto [`Error`] kinds
//!   (authentication, authorization, not found, validation, rate limit,
//!   retryable) that callers can match on. Each kind knows whether it is
//!   worth retrying.
//! - **Retry engine** - [`execute_with_retry`] retries transient failures with
//!   capped exponential backoff and jitter. It waits out announced rate-limit
//!   windows and stops early on cancellation or a deadline.
//! - **Circuit breaker** - [`CircuitBreaker`] fails fast after repeated
//!   failures and probes for recovery after a cool-down.
//! - **Response cache** - [`MemoryCache`] keeps GET responses for a TTL,
//!   remembers their ETags and sweeps expired entries in the background.
//!
//! [`Client`] combines all four. Each piece is also usable on its own.
//!
//! ## Quick Start
//!
//! ```no_run
//! use steadfast::{CircuitBreakerConfig, Client, RetryPolicy};
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Repository {
//!     full_name: String,
//!     stargazers_count: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), steadfast::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")?
//!         .timeout(Duration::from_secs(10))
//!         .retry_policy(RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(5)))
//!         .circuit_breaker(CircuitBreakerConfig::default().with_max_failures(5))
//!         .build()?;
//!
//!     let repo = client.get::<Repository>("/repos/acme/widgets").await?;
//!     println!("{} has {} stars", repo.full_name, repo.stargazers_count);
//!
//!     // The second read is served from the cache.
//!     let again = client.get::<Repository>("/repos/acme/widgets").await?;
//!     assert!(again.from_cache);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! ```no_run
//! use steadfast::{Client, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.get::<serde_json::Value>("/repos/acme/widgets").await {
//!     Ok(response) => println!("{:?}", response.data),
//!     Err(Error::NotFound { resource, .. }) => eprintln!("{} does not exist", resource),
//!     Err(Error::Validation { field_errors, .. }) => {
//!         for field in field_errors {
//!             eprintln!("{:?}: {:?}", field.field, field.code);
//!         }
//!     }
//!     Err(Error::CircuitOpen) => eprintln!("Backend unhealthy, try later"),
//!     Err(e) if e.is_retryable() => eprintln!("Transient failure: {}", e),
//!     Err(e) => eprintln!("Request failed: {}", e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Using the pieces directly
//!
//! ```
//! use steadfast::{CircuitBreaker, CircuitBreakerConfig, Error};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default().with_max_failures(1));
//!
//! let first: Result<(), Error> = breaker.call(async { Err(Error::retryable("reset")) }).await;
//! assert!(first.is_err());
//!
//! let second: Result<(), Error> = breaker.call(async { Ok(()) }).await;
//! assert!(matches!(second, Err(Error::CircuitOpen)));
//! # }
//! ```

pub mod cache;
mod circuit_breaker;
mod classify;
mod client;
mod error;
pub mod metadata;
pub mod rate_limit;
mod response;
pub mod retry;
mod serde_millis;

pub use cache::{generate_cache_key, Cache, CacheConfig, CacheStats, MemoryCache, NoOpCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classify::{classify, classify_parts, is_retryable_status, AttemptResponse, RetryDecision};
pub use client::{CachedResponse, Client, ClientBuilder};
pub use error::{
    classify_error, map_status_to_error, ApiErrorBody, BoxError, Error, ExternalError, FieldError,
    Result,
};
pub use metadata::RequestMetadata;
pub use rate_limit::RateLimitInfo;
pub use response::Response;
pub use retry::{
    execute_with_retry, execute_with_retry_outcome, CallContext, RetryOutcome, RetryPolicy,
};
