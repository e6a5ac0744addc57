//! Retry engine: exponential backoff with jitter, honoring rate limits and
//! cancellation.
//!
//! [`execute_with_retry`] invokes an attempt function up to
//! `max_retries + 1` times. Each outcome is classified (see
//! [`crate::classify()`]); final outcomes are returned immediately and transient
//! ones are retried after a backoff delay. The wait between attempts is the
//! only suspension point and races against the [`CallContext`]'s cancellation
//! token and deadline.

use crate::classify::{classify, AttemptResponse, RetryDecision};
use crate::rate_limit::reset_floor;
use crate::{Error, Result};
use http::StatusCode;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How many times to retry and how long to wait in between.
///
/// A policy is immutable once constructed and is typically shared by every
/// call a client makes.
///
/// # Examples
///
/// ```
/// use steadfast::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10));
/// assert_eq!(policy.max_attempts(), 4);
///
/// // 100ms, 200ms, 400ms ... capped at 10s, before jitter
/// assert_eq!(policy.capped_delay(2), Duration::from_millis(400));
/// assert_eq!(policy.capped_delay(20), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    max_retries: u32,
    #[serde(with = "crate::serde_millis")]
    base_delay: Duration,
    #[serde(with = "crate::serde_millis")]
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// The number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The total number of attempts, `max_retries + 1`.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// The delay before the first retry, before jitter.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// The cap on the exponential delay, before jitter.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Returns `min(base_delay * 2^attempt, max_delay)`.
    ///
    /// `attempt` is zero-based: `0` is the wait after the first failed attempt.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|multiplier| self.base_delay.checked_mul(multiplier))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Returns the jittered delay to wait after the given (zero-based) attempt.
    ///
    /// Jitter is drawn uniformly from `[0, delay / 2)`, so the result never
    /// exceeds `1.5 * max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.capped_delay(attempt);
        let spread = u64::try_from((delay / 2).as_nanos()).unwrap_or(u64::MAX);
        if spread == 0 {
            return delay;
        }

        let jitter = rand::thread_rng().gen_range(0..spread);
        delay.saturating_add(Duration::from_nanos(jitter))
    }
}

/// Cancellation and deadline for one logical call.
///
/// Cancelling the token or reaching the deadline aborts a pending retry wait
/// immediately. An attempt that is already running is not interrupted.
///
/// # Examples
///
/// ```
/// use steadfast::CallContext;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ctx = CallContext::new().timeout(Duration::from_secs(30));
/// let handle = ctx.clone();
/// handle.cancel();
/// assert!(ctx.is_cancelled());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context with a fresh token and no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context driven by an existing cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Sets an absolute deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline `after` from now.
    pub fn timeout(self, after: Duration) -> Self {
        self.deadline(Instant::now() + after)
    }

    /// The context's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels every call using this context (or a clone of it).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn until_deadline(&self) {
        match self.deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Sleeps for `delay` unless cancelled or past the deadline first.
    pub async fn wait(&self, delay: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Drives `operation` to completion unless the context is cancelled or
    /// its deadline passes first, in which case `operation` is dropped.
    pub async fn run<T, Fut>(&self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = self.until_deadline() => Err(Error::DeadlineExceeded),
            result = operation => result,
        }
    }
}

/// The result of a retried call, with bookkeeping.
#[derive(Debug)]
pub struct RetryOutcome<R> {
    /// The final response or error.
    pub result: Result<R>,
    /// Number of times the attempt function was invoked.
    pub attempts: u32,
    /// Total time spent, including waits.
    pub elapsed: Duration,
}

/// Runs `attempt` under `policy`, retrying transient failures.
///
/// Returns the first final outcome. A final response is returned as `Ok`
/// whatever its status; interpreting non-2xx responses is up to the caller.
/// When every attempt fails transiently the result is
/// [`Error::MaxRetriesExceeded`] wrapping the last attempt's error. If the
/// last attempt returned a response instead, the wrapped error is a
/// [`Error::Retryable`] carrying its status. A cancelled or expired `ctx` ends the wait with
/// [`Error::Cancelled`] or [`Error::DeadlineExceeded`].
///
/// # Examples
///
/// ```
/// use steadfast::{execute_with_retry, CallContext, RetryPolicy};
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), steadfast::Error> {
/// let calls = AtomicU32::new(0);
/// let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
///
/// let response = execute_with_retry(&CallContext::new(), &policy, || async {
///     let status = if calls.fetch_add(1, Ordering::SeqCst) == 0 { 503 } else { 200 };
///     Ok(http::Response::builder().status(status).body(()).unwrap())
/// })
/// .await?;
///
/// assert_eq!(response.status(), 200);
/// assert_eq!(calls.load(Ordering::SeqCst), 2);
/// # Ok(())
/// # }
/// ```
pub async fn execute_with_retry<R, F, Fut>(
    ctx: &CallContext,
    policy: &RetryPolicy,
    attempt: F,
) -> Result<R>
where
    R: AttemptResponse,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    execute_with_retry_outcome(ctx, policy, attempt).await.result
}

/// Like [`execute_with_retry`], also reporting attempts made and time spent.
pub async fn execute_with_retry_outcome<R, F, Fut>(
    ctx: &CallContext,
    policy: &RetryPolicy,
    mut attempt: F,
) -> RetryOutcome<R>
where
    R: AttemptResponse,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts();
    let mut attempts = 0u32;

    loop {
        let outcome = attempt().await;
        attempts += 1;

        let finish = |result| RetryOutcome {
            result,
            attempts,
            elapsed: start.elapsed(),
        };

        if classify(&outcome) == RetryDecision::Stop {
            return finish(outcome);
        }

        match &outcome {
            Ok(response) => tracing::warn!(
                status = response.status().as_u16(),
                attempt = attempts,
                max_attempts = max_attempts,
                "Attempt returned a retryable status"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                attempt = attempts,
                max_attempts = max_attempts,
                "Attempt failed with a retryable error"
            ),
        }

        if attempts >= max_attempts {
            return finish(Err(exhausted(outcome, attempts)));
        }

        let mut delay = policy.backoff(attempts - 1);
        if let Some(floor) = rate_limit_floor(&outcome) {
            if floor > delay {
                tracing::info!(
                    rate_limit_delay_ms = floor.as_millis() as u64,
                    attempt = attempts,
                    "Rate limited - waiting for the window to reset"
                );
                delay = floor;
            }
        }

        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempts,
            "Retrying after delay"
        );

        if let Err(e) = ctx.wait(delay).await {
            tracing::debug!(error = %e, attempt = attempts, "Retry wait aborted");
            return finish(Err(e));
        }
    }
}

fn exhausted<R: AttemptResponse>(outcome: Result<R>, attempts: u32) -> Error {
    let last_error = match outcome {
        Ok(response) => {
            let status = response.status();
            Error::Retryable {
                message: format!("Server responded with {}", status),
                status: Some(status),
                source: None,
            }
        }
        Err(e) => e,
    };

    Error::MaxRetriesExceeded {
        attempts,
        last_error: Box::new(last_error),
    }
}

fn rate_limit_floor<R: AttemptResponse>(outcome: &Result<R>) -> Option<Duration> {
    match outcome {
        Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
            response.rate_limit_info()?.backoff_floor()
        }
        Err(Error::RateLimit {
            reset_at: Some(reset_at),
            ..
        }) => reset_floor(*reset_at),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitInfo;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::SystemTime;

    #[derive(Debug)]
    struct Reply {
        status: StatusCode,
        rate_limit: Option<RateLimitInfo>,
    }

    impl Reply {
        fn new(status: u16) -> Self {
            Self {
                status: StatusCode::from_u16(status).unwrap(),
                rate_limit: None,
            }
        }
    }

    impl AttemptResponse for Reply {
        fn status(&self) -> StatusCode {
            self.status
        }

        fn rate_limit_info(&self) -> Option<RateLimitInfo> {
            self.rate_limit.clone()
        }
    }

    fn scripted(
        calls: &Arc<AtomicU32>,
        script: fn(u32) -> Result<Reply>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<Reply>> + Send>> {
        let calls = calls.clone();
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let fut: std::pin::Pin<Box<dyn Future<Output = Result<Reply>> + Send>> =
                Box::pin(async move { script(n) });
            fut
        }
    }

    #[test]
    fn test_capped_delay_doubles_until_max() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.capped_delay(0), Duration::from_millis(100));
        assert_eq!(policy.capped_delay(1), Duration::from_millis(200));
        assert_eq!(policy.capped_delay(3), Duration::from_millis(800));
        assert_eq!(policy.capped_delay(4), Duration::from_secs(1));
        assert_eq!(policy.capped_delay(64), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
        let ceiling = policy.max_delay().mul_f64(1.5);

        for attempt in 0..40 {
            for _ in 0..50 {
                let delay = policy.backoff(attempt);
                let floor = policy.capped_delay(attempt);
                assert!(delay >= floor, "attempt {}: {:?} < {:?}", attempt, delay, floor);
                assert!(delay < floor + floor / 2 + Duration::from_nanos(1));
                assert!(delay <= ceiling);
            }
        }
    }

    #[test]
    fn test_zero_policy_has_no_delay() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(5), Duration::ZERO);
    }

    #[test]
    fn test_policy_serde_uses_millis() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_retries":2,"base_delay":10,"max_delay":100}"#).unwrap();
        assert_eq!(
            policy,
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(100))
        );

        let defaults: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_succeeds_after_server_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(100));
        let started = std::time::Instant::now();

        let outcome = execute_with_retry_outcome(
            &CallContext::new(),
            &policy,
            scripted(&calls, |n| Ok(Reply::new(if n < 2 { 500 } else { 200 }))),
        )
        .await;

        let response = outcome.result.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_with_responses() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50));

        let result = execute_with_retry(
            &CallContext::new(),
            &policy,
            scripted(&calls, |_| Ok(Reply::new(503))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(Error::MaxRetriesExceeded {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last_error, Error::Retryable { .. }));
                assert_eq!(last_error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
            }
            other => panic!("Expected MaxRetriesExceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_with_errors_keeps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(50));

        let result = execute_with_retry(
            &CallContext::new(),
            &policy,
            scripted(&calls, |n| Err(Error::retryable(format!("reset #{}", n)))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("reset #1"));
        assert!(matches!(err.last_error(), Error::Retryable { .. }));
    }

    #[tokio::test]
    async fn test_final_outcomes_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50));

        let response = execute_with_retry(
            &CallContext::new(),
            &policy,
            scripted(&calls, |_| Ok(Reply::new(404))),
        )
        .await
        .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = Arc::new(AtomicU32::new(0));
        let result = execute_with_retry(
            &CallContext::new(),
            &policy,
            scripted(&calls, |_| {
                Err(Error::Authentication {
                    message: "token revoked".to_string(),
                    source: None,
                })
            }),
        )
        .await;
        assert!(matches!(result, Err(Error::Authentication { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_makes_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = execute_with_retry(
            &CallContext::new(),
            &RetryPolicy::none(),
            scripted(&calls, |_| Ok(Reply::new(500))),
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::MaxRetriesExceeded { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(60));
        let ctx = CallContext::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let outcome = execute_with_retry_outcome(
            &ctx,
            &policy,
            scripted(&calls, |_| Ok(Reply::new(502))),
        )
        .await;

        assert!(matches!(outcome.result, Err(Error::Cancelled)));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcome.elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(5));
        let ctx = CallContext::new().timeout(Duration::from_millis(50));

        let result = execute_with_retry(
            &ctx,
            &policy,
            scripted(&calls, |_| Err(Error::retryable("timeout"))),
        )
        .await;

        assert!(matches!(result, Err(Error::DeadlineExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_races_context() {
        let ctx = CallContext::new().timeout(Duration::from_secs(1));
        assert_eq!(ctx.run(async { Ok(7) }).await.unwrap(), 7);

        let slow = ctx.run(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        assert!(matches!(slow.await, Err(Error::DeadlineExceeded)));

        let cancelled = CallContext::new();
        cancelled.cancel();
        let result: Result<()> = cancelled.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_reset_overrides_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(10));
        let started = Instant::now();

        let response = execute_with_retry(
            &CallContext::new(),
            &policy,
            scripted(&calls, |n| {
                if n == 0 {
                    Ok(Reply {
                        status: StatusCode::TOO_MANY_REQUESTS,
                        rate_limit: Some(RateLimitInfo {
                            limit: Some(60),
                            remaining: Some(0),
                            reset_at: Some(SystemTime::now() + Duration::from_secs(2)),
                            retry_after: None,
                        }),
                    })
                } else {
                    Ok(Reply::new(200))
                }
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_error_overrides_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(10));
        let started = Instant::now();

        let result = execute_with_retry(
            &CallContext::new(),
            &policy,
            scripted(&calls, |_| {
                Err(Error::RateLimit {
                    limit: 60,
                    remaining: 0,
                    reset_at: Some(SystemTime::now() + Duration::from_secs(3)),
                    message: "API rate limit exceeded".to_string(),
                    source: None,
                })
            }),
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::MaxRetriesExceeded { attempts: 2, .. })
        ));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
