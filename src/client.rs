//! HTTP client that routes every call through the circuit breaker, the
//! response cache and the retry engine.
//!
//! For each call:
//!
//! 1. The breaker is asked whether requests may proceed; if not the call
//!    fails fast with [`Error::CircuitOpen`].
//! 2. A GET is looked up in the cache. A fresh hit is returned without a
//!    request. A GET marked for revalidation sends `If-None-Match` instead.
//! 3. Otherwise the request runs under the retry policy.
//! 4. The final response is recorded on the breaker, cached if it is a
//!    successful GET, and either decoded or mapped onto [`Error`].

use crate::{
    cache::{Cache, CacheConfig, CacheStats, MemoryCache, NoOpCache},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    classify::AttemptResponse,
    error::{map_status_to_error, ApiErrorBody},
    metadata::{parse_header, RequestMetadata},
    rate_limit::RateLimitInfo,
    retry::{execute_with_retry_outcome, CallContext, RetryOutcome, RetryPolicy},
    Error, Response, Result,
};
use http::{header, HeaderMap, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// A response body as stored in the client's cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Body exactly as received.
    pub raw_body: String,
    /// Status of the response that was cached.
    pub status: StatusCode,
    /// Headers of the response that was cached.
    pub headers: HeaderMap,
}

/// One attempt's response, body already read.
#[derive(Debug)]
struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl AttemptResponse for RawResponse {
    fn status(&self) -> StatusCode {
        self.status
    }
}

/// An HTTP client with retries, a circuit breaker and response caching.
///
/// Cloning is cheap; clones share the connection pool, the breaker and the
/// cache.
///
/// # Examples
///
/// ```no_run
/// use steadfast::{CacheConfig, CircuitBreakerConfig, Client, Response, RetryPolicy};
/// use std::time::Duration;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize)]
/// struct NewIssue {
///     title: String,
/// }
///
/// #[derive(Deserialize)]
/// struct Issue {
///     number: u64,
///     title: String,
/// }
///
/// # async fn example() -> Result<(), steadfast::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retry_policy(RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10)))
///     .circuit_breaker(CircuitBreakerConfig::default().with_max_failures(5))
///     .cache_config(CacheConfig::default().with_default_ttl(Duration::from_secs(60)))
///     .build()?;
///
/// let issue: Response<Issue> = client.get("/repos/acme/widgets/issues/1").await?;
/// println!("#{} {}", issue.number, issue.title);
///
/// let created: Response<Issue> = client
///     .post("/repos/acme/widgets/issues", &NewIssue { title: "Flaky build".into() })
///     .await?;
/// println!("Opened #{}", created.number);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http_client: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<dyn Cache<CachedResponse>>,
    cache_ttl: Duration,
    timeout: Option<Duration>,
    rate_limit_handling: bool,
}

impl Client {
    /// Starts configuring a new `Client`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The circuit breaker guarding this client.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// A snapshot of the response cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Makes a typed request with a fresh [`CallContext`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use steadfast::{Client, RequestMetadata};
    /// use http::Method;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct SearchResults { total_count: u64 }
    ///
    /// # async fn example() -> Result<(), steadfast::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let metadata = RequestMetadata::new(Method::GET, "/search/issues")
    ///     .with_query_param("q", "is:open label:bug");
    ///
    /// let response = client.call::<(), SearchResults>(metadata, None).await?;
    /// println!("{} open bugs", response.total_count);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<Req, Res>(
        &self,
        metadata: RequestMetadata,
        body: Option<&Req>,
    ) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.call_with_context(&CallContext::new(), metadata, body)
            .await
    }

    /// Makes a typed request that stops early when `ctx` is cancelled or its
    /// deadline passes.
    ///
    /// # Errors
    ///
    /// - [`Error::CircuitOpen`] if the breaker refuses the call.
    /// - [`Error::Cancelled`] or [`Error::DeadlineExceeded`] from `ctx`.
    /// - [`Error::MaxRetriesExceeded`] once retries are used up.
    /// - The error mapped from the status of a final non-2xx response.
    /// - [`Error::DeserializationFailed`] if a 2xx body does not decode.
    pub async fn call_with_context<Req, Res>(
        &self,
        ctx: &CallContext,
        metadata: RequestMetadata,
        body: Option<&Req>,
    ) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let start = Instant::now();
        let inner = &self.inner;

        if !inner.breaker.allow() {
            tracing::warn!(
                method = %metadata.method,
                path = %metadata.path,
                "Circuit breaker open - request refused"
            );
            return Err(Error::CircuitOpen);
        }

        let cache_key = (metadata.method == Method::GET).then(|| metadata.cache_key());
        let mut revalidating = None;
        if let Some(key) = &cache_key {
            if metadata.revalidate {
                revalidating = inner
                    .cache
                    .get_etag(key)
                    .and_then(|etag| Some((etag, inner.cache.get(key)?)));
            } else if let Some(cached) = inner.cache.get(key) {
                tracing::debug!(path = %metadata.path, "Cache hit");
                let CachedResponse {
                    raw_body,
                    status,
                    headers,
                } = cached;
                return decode(raw_body, status, headers, start.elapsed(), 0).map(Response::cached);
            }
        }

        let json = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::SerializationFailed(e.to_string()))?;

        let RetryOutcome {
            result, attempts, ..
        } = {
            let client = self;
            let metadata = &metadata;
            let json = json.as_ref();
            let etag = revalidating.as_ref().map(|(etag, _)| etag.as_str());
            let mut attempt = 0u32;
            execute_with_retry_outcome(ctx, &inner.retry_policy, move || {
                attempt += 1;
                client.execute_request(ctx, metadata, json, etag, attempt)
            })
            .await
        };
        let latency = start.elapsed();

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                if !matches!(e, Error::Cancelled | Error::DeadlineExceeded) {
                    inner.breaker.record_failure();
                }
                return Err(e);
            }
        };

        tracing::info!(
            status = raw.status.as_u16(),
            latency_ms = latency.as_millis() as u64,
            attempts = attempts,
            "Received HTTP response"
        );

        if raw.status == StatusCode::NOT_MODIFIED {
            if let (Some(key), Some((etag, cached))) = (&cache_key, revalidating) {
                inner.breaker.record_success();
                tracing::debug!(path = %metadata.path, etag = %etag, "Cached response revalidated");
                inner
                    .cache
                    .set_with_etag(key, cached.clone(), &etag, inner.cache_ttl);
                return decode(cached.raw_body, cached.status, cached.headers, latency, attempts)
                    .map(Response::cached);
            }
        }

        if !raw.status.is_success() {
            inner.breaker.record_failure();
            return Err(self.map_failure(&metadata, raw));
        }
        inner.breaker.record_success();

        let RawResponse {
            status,
            headers,
            body,
        } = raw;
        let etag = headers
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let cached = CachedResponse {
            raw_body: body.clone(),
            status,
            headers: headers.clone(),
        };
        let response = decode(body, status, headers, latency, attempts)?;

        match cache_key {
            Some(key) => match etag {
                Some(etag) => inner.cache.set_with_etag(&key, cached, &etag, inner.cache_ttl),
                None => inner.cache.set(&key, cached, inner.cache_ttl),
            },
            None => inner.cache.delete(&format!("GET:{}", metadata.path)),
        }

        Ok(response)
    }

    /// Sends one attempt and reads its body.
    async fn execute_request(
        &self,
        ctx: &CallContext,
        metadata: &RequestMetadata,
        body: Option<&serde_json::Value>,
        etag: Option<&str>,
        attempt: u32,
    ) -> Result<RawResponse> {
        let mut url = self.inner.base_url.clone();
        url.set_path(&metadata.path);
        for (key, value) in &metadata.query_params {
            url.query_pairs_mut().append_pair(key, value);
        }

        tracing::debug!(
            method = %metadata.method,
            url = %url,
            attempt = attempt,
            "Executing HTTP request"
        );

        let mut request = self.inner.http_client.request(metadata.method.clone(), url);
        for (name, value) in &self.inner.default_headers {
            request = request.header(name, value);
        }
        for (name, value) in &metadata.headers {
            request = request.header(name, value);
        }
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(timeout) = self.inner.timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = ctx.run(async { Ok::<_, Error>(request.send().await?) }).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = ctx.run(async { Ok::<_, Error>(response.text().await?) }).await?;

        if status == StatusCode::TOO_MANY_REQUESTS && self.inner.rate_limit_handling {
            // Surfaced as an error so the retry engine waits out the window.
            let mut info = RateLimitInfo::from_headers(&headers);
            info.reset_at = info.effective_reset();
            return Err(map_status_to_error(
                status,
                ApiErrorBody::decode(status, &body),
                &metadata.path,
                Some(&info),
            ));
        }

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    fn map_failure(&self, metadata: &RequestMetadata, raw: RawResponse) -> Error {
        if raw.status.is_client_error() {
            tracing::error!(
                status = raw.status.as_u16(),
                response = %raw.body,
                "Client error (4xx)"
            );
        } else if raw.status.is_server_error() {
            tracing::warn!(
                status = raw.status.as_u16(),
                response = %raw.body,
                "Server error (5xx)"
            );
        }

        let rate_limit = Some(RateLimitInfo::from_headers(&raw.headers))
            .filter(|info| self.inner.rate_limit_handling && !info.is_empty());
        map_status_to_error(
            raw.status,
            ApiErrorBody::decode(raw.status, &raw.body),
            &metadata.path,
            rate_limit.as_ref(),
        )
    }

    /// Makes a GET request to `path`, served from the cache when fresh.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use steadfast::Client;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Organization { login: String }
    ///
    /// # async fn example() -> Result<(), steadfast::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let org: steadfast::Response<Organization> = client.get("/orgs/acme").await?;
    /// println!("Org: {}", org.login);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::GET, path);
        self.call::<(), Res>(metadata, None).await
    }

    /// Makes a POST request to `path` with a JSON body.
    pub async fn post<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::POST, path);
        self.call(metadata, Some(body)).await
    }

    /// Makes a PUT request to `path` with a JSON body.
    pub async fn put<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::PUT, path);
        self.call(metadata, Some(body)).await
    }

    /// Makes a DELETE request to `path`.
    pub async fn delete<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::DELETE, path);
        self.call::<(), Res>(metadata, None).await
    }

    /// Makes a PATCH request to `path` with a JSON body.
    pub async fn patch<Req, Res>(
        &self,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::PATCH, path);
        self.call(metadata, Some(body)).await
    }
}

/// Decodes a 2xx body. An empty body decodes as JSON `null`, so `()` and
/// `Option<T>` work for bodiless responses.
fn decode<Res>(
    raw_body: String,
    status: StatusCode,
    headers: HeaderMap,
    latency: Duration,
    attempts: u32,
) -> Result<Response<Res>>
where
    Res: DeserializeOwned,
{
    let text = if raw_body.trim().is_empty() {
        "null"
    } else {
        raw_body.as_str()
    };

    match serde_json::from_str::<Res>(text) {
        Ok(data) => Ok(Response::new(
            data, raw_body, status, headers, latency, attempts,
        )),
        Err(e) => {
            tracing::error!(
                error = %e,
                raw_response = %raw_body,
                "Failed to deserialize response"
            );

            Err(Error::DeserializationFailed {
                raw_response: raw_body,
                serde_error: e.to_string(),
                status,
            })
        }
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// Defaults: [`RetryPolicy::default`], [`CircuitBreakerConfig::default`], an
/// in-memory cache built from [`CacheConfig::default`], rate-limit handling
/// on and no request timeout.
///
/// # Examples
///
/// ```no_run
/// use steadfast::{ClientBuilder, NoOpCache, RetryPolicy};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), steadfast::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .retry_policy(RetryPolicy::none())
///     .cache(Arc::new(NoOpCache))
///     .default_header("User-Agent", "inventory-sync/2.1")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    cache: Option<Arc<dyn Cache<CachedResponse>>>,
    cache_config: CacheConfig,
    cache_ttl: Option<Duration>,
    timeout: Option<Duration>,
    rate_limit_handling: bool,
}

impl ClientBuilder {
    /// A builder with default retry, breaker and cache settings and no base URL.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            retry_policy: RetryPolicy::default(),
            breaker_config: CircuitBreakerConfig::default(),
            cache: None,
            cache_config: CacheConfig::default(),
            cache_ttl: None,
            timeout: None,
            rate_limit_handling: true,
        }
    }

    /// Sets the base URL for all requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the URL does not parse.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a header sent with every request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if the name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = parse_header(name.as_ref(), value.as_ref())?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how failed attempts are retried.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Configures the circuit breaker guarding the client.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Uses `cache` instead of building one from the cache configuration.
    pub fn cache(mut self, cache: Arc<dyn Cache<CachedResponse>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Configures the built-in in-memory cache.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Sets the TTL of cached responses, overriding
    /// [`CacheConfig::default_ttl`].
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Whether 429 responses are turned into [`Error::RateLimit`] and waited
    /// out using the rate-limit headers. When off, a 429 is retried with the
    /// plain backoff like any other retryable status.
    pub fn rate_limit_handling(mut self, enabled: bool) -> Self {
        self.rate_limit_handling = enabled;
        self
    }

    /// Builds the configured `Client`.
    ///
    /// The in-memory cache's background sweep needs a Tokio runtime; build
    /// the client from within one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if no base URL was provided or
    /// the HTTP client cannot be created.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;

        let http_client = reqwest::Client::builder().build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;

        let cache: Arc<dyn Cache<CachedResponse>> = match self.cache {
            Some(cache) => cache,
            None if self.cache_config.enabled => {
                Arc::new(MemoryCache::from_config(&self.cache_config))
            }
            None => Arc::new(NoOpCache),
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                http_client,
                base_url,
                default_headers: self.default_headers,
                retry_policy: self.retry_policy,
                breaker: Arc::new(CircuitBreaker::new(self.breaker_config)),
                cache,
                cache_ttl: self.cache_ttl.unwrap_or(self.cache_config.default_ttl),
                timeout: self.timeout,
                rate_limit_handling: self.rate_limit_handling,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
