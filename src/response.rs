//! Successful response wrapper.
//!
//! [`Response`] carries the decoded body together with the raw body, status,
//! headers and how the client produced it: how many attempts it took, how long
//! it took and whether it came from the cache.

use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// A successful, decoded response.
///
/// # Examples
///
/// ```no_run
/// use steadfast::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Repository {
///     id: u64,
///     full_name: String,
/// }
///
/// # async fn example() -> Result<(), steadfast::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let response = client.get::<Repository>("/repos/acme/widgets").await?;
///
/// println!("Repository: {}", response.data.full_name);
/// println!("Took {:?} over {} attempt(s)", response.latency, response.attempts);
/// if response.from_cache {
///     println!("Served from cache");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The decoded body.
    pub data: T,

    /// The body exactly as received.
    pub raw_body: String,

    /// HTTP status of the response.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Time from the start of the call until the response was available,
    /// including retries and backoff waits.
    pub latency: Duration,

    /// Attempts sent to the server. `0` when served from the cache without a
    /// request.
    pub attempts: u32,

    /// `true` if the body came from the cache, either as a fresh hit or
    /// after a `304 Not Modified` revalidation.
    pub from_cache: bool,
}

impl<T> Response<T> {
    /// Wraps a freshly fetched response.
    pub fn new(
        data: T,
        raw_body: String,
        status: StatusCode,
        headers: HeaderMap,
        latency: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            data,
            raw_body,
            status,
            headers,
            latency,
            attempts,
            from_cache: false,
        }
    }

    pub(crate) fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// Transforms the decoded body, keeping everything else.
    ///
    /// # Examples
    ///
    /// ```
    /// # use steadfast::Response;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let response = Response::new(
    ///     7u32,
    ///     "7".to_string(),
    ///     StatusCode::OK,
    ///     HeaderMap::new(),
    ///     Duration::from_millis(20),
    ///     1,
    /// );
    ///
    /// let doubled = response.map(|n| n * 2);
    /// assert_eq!(doubled.data, 14);
    /// assert_eq!(doubled.raw_body, "7");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
            from_cache: self.from_cache,
        }
    }

    /// Returns `true` if more than one attempt was needed.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// A header value as a string, if present and valid UTF-8.
    ///
    /// # Examples
    ///
    /// ```
    /// # use steadfast::Response;
    /// # use http::{HeaderMap, HeaderValue, StatusCode};
    /// # use std::time::Duration;
    /// let mut headers = HeaderMap::new();
    /// headers.insert("etag", HeaderValue::from_static("\"v1\""));
    ///
    /// let response = Response::new((), String::new(), StatusCode::OK, headers, Duration::ZERO, 1);
    ///
    /// assert_eq!(response.header("etag"), Some("\"v1\""));
    /// assert_eq!(response.header("x-missing"), None);
    /// ```
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
