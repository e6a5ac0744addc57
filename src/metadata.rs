//! Per-request description: method, path, headers and query parameters.

use crate::cache::generate_cache_key;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::collections::HashMap;

/// Everything needed to issue one logical request through a [`crate::Client`].
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    /// HTTP method of the request.
    pub method: Method,

    /// Path relative to the client's base URL.
    pub path: String,

    /// Headers sent in addition to the client defaults.
    pub headers: HeaderMap,

    /// Query parameters appended to the URL. Order does not matter.
    pub query_params: HashMap<String, String>,

    /// Skip the fresh-hit shortcut and revalidate a cached GET with
    /// `If-None-Match`.
    pub revalidate: bool,
}

impl RequestMetadata {
    /// A request with no extra headers or query parameters.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query_params: HashMap::new(),
            revalidate: false,
        }
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConfigurationError`] if the name or value is
    /// not a valid header.
    pub fn with_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self, crate::Error> {
        let (name, value) = parse_header(name.as_ref(), value.as_ref())?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds one query parameter, replacing any previous value for `key`.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Adds several query parameters at once.
    pub fn with_query_params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query_params.extend(params);
        self
    }

    /// Marks the request for ETag revalidation instead of serving a cached
    /// copy outright.
    pub fn revalidate(mut self) -> Self {
        self.revalidate = true;
        self
    }

    /// The key this request's response is cached under.
    ///
    /// # Examples
    ///
    /// ```
    /// use steadfast::RequestMetadata;
    /// use http::Method;
    ///
    /// let plain = RequestMetadata::new(Method::GET, "/orgs/acme");
    /// assert_eq!(plain.cache_key(), "GET:/orgs/acme");
    ///
    /// let a = RequestMetadata::new(Method::GET, "/search")
    ///     .with_query_param("q", "rust")
    ///     .with_query_param("page", "2");
    /// let b = RequestMetadata::new(Method::GET, "/search")
    ///     .with_query_param("page", "2")
    ///     .with_query_param("q", "rust");
    /// assert_eq!(a.cache_key(), b.cache_key());
    /// ```
    pub fn cache_key(&self) -> String {
        generate_cache_key(
            self.method.as_str(),
            &self.path,
            self.query_params
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )
    }
}

/// Validates a header name and value supplied as strings.
pub(crate) fn parse_header(
    name: &str,
    value: &str,
) -> Result<(HeaderName, HeaderValue), crate::Error> {
    let name = HeaderName::try_from(name).map_err(|e| {
        crate::Error::ConfigurationError(format!("Invalid header name '{}': {}", name, e))
    })?;
    let value = HeaderValue::try_from(value).map_err(|e| {
        crate::Error::ConfigurationError(format!("Invalid value for header '{}': {}", name, e))
    })?;
    Ok((name, value))
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self::new(Method::GET, "")
    }
}
