//! Outbound request description.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use http_body_util::Full;

use super::Error;

/// Whether a call may be retried after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retry {
    /// Single attempt.
    #[default]
    Disabled,
    /// Retry transport failures up to the client's `max_retries`.
    Enabled,
}

impl Retry {
    /// The attempt counter a request starts with.
    pub fn first_attempt(self) -> u32 {
        match self {
            Retry::Disabled => 0,
            Retry::Enabled => 1,
        }
    }
}

/// One logical HTTP call.
///
/// The body is buffered so that the same bytes are sent again on a retry.
/// Headers, when given, replace the request headers as a whole.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: Option<HeaderMap>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    attempt: u32,
}

impl Request {
    /// A request with no headers, no body, the client's default timeout and
    /// retries disabled.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: None,
            body: None,
            timeout: None,
            attempt: Retry::Disabled.first_attempt(),
        }
    }

    /// Parse `url` and create a request for it.
    pub fn parse(method: Method, url: &str) -> Result<Self, Error> {
        Ok(Self::new(method, url.parse()?))
    }

    /// Set the header map sent with every attempt.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Set the request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the timeout of each attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable or disable retries.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.attempt = retry.first_attempt();
        self
    }

    /// Set the starting attempt counter directly. `0` disables retries;
    /// any other value enables them, counting from that attempt.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The header map, if one was set.
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    /// The request body, if one was set.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The per-attempt timeout, if one was set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The starting attempt counter.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Build the HTTP request for one attempt.
    pub(crate) fn to_http(&self) -> Result<http::Request<Full<Bytes>>, Error> {
        let mut request = http::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(Full::new(self.body.clone().unwrap_or_default()))
            .map_err(Error::InvalidRequest)?;

        if let Some(headers) = &self.headers {
            *request.headers_mut() = headers.clone();
        }

        Ok(request)
    }
}
