//! Outbound HTTP client.
//!
//! A [`Client`] is an explicitly constructed handle around one connection
//! pool. Clones share that pool, its DNS cache and its configuration, so a
//! service normally builds one client at startup and passes it around. For
//! code which cannot do that, [`shared`] hands out a process-wide client
//! constructed exactly once.
//!
//! Calls go through [`Client::execute`], or the per-verb helpers built on
//! it. Each attempt is bounded by its own timeout; transport failures of
//! retry-enabled requests are retried with linear backoff; responses are
//! classified into [`Error`] variants.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt as _;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn, Instrument as _};

mod builder;
mod classify;
mod config;
pub mod conn;
mod error;
mod health;
mod pool;
mod ready;
mod request;

pub use self::builder::Builder;
pub use self::classify::{classify, Outcome, CLASSES};
pub use self::config::{ClientConfig, ConfigError};
pub use self::conn::GaiResolver;
pub use self::error::{AttemptTimeout, Error, ErrorKind};
pub use self::health::HealthReport;
pub use self::pool::PoolConfig;
pub use self::ready::{shared, try_shared, ReadinessGate};
pub use self::request::{Request, Retry};

use self::conn::{DnsCache, Refresher, Resolve};
use self::pool::Pool;

/// Longest part of a response body included in error logs.
const BODY_SNIPPET: usize = 512;

/// Inner type for managing the client.
struct ClientRef<R> {
    config: ClientConfig,
    pool: Pool<R>,
    dns: DnsCache<R>,
    refresher: Refresher,
}

/// A shared outbound HTTP client.
///
/// # Example
/// ```no_run
/// # use hyperdial::client::{Client, ClientConfig, Request, Retry};
/// # async fn run() -> Result<(), hyperdial::client::Error> {
/// let client = Client::new(ClientConfig::from_env().unwrap())?;
///
/// let mut value = serde_json::Value::Null;
/// let request = Request::parse(http::Method::GET, "http://upstream/items/1")?
///     .with_retry(Retry::Enabled);
/// client.execute(request, Some(&mut value)).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client<R = GaiResolver> {
    inner: Arc<ClientRef<R>>,
}

impl<R> Clone for Client<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> fmt::Debug for Client<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("dns", &self.inner.dns)
            .finish()
    }
}

impl Client {
    /// Build a client with the system resolver.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Builder::new(config).build()
    }

    /// Create a builder for clients.
    pub fn builder(config: ClientConfig) -> Builder {
        Builder::new(config)
    }
}

impl<R> Client<R> {
    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The DNS cache used for new connections.
    pub fn dns(&self) -> &DnsCache<R> {
        &self.inner.dns
    }

    /// Stop the background DNS refresh. Requests keep working, using the
    /// cached addresses and resolving unknown hosts on demand.
    pub fn shutdown(&self) {
        self.inner.refresher.stop();
    }

    /// Returns `true` once the background DNS refresh has stopped.
    pub fn is_shutdown(&self) -> bool {
        self.inner.refresher.is_finished()
    }
}

impl<R> Client<R>
where
    R: Resolve,
{
    /// Execute `request`, decoding a JSON response body into `destination`.
    ///
    /// Each attempt runs under the request timeout (or the configured
    /// default). The timeout is per attempt: a retried call can take up to
    /// `attempts * timeout` plus the backoff sleeps. Transport failures are
    /// retried while the attempt counter is between 1 and `max_retries`,
    /// sleeping `attempt * retry_backoff` before the next one. A response,
    /// whatever its status, is never retried.
    ///
    /// An empty 2xx body leaves `destination` untouched. Without a
    /// destination the body is not decoded at all.
    pub async fn execute<T>(
        &self,
        request: Request,
        destination: Option<&mut T>,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned,
    {
        let (status, body) = self.send(&request).await?;
        self.finish(&request, status, body, destination)
    }

    /// GET `url`, retrying transport failures.
    pub async fn get<T>(
        &self,
        url: &str,
        destination: Option<&mut T>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned,
    {
        let request = self.prepare(Method::GET, url, None, headers, timeout)?;
        self.execute(request.with_retry(Retry::Enabled), destination)
            .await
    }

    /// POST `body` to `url`.
    pub async fn post<T>(
        &self,
        url: &str,
        destination: Option<&mut T>,
        body: Option<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned,
    {
        let request = self.prepare(Method::POST, url, body, headers, timeout)?;
        self.execute(request, destination).await
    }

    /// PUT `body` to `url`.
    pub async fn put<T>(
        &self,
        url: &str,
        destination: Option<&mut T>,
        body: Option<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned,
    {
        let request = self.prepare(Method::PUT, url, body, headers, timeout)?;
        self.execute(request, destination).await
    }

    /// PATCH `url` with `body`.
    pub async fn patch<T>(
        &self,
        url: &str,
        destination: Option<&mut T>,
        body: Option<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned,
    {
        let request = self.prepare(Method::PATCH, url, body, headers, timeout)?;
        self.execute(request, destination).await
    }

    /// DELETE `url`.
    pub async fn delete<T>(
        &self,
        url: &str,
        destination: Option<&mut T>,
        body: Option<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned,
    {
        let request = self.prepare(Method::DELETE, url, body, headers, timeout)?;
        self.execute(request, destination).await
    }

    fn prepare(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<Request, Error> {
        let mut request = Request::parse(method, url)?;
        if let Some(body) = body {
            request = request.with_body(body);
        }
        if let Some(headers) = headers {
            request = request.with_headers(headers);
        }
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        Ok(request)
    }

    /// Run attempts until one yields a response or retries are exhausted.
    async fn send(&self, request: &Request) -> Result<(StatusCode, Bytes), Error> {
        let timeout = request.timeout().unwrap_or(self.inner.config.timeout);
        let max_retries = self.inner.config.max_retries;
        let mut attempt = request.attempt();

        loop {
            let span = tracing::debug_span!(
                "request",
                method = %request.method(),
                uri = %request.uri(),
                attempt
            );

            match self.attempt(request, timeout).instrument(span).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transport() && (1..=max_retries).contains(&attempt) => {
                    let backoff = self.inner.config.retry_backoff * attempt;
                    warn!(
                        method = %request.method(),
                        uri = %request.uri(),
                        attempt,
                        ?timeout,
                        ?backoff,
                        %error,
                        "retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One attempt: send the request and read the whole response body,
    /// all within `timeout`.
    ///
    /// Failures before the response head arrives are [`Error::Transport`].
    /// Once a status has been received, failures are [`Error::Body`], which
    /// the caller does not retry.
    async fn attempt(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<(StatusCode, Bytes), Error> {
        let http = request.to_http()?;
        let (method, uri) = (request.method(), request.uri());

        let mut received = None;
        let exchange = async {
            let response = self
                .inner
                .pool
                .request(http)
                .await
                .map_err(|error| Error::transport(method, uri, error))?;

            let status = response.status();
            received = Some(status);
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|error| Error::body(method, uri, status, error))?;
            Ok((status, body.to_bytes()))
        };

        let result = tokio::time::timeout(timeout, exchange).await;
        match result {
            Ok(result) => result,
            Err(_) => Err(match received {
                None => Error::transport(method, uri, AttemptTimeout(timeout)),
                Some(status) => Error::body(method, uri, status, AttemptTimeout(timeout)),
            }),
        }
    }

    /// Classify a received response and decode its body.
    fn finish<T>(
        &self,
        request: &Request,
        status: StatusCode,
        body: Bytes,
        destination: Option<&mut T>,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned,
    {
        let outcome = classify(status);
        if let Some(err) = outcome.into_error(request.method(), request.uri(), status, &body) {
            error!(
                method = %request.method(),
                uri = %request.uri(),
                status = status.as_u16(),
                body = %snippet(&body),
                "error executing request"
            );
            return Err(err);
        }

        if self.inner.config.response_debug {
            debug!(
                method = %request.method(),
                uri = %request.uri(),
                body = %String::from_utf8_lossy(&body),
                "response"
            );
        }

        let Some(destination) = destination else {
            return Ok(());
        };

        if body.is_empty() {
            warn!(
                method = %request.method(),
                uri = %request.uri(),
                "response has an empty body"
            );
            return Ok(());
        }

        *destination = serde_json::from_slice(&body).map_err(Error::Decode)?;
        Ok(())
    }
}

fn snippet(body: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = body.len().min(BODY_SNIPPET);
    String::from_utf8_lossy(&body[..end])
}
