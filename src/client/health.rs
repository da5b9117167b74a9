//! Reachability check for the configured upstream.

use http::Method;
use serde::Serialize;

use super::conn::Resolve;
use super::{Client, Error, Request};

const OK: &str = "OK";

/// Result of [`Client::health_report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `"OK"`, or the text of the health check error.
    pub http: String,
}

impl HealthReport {
    /// Returns `true` if every checked dependency answered.
    pub fn healthy(&self) -> bool {
        self.http == OK
    }
}

impl<R> Client<R>
where
    R: Resolve,
{
    /// Request the health endpoint, if one is configured.
    ///
    /// This is a single GET with no retry. Any response counts as
    /// reachable, whatever its status, and the body is discarded.
    /// A body which fails to arrive does not make the check fail.
    pub async fn healthcheck(&self) -> Result<(), Error> {
        let Some(endpoint) = self.inner.config.healthcheck_endpoint.clone() else {
            return Ok(());
        };

        let request = Request::new(Method::GET, endpoint);
        let status = match self.attempt(&request, self.inner.config.timeout).await {
            Ok((status, _)) => status,
            // The server answered; only its body was lost.
            Err(Error::Body { status, .. }) => status,
            Err(error) => return Err(error),
        };
        tracing::trace!(uri = %request.uri(), %status, "healthcheck");
        Ok(())
    }

    /// Run [`Client::healthcheck`] and report the outcome as text.
    pub async fn health_report(&self) -> HealthReport {
        let http = match self.healthcheck().await {
            Ok(()) => OK.to_owned(),
            Err(error) => error.to_string(),
        };
        HealthReport { http }
    }
}
