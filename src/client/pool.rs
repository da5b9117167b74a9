//! Connection pooling for clients.
//!
//! Connections are pooled per scheme and authority by the hyper-util
//! client, which is safe to share between any number of tasks. This module
//! only decides how that pool is configured and which connector feeds it.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use super::config::ClientConfig;
use super::conn::FailoverConnector;

/// The pooled HTTP client underneath a [`Client`][crate::client::Client].
pub(crate) type Pool<R> = legacy::Client<FailoverConnector<R>, Full<Bytes>>;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// The maximum idle duration of a connection.
    pub idle_timeout: Option<Duration>,

    /// The maximum number of idle connections per host.
    pub max_idle_per_host: usize,

    /// Target for idle connections across all hosts. Informational: the
    /// pool enforces its limits per host.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            idle_timeout: Some(config.timeout),
            max_idle_per_host: config.max_idle_connections,
            max_idle: config.total_idle_connections(),
        }
    }
}

impl PoolConfig {
    pub(crate) fn build<R>(&self, connector: FailoverConnector<R>) -> Pool<R>
    where
        R: super::conn::Resolve,
    {
        tracing::debug!(
            idle_timeout = ?self.idle_timeout,
            max_idle_per_host = self.max_idle_per_host,
            max_idle = self.max_idle,
            "building connection pool"
        );

        legacy::Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.idle_timeout)
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .build(connector)
    }
}
