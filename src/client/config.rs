//! Client configuration.
//!
//! All values are fixed when the client is built and never change per
//! request. They can be read from the environment with
//! [`ClientConfig::from_env`], which understands the same keys the
//! service deployment sets:
//!
//! | key                         | default | meaning                                  |
//! |-----------------------------|---------|------------------------------------------|
//! | `HTTP_TIMEOUT_SECONDS`      | 600     | connect, read deadline and idle timeout  |
//! | `HTTP_MIN_CONNECTIONS`      | 10      | overall idle target is ten times this    |
//! | `HTTP_MAX_CONNECTIONS`      | 10      | idle connections kept per host           |
//! | `HTTP_MAX_RETRIES`          | 1       | retries after a transport failure        |
//! | `HTTP_RESPONSE_DEBUG`       | false   | log every successful response body       |
//! | `HTTP_HEALTHCHECK_ENDPOINT` | (unset) | URL requested by the health check        |
//! | `HTTP_TLS_VERIFY`           | true    | verify server certificates               |

use std::str::FromStr;
use std::time::Duration;

use http::Uri;
use thiserror::Error;

const TIMEOUT_SECONDS: &str = "HTTP_TIMEOUT_SECONDS";
const MIN_CONNECTIONS: &str = "HTTP_MIN_CONNECTIONS";
const MAX_CONNECTIONS: &str = "HTTP_MAX_CONNECTIONS";
const MAX_RETRIES: &str = "HTTP_MAX_RETRIES";
const RESPONSE_DEBUG: &str = "HTTP_RESPONSE_DEBUG";
const HEALTHCHECK_ENDPOINT: &str = "HTTP_HEALTHCHECK_ENDPOINT";
const TLS_VERIFY: &str = "HTTP_TLS_VERIFY";

/// Error reading a [`ClientConfig`] from the environment.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A key was present but its value could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// The offending key.
        key: &'static str,
        /// The raw value found.
        value: String,
    },
}

/// Configuration for a [`Client`][crate::client::Client].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default per-attempt timeout. Also used as the connect timeout, the
    /// read deadline set on every new connection, the idle timeout of
    /// pooled connections and the TLS handshake timeout.
    pub timeout: Duration,

    /// Lower bound used to size the overall idle pool (ten times this value).
    pub min_idle_connections: usize,

    /// Maximum number of idle connections kept per host.
    pub max_idle_connections: usize,

    /// How many extra attempts a retry-enabled request may make after
    /// transport failures.
    pub max_retries: u32,

    /// Log successful response bodies at debug level.
    pub response_debug: bool,

    /// Endpoint requested by [`Client::healthcheck`][crate::client::Client::healthcheck].
    pub healthcheck_endpoint: Option<Uri>,

    /// Verify TLS server certificates against the platform roots.
    pub tls_verify: bool,

    /// How often the DNS cache re-resolves every known host.
    pub dns_refresh_interval: Duration,

    /// Backoff step between retries. Attempt `n` waits `n` steps.
    pub retry_backoff: Duration,

    /// TCP keep-alive applied to new connections.
    pub keep_alive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            min_idle_connections: 10,
            max_idle_connections: 10,
            max_retries: 1,
            response_debug: false,
            healthcheck_endpoint: None,
            tls_verify: true,
            dns_refresh_interval: Duration::from_secs(5 * 60),
            retry_backoff: Duration::from_secs(1),
            keep_alive: Some(Duration::from_secs(90)),
        }
    }
}

impl ClientConfig {
    /// Read the configuration from process environment variables.
    ///
    /// Unset keys keep their default value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(seconds) = parse::<u64, _>(&lookup, TIMEOUT_SECONDS)? {
            config.timeout = Duration::from_secs(seconds);
        }
        if let Some(min) = parse(&lookup, MIN_CONNECTIONS)? {
            config.min_idle_connections = min;
        }
        if let Some(max) = parse(&lookup, MAX_CONNECTIONS)? {
            config.max_idle_connections = max;
        }
        if let Some(retries) = parse(&lookup, MAX_RETRIES)? {
            config.max_retries = retries;
        }
        if let Some(debug) = parse_flag(&lookup, RESPONSE_DEBUG)? {
            config.response_debug = debug;
        }
        if let Some(verify) = parse_flag(&lookup, TLS_VERIFY)? {
            config.tls_verify = verify;
        }

        config.healthcheck_endpoint = match lookup(HEALTHCHECK_ENDPOINT) {
            Some(value) if !value.trim().is_empty() => {
                Some(value.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: HEALTHCHECK_ENDPOINT,
                    value,
                })?)
            }
            _ => None,
        };

        Ok(config)
    }

    /// Set the default per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the endpoint used by the health check.
    pub fn with_healthcheck_endpoint(mut self, endpoint: Uri) -> Self {
        self.healthcheck_endpoint = Some(endpoint);
        self
    }

    /// The overall idle connection target, across all hosts.
    pub fn total_idle_connections(&self) -> usize {
        self.min_idle_connections.saturating_mul(10)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(None),
    }
}

fn parse_flag<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" | "" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { key, value }),
        },
        None => Ok(None),
    }
}
