use std::sync::Arc;

use super::config::ClientConfig;
use super::conn::{DnsCache, FailoverConnector, GaiResolver, Resolve, TcpConnectionConfig};
use super::pool::PoolConfig;
use super::{Client, ClientRef, Error};

/// A builder for a client.
#[derive(Debug)]
pub struct Builder<R = GaiResolver> {
    config: ClientConfig,
    resolver: R,
    #[cfg(feature = "tls")]
    tls: Option<rustls::ClientConfig>,
}

impl Builder {
    /// Create a builder using the system resolver.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            resolver: GaiResolver::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl<R> Builder<R> {
    /// Access the client configuration.
    pub fn config(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// Set the client configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve hostnames with `resolver` instead of the system resolver.
    pub fn with_resolver<R2>(self, resolver: R2) -> Builder<R2> {
        Builder {
            config: self.config,
            resolver,
            #[cfg(feature = "tls")]
            tls: self.tls,
        }
    }
}

#[cfg(feature = "tls")]
impl<R> Builder<R> {
    /// Use the provided TLS configuration instead of one derived from
    /// [`ClientConfig::tls_verify`].
    pub fn with_tls(mut self, config: rustls::ClientConfig) -> Self {
        self.tls = Some(config);
        self
    }
}

impl<R> Builder<R>
where
    R: Resolve,
{
    /// Build the client.
    ///
    /// This spawns the DNS refresh task, so it must run inside a tokio
    /// runtime. The task stops with [`Client::shutdown`] or when the last
    /// handle to the client is dropped.
    pub fn build(self) -> Result<Client<R>, Error> {
        let config = self.config;

        let dns = DnsCache::new(self.resolver);
        let tcp = TcpConnectionConfig {
            keep_alive_timeout: config.keep_alive,
            ..TcpConnectionConfig::with_timeouts(config.timeout)
        };

        #[allow(unused_mut)]
        let mut connector = FailoverConnector::new(dns.clone(), tcp);

        #[cfg(feature = "tls")]
        {
            let tls = match self.tls {
                Some(tls) => tls,
                None => super::conn::tls::client_config(config.tls_verify)
                    .map_err(|error| Error::Setup(error.into()))?,
            };
            connector = connector.with_tls(Arc::new(tls));
        }

        let pool = PoolConfig::from(&config).build(connector);
        let refresher = dns.spawn_refresher(config.dns_refresh_interval);

        tracing::debug!(
            timeout = ?config.timeout,
            max_retries = config.max_retries,
            dns_refresh = ?config.dns_refresh_interval,
            "http client ready"
        );

        Ok(Client {
            inner: Arc::new(ClientRef {
                config,
                pool,
                dns,
                refresher,
            }),
        })
    }
}
