//! Failover TCP dialer for client connections.
//!
//! This module contains the [`FailoverConnector`] type, which is a [`tower::Service`] that turns a
//! URI into a live connection. Hostnames are looked up through the shared [`DnsCache`], then each
//! resolved address is tried in order, each with its own connect timeout, until one accepts. If
//! every address fails, the error from the last one is returned.
//!
//! Every connection gets a hard deadline of `now + read_timeout` as soon as TCP is established,
//! see [`DeadlineStream`][super::stream::DeadlineStream].

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn, Instrument as _};

use super::dns::{DnsCache, GaiResolver, Resolve};
use super::stream::{DeadlineStream, DialedStream};
use crate::BoxFuture;

/// Configuration for dialing TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConnectionConfig {
    /// The timeout for connecting to a single remote address.
    pub connect_timeout: Option<Duration>,

    /// Hard limit on the lifetime of I/O on a connection, measured from
    /// when it was established.
    pub read_timeout: Option<Duration>,

    /// The timeout for completing a TLS handshake.
    pub tls_handshake_timeout: Option<Duration>,

    /// The timeout for keep-alive connections.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,
}

impl Default for TcpConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: None,
            tls_handshake_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
            reuse_address: true,
        }
    }
}

impl TcpConnectionConfig {
    /// Use `timeout` for connecting, reading and the TLS handshake.
    pub fn with_timeouts(timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
            read_timeout: Some(timeout),
            tls_handshake_timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// A TCP connector which fails over between resolved addresses.
///
/// # Example
/// ```no_run
/// # use hyperdial::client::conn::{DnsCache, FailoverConnector, TcpConnectionConfig};
/// # use tower::ServiceExt as _;
/// # async fn run() {
/// let connector = FailoverConnector::new(DnsCache::default(), TcpConnectionConfig::default());
///
/// let uri = "http://example.com".parse().unwrap();
/// let stream = connector.oneshot(uri).await.unwrap();
/// # }
/// ```
pub struct FailoverConnector<R = GaiResolver> {
    dns: DnsCache<R>,
    config: Arc<TcpConnectionConfig>,

    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl<R> Clone for FailoverConnector<R> {
    fn clone(&self) -> Self {
        Self {
            dns: self.dns.clone(),
            config: self.config.clone(),
            #[cfg(feature = "tls")]
            tls: self.tls.clone(),
        }
    }
}

impl<R> fmt::Debug for FailoverConnector<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverConnector")
            .field("dns", &self.dns)
            .field("config", &self.config)
            .finish()
    }
}

impl<R> FailoverConnector<R> {
    /// Create a connector which resolves through `dns`. HTTPS is not
    /// available until a TLS configuration is provided.
    pub fn new(dns: DnsCache<R>, config: TcpConnectionConfig) -> Self {
        Self {
            dns,
            config: Arc::new(config),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Use `tls` for `https` URIs.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Get the configuration for the connector.
    pub fn config(&self) -> &TcpConnectionConfig {
        &self.config
    }

    /// The DNS cache used by this connector.
    pub fn dns(&self) -> &DnsCache<R> {
        &self.dns
    }
}

impl<R> tower::Service<Uri> for FailoverConnector<R>
where
    R: Resolve,
{
    type Response = DialedStream;
    type Error = TcpConnectionError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Uri) -> Self::Future {
        let (host, port) = match get_host_and_port(&req) {
            Ok((host, port)) => (host, port),
            Err(e) => return Box::pin(std::future::ready(Err(e))),
        };

        let connector = self.clone();
        let span = tracing::trace_span!("tcp", host = %host, port = %port);

        Box::pin(
            async move {
                let stream = connector.dial(&host, port).await?;

                if let Ok(peer_addr) = stream.peer_addr() {
                    trace!(peer.addr = %peer_addr, "tcp connected");
                }

                let deadline = connector
                    .config
                    .read_timeout
                    .map(|timeout| tokio::time::Instant::now() + timeout);
                let stream = DeadlineStream::new(stream, deadline);

                if req.scheme_str() == Some("https") {
                    connector.handshake(&host, stream).await
                } else {
                    Ok(DialedStream::Tcp(stream))
                }
            }
            .instrument(span),
        )
    }
}

impl<R> FailoverConnector<R>
where
    R: Resolve,
{
    /// Resolve `host` and connect to the first address which accepts.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, TcpConnectionError> {
        let addrs = self
            .dns
            .lookup(host)
            .await
            .map_err(TcpConnectionError::msg("dns resolution"))?;

        let mut last_error = None;
        for ip in addrs.iter() {
            let address = SocketAddr::new(*ip, port);
            let span = tracing::trace_span!("connect", %address);
            match connect(&address, &self.config).instrument(span).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    trace!(%address, %error, "connection attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TcpConnectionError::new(format!("no addresses to connect to for {host}"))
        }))
    }

    #[cfg(feature = "tls")]
    async fn handshake(
        &self,
        host: &str,
        stream: DeadlineStream<TcpStream>,
    ) -> Result<DialedStream, TcpConnectionError> {
        let Some(tls) = self.tls.clone() else {
            return Err(TcpConnectionError::new("TLS is not configured"));
        };

        let name = rustls::pki_types::ServerName::try_from(host.to_owned())
            .map_err(TcpConnectionError::msg("invalid TLS server name"))?;
        let connecting = tokio_rustls::TlsConnector::from(tls).connect(name, stream);

        let stream = match self.config.tls_handshake_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting)
                .await
                .map_err(|elapsed| io::Error::new(io::ErrorKind::TimedOut, elapsed))
                .and_then(|result| result),
            None => connecting.await,
        }
        .map_err(TcpConnectionError::msg("TLS handshake"))?;

        trace!("tls handshake complete");
        Ok(DialedStream::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "tls"))]
    async fn handshake(
        &self,
        _host: &str,
        _stream: DeadlineStream<TcpStream>,
    ) -> Result<DialedStream, TcpConnectionError> {
        Err(TcpConnectionError::new("TLS support is disabled"))
    }
}

/// Error type for invalid URIs during connection.
#[derive(Debug, Error)]
#[error("invalid URI")]
pub struct InvalidUri {
    _priv: (),
}

/// Error type for TCP connections.
#[derive(Debug, Error)]
pub struct TcpConnectionError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TcpConnectionError {
    pub(super) fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    fn uri<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: Some(InvalidUri { _priv: () }.into()),
        }
    }

    pub(super) fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }
}

impl fmt::Display for TcpConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

fn get_host_and_port(uri: &Uri) -> Result<(Box<str>, u16), TcpConnectionError> {
    let host = uri.host().ok_or(TcpConnectionError::uri("missing host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = match uri.port_u16() {
        Some(port) => port,
        None => match uri.scheme_str() {
            Some("http") => 80,
            Some("https") => 443,
            _ => return Err(TcpConnectionError::uri("missing port")),
        },
    };

    Ok((host.into(), port))
}

#[tracing::instrument(skip(config), level = "debug")]
async fn connect(
    addr: &SocketAddr,
    config: &TcpConnectionConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let socket = match addr.ip() {
        IpAddr::V4(_) => TcpSocket::new_v4(),
        IpAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(TcpConnectionError::msg("tcp open error"))?;
    trace!("tcp socket opened");

    if let Some(dur) = config.keep_alive_timeout {
        let conf = socket2::TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket2::SockRef::from(&socket).set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    if config.reuse_address {
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("tcp set_reuse_address error: {}", e);
        }
    }

    let connect = socket.connect(*addr);
    let stream = match config.connect_timeout {
        Some(dur) => match tokio::time::timeout(dur, connect).await {
            Ok(result) => result,
            Err(elapsed) => {
                trace!(timeout = ?dur, "connection timed out");
                Err(io::Error::new(io::ErrorKind::TimedOut, elapsed))
            }
        },
        None => connect.await,
    }
    .map_err(TcpConnectionError::msg("tcp connect error"))?;

    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    Ok(stream)
}
