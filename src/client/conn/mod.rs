//! Client connection types.
//!
//! Connections are made in three layers, leaves first:
//!
//! - [`DnsCache`]: hostnames to addresses, refreshed in the background by a [`Refresher`].
//! - [`FailoverConnector`]: tries each resolved address in order and returns the first
//!   connection which succeeds, with a hard deadline attached.
//! - The connection pool (see [`PoolConfig`][crate::client::PoolConfig]) which reuses those
//!   connections across requests.

pub mod dns;
pub mod stream;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;

pub use self::dns::{Addrs, DnsCache, GaiResolver, Refresher, Resolve};
pub use self::stream::{DeadlineStream, DialedStream};
pub use self::tcp::{FailoverConnector, TcpConnectionConfig, TcpConnectionError};
