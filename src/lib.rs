//! Hyperdial
//!
//! The outbound half of a service: a shared HTTP client which resolves
//! hostnames through a self-refreshing cache, dials the first reachable
//! address, bounds every attempt with its own timeout, retries transport
//! failures with linear backoff and classifies non-2xx responses into a
//! small error taxonomy.
//!
//! ```no_run
//! # use hyperdial::client::{Client, ClientConfig};
//! # async fn run() -> Result<(), hyperdial::client::Error> {
//! #[derive(Debug, Default, serde::Deserialize)]
//! struct Comment {
//!     id: u64,
//!     desc: String,
//! }
//!
//! let client = Client::new(ClientConfig::default())?;
//! let mut comment = Comment::default();
//! client
//!     .get("http://comments.internal/comments/1", Some(&mut comment), None, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub use client::Client;

/// Boxed error type used at the seams of the connection stack.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
