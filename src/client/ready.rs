//! One-time initialization of a process-wide client.

use std::future::Future;

use tokio::sync::OnceCell;

use super::{Client, ClientConfig, Error};

static SHARED: ReadinessGate<Client> = ReadinessGate::new();

/// Holds a value which is constructed at most once.
///
/// Concurrent first callers of [`ReadinessGate::ensure_ready`] wait for a
/// single initializer instead of racing to build their own. If the
/// initializer fails, the gate stays unset and the next caller tries again.
#[derive(Debug)]
pub struct ReadinessGate<T> {
    cell: OnceCell<T>,
}

impl<T> ReadinessGate<T> {
    /// An unset gate, usable in a `static`.
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Returns `true` once a value has been set.
    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }

    /// The value, if it has been set.
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    /// Return the value, running `init` first if no value is set yet.
    pub async fn ensure_ready<F, Fut, E>(&self, init: F) -> Result<&T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.cell.get_or_try_init(init).await
    }
}

impl<T> Default for ReadinessGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide client, built from `config` on first use.
///
/// Later calls return the same client and ignore their `config`. The
/// client's connections and DNS refresh task belong to the runtime of the
/// first caller, so use this only from a single long-lived runtime. Code
/// which can hold a [`Client`] should prefer doing so.
pub async fn shared(config: ClientConfig) -> Result<&'static Client, Error> {
    SHARED
        .ensure_ready(|| async move {
            tracing::debug!("initializing shared http client");
            Client::new(config)
        })
        .await
}

/// The process-wide client, if [`shared`] has built it.
pub fn try_shared() -> Option<&'static Client> {
    SHARED.get()
}
