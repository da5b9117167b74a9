//! DNS resolution and caching.
//!
//! [`GaiResolver`] asks the operating system (`getaddrinfo`) on a blocking
//! worker thread. [`DnsCache`] sits in front of any resolver and keeps the
//! answers for every host the client talks to, so connection setup does not
//! pay for a lookup each time. A [`Refresher`] re-resolves the whole cache on
//! a fixed period and stops when it is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use std::{fmt, io};

use arc_swap::ArcSwap;
use pin_project::{pin_project, pinned_drop};
use tokio::task::JoinHandle;
use tower::util::Oneshot;
use tower::ServiceExt as _;
use tracing::{debug, trace, warn, Instrument as _};

/// Addresses resolved for a single host, in resolver order.
pub type Addrs = Arc<[IpAddr]>;

/// A resolver usable by the [`DnsCache`].
///
/// This is implemented for every [`tower::Service`] which maps a hostname to
/// a list of addresses, so custom resolvers only need to be services.
pub trait Resolve: Clone + Send + Sync + 'static {
    /// Future returned by [`Resolve::resolve`].
    type Future: Future<Output = io::Result<Vec<IpAddr>>> + Send + 'static;

    /// Resolve `host` to its addresses.
    fn resolve(&self, host: Box<str>) -> Self::Future;
}

impl<S> Resolve for S
where
    S: tower::Service<Box<str>, Response = Vec<IpAddr>, Error = io::Error>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    type Future = Oneshot<S, Box<str>>;

    fn resolve(&self, host: Box<str>) -> Self::Future {
        self.clone().oneshot(host)
    }
}

/// GetAddrInfo based resolver.
///
/// This resolver uses the `getaddrinfo` system call to resolve
/// hostnames to IP addresses via the operating system.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl tower::Service<Box<str>> for GaiResolver {
    type Response = Vec<IpAddr>;
    type Error = io::Error;
    type Future = JoinHandleFuture<Vec<IpAddr>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, host: Box<str>) -> Self::Future {
        let span = tracing::Span::current();
        JoinHandleFuture {
            handle: tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo", %host).in_scope(|| {
                    trace!("dns resolution starting");
                    (host.as_ref(), 0)
                        .to_socket_addrs()
                        .map(|addrs| addrs.map(|addr| addr.ip()).collect())
                })
            }),
        }
    }
}

/// Future returned by [`GaiResolver`], resolving on a blocking worker.
///
/// Dropping the future aborts the lookup.
#[pin_project(PinnedDrop)]
pub struct JoinHandleFuture<T> {
    #[pin]
    handle: JoinHandle<io::Result<T>>,
}

impl<T> fmt::Debug for JoinHandleFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandleFuture").finish()
    }
}

impl<T> Future for JoinHandleFuture<T> {
    type Output = io::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(join_err) => {
                if join_err.is_cancelled() {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
                } else {
                    Poll::Ready(Err(io::Error::other(join_err)))
                }
            }
        }
    }
}

#[pinned_drop]
impl<T> PinnedDrop for JoinHandleFuture<T> {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}

#[derive(Debug)]
struct Entry {
    addrs: Addrs,

    /// Set by every lookup, cleared by every refresh.
    used: AtomicBool,
}

impl Entry {
    fn new(addrs: Addrs, used: bool) -> Arc<Self> {
        Arc::new(Self {
            addrs,
            used: AtomicBool::new(used),
        })
    }
}

type Table = HashMap<Box<str>, Arc<Entry>>;

struct CacheRef<R> {
    resolver: R,
    table: ArcSwap<Table>,
}

/// A cache of resolved hostnames.
///
/// The table is replaced as a whole whenever it changes, so a reader always
/// sees one complete version of it. Cloning the cache is cheap and every
/// clone shares the same table.
pub struct DnsCache<R = GaiResolver> {
    inner: Arc<CacheRef<R>>,
}

impl<R> Clone for DnsCache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> fmt::Debug for DnsCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsCache")
            .field("hosts", &self.inner.table.load().len())
            .finish()
    }
}

impl Default for DnsCache<GaiResolver> {
    fn default() -> Self {
        Self::new(GaiResolver::new())
    }
}

impl<R> DnsCache<R> {
    /// Create an empty cache in front of `resolver`.
    pub fn new(resolver: R) -> Self {
        Self {
            inner: Arc::new(CacheRef {
                resolver,
                table: ArcSwap::from_pointee(Table::new()),
            }),
        }
    }

    /// Number of cached hosts.
    pub fn len(&self) -> usize {
        self.inner.table.load().len()
    }

    /// Returns `true` if no host is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached addresses for `host` without resolving.
    pub fn cached(&self, host: &str) -> Option<Addrs> {
        self.inner
            .table
            .load()
            .get(host)
            .map(|entry| entry.addrs.clone())
    }
}

impl<R> DnsCache<R>
where
    R: Resolve,
{
    /// Look up the addresses for `host`.
    ///
    /// IP literals are returned as-is. Cached hosts are answered from the
    /// table; anything else is resolved now and added to it. A failed
    /// resolution is returned to the caller and nothing is cached.
    pub async fn lookup(&self, host: &str) -> io::Result<Addrs> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Arc::from([ip]));
        }

        if let Some(entry) = self.inner.table.load().get(host) {
            entry.used.store(true, Ordering::Relaxed);
            trace!(%host, "dns cache hit");
            return Ok(entry.addrs.clone());
        }

        trace!(%host, "dns cache miss");
        let addrs = self.resolve(host).await?;
        let entry = Entry::new(addrs.clone(), true);
        self.inner.table.rcu(|table| {
            let mut table = Table::clone(table);
            table.insert(host.into(), entry.clone());
            table
        });

        Ok(addrs)
    }

    /// Re-resolve every host looked up since the previous refresh and drop
    /// the others.
    ///
    /// A host which fails to resolve keeps its previous addresses. Hosts
    /// looked up while the refresh runs count as used for the next one.
    pub async fn refresh(&self) {
        let snapshot = self.inner.table.load_full();
        let (keep, evict): (Vec<_>, Vec<_>) = snapshot
            .iter()
            .partition(|(_, entry)| entry.used.swap(false, Ordering::Relaxed));

        let results =
            futures_util::future::join_all(keep.iter().map(|(host, _)| self.resolve(host))).await;

        let mut next = Table::with_capacity(keep.len());
        for ((host, previous), result) in keep.into_iter().zip(results) {
            let addrs = match result {
                Ok(addrs) => addrs,
                Err(error) => {
                    warn!(%host, %error, "dns refresh failed, keeping previous addresses");
                    previous.addrs.clone()
                }
            };
            next.insert(host.clone(), Entry::new(addrs, false));
        }

        // Lookups which landed on the old table while the refresh was
        // running: new hosts are added, used flags are carried over.
        self.inner.table.rcu(|current| {
            let mut table = next.clone();
            for (host, entry) in current.iter() {
                let used = entry.used.load(Ordering::Relaxed);
                match table.get(host) {
                    Some(fresh) if used => fresh.used.store(true, Ordering::Relaxed),
                    Some(_) => {}
                    None if used || !snapshot.contains_key(host) => {
                        table.insert(host.clone(), entry.clone());
                    }
                    None => {}
                }
            }
            table
        });

        debug!(
            refreshed = next.len(),
            evicted = evict.len(),
            "dns cache refreshed"
        );
    }

    /// Spawn a task which refreshes the cache every `interval`.
    ///
    /// The first refresh happens one full interval from now. The task runs
    /// until the returned [`Refresher`] is stopped or dropped.
    pub fn spawn_refresher(&self, interval: Duration) -> Refresher {
        let cache = self.clone();
        let span = tracing::debug_span!("dns_refresh", ?interval);
        let handle = tokio::spawn(
            async move {
                let start = tokio::time::Instant::now() + interval;
                let mut ticker = tokio::time::interval_at(start, interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    cache.refresh().await;
                }
            }
            .instrument(span),
        );

        Refresher { handle }
    }

    async fn resolve(&self, host: &str) -> io::Result<Addrs> {
        let addrs = self.inner.resolver.resolve(host.into()).await?;
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no addresses resolved for {host}"),
            ));
        }
        Ok(addrs.into())
    }
}

/// Handle to the periodic refresh task of a [`DnsCache`].
#[derive(Debug)]
pub struct Refresher {
    handle: JoinHandle<()>,
}

impl Refresher {
    /// Stop refreshing. Idempotent.
    pub fn stop(&self) {
        if !self.handle.is_finished() {
            trace!("stopping dns refresher");
        }
        self.handle.abort();
    }

    /// Returns `true` once the task has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::future::Ready;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use super::*;

    /// Resolver answering from a mutable table, counting every call.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct StaticResolver {
        hosts: Arc<Mutex<HashMap<String, Vec<IpAddr>>>>,
        calls: Arc<AtomicUsize>,
    }

    impl StaticResolver {
        pub(crate) fn with(self, host: &str, addrs: Vec<IpAddr>) -> Self {
            self.set(host, addrs);
            self
        }

        pub(crate) fn set(&self, host: &str, addrs: Vec<IpAddr>) {
            self.hosts.lock().unwrap().insert(host.into(), addrs);
        }

        pub(crate) fn remove(&self, host: &str) {
            self.hosts.lock().unwrap().remove(host);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl tower::Service<Box<str>> for StaticResolver {
        type Response = Vec<IpAddr>;
        type Error = io::Error;
        type Future = Ready<io::Result<Vec<IpAddr>>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, host: Box<str>) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self
                .hosts
                .lock()
                .unwrap()
                .get(host.as_ref())
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown host"));
            std::future::ready(result)
        }
    }

    /// Resolver which holds every answer until a permit is added.
    #[derive(Debug, Clone)]
    struct GatedResolver {
        inner: StaticResolver,
        entered: Arc<tokio::sync::Notify>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    impl GatedResolver {
        fn new(inner: StaticResolver) -> Self {
            Self {
                inner,
                entered: Arc::new(tokio::sync::Notify::new()),
                gate: Arc::new(tokio::sync::Semaphore::new(0)),
            }
        }
    }

    impl tower::Service<Box<str>> for GatedResolver {
        type Response = Vec<IpAddr>;
        type Error = io::Error;
        type Future = crate::BoxFuture<'static, io::Result<Vec<IpAddr>>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, host: Box<str>) -> Self::Future {
            let answer = tower::Service::call(&mut self.inner, host);
            let entered = self.entered.clone();
            let gate = self.gate.clone();
            Box::pin(async move {
                entered.notify_one();
                gate.acquire().await.map_err(io::Error::other)?.forget();
                answer.await
            })
        }
    }

    fn ip(last: u8) -> IpAddr {
        Ipv4Addr::new(10, 0, 0, last).into()
    }

    #[tokio::test]
    async fn lookup_is_cached() {
        let resolver = StaticResolver::default().with("api.internal", vec![ip(1), ip(2)]);
        let cache = DnsCache::new(resolver.clone());

        let first = cache.lookup("api.internal").await.unwrap();
        let second = cache.lookup("api.internal").await.unwrap();

        assert_eq!(&*first, &[ip(1), ip(2)]);
        assert_eq!(first, second);
        assert_eq!(resolver.calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn ip_literal_skips_resolver() {
        let resolver = StaticResolver::default();
        let cache = DnsCache::new(resolver.clone());

        let addrs = cache.lookup("127.0.0.1").await.unwrap();
        assert_eq!(&*addrs, &[IpAddr::from(Ipv4Addr::LOCALHOST)]);
        assert_eq!(resolver.calls(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let resolver = StaticResolver::default();
        let cache = DnsCache::new(resolver.clone());

        let err = cache.lookup("missing.internal").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(cache.is_empty());

        resolver.set("missing.internal", vec![ip(9)]);
        let addrs = cache.lookup("missing.internal").await.unwrap();
        assert_eq!(&*addrs, &[ip(9)]);
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn empty_answer_is_an_error() {
        let resolver = StaticResolver::default().with("void.internal", vec![]);
        let cache = DnsCache::new(resolver);

        let err = cache.lookup("void.internal").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
        assert!(cache.cached("void.internal").is_none());
    }

    #[tokio::test]
    async fn refresh_replaces_used_and_evicts_unused() {
        let resolver = StaticResolver::default()
            .with("a.internal", vec![ip(1)])
            .with("b.internal", vec![ip(2)]);
        let cache = DnsCache::new(resolver.clone());

        cache.lookup("a.internal").await.unwrap();
        cache.lookup("b.internal").await.unwrap();

        resolver.set("a.internal", vec![ip(3)]);
        cache.refresh().await;

        assert_eq!(&*cache.cached("a.internal").unwrap(), &[ip(3)]);
        assert_eq!(&*cache.cached("b.internal").unwrap(), &[ip(2)]);

        // Only `a` is used before the next refresh.
        cache.lookup("a.internal").await.unwrap();
        cache.refresh().await;

        assert!(cache.cached("a.internal").is_some());
        assert!(cache.cached("b.internal").is_none());
    }

    #[tokio::test]
    async fn lookups_during_refresh_count_as_used() {
        let resolver = GatedResolver::new(
            StaticResolver::default()
                .with("a.internal", vec![ip(1)])
                .with("b.internal", vec![ip(2)]),
        );
        let cache = DnsCache::new(resolver.clone());

        resolver.gate.add_permits(2);
        cache.lookup("a.internal").await.unwrap();
        cache.lookup("b.internal").await.unwrap();

        // `a` is used going into the refresh, `b` is not.
        resolver.gate.add_permits(2);
        cache.refresh().await;
        cache.lookup("a.internal").await.unwrap();

        let refresh = tokio::spawn({
            let cache = cache.clone();
            async move { cache.refresh().await }
        });
        resolver.entered.notified().await;

        cache.lookup("a.internal").await.unwrap();
        cache.lookup("b.internal").await.unwrap();
        resolver.gate.add_permits(1);
        refresh.await.unwrap();

        assert!(cache.cached("b.internal").is_some());

        // Both were used since the previous refresh began.
        resolver.gate.add_permits(2);
        cache.refresh().await;
        assert!(cache.cached("a.internal").is_some());
        assert!(cache.cached("b.internal").is_some());

        cache.refresh().await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn refresh_keeps_previous_on_failure() {
        let resolver = StaticResolver::default().with("flaky.internal", vec![ip(7)]);
        let cache = DnsCache::new(resolver.clone());
        cache.lookup("flaky.internal").await.unwrap();

        resolver.remove("flaky.internal");
        cache.refresh().await;

        assert_eq!(&*cache.cached("flaky.internal").unwrap(), &[ip(7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_runs_until_stopped() {
        let resolver = StaticResolver::default().with("tick.internal", vec![ip(1)]);
        let cache = DnsCache::new(resolver.clone());
        cache.lookup("tick.internal").await.unwrap();
        assert_eq!(resolver.calls(), 1);

        let refresher = cache.spawn_refresher(Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(resolver.calls(), 1);

        resolver.set("tick.internal", vec![ip(2)]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(resolver.calls(), 2);
        assert_eq!(&*cache.cached("tick.internal").unwrap(), &[ip(2)]);

        refresher.stop();
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(resolver.calls(), 2);
        assert!(refresher.is_finished());
    }
}
