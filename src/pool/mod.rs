//! The dispatcher.
//!
//! A [`Pool`] accepts requests for any host, queues them per host, and starts
//! them on connections while the admission caps allow. Two caps apply: a
//! global cap on active connections, and a cap per host. A connection counts as
//! active from the moment a request is dispatched to it until its exchange has
//! finished.
//!
//! Draining is demand driven. A drain pass runs when a request is sent and
//! again when each exchange completes, so there is no background loop. Each
//! pass visits every host once in the order the hosts were first seen,
//! starting right after the host that was served last. Hosts therefore take
//! turns when global capacity is scarce.
//!
//! All bookkeeping lives behind a single lock which is never held across I/O.
//! Exchanges run on their own tokio tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

mod bucket;
mod connection;
mod key;

use self::bucket::Bucket;
use self::connection::{Connection, State};
pub use self::key::HostKey;
use crate::config::{PoolConfig, Settings, SharedSettings};
use crate::error::{AdmissionError, BuildError};
use crate::request::{Request, RequestId};
use crate::response::{Response, Transfer};
use crate::transport::{HttpTransport, TransferCallback, Transport};

/// Callback receiving the finished response.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send + 'static>;

/// A request waiting in a host queue, with its callbacks.
pub(crate) struct QueuedRequest {
    pub(crate) request: Request,
    pub(crate) on_transfer: TransferCallback,
    pub(crate) on_response: ResponseCallback,
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("request", &self.request.id())
            .finish()
    }
}

/// Pool activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Stats {
    /// Requests started on a connection.
    pub dispatched: u64,

    /// Requests refused by [`Pool::send`].
    pub rejected: u64,

    /// Queued requests discarded by shutdown or [`Pool::cancel`] without a
    /// response.
    pub dropped: u64,

    /// Connections created.
    pub connections_created: u64,

    /// Exchanges which finished without a transport error.
    pub succeeded: u64,

    /// Exchanges which finished with a transport error.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    dispatched: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    connections_created: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl StatCounters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn record(&self, response: &Response) {
        if response.is_ok() {
            Self::add(&self.succeeded, 1);
        } else {
            Self::add(&self.failed, 1);
        }
    }

    fn load(&self) -> Stats {
        Stats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// The state of one host bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct HostSnapshot {
    /// The host.
    pub key: HostKey,

    /// Connections currently held for the host.
    pub connections: usize,

    /// Connections counting against the caps.
    pub active: usize,

    /// Requests waiting for a connection.
    pub queued: usize,
}

/// A point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Snapshot {
    /// Host buckets, in the order they were created.
    pub hosts: Vec<HostSnapshot>,

    /// Counters since the pool was built.
    pub stats: Stats,

    /// Whether [`Pool::shutdown`] has been called.
    pub shutdown: bool,
}

impl Snapshot {
    /// The bucket for `host`, matched against the key's display form
    /// (`http://example.com:8080`) or its authority (`example.com:8080`).
    pub fn host(&self, host: &str) -> Option<&HostSnapshot> {
        self.hosts
            .iter()
            .find(|h| h.key.to_string() == host || h.key.authority().as_str() == host)
    }

    /// Active connections across all hosts.
    pub fn active(&self) -> usize {
        self.hosts.iter().map(|h| h.active).sum()
    }

    /// Queued requests across all hosts.
    pub fn queued(&self) -> usize {
        self.hosts.iter().map(|h| h.queued).sum()
    }
}

struct PoolState<S> {
    buckets: Vec<Bucket<S>>,
    index: HashMap<HostKey, usize>,
    cursor: usize,
    next_connection: u64,
    shutdown: bool,
}

impl<S> fmt::Debug for PoolState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolState")
            .field("hosts", &self.buckets.len())
            .field("cursor", &self.cursor)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

pub(crate) struct Shared<T: Transport> {
    pub(crate) transport: T,
    pub(crate) settings: Arc<dyn Settings>,
    pub(crate) handle: Handle,
    config: PoolConfig,
    state: Mutex<PoolState<T::Session>>,
    stats: StatCounters,
}

impl<T: Transport> Shared<T> {
    #[tracing::instrument(name = "drain", skip_all, level = "trace")]
    pub(crate) fn process_queue(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let PoolState {
            buckets,
            cursor,
            next_connection,
            shutdown,
            ..
        } = &mut *guard;

        if *shutdown {
            trace!("pool is shut down, not draining");
            return;
        }
        if buckets.is_empty() {
            return;
        }

        let reuse = self.settings.reuse_connections();
        for bucket in buckets.iter_mut() {
            bucket.prune(reuse);
        }

        let mut active: usize = buckets.iter().map(Bucket::active).sum();
        let start = *cursor % buckets.len();
        let mut served = None;

        for offset in 0..buckets.len() {
            if active >= self.config.max_connections {
                trace!(active, "global connection cap reached");
                break;
            }

            let index = (start + offset) % buckets.len();
            let bucket = &mut buckets[index];
            let mut host_active = bucket.active();

            while host_active < self.config.max_connections_per_host
                && active < self.config.max_connections
            {
                let Some(queued) = bucket.queue.pop_front() else {
                    break;
                };

                let reuse = self.settings.reuse_connections();
                let connection = bucket.select(reuse, |key| {
                    let id = *next_connection;
                    *next_connection += 1;
                    StatCounters::add(&self.stats.connections_created, 1);
                    Connection::new(id, key, self.transport.session())
                });

                match connection.start(queued, self) {
                    Ok(()) => {
                        StatCounters::add(&self.stats.dispatched, 1);
                        host_active += 1;
                        active += 1;
                        served = Some(index);
                    }
                    Err(queued) => {
                        warn!(host = %bucket.key, "selected connection was not ready");
                        bucket.queue.push_front(queued);
                        break;
                    }
                }
            }

            if !bucket.queue.is_empty() {
                trace!(
                    host = %bucket.key,
                    queued = bucket.queue.len(),
                    host_active,
                    "requests left waiting"
                );
            }
        }

        // The next pass starts after the last host that got a connection.
        if let Some(index) = served {
            *cursor = index + 1;
        }
    }
}

/// Per-host admission controlled request dispatcher.
///
/// `Pool` is a cheap handle: clones share the same queues and connections.
/// See the [module documentation](self) for how dispatching works.
pub struct Pool<T: Transport = HttpTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

impl Pool<HttpTransport> {
    /// Start building a pool with the default HTTP transport.
    pub fn builder() -> Builder<HttpTransport> {
        Builder::new()
    }
}

impl<T: Transport> Pool<T> {
    /// Queue a request and try to dispatch it right away.
    ///
    /// `on_transfer` is called with progress while the response body arrives;
    /// returning `false` aborts the exchange. `on_response` is called exactly
    /// once with the outcome, on a pool task, unless the request is still
    /// queued when the pool shuts down or it is cancelled.
    ///
    /// Requests whose target has no host, and all requests after
    /// [`Pool::shutdown`], are refused. Neither callback is called for them.
    pub fn send<P, R>(
        &self,
        request: Request,
        on_transfer: P,
        on_response: R,
    ) -> Result<RequestId, AdmissionError>
    where
        P: FnMut(Transfer) -> bool + Send + 'static,
        R: FnOnce(Response) + Send + 'static,
    {
        let id = request.id();
        let key = match request
            .target()
            .map_err(AdmissionError::from)
            .and_then(|target| HostKey::try_from(&target))
        {
            Ok(key) => key,
            Err(error) => {
                StatCounters::add(&self.shared.stats.rejected, 1);
                warn!(request = %id, %error, "request rejected");
                return Err(error);
            }
        };

        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                StatCounters::add(&self.shared.stats.rejected, 1);
                StatCounters::add(&self.shared.stats.dropped, 1);
                warn!(request = %id, host = %key, "pool is shut down, dropping request");
                return Err(AdmissionError::ShuttingDown);
            }

            let index = match state.index.get(&key) {
                Some(index) => *index,
                None => {
                    let index = state.buckets.len();
                    state.buckets.push(Bucket::new(key.clone()));
                    state.index.insert(key.clone(), index);
                    index
                }
            };

            let bucket = &mut state.buckets[index];
            bucket.queue.push_back(QueuedRequest {
                request,
                on_transfer: Box::new(on_transfer),
                on_response: Box::new(on_response),
            });
            trace!(request = %id, host = %key, queued = bucket.queue.len(), "request queued");
        }

        self.process_queue();
        Ok(id)
    }

    /// Send a request and wait for its response.
    ///
    /// Returns [`AdmissionError::ShuttingDown`] if the pool shuts down, or the
    /// request is cancelled, before it was dispatched.
    pub async fn fetch(&self, request: Request) -> Result<Response, AdmissionError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(
            request,
            |_| true,
            move |response| {
                let _ = tx.send(response);
            },
        )?;
        rx.await.map_err(|_| AdmissionError::ShuttingDown)
    }

    /// Run a drain pass: start queued requests while the caps allow.
    ///
    /// This happens on its own after every [`Pool::send`] and every completed
    /// exchange. Calling it again is always safe.
    pub fn process_queue(&self) {
        self.shared.process_queue();
    }

    /// Stop the pool.
    ///
    /// Queued requests are dropped without calling their callbacks, running
    /// exchanges are asked to stop, and every later [`Pool::send`] is refused.
    /// Running exchanges still deliver a response, carrying
    /// [`TransportError::Cancelled`][crate::TransportError::Cancelled] when
    /// they were stopped.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;

        let mut dropped = 0;
        let mut cancelled = 0;
        for bucket in state.buckets.iter_mut() {
            dropped += bucket.queue.len();
            bucket.queue.clear();
            for connection in bucket
                .connections
                .iter()
                .filter(|c| c.state() == State::Busy)
            {
                connection.cancel();
                cancelled += 1;
            }
        }

        StatCounters::add(&self.shared.stats.dropped, dropped as u64);
        if dropped > 0 {
            warn!(dropped, cancelled, "pool shut down, queued requests dropped");
        } else {
            debug!(cancelled, "pool shut down");
        }
    }

    /// Cancel a request.
    ///
    /// A queued request is removed and its callbacks are never called. A
    /// running request has its connection cancelled; it still receives a
    /// response carrying
    /// [`TransportError::Cancelled`][crate::TransportError::Cancelled], and the
    /// connection is not reused. Returns `false` if the request is unknown or
    /// already finished.
    pub fn cancel(&self, request: RequestId) -> bool {
        let mut state = self.shared.state.lock();
        for bucket in state.buckets.iter_mut() {
            if let Some(position) = bucket.queue.iter().position(|q| q.request.id() == request) {
                bucket.queue.remove(position);
                StatCounters::add(&self.shared.stats.dropped, 1);
                debug!(%request, host = %bucket.key, "queued request cancelled");
                return true;
            }

            if let Some(connection) = bucket.connections.iter().find(|c| c.is_running(request)) {
                connection.cancel();
                debug!(%request, host = %bucket.key, "running request cancelled");
                return true;
            }
        }
        false
    }

    /// A point-in-time view of hosts, queues and counters.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.shared.state.lock();
        Snapshot {
            hosts: state
                .buckets
                .iter()
                .map(|bucket| HostSnapshot {
                    key: bucket.key.clone(),
                    connections: bucket.connections.len(),
                    active: bucket.active(),
                    queued: bucket.queue.len(),
                })
                .collect(),
            stats: self.shared.stats.load(),
            shutdown: state.shutdown,
        }
    }

    /// The admission configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}

/// Builds a [`Pool`].
pub struct Builder<T> {
    config: PoolConfig,
    settings: Option<Arc<dyn Settings>>,
    transport: T,
    handle: Option<Handle>,
}

impl<T: fmt::Debug> fmt::Debug for Builder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("settings", &self.settings.is_some())
            .field("transport", &self.transport)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Builder<HttpTransport> {
    /// A builder with default caps, default settings and the HTTP transport.
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            settings: None,
            transport: HttpTransport::new(),
            handle: None,
        }
    }
}

impl Default for Builder<HttpTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Builder<T> {
    /// Use the given admission caps.
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Read exchange options and the reuse policy from `settings`.
    pub fn with_settings<S: Settings>(mut self, settings: S) -> Self {
        self.settings = Some(Arc::new(settings));
        self
    }

    /// Use a different transport.
    pub fn with_transport<U: Transport>(self, transport: U) -> Builder<U> {
        Builder {
            config: self.config,
            settings: self.settings,
            transport,
            handle: self.handle,
        }
    }

    /// Spawn exchange tasks on this runtime.
    ///
    /// Defaults to the runtime `build` is called from.
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }
}

impl<T: Transport> Builder<T> {
    /// Build the pool.
    pub fn build(self) -> Result<Pool<T>, BuildError> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(SharedSettings::default()));

        debug!(
            max_connections = self.config.max_connections,
            max_connections_per_host = self.config.max_connections_per_host,
            "building pool"
        );

        Ok(Pool {
            shared: Arc::new(Shared {
                transport: self.transport,
                settings,
                handle,
                config: self.config,
                state: Mutex::new(PoolState {
                    buckets: Vec::new(),
                    index: HashMap::new(),
                    cursor: 0,
                    next_connection: 0,
                    shutdown: false,
                }),
                stats: StatCounters::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{StatusCode, Uri};
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::transport::mock::{MockReply, MockTransport};
    use crate::TransportError;

    assert_impl_all!(Pool: Send, Sync, Clone);
    assert_impl_all!(Pool<MockTransport>: Send, Sync, Clone);

    fn pool(transport: &MockTransport, config: PoolConfig) -> Pool<MockTransport> {
        Builder::new()
            .with_config(config)
            .with_transport(transport.clone())
            .build()
            .unwrap()
    }

    fn get(uri: &'static str) -> Request {
        Request::get(Uri::from_static(uri))
    }

    #[tokio::test]
    async fn rejects_targets_without_host() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::default());
        let result = pool.send(
            get("/relative"),
            |_| panic!("transfer callback"),
            |_| panic!("response callback"),
        );
        assert!(matches!(result, Err(AdmissionError::MissingAuthority(_))));

        let snapshot = pool.snapshot();
        assert!(snapshot.hosts.is_empty());
        assert_eq!(snapshot.stats.rejected, 1);
        assert_eq!(transport.sessions(), 0);
    }

    #[tokio::test]
    async fn fetch_round_trip() {
        let transport = MockTransport::new();
        transport.reply(
            "http://example.com/a",
            MockReply::new(StatusCode::CREATED).body("made"),
        );
        let pool = pool(&transport, PoolConfig::default());

        let response = pool.fetch(get("http://example.com/a")).await.unwrap();
        assert_eq!(response.status(), Some(StatusCode::CREATED));
        assert_eq!(response.body(), "made");

        let stats = pool.snapshot().stats;
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn per_host_cap_queues_excess() {
        let transport = MockTransport::gated();
        let pool = pool(&transport, PoolConfig::new(10, 2));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for _ in 0..5 {
            let tx = tx.clone();
            pool.send(get("http://example.com/"), |_| true, move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        }

        transport.wait_started(2).await;
        let host = pool.snapshot().host("example.com").cloned().unwrap();
        assert_eq!(host.active, 2);
        assert_eq!(host.queued, 3);

        transport.release_all();
        for _ in 0..5 {
            assert!(rx.recv().await.unwrap().is_ok());
        }
        assert_eq!(transport.peak_for("example.com"), 2);
    }

    #[tokio::test]
    async fn cancel_queued_request() {
        let transport = MockTransport::gated();
        let pool = pool(&transport, PoolConfig::new(1, 1));

        let first = pool.send(get("http://a.test/"), |_| true, |_| {}).unwrap();
        let second = pool
            .send(get("http://a.test/"), |_| true, |_| panic!("never delivered"))
            .unwrap();
        transport.wait_started(1).await;

        assert!(pool.cancel(second));
        assert!(!pool.cancel(second));
        assert_eq!(pool.snapshot().stats.dropped, 1);

        transport.release_all();
        transport.wait_finished(1).await;
        assert_eq!(transport.started().len(), 1);
        assert_eq!(transport.started()[0].request, first);
    }

    #[tokio::test]
    async fn cancel_running_request() {
        let transport = MockTransport::gated();
        let pool = pool(&transport, PoolConfig::default());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = pool
            .send(get("http://a.test/"), |_| true, move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        transport.wait_started(1).await;

        assert!(pool.cancel(id));
        let response = rx.await.unwrap();
        assert!(matches!(response.error(), Some(TransportError::Cancelled)));

        // The cancelled connection is gone once its task has finished, and a
        // new request gets a fresh one.
        transport.release_all();
        let response = pool.fetch(get("http://a.test/")).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(transport.sessions(), 2);
    }

    #[tokio::test]
    async fn settings_are_read_per_exchange() {
        let transport = MockTransport::new();
        transport.reply_all(MockReply::new(StatusCode::OK).delay(Duration::from_millis(1)));
        let settings = SharedSettings::default();
        let pool = Builder::new()
            .with_settings(settings.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap();

        pool.fetch(get("http://a.test/")).await.unwrap();
        settings.set_reuse_connections(false);
        pool.fetch(get("http://a.test/")).await.unwrap();
        pool.fetch(get("http://a.test/")).await.unwrap();

        assert_eq!(transport.sessions(), 3);
        assert_eq!(pool.snapshot().stats.connections_created, 3);
    }

    #[test]
    fn build_requires_runtime() {
        let result = Builder::new().build();
        assert!(matches!(result, Err(BuildError::NoRuntime(_))));
    }
}
