//! A scriptable transport for exercising the pool without a network.
//!
//! [`MockTransport`] records every session it creates and every exchange it
//! starts, tracks how many exchanges are live at once (globally and per host),
//! and can hold exchanges on a gate until the test releases them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};

use super::{Exchange, RawResponse, Transport};
use crate::error::TransportError;
use crate::request::RequestId;
use crate::response::Transfer;
use crate::BoxFuture;

/// Transport failures a [`MockReply`] can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Name resolution fails.
    Dns,
    /// The connection is refused.
    Connect,
    /// The exchange times out.
    Timeout,
    /// The server hangs up mid-exchange.
    Protocol,
}

impl MockFailure {
    fn error(self, uri: &Uri) -> TransportError {
        match self {
            MockFailure::Dns => TransportError::Dns {
                host: uri.host().unwrap_or_default().to_owned(),
                source: None,
            },
            MockFailure::Connect => TransportError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock connection refused",
            )),
            MockFailure::Timeout => TransportError::Timeout,
            MockFailure::Protocol => TransportError::protocol("mock connection closed"),
        }
    }
}

/// A scripted reply.
#[derive(Debug, Clone)]
pub struct MockReply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    ticks: Vec<Transfer>,
    delay: Option<Duration>,
    failure: Option<MockFailure>,
}

impl Default for MockReply {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl MockReply {
    /// A reply with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            ticks: Vec::new(),
            delay: None,
            failure: None,
        }
    }

    /// A reply which fails at the transport level.
    pub fn failure(failure: MockFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::default()
        }
    }

    /// Add a response header.
    pub fn header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.append(name, HeaderValue::from_static(value));
        self
    }

    /// Set the response body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Report these progress ticks before replying.
    pub fn ticks(mut self, ticks: impl IntoIterator<Item = Transfer>) -> Self {
        self.ticks = ticks.into_iter().collect();
        self
    }

    /// Wait this long before replying.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// An exchange as seen by the mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    /// Id of the session, in creation order starting at zero.
    pub session: usize,

    /// The request which started.
    pub request: RequestId,

    /// The resolved request target.
    pub uri: Uri,
}

#[derive(Debug, Default)]
struct Live {
    current: usize,
    peak: usize,
    hosts: HashMap<String, (usize, usize)>,
}

#[derive(Debug)]
struct MockState {
    sessions: AtomicUsize,
    started: Mutex<Vec<Started>>,
    started_count: watch::Sender<usize>,
    finished_count: watch::Sender<usize>,
    live: Mutex<Live>,
    gate: Option<Semaphore>,
    replies: Mutex<HashMap<String, MockReply>>,
    fallback: Mutex<MockReply>,
}

/// A transport which answers from a script.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::build(None)
    }
}

impl MockTransport {
    /// Transport which answers every exchange immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport which holds every exchange until [`MockTransport::release`]
    /// lets it through.
    pub fn gated() -> Self {
        Self::build(Some(Semaphore::new(0)))
    }

    fn build(gate: Option<Semaphore>) -> Self {
        Self {
            state: Arc::new(MockState {
                sessions: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
                started_count: watch::channel(0).0,
                finished_count: watch::channel(0).0,
                live: Mutex::new(Live::default()),
                gate,
                replies: Mutex::new(HashMap::new()),
                fallback: Mutex::new(MockReply::default()),
            }),
        }
    }

    /// Reply to requests for exactly `uri` with `reply`.
    pub fn reply(&self, uri: &str, reply: MockReply) -> &Self {
        self.state.replies.lock().insert(uri.to_owned(), reply);
        self
    }

    /// Reply to every unscripted request with `reply`.
    pub fn reply_all(&self, reply: MockReply) -> &Self {
        *self.state.fallback.lock() = reply;
        self
    }

    /// Let `n` held exchanges proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.state.gate {
            gate.add_permits(n);
        }
    }

    /// Open the gate for good.
    pub fn release_all(&self) {
        if let Some(gate) = &self.state.gate {
            gate.close();
        }
    }

    /// Number of sessions created so far.
    pub fn sessions(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    /// Every exchange started so far, in start order.
    pub fn started(&self) -> Vec<Started> {
        self.state.started.lock().clone()
    }

    /// Number of exchanges currently running.
    pub fn current(&self) -> usize {
        self.state.live.lock().current
    }

    /// The largest number of exchanges that were running at once.
    pub fn peak(&self) -> usize {
        self.state.live.lock().peak
    }

    /// The largest number of exchanges to `host` that were running at once.
    ///
    /// `host` is the authority of the request target, e.g. `example.com:80`
    /// or `example.com`.
    pub fn peak_for(&self, host: &str) -> usize {
        self.state
            .live
            .lock()
            .hosts
            .get(host)
            .map(|(_, peak)| *peak)
            .unwrap_or(0)
    }

    /// Wait until at least `n` exchanges have started.
    pub async fn wait_started(&self, n: usize) {
        let mut rx = self.state.started_count.subscribe();
        let _ = rx.wait_for(|started| *started >= n).await;
    }

    /// Wait until at least `n` exchanges have finished or been dropped.
    pub async fn wait_finished(&self, n: usize) {
        let mut rx = self.state.finished_count.subscribe();
        let _ = rx.wait_for(|finished| *finished >= n).await;
    }
}

impl Transport for MockTransport {
    type Session = MockSession;

    fn session(&self) -> Self::Session {
        let id = self.state.sessions.fetch_add(1, Ordering::SeqCst);
        MockSession {
            id,
            state: self.state.clone(),
        }
    }
}

/// Session produced by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockSession {
    id: usize,
    state: Arc<MockState>,
}

/// Marks an exchange live for as long as it exists, even if it is dropped
/// before completing.
struct LiveGuard {
    state: Arc<MockState>,
    host: String,
}

impl LiveGuard {
    fn enter(state: Arc<MockState>, host: String) -> Self {
        {
            let mut live = state.live.lock();
            live.current += 1;
            live.peak = live.peak.max(live.current);
            let entry = live.hosts.entry(host.clone()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        Self { state, host }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        {
            let mut live = self.state.live.lock();
            live.current = live.current.saturating_sub(1);
            if let Some(entry) = live.hosts.get_mut(&self.host) {
                entry.0 = entry.0.saturating_sub(1);
            }
        }
        self.state.finished_count.send_modify(|finished| *finished += 1);
    }
}

impl tower::Service<Exchange> for MockSession {
    type Response = RawResponse;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<RawResponse, TransportError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let state = self.state.clone();
        let session = self.id;

        Box::pin(async move {
            let Exchange {
                request,
                mut progress,
                ..
            } = exchange;
            let uri = request
                .target()
                .map_err(|error| TransportError::InvalidUri(error.to_string()))?;
            let host = uri
                .authority()
                .map(|authority| authority.as_str().to_owned())
                .unwrap_or_default();

            let _guard = LiveGuard::enter(state.clone(), host);
            state.started.lock().push(Started {
                session,
                request: request.id(),
                uri: uri.clone(),
            });
            state.started_count.send_modify(|started| *started += 1);

            if let Some(gate) = &state.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            let reply = state
                .replies
                .lock()
                .get(&uri.to_string())
                .cloned()
                .unwrap_or_else(|| state.fallback.lock().clone());

            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }

            for tick in &reply.ticks {
                if !progress.report(*tick) {
                    return Err(if progress.is_cancelled() {
                        TransportError::Cancelled
                    } else {
                        TransportError::Aborted
                    });
                }
            }

            if let Some(failure) = reply.failure {
                return Err(failure.error(&uri));
            }

            Ok(RawResponse {
                status: reply.status,
                headers: reply.headers,
                body: reply.body,
                url: uri,
            })
        })
    }
}
