//! A connection: one transport session and the task running on it.
//!
//! A connection moves through three states. It starts `Ready`, becomes `Busy`
//! when the pool hands it a request, and returns to `Ready` when the exchange
//! finishes. If cancellation is observed while it is busy it ends `Cancelled`
//! and is never used again.
//!
//! The pool only moves a connection from `Ready` to `Busy`, always under its
//! lock. The exchange task performs the other transitions without the lock,
//! so the state lives in an atomic shared between the two.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tower::ServiceExt as _;
use tracing::{debug, error, trace};

use super::key::HostKey;
use super::{QueuedRequest, Shared};
use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::request::RequestId;
use crate::transport::{Exchange, Progress, RawResponse, Session, Transport};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// Idle and available for a request.
    Ready = 0,

    /// Running an exchange.
    Busy = 1,

    /// Cancelled while busy. Terminal.
    Cancelled = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Ready,
            1 => State::Busy,
            _ => State::Cancelled,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Ready => f.write_str("ready"),
            State::Busy => f.write_str("busy"),
            State::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`. Returns `false` if the state was not `from`.
    fn transition(&self, from: State, to: State) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Where the connection's session currently is.
enum Slot<S> {
    /// Never used; the session is right here.
    Idle(S),

    /// Held by the task of the latest exchange, which hands it back when joined.
    Running(JoinHandle<Option<S>>),

    /// Moved out while a new task is being started.
    Empty,
}

impl<S> fmt::Debug for Slot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Idle(_) => f.write_str("Idle"),
            Slot::Running(handle) if handle.is_finished() => f.write_str("Finished"),
            Slot::Running(_) => f.write_str("Running"),
            Slot::Empty => f.write_str("Empty"),
        }
    }
}

pub(super) struct Connection<S> {
    id: u64,
    key: HostKey,
    state: Arc<AtomicState>,
    cancel: CancelToken,
    slot: Slot<S>,
    current: Option<RequestId>,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state.load())
            .field("slot", &self.slot)
            .field("current", &self.current)
            .finish()
    }
}

impl<S: Session> Connection<S> {
    pub(super) fn new(id: u64, key: HostKey, session: S) -> Self {
        debug!(host = %key, connection = id, "new connection");
        Self {
            id,
            key,
            state: Arc::new(AtomicState::new(State::Ready)),
            cancel: CancelToken::new(),
            slot: Slot::Idle(session),
            current: None,
        }
    }

    pub(super) fn state(&self) -> State {
        self.state.load()
    }

    pub(super) fn is_ready(&self) -> bool {
        self.state() == State::Ready
    }

    /// Counts against the admission caps.
    ///
    /// Only `Busy` counts. A task stores `Cancelled` after its exchange has
    /// produced a result, so a cancelled connection holds no capacity even
    /// while its task is still delivering the response.
    pub(super) fn is_active(&self) -> bool {
        self.state() == State::Busy
    }

    /// No task is running on this connection.
    pub(super) fn is_settled(&self) -> bool {
        match &self.slot {
            Slot::Running(handle) => handle.is_finished(),
            Slot::Idle(_) | Slot::Empty => true,
        }
    }

    /// Returns `true` if this connection is busy with `request`.
    pub(super) fn is_running(&self, request: RequestId) -> bool {
        self.state() == State::Busy && self.current == Some(request)
    }

    /// Ask the running exchange to stop.
    ///
    /// Each exchange gets its own token, so a cancel which arrives after the
    /// exchange finished has no effect on the next one.
    pub(super) fn cancel(&self) {
        trace!(host = %self.key, connection = self.id, "cancelling connection");
        self.cancel.cancel();
    }

    /// Start an exchange for `queued` on this connection.
    ///
    /// The connection must be `Ready`; otherwise the request is handed back.
    pub(super) fn start<T>(
        &mut self,
        queued: QueuedRequest,
        shared: &Arc<Shared<T>>,
    ) -> Result<(), QueuedRequest>
    where
        T: Transport<Session = S>,
    {
        if !self.state.transition(State::Ready, State::Busy) {
            return Err(queued);
        }

        let request = queued.request.id();
        self.current = Some(request);
        self.cancel = CancelToken::new();
        trace!(host = %self.key, connection = self.id, %request, "dispatching");

        let task = Task {
            shared: shared.clone(),
            connection: self.id,
            key: self.key.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            previous: std::mem::replace(&mut self.slot, Slot::Empty),
            queued,
        };
        self.slot = Slot::Running(shared.handle.spawn(task.run()));
        Ok(())
    }
}

/// Everything an exchange task needs, moved onto the task.
struct Task<T: Transport> {
    shared: Arc<Shared<T>>,
    connection: u64,
    key: HostKey,
    state: Arc<AtomicState>,
    cancel: CancelToken,
    previous: Slot<T::Session>,
    queued: QueuedRequest,
}

impl<T: Transport> Task<T> {
    #[tracing::instrument(
        name = "exchange",
        skip_all,
        fields(host = %self.key, connection = self.connection, request = %self.queued.request.id())
    )]
    async fn run(self) -> Option<T::Session> {
        let Task {
            shared,
            state,
            cancel,
            previous,
            queued,
            ..
        } = self;

        // At most one task per connection: wait for the previous one and take
        // its session back.
        let session = match previous {
            Slot::Idle(session) => Some(session),
            Slot::Running(handle) => match handle.await {
                Ok(session) => session,
                Err(error) => {
                    error!(%error, "previous exchange task failed");
                    None
                }
            },
            Slot::Empty => None,
        };
        let mut session = session.unwrap_or_else(|| shared.transport.session());

        let QueuedRequest {
            request,
            on_transfer,
            on_response,
        } = queued;
        let id = request.id();
        let target = request.target().unwrap_or_else(|_| request.uri().clone());

        let exchange = Exchange {
            request,
            options: shared.settings.exchange_options(),
            progress: Progress::new(on_transfer, cancel.clone()),
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = call(&mut session, exchange) => result,
        };

        let cancelled =
            cancel.is_cancelled() || matches!(&result, Err(TransportError::Cancelled));

        let response = crate::pipeline::finish(id, target, result);
        shared.stats.record(&response);

        // Released before the callback runs, so work the callback sends can
        // land on this connection. A new task joins this one first.
        if cancelled {
            state.store(State::Cancelled);
            debug!("connection cancelled");
        } else {
            state.store(State::Ready);
            trace!("connection ready");
        }

        if std::panic::catch_unwind(AssertUnwindSafe(move || on_response(response))).is_err() {
            error!("response callback panicked");
        }

        shared.process_queue();

        if cancelled {
            None
        } else {
            Some(session)
        }
    }
}

async fn call<S: Session>(session: &mut S, exchange: Exchange) -> Result<RawResponse, TransportError> {
    session.ready().await?.call(exchange).await
}
