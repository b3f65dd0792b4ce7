//! The transport boundary.
//!
//! A [`Transport`] performs the actual network exchange. The pool never talks to
//! the network itself: every connection it manages owns one [`Session`] produced
//! by the transport, and hands that session one [`Exchange`] at a time.
//!
//! Sessions are [`tower::Service`]s, so any service that accepts an `Exchange`
//! and returns a [`RawResponse`] can be plugged in. [`HttpTransport`] is the
//! default, built on hyper's HTTP/1.1 client connections.

use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri};

use crate::cancel::CancelToken;
use crate::config::ExchangeOptions;
use crate::error::TransportError;
use crate::request::Request;
use crate::response::Transfer;
use crate::BoxFuture;

pub mod http1;
mod io;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
#[cfg(feature = "tls")]
pub(crate) mod tls;

pub use self::http1::HttpTransport;

/// Callback receiving transfer progress. Returning `false` aborts the exchange.
pub type TransferCallback = Box<dyn FnMut(Transfer) -> bool + Send + 'static>;

/// Progress reporting for a running exchange.
///
/// Wraps the caller's transfer callback with the connection's cancellation
/// signal. Once the connection has been cancelled, [`Progress::report`] returns
/// `false` without calling the callback.
pub struct Progress {
    callback: TransferCallback,
    cancel: CancelToken,
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Progress {
    pub(crate) fn new(callback: TransferCallback, cancel: CancelToken) -> Self {
        Self { callback, cancel }
    }

    /// Progress which never aborts and reports to no one.
    pub fn noop() -> Self {
        Self::new(Box::new(|_| true), CancelToken::new())
    }

    /// Report progress. Returns `false` if the exchange should stop.
    pub fn report(&mut self, transfer: Transfer) -> bool {
        if self.cancel.is_cancelled() {
            tracing::trace!("cancellation observed at transfer checkpoint");
            return false;
        }
        (self.callback)(transfer)
    }

    /// Returns `true` if the connection running this exchange was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One request/response exchange handed to a [`Session`].
#[derive(Debug)]
pub struct Exchange {
    /// The request to send.
    pub request: Request,

    /// Options assembled for this exchange.
    pub options: ExchangeOptions,

    /// Progress reporting and cancellation.
    pub progress: Progress,
}

/// A completed exchange, before the response pipeline runs.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status of the final response.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Undecoded response body.
    pub body: Bytes,

    /// URL of the final response, after redirects.
    pub url: Uri,
}

/// A session with a remote host, able to run one exchange at a time.
///
/// This is an alias for a [`tower::Service`] over [`Exchange`]s. The pool calls
/// it from a single task at a time, and drops it if the connection is cancelled.
pub trait Session:
    tower::Service<
        Exchange,
        Response = RawResponse,
        Error = TransportError,
        Future = BoxFuture<'static, Result<RawResponse, TransportError>>,
    > + Send
    + 'static
{
}

impl<S> Session for S where
    S: tower::Service<
            Exchange,
            Response = RawResponse,
            Error = TransportError,
            Future = BoxFuture<'static, Result<RawResponse, TransportError>>,
        > + Send
        + 'static
{
}

/// Produces sessions for new connections.
///
/// Creating a session must not perform I/O; sessions connect lazily when their
/// first exchange runs.
pub trait Transport: Send + Sync + 'static {
    /// The session type produced by this transport.
    type Session: Session;

    /// Create a session for a new connection.
    fn session(&self) -> Self::Session;
}
