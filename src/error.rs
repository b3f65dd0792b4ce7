//! Error types for the dispatcher.
//!
//! Two classes of failure exist. An [`AdmissionError`] is returned directly from
//! [`Pool::send`][crate::Pool::send] when a request can never be dispatched; no
//! callback is invoked for it. A [`TransportError`] happens while an exchange is
//! running and is always delivered through [`Response::error`][crate::Response::error].
//!
//! HTTP status codes, including 4xx and 5xx, are not errors at this layer.

use thiserror::Error;

use crate::BoxError;

/// A request was refused by the pool and will never be dispatched.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AdmissionError {
    /// The request target has no authority (host) to connect to.
    #[error("request target has no host: {0}")]
    MissingAuthority(http::Uri),

    /// The request target could not be assembled into a valid URI.
    #[error("invalid request target: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The pool has been shut down and accepts no further work.
    #[error("pool is shutting down")]
    ShuttingDown,
}

/// A [`Pool`][crate::Pool] could not be built.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// No runtime handle was given and `build` was not called from within a
    /// tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// A failure during the network exchange itself.
///
/// The variants mirror the points at which an exchange can fail: name resolution,
/// connecting, the TLS handshake, and the HTTP exchange proper.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The host name could not be resolved.
    #[error("dns: could not resolve {host}")]
    Dns {
        /// The host that failed to resolve.
        host: String,
        /// Underlying resolver error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The TCP connection could not be established.
    #[error("connect: {0}")]
    Connect(#[source] std::io::Error),

    /// The TLS handshake failed or TLS is unavailable.
    #[error("tls: {0}")]
    Tls(#[source] BoxError),

    /// The exchange did not finish within the configured timeout.
    #[error("exchange timed out")]
    Timeout,

    /// The HTTP exchange failed after the connection was established.
    #[error("protocol: {0}")]
    Protocol(#[source] BoxError),

    /// Too many redirects were followed.
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(u32),

    /// The transfer callback asked for the exchange to stop.
    #[error("exchange aborted by transfer callback")]
    Aborted,

    /// The connection running this exchange was cancelled.
    #[error("exchange cancelled")]
    Cancelled,

    /// Generic I/O failure on an established connection.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A redirect or proxy produced an unusable URI.
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// The URI scheme is not supported by this transport.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

impl TransportError {
    pub(crate) fn protocol<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        TransportError::Protocol(error.into())
    }

    pub(crate) fn tls<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        TransportError::Tls(error.into())
    }

    /// Returns `true` if the exchange was stopped on purpose, either by the
    /// caller's transfer callback or by cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, TransportError::Aborted | TransportError::Cancelled)
    }

    /// Returns `true` if the error happened before any bytes were exchanged with
    /// the remote host.
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            TransportError::Dns { .. } | TransportError::Connect(_) | TransportError::Tls(_)
        )
    }
}
