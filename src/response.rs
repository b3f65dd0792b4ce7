//! Completed exchanges and transfer progress.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri};

use crate::error::TransportError;
use crate::request::RequestId;

/// A progress snapshot for a running exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transfer {
    /// Bytes transferred so far.
    pub current: u64,

    /// Total bytes expected, when the server announced a length.
    pub total: Option<u64>,
}

impl Transfer {
    /// Fraction complete in `0.0..=1.0`, when the total is known.
    pub fn ratio(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.current as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// The outcome of one dispatched request.
///
/// Exactly one `Response` is produced for every request that was admitted and
/// dispatched. A response either carries an HTTP status, or a
/// [`TransportError`] explaining why no status could be obtained.
#[derive(Debug)]
pub struct Response {
    pub(crate) request_id: RequestId,
    pub(crate) status: Option<StatusCode>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) error: Option<TransportError>,
    pub(crate) url: Uri,
}

impl Response {
    pub(crate) fn failed(request_id: RequestId, url: Uri, error: TransportError) -> Self {
        Self {
            request_id,
            status: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            error: Some(error),
            url,
        }
    }

    /// The id of the request this response answers.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The HTTP status, if the exchange got that far.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The numeric status code, or `0` if no status was received.
    pub fn status_code(&self) -> u16 {
        self.status.map(|s| s.as_u16()).unwrap_or(0)
    }

    /// The status class: the status code rounded down to the nearest hundred.
    pub fn status_class(&self) -> u16 {
        let code = self.status_code();
        code - code % 100
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Response body, already decompressed when the server used gzip.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body decoded as UTF-8, replacing invalid sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Take ownership of the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The transport level failure, if any.
    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    /// Returns `true` when no transport error occurred.
    ///
    /// This says nothing about the HTTP status.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The URL the final response came from, after redirects.
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Heuristic check for an anti-bot challenge page.
    ///
    /// See [`crate::pipeline::is_challenge`].
    pub fn is_challenge(&self) -> bool {
        crate::pipeline::is_challenge(self)
    }
}
