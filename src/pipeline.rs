//! Post-processing applied to every completed exchange.
//!
//! The pipeline turns the transport's result into the [`Response`] handed to the
//! caller: it decompresses gzip bodies, folds transport failures into
//! [`Response::error`], and counts outcomes.

use std::io::Read as _;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, SERVER};
use http::{HeaderMap, StatusCode, Uri};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::request::RequestId;
use crate::response::Response;
use crate::transport::RawResponse;

static SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static FAILED: AtomicU64 = AtomicU64::new(0);

/// Process-wide exchange outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Exchanges that completed without a transport error.
    pub succeeded: u64,

    /// Exchanges that ended with a transport error.
    pub failed: u64,
}

/// Read the process-wide counters, summed over every pool.
pub fn counters() -> Counters {
    Counters {
        succeeded: SUCCEEDED.load(Ordering::Relaxed),
        failed: FAILED.load(Ordering::Relaxed),
    }
}

/// Server header prefixes of known anti-bot reverse proxies.
const CHALLENGE_SERVERS: &[&str] = &["cloudflare", "ddos-guard"];

/// Heuristic check for anti-bot challenge pages.
///
/// A response is flagged when its status is 403, 429 or 503 and its `Server`
/// header starts with the name of a known anti-bot vendor. This is advisory:
/// the dispatcher never acts on it.
pub fn is_challenge(response: &Response) -> bool {
    let status = match response.status() {
        Some(status) => status,
        None => return false,
    };

    if !matches!(
        status,
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
    ) {
        return false;
    }

    response
        .headers()
        .get_all(SERVER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|server| {
            let server = server.trim_start().to_ascii_lowercase();
            CHALLENGE_SERVERS
                .iter()
                .any(|vendor| server.starts_with(vendor))
        })
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("gzip"))
}

/// Decompress a gzip body.
///
/// Returns `None` if the body is not a valid gzip stream.
pub(crate) fn gunzip(body: &[u8]) -> Option<Bytes> {
    let mut decoder = flate2::read::MultiGzDecoder::new(body);
    let mut output = Vec::with_capacity(body.len().saturating_mul(4));
    match decoder.read_to_end(&mut output) {
        Ok(_) => Some(Bytes::from(output)),
        Err(error) => {
            debug!(%error, "gzip decoding failed, passing body through");
            None
        }
    }
}

/// Decode the body in place if the response says it is gzipped.
fn decode(headers: &mut HeaderMap, body: Bytes) -> Bytes {
    if body.is_empty() || !is_gzip(headers) {
        return body;
    }

    match gunzip(&body) {
        Some(decoded) => {
            trace!(
                compressed = body.len(),
                decompressed = decoded.len(),
                "gzip body decoded"
            );
            headers.remove(CONTENT_ENCODING);
            headers.remove(CONTENT_LENGTH);
            decoded
        }
        None => body,
    }
}

/// Run the pipeline over the result of one exchange.
pub(crate) fn finish(
    request_id: RequestId,
    target: Uri,
    result: Result<RawResponse, TransportError>,
) -> Response {
    match result {
        Ok(raw) => {
            SUCCEEDED.fetch_add(1, Ordering::Relaxed);
            let mut headers = raw.headers;
            let body = decode(&mut headers, raw.body);
            Response {
                request_id,
                status: Some(raw.status),
                headers,
                body,
                error: None,
                url: raw.url,
            }
        }
        Err(error) => {
            FAILED.fetch_add(1, Ordering::Relaxed);
            if error.is_abort() {
                debug!(request = %request_id, %error, "exchange stopped");
            } else {
                debug!(request = %request_id, %error, "exchange failed");
            }
            Response::failed(request_id, target, error)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write as _;

    use http::HeaderValue;

    use super::*;
    use crate::Request;

    pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn raw(status: u16, headers: &[(&'static str, &'static str)], body: Bytes) -> RawResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(value));
        }
        RawResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            body,
            url: Uri::from_static("http://example.com/"),
        }
    }

    fn id() -> RequestId {
        Request::get(Uri::from_static("http://example.com/")).id()
    }

    #[test]
    fn gzip_body_is_decoded() {
        let plain = b"<anime><title>Trigun</title></anime>".repeat(20);
        let body = Bytes::from(gzip(&plain));
        let response = finish(
            id(),
            Uri::from_static("http://example.com/"),
            Ok(raw(200, &[("content-encoding", "gzip")], body)),
        );

        assert_eq!(response.body().as_ref(), plain.as_slice());
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert!(response.is_ok());
    }

    #[test]
    fn gzip_match_is_substring_and_case_insensitive() {
        let body = Bytes::from(gzip(b"hello"));
        let response = finish(
            id(),
            Uri::from_static("http://example.com/"),
            Ok(raw(200, &[("Content-Encoding", "x-GZIP")], body)),
        );
        assert_eq!(response.body().as_ref(), b"hello");
    }

    #[test]
    fn broken_gzip_passes_through() {
        let body = Bytes::from_static(b"definitely not gzip");
        let response = finish(
            id(),
            Uri::from_static("http://example.com/"),
            Ok(raw(200, &[("content-encoding", "gzip")], body.clone())),
        );
        assert_eq!(response.body(), &body);
        assert!(response.headers().get(CONTENT_ENCODING).is_some());
        assert!(response.is_ok());
    }

    #[test]
    fn plain_body_untouched() {
        let body = Bytes::from_static(b"plain");
        let response = finish(
            id(),
            Uri::from_static("http://example.com/"),
            Ok(raw(404, &[], body.clone())),
        );
        assert_eq!(response.body(), &body);
        assert_eq!(response.status_code(), 404);
        assert!(response.error().is_none(), "status codes are not errors");
    }

    #[test]
    fn transport_error_is_surfaced() {
        let response = finish(
            id(),
            Uri::from_static("http://example.com/x"),
            Err(TransportError::Timeout),
        );
        assert!(matches!(response.error(), Some(TransportError::Timeout)));
        assert_eq!(response.url(), &Uri::from_static("http://example.com/x"));
    }

    #[test]
    fn counters_move() {
        let before = counters();
        finish(
            id(),
            Uri::from_static("http://example.com/"),
            Ok(raw(200, &[], Bytes::new())),
        );
        finish(
            id(),
            Uri::from_static("http://example.com/"),
            Err(TransportError::Aborted),
        );
        let after = counters();
        assert!(after.succeeded > before.succeeded);
        assert!(after.failed > before.failed);
    }

    #[test]
    fn challenge_detection() {
        let flagged = |status, server: &'static str| {
            let response = finish(
                id(),
                Uri::from_static("http://example.com/"),
                Ok(raw(status, &[("server", server)], Bytes::new())),
            );
            is_challenge(&response)
        };

        assert!(flagged(503, "cloudflare"));
        assert!(flagged(403, "cloudflare-nginx"));
        assert!(flagged(429, "ddos-guard"));
        assert!(!flagged(200, "cloudflare"));
        assert!(!flagged(503, "nginx"));

        let failed = finish(
            id(),
            Uri::from_static("http://example.com/"),
            Err(TransportError::Timeout),
        );
        assert!(!failed.is_challenge());
    }
}
