//! Outgoing requests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, REFERER};
use http::{HeaderMap, Method, Uri};

/// Process-unique identifier for a request.
///
/// Every request receives an id when it is created so that callers can correlate
/// responses and cancel work they no longer need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value of this id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{:010}", self.0)
    }
}

/// The body sent with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    /// No body.
    #[default]
    Empty,

    /// Raw bytes, sent as-is.
    Bytes(Bytes),

    /// Form parameters, sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
}

impl Payload {
    /// Encode the payload into the bytes that go on the wire.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Empty => Bytes::new(),
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Form(params) => Bytes::from(encode_pairs(params)),
        }
    }

    /// The content type implied by the payload, if any.
    pub fn content_type(&self) -> Option<HeaderValue> {
        match self {
            Payload::Form(_) => Some(HeaderValue::from_static(
                "application/x-www-form-urlencoded",
            )),
            _ => None,
        }
    }

    /// Returns `true` if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Bytes(bytes) => bytes.is_empty(),
            Payload::Form(params) => params.is_empty(),
        }
    }
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// An HTTP request waiting to be dispatched.
///
/// Requests are plain data. Once handed to [`Pool::send`][crate::Pool::send]
/// they are owned by the pool and never modified again.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Payload,
    query: Vec<(String, String)>,
}

impl Request {
    /// Create a new request with the given method and target.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            id: RequestId::next(),
            method,
            uri,
            headers: HeaderMap::new(),
            body: Payload::Empty,
            query: Vec::new(),
        }
    }

    /// Create a `GET` request.
    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Create a `POST` request.
    pub fn post(uri: Uri) -> Self {
        Self::new(Method::POST, uri)
    }

    /// Add a header, replacing any previous value with the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a query parameter, appended to the target when the request is sent.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Use raw bytes as the request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Payload::Bytes(body.into());
        self
    }

    /// Use form parameters as the request body.
    pub fn with_form<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Payload::Form(
            params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Set the `Referer` header.
    pub fn with_referer(self, referer: HeaderValue) -> Self {
        self.with_header(REFERER, referer)
    }

    /// The id assigned to this request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target, without the extra query parameters.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The request body.
    pub fn body(&self) -> &Payload {
        &self.body
    }

    /// Extra query parameters.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// The fully resolved target, with query parameters appended.
    pub fn target(&self) -> Result<Uri, http::uri::InvalidUri> {
        if self.query.is_empty() {
            return Ok(self.uri.clone());
        }

        let encoded = encode_pairs(&self.query);
        let mut target = self.uri.to_string();
        match self.uri.query() {
            Some(existing) if !existing.is_empty() => target.push('&'),
            Some(_) => {}
            None => target.push('?'),
        }
        target.push_str(&encoded);
        target.parse()
    }

    /// Headers as they should be sent, including the implied content type.
    pub(crate) fn effective_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(content_type) = self.body.content_type() {
            headers.entry(CONTENT_TYPE).or_insert(content_type);
        }
        headers
    }
}
