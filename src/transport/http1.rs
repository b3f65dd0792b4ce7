//! HTTP/1.1 transport built on hyper client connections.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION,
    PROXY_AUTHORIZATION, USER_AGENT,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::{BodyExt as _, Full};
use hyper::client::conn::http1::SendRequest;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::io::Stream;
use super::{Exchange, Progress, RawResponse, Transport};
use crate::bridge::io::TokioIo;
use crate::config::{ExchangeOptions, Proxy};
use crate::error::TransportError;
use crate::response::Transfer;
use crate::BoxFuture;

type Sender = SendRequest<Full<Bytes>>;

/// The default transport, speaking HTTP/1.1 over TCP with optional TLS.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    _priv: (),
}

impl HttpTransport {
    /// Create a new transport.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for HttpTransport {
    type Session = HttpSession;

    fn session(&self) -> Self::Session {
        HttpSession::default()
    }
}

/// Where a cached hyper connection leads.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    secure: bool,
    host: String,
    port: u16,
    proxy: Option<String>,
    verify_tls: bool,
}

impl Endpoint {
    fn new(uri: &Uri, options: &ExchangeOptions) -> Result<Self, TransportError> {
        let secure = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => return Err(TransportError::UnsupportedScheme(other.to_owned())),
            None => return Err(TransportError::InvalidUri(uri.to_string())),
        };
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TransportError::InvalidUri(uri.to_string()))?
            .to_owned();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        Ok(Self {
            secure,
            host,
            port,
            proxy: options.proxy.as_ref().map(|proxy| proxy.host.clone()),
            verify_tls: options.verify_tls,
        })
    }

    fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Plain http through a proxy uses absolute-form request targets.
    fn absolute_form(&self) -> bool {
        self.proxy.is_some() && !self.secure
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.authority())?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {proxy}")?;
        }
        Ok(())
    }
}

/// A keep-alive session produced by [`HttpTransport`].
///
/// The session keeps the hyper connection from its last exchange and reuses it
/// when the next exchange goes to the same endpoint. Any failure drops it.
#[derive(Debug, Clone, Default)]
pub struct HttpSession {
    cached: Arc<Mutex<Option<(Endpoint, Sender)>>>,
}

impl tower::Service<Exchange> for HttpSession {
    type Response = RawResponse;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<RawResponse, TransportError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let cached = self.cached.clone();
        Box::pin(async move {
            let Exchange {
                request,
                options,
                mut progress,
            } = exchange;

            let mut redirects = Redirects::new(&request, &options)?;
            let run = redirects.follow(&cached, &options, &mut progress);
            if options.timeout.is_zero() {
                return run.await;
            }

            match tokio::time::timeout(options.timeout, run).await {
                Ok(result) => result,
                Err(_) => {
                    cached.lock().take();
                    Err(TransportError::Timeout)
                }
            }
        })
    }
}

/// The evolving request as redirects are followed.
struct Redirects {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl Redirects {
    fn new(request: &crate::Request, options: &ExchangeOptions) -> Result<Self, TransportError> {
        let uri = request
            .target()
            .map_err(|error| TransportError::InvalidUri(error.to_string()))?;

        let mut headers = request.effective_headers();
        if let Some(user_agent) = &options.user_agent {
            if !headers.contains_key(USER_AGENT) {
                let value = HeaderValue::from_str(user_agent).map_err(TransportError::protocol)?;
                headers.insert(USER_AGENT, value);
            }
        }
        headers
            .entry(ACCEPT_ENCODING)
            .or_insert(HeaderValue::from_static("gzip"));

        Ok(Self {
            method: request.method().clone(),
            uri,
            headers,
            body: request.body().to_bytes(),
        })
    }

    async fn follow(
        &mut self,
        cached: &Mutex<Option<(Endpoint, Sender)>>,
        options: &ExchangeOptions,
        progress: &mut Progress,
    ) -> Result<RawResponse, TransportError> {
        let mut followed = 0;
        loop {
            let response = self.send(cached, options, progress).await?;
            if options.max_redirects == 0 || !is_redirect(response.status) {
                return Ok(response);
            }

            let Some(location) = response
                .headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return Ok(response);
            };

            if followed >= options.max_redirects {
                return Err(TransportError::TooManyRedirects(options.max_redirects));
            }
            followed += 1;

            let next = resolve(&self.uri, location)?;
            trace!(status = %response.status, from = %self.uri, to = %next, "following redirect");
            self.redirect(response.status, next);
        }
    }

    fn redirect(&mut self, status: StatusCode, next: Uri) {
        if matches!(
            status,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
        ) && self.method != Method::HEAD
        {
            self.method = Method::GET;
            self.body = Bytes::new();
            self.headers.remove(CONTENT_TYPE);
            self.headers.remove(CONTENT_LENGTH);
        }

        if next.authority() != self.uri.authority() {
            self.headers.remove(AUTHORIZATION);
            self.headers.remove(COOKIE);
        }

        self.uri = next;
    }

    async fn send(
        &self,
        cached: &Mutex<Option<(Endpoint, Sender)>>,
        options: &ExchangeOptions,
        progress: &mut Progress,
    ) -> Result<RawResponse, TransportError> {
        if progress.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let endpoint = Endpoint::new(&self.uri, options)?;
        let mut sender = checkout(cached, &endpoint, options).await?;
        let request = self.build(&endpoint, options)?;

        if options.verbose {
            debug!(
                method = %request.method(),
                uri = %self.uri,
                headers = ?request.headers(),
                "> request"
            );
        }

        let response = sender
            .send_request(request)
            .await
            .map_err(TransportError::protocol)?;
        let (parts, mut incoming) = response.into_parts();

        if options.verbose {
            debug!(
                status = %parts.status,
                version = ?parts.version,
                headers = ?parts.headers,
                "< response"
            );
        }

        let total = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        let mut body = BytesMut::new();
        while let Some(frame) = incoming.frame().await {
            let frame = frame.map_err(TransportError::protocol)?;
            if let Ok(data) = frame.into_data() {
                body.extend_from_slice(&data);
                let transfer = Transfer {
                    current: body.len() as u64,
                    total,
                };
                if !progress.report(transfer) {
                    return Err(if progress.is_cancelled() {
                        TransportError::Cancelled
                    } else {
                        TransportError::Aborted
                    });
                }
            }
        }

        *cached.lock() = Some((endpoint, sender));

        Ok(RawResponse {
            status: parts.status,
            headers: parts.headers,
            body: body.freeze(),
            url: self.uri.clone(),
        })
    }

    fn build(
        &self,
        endpoint: &Endpoint,
        options: &ExchangeOptions,
    ) -> Result<http::Request<Full<Bytes>>, TransportError> {
        let target = if endpoint.absolute_form() {
            self.uri.clone()
        } else {
            let path = self
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .filter(|pq| !pq.is_empty())
                .unwrap_or("/");
            path.parse::<Uri>()
                .map_err(|error| TransportError::InvalidUri(error.to_string()))?
        };

        let mut request = http::Request::new(Full::new(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = target;
        *request.headers_mut() = self.headers.clone();

        let headers = request.headers_mut();
        if !headers.contains_key(HOST) {
            let host = self
                .uri
                .authority()
                .map(|authority| authority.as_str())
                .unwrap_or(endpoint.host.as_str());
            let host = host.rsplit('@').next().unwrap_or(host);
            let value = HeaderValue::from_str(host)
                .map_err(|error| TransportError::InvalidUri(error.to_string()))?;
            headers.insert(HOST, value);
        }

        if self.body.is_empty()
            && matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
            && !headers.contains_key(CONTENT_LENGTH)
        {
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }

        if endpoint.absolute_form() {
            if let Some(authorization) = options.proxy.as_ref().and_then(Proxy::authorization) {
                headers.insert(PROXY_AUTHORIZATION, authorization);
            }
        }

        Ok(request)
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Resolve a `Location` header against the URI it was received from.
fn resolve(base: &Uri, location: &str) -> Result<Uri, TransportError> {
    let invalid = |_| TransportError::InvalidUri(location.to_owned());

    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Ok(uri);
        }
    }

    let scheme = base.scheme_str().unwrap_or("http");
    if let Some(rest) = location.strip_prefix("//") {
        return format!("{scheme}://{rest}").parse().map_err(invalid);
    }

    let authority = base
        .authority()
        .map(|authority| authority.as_str())
        .unwrap_or_default();

    let path = if location.starts_with('/') {
        location.to_owned()
    } else if location.starts_with('?') {
        format!("{}{location}", base.path())
    } else {
        let directory = base
            .path()
            .rsplit_once('/')
            .map(|(directory, _)| directory)
            .unwrap_or_default();
        format!("{directory}/{location}")
    };

    format!("{scheme}://{authority}{path}")
        .parse()
        .map_err(invalid)
}

/// Take the cached connection if it leads to `endpoint` and is still usable,
/// otherwise open a new one.
async fn checkout(
    cached: &Mutex<Option<(Endpoint, Sender)>>,
    endpoint: &Endpoint,
    options: &ExchangeOptions,
) -> Result<Sender, TransportError> {
    let previous = cached.lock().take();
    if let Some((key, mut sender)) = previous {
        if &key == endpoint && !sender.is_closed() && sender.ready().await.is_ok() {
            trace!(%endpoint, "reusing connection");
            return Ok(sender);
        }
        trace!(%key, "discarding cached connection");
    }

    connect(endpoint, options).await
}

#[tracing::instrument(name = "connect", skip_all, fields(%endpoint))]
async fn connect(endpoint: &Endpoint, options: &ExchangeOptions) -> Result<Sender, TransportError> {
    let proxy = match &options.proxy {
        Some(proxy) => Some((proxy, proxy_address(proxy)?)),
        None => None,
    };

    let tcp = match &proxy {
        Some((_, (host, port))) => dial(host, *port).await?,
        None => dial(&endpoint.host, endpoint.port).await?,
    };

    let stream = if endpoint.secure {
        let tcp = match &proxy {
            Some((proxy, _)) => tunnel(tcp, &endpoint.authority(), proxy).await?,
            None => tcp,
        };
        secure(tcp, endpoint, options).await?
    } else {
        Stream::Plain(tcp)
    };

    trace!("handshake h1");
    let (sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake(TokioIo::new(stream))
        .await
        .map_err(TransportError::protocol)?;
    tokio::spawn(async {
        if let Err(err) = conn.await {
            debug!(%err, "h1 connection driver error");
        }
    });
    trace!("handshake complete");

    Ok(sender)
}

fn proxy_address(proxy: &Proxy) -> Result<(String, u16), TransportError> {
    let uri = proxy
        .uri()
        .map_err(|error| TransportError::InvalidUri(error.to_string()))?;
    match uri.scheme_str() {
        Some("http") | None => {}
        Some(other) => return Err(TransportError::UnsupportedScheme(other.to_owned())),
    }
    let host = uri
        .host()
        .ok_or_else(|| TransportError::InvalidUri(proxy.host.clone()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    Ok((host, uri.port_u16().unwrap_or(80)))
}

async fn dial(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|error| TransportError::Dns {
            host: host.to_owned(),
            source: Some(error),
        })?;

    let mut last = None;
    for addr in addrs {
        trace!(%addr, "connecting");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(error) => {
                trace!(%addr, %error, "connect attempt failed");
                last = Some(error);
            }
        }
    }

    Err(match last {
        Some(error) => TransportError::Connect(error),
        None => TransportError::Dns {
            host: host.to_owned(),
            source: None,
        },
    })
}

/// Open a `CONNECT` tunnel through an HTTP proxy.
async fn tunnel(
    mut tcp: TcpStream,
    authority: &str,
    proxy: &Proxy,
) -> Result<TcpStream, TransportError> {
    let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(authorization) = proxy.authorization() {
        if let Ok(value) = authorization.to_str() {
            head.push_str("Proxy-Authorization: ");
            head.push_str(value);
            head.push_str("\r\n");
        }
    }
    head.push_str("\r\n");
    tcp.write_all(head.as_bytes()).await?;

    let mut buffer = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    while !buffer.windows(4).any(|window| window == b"\r\n\r\n") {
        if buffer.len() > 8 * 1024 {
            return Err(TransportError::protocol("proxy response head too large"));
        }
        let n = tcp.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::protocol(
                "proxy closed the connection during CONNECT",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buffer);
    let line = head.lines().next().unwrap_or_default();
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());
    match status {
        Some(code) if (200..300).contains(&code) => {
            trace!(%authority, "proxy tunnel established");
            Ok(tcp)
        }
        _ => Err(TransportError::Connect(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("proxy refused tunnel: {line}"),
        ))),
    }
}

#[cfg(feature = "tls")]
async fn secure(
    tcp: TcpStream,
    endpoint: &Endpoint,
    options: &ExchangeOptions,
) -> Result<Stream, TransportError> {
    if options.no_revoke {
        trace!("revocation checks are not performed, no_revoke has no effect");
    }

    let config = super::tls::client_config(options.verify_tls)?;
    let name = super::tls::server_name(&endpoint.host)?;
    let stream = tokio_rustls::TlsConnector::from(config)
        .connect(name, tcp)
        .await
        .map_err(TransportError::tls)?;
    trace!("tls handshake complete");
    Ok(Stream::Tls(Box::new(stream)))
}

#[cfg(not(feature = "tls"))]
async fn secure(
    _tcp: TcpStream,
    _endpoint: &Endpoint,
    _options: &ExchangeOptions,
) -> Result<Stream, TransportError> {
    Err(TransportError::UnsupportedScheme("https".to_owned()))
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(HttpSession: Send, Sync, Clone);
    assert_impl_all!(HttpTransport: Send, Sync);

    #[test]
    fn resolve_locations() {
        let base = Uri::from_static("http://example.com/a/b?x=1");
        assert_eq!(
            resolve(&base, "https://other.net/c").unwrap(),
            "https://other.net/c"
        );
        assert_eq!(
            resolve(&base, "//cdn.example.com/img").unwrap(),
            "http://cdn.example.com/img"
        );
        assert_eq!(
            resolve(&base, "/root").unwrap(),
            "http://example.com/root"
        );
        assert_eq!(
            resolve(&base, "sibling").unwrap(),
            "http://example.com/a/sibling"
        );
        assert_eq!(
            resolve(&base, "?page=2").unwrap(),
            "http://example.com/a/b?page=2"
        );
    }

    #[test]
    fn endpoints() {
        let options = ExchangeOptions::default();
        let endpoint = Endpoint::new(&Uri::from_static("https://example.com/x"), &options).unwrap();
        assert!(endpoint.secure);
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.to_string(), "https://example.com:443");

        let endpoint =
            Endpoint::new(&Uri::from_static("http://[::1]:8080/"), &options).unwrap();
        assert_eq!(endpoint.authority(), "[::1]:8080");

        assert!(matches!(
            Endpoint::new(&Uri::from_static("ftp://example.com/"), &options),
            Err(TransportError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn proxied_plain_http_uses_absolute_form() {
        let options = ExchangeOptions::default().with_proxy(Some(
            Proxy::new("proxy.local:3128").with_credentials("user", "pass"),
        ));
        let request = crate::Request::get(Uri::from_static("http://example.com/a?b=c"));
        let redirects = Redirects::new(&request, &options).unwrap();
        let endpoint = Endpoint::new(&redirects.uri, &options).unwrap();
        let built = redirects.build(&endpoint, &options).unwrap();

        assert_eq!(built.uri(), &Uri::from_static("http://example.com/a?b=c"));
        assert_eq!(built.headers()[HOST], "example.com");
        assert!(built.headers().contains_key(PROXY_AUTHORIZATION));
        assert_eq!(built.headers()[ACCEPT_ENCODING], "gzip");
        assert!(built.headers().contains_key(USER_AGENT));
    }

    #[test]
    fn direct_requests_use_origin_form() {
        let options = ExchangeOptions::default();
        let request = crate::Request::post(Uri::from_static("http://example.com:8080"));
        let redirects = Redirects::new(&request, &options).unwrap();
        let endpoint = Endpoint::new(&redirects.uri, &options).unwrap();
        let built = redirects.build(&endpoint, &options).unwrap();

        assert_eq!(built.uri(), "/");
        assert_eq!(built.headers()[HOST], "example.com:8080");
        assert_eq!(built.headers()[CONTENT_LENGTH], "0");
        assert!(!built.headers().contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn see_other_downgrades_to_get() {
        let options = ExchangeOptions::default();
        let request = crate::Request::post(Uri::from_static("http://example.com/form"))
            .with_form([("a", "b")])
            .with_header(AUTHORIZATION, HeaderValue::from_static("secret"));
        let mut redirects = Redirects::new(&request, &options).unwrap();

        redirects.redirect(
            StatusCode::TEMPORARY_REDIRECT,
            Uri::from_static("http://example.com/again"),
        );
        assert_eq!(redirects.method, Method::POST);
        assert!(!redirects.body.is_empty());
        assert!(redirects.headers.contains_key(AUTHORIZATION));

        redirects.redirect(
            StatusCode::SEE_OTHER,
            Uri::from_static("http://elsewhere.com/done"),
        );
        assert_eq!(redirects.method, Method::GET);
        assert!(redirects.body.is_empty());
        assert!(!redirects.headers.contains_key(CONTENT_TYPE));
        assert!(!redirects.headers.contains_key(AUTHORIZATION));
    }
}
