//! Pool configuration and per-exchange options.
//!
//! Two kinds of configuration exist. [`PoolConfig`] is fixed when the pool is
//! built and controls admission. [`ExchangeOptions`] come from a [`Settings`]
//! source and are read again at the start of every exchange, so changes apply
//! to the next exchange even on a reused connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use http::{HeaderValue, Uri};
use parking_lot::RwLock;

/// Default global cap on simultaneously busy connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Default per-host cap on simultaneously busy connections.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 6;

/// Configuration for admission control in a [`Pool`][crate::Pool].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of busy connections across all hosts.
    pub max_connections: usize,

    /// Maximum number of busy connections to a single host.
    pub max_connections_per_host: usize,
}

impl PoolConfig {
    /// Create a configuration with explicit caps.
    ///
    /// Caps of zero are raised to one, since a pool that can never dispatch
    /// would queue forever.
    pub fn new(max_connections: usize, max_connections_per_host: usize) -> Self {
        Self {
            max_connections: max_connections.max(1),
            max_connections_per_host: max_connections_per_host.max(1),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
        }
    }
}

/// An HTTP proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct Proxy {
    /// Proxy host, optionally with a port and scheme (`proxy.local:3128`).
    pub host: String,

    /// Username for basic proxy authentication.
    pub username: Option<String>,

    /// Password for basic proxy authentication.
    pub password: Option<String>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl Proxy {
    /// A proxy without credentials.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
        }
    }

    /// Add basic authentication credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// The proxy address as a URI. A missing scheme means `http`.
    pub fn uri(&self) -> Result<Uri, http::uri::InvalidUri> {
        if self.host.contains("://") {
            self.host.parse()
        } else {
            format!("http://{}", self.host).parse()
        }
    }

    /// The `Proxy-Authorization` header value, when a username is set.
    pub fn authorization(&self) -> Option<HeaderValue> {
        let username = self.username.as_deref().filter(|u| !u.is_empty())?;
        let password = self.password.as_deref().unwrap_or("");
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        let mut value = HeaderValue::from_str(&format!("Basic {token}")).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

/// Default per-exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default redirect limit. Twenty is the number browsers use.
pub const DEFAULT_MAX_REDIRECTS: u32 = 20;

/// Options applied to a single exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ExchangeOptions {
    /// Timeout for the whole exchange, redirects included.
    pub timeout: Duration,

    /// Maximum number of redirects to follow. Zero disables following.
    pub max_redirects: u32,

    /// Verify TLS certificates and host names.
    pub verify_tls: bool,

    /// Skip certificate revocation checks.
    pub no_revoke: bool,

    /// Proxy to send requests through.
    pub proxy: Option<Proxy>,

    /// Log the request and response lines and headers.
    pub verbose: bool,

    /// `User-Agent` used when the request does not set one.
    pub user_agent: Option<String>,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            verify_tls: true,
            no_revoke: false,
            proxy: None,
            verbose: false,
            user_agent: Some(concat!("hyperdispatch/", env!("CARGO_PKG_VERSION")).to_owned()),
        }
    }
}

impl ExchangeOptions {
    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the redirect limit.
    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Enable or disable TLS verification.
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Enable or disable revocation checks.
    pub fn with_no_revoke(mut self, no_revoke: bool) -> Self {
        self.no_revoke = no_revoke;
        self
    }

    /// Route exchanges through a proxy.
    pub fn with_proxy(mut self, proxy: Option<Proxy>) -> Self {
        self.proxy = proxy.filter(|p| !p.host.is_empty());
        self
    }

    /// Enable verbose transport logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the default user agent.
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Source of configuration owned outside the dispatcher.
///
/// Both methods are called often: `exchange_options` at the start of every
/// exchange and `reuse_connections` every time a connection is selected. They
/// should be cheap and must not block on I/O.
pub trait Settings: Send + Sync + 'static {
    /// Options for the exchange that is about to start.
    fn exchange_options(&self) -> ExchangeOptions;

    /// Prefer an idle connection over creating a new one.
    fn reuse_connections(&self) -> bool;
}

#[derive(Debug, Clone)]
struct SettingsValues {
    options: ExchangeOptions,
    reuse: bool,
}

/// In-memory [`Settings`] that can be changed while the pool is running.
///
/// Clones share the same values.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<SettingsValues>>,
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(ExchangeOptions::default(), true)
    }
}

impl SharedSettings {
    /// Create settings with the given options and reuse policy.
    pub fn new(options: ExchangeOptions, reuse: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SettingsValues { options, reuse })),
        }
    }

    /// Replace the exchange options.
    pub fn set_options(&self, options: ExchangeOptions) {
        self.inner.write().options = options;
    }

    /// Modify the exchange options in place.
    pub fn update_options<F>(&self, update: F)
    where
        F: FnOnce(&mut ExchangeOptions),
    {
        update(&mut self.inner.write().options);
    }

    /// Change the reuse policy.
    pub fn set_reuse_connections(&self, reuse: bool) {
        self.inner.write().reuse = reuse;
    }
}

impl Settings for SharedSettings {
    fn exchange_options(&self) -> ExchangeOptions {
        self.inner.read().options.clone()
    }

    fn reuse_connections(&self) -> bool {
        self.inner.read().reuse
    }
}
