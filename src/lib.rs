//! Hyperdispatch
//!
//! An HTTP request dispatcher with per-host and global admission control,
//! built on hyper.
//!
//! Requests go to a [`Pool`] together with two callbacks: one for transfer
//! progress and one for the finished [`Response`]. The pool queues requests
//! per host, starts them on connections while the admission caps allow, and
//! reuses idle connections. Responses are decompressed and classified before
//! they reach the caller.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use hyperdispatch::{Pool, Request};
//!
//! hyperdispatch::init();
//! let pool = Pool::builder().build()?;
//!
//! pool.send(
//!     Request::get("https://example.com/".parse()?),
//!     |transfer| {
//!         println!("{} bytes", transfer.current);
//!         true
//!     },
//!     |response| println!("{}", response.status_code()),
//! )?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::future::Future;
use std::pin::Pin;

pub mod bridge;
mod cancel;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod request;
pub mod response;
pub mod transport;

pub use self::config::{ExchangeOptions, PoolConfig, Proxy, Settings, SharedSettings};
pub use self::error::{AdmissionError, BuildError, TransportError};
pub use self::pool::{Pool, Stats};
pub use self::request::{Payload, Request, RequestId};
pub use self::response::{Response, Transfer};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed, sendable error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Process-wide setup.
///
/// Installs the built-in rustls crypto provider when TLS is enabled and no
/// provider was installed yet. Safe to call any number of times; the transport
/// also does this on its first TLS connection.
pub fn init() {
    #[cfg(feature = "tls")]
    transport::tls::install_provider();

    tracing::trace!("hyperdispatch initialized");
}
