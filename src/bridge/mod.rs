//! Glue between tokio and hyper.

/// Tokio streams behind hyper's I/O traits.
pub mod io;
