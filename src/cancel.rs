use std::sync::Arc;

/// Cooperative cancellation signal shared between the pool and a running exchange.
///
/// The pool calls [`CancelToken::cancel`]; the exchange either polls
/// [`CancelToken::is_cancelled`] at progress checkpoints or awaits
/// [`CancelToken::cancelled`] alongside the transport future.
#[derive(Debug, Clone)]
pub(crate) struct CancelToken(Arc<tokio::sync::watch::Sender<bool>>);

impl Default for CancelToken {
    fn default() -> Self {
        let (tx, _) = tokio::sync::watch::channel(false);
        Self(Arc::new(tx))
    }
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        if !self.0.send_replace(true) {
            tracing::trace!("sending cancel signal");
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the token has been cancelled.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
