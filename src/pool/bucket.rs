use std::collections::VecDeque;

use tracing::trace;

use super::connection::{Connection, State};
use super::key::HostKey;
use super::QueuedRequest;
use crate::transport::Session;

/// Connections and waiting requests for one host.
#[derive(Debug)]
pub(super) struct Bucket<S> {
    pub(super) key: HostKey,
    pub(super) queue: VecDeque<QueuedRequest>,
    pub(super) connections: Vec<Connection<S>>,
}

impl<S: Session> Bucket<S> {
    pub(super) fn new(key: HostKey) -> Self {
        trace!(host = %key, "new host bucket");
        Self {
            key,
            queue: VecDeque::new(),
            connections: Vec::new(),
        }
    }

    /// Connections counting against the admission caps.
    pub(super) fn active(&self) -> usize {
        self.connections.iter().filter(|c| c.is_active()).count()
    }

    /// Drop connections which can never run again.
    ///
    /// Cancelled connections go once their task has finished. When reuse is
    /// off, idle connections go as well: nothing selects them again, so their
    /// sessions are released here rather than when the pool is dropped.
    pub(super) fn prune(&mut self, reuse: bool) -> usize {
        let before = self.connections.len();
        self.connections.retain(|connection| {
            let keep = match connection.state() {
                State::Busy => true,
                State::Cancelled => !connection.is_settled(),
                State::Ready => reuse || !connection.is_settled(),
            };
            if !keep {
                trace!(host = %self.key, ?connection, "removing connection");
            }
            keep
        });
        before - self.connections.len()
    }

    /// Choose the connection for the next request: an idle one when reuse is
    /// on, otherwise a new one built by `create`.
    pub(super) fn select<F>(&mut self, reuse: bool, create: F) -> &mut Connection<S>
    where
        F: FnOnce(HostKey) -> Connection<S>,
    {
        let idle = if reuse {
            self.connections.iter().position(Connection::is_ready)
        } else {
            None
        };

        let index = match idle {
            Some(index) => {
                trace!(host = %self.key, "reusing idle connection");
                index
            }
            None => {
                self.connections.push(create(self.key.clone()));
                self.connections.len() - 1
            }
        };
        &mut self.connections[index]
    }
}
