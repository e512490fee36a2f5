//! Registry of open sockets and transport sessions.
//!
//! Every accepted socket, destination channel and gateway session is recorded
//! here so the tunnel can close them on shutdown. Forwarding pairs release
//! their own entries when they finish; the tunnel drains whatever is left.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which side of a forwarding pair a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// The connection accepted on the local listener.
    Local,
    /// The channel opened to the destination through the gateway.
    Destination,
}

/// What a registry entry holds.
pub enum Resource<S> {
    /// A socket owned by a forwarding task. Cancelling the token makes the
    /// task drop the socket.
    Socket {
        role: SocketRole,
        cancel: CancellationToken,
    },
    /// A gateway session shared with its forwarding task.
    Session(Arc<S>),
}

/// A registered resource.
pub struct Entry<S> {
    /// Forwarding pair that owns the resource.
    pub pair: u64,
    pub resource: Resource<S>,
}

struct Inner<S> {
    entries: Vec<Entry<S>>,
    next_pair: u64,
    /// Set once the drain has started; later registrations are refused.
    closed: bool,
}

/// Mutex-guarded list of open resources, in registration order.
pub struct Registry<S> {
    inner: Mutex<Inner<S>>,
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                next_pair: 1,
                closed: false,
            }),
        }
    }

    /// Allocate the next forwarding pair id.
    pub async fn next_pair(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_pair;
        inner.next_pair += 1;
        id
    }

    /// Record a socket. Returns `false` if the registry is already draining;
    /// the caller then owns the cleanup.
    pub async fn register_socket(&self, pair: u64, role: SocketRole, cancel: CancellationToken) -> bool {
        self.push(pair, Resource::Socket { role, cancel }).await
    }

    /// Record a gateway session. Same contract as [`Self::register_socket`].
    pub async fn register_session(&self, pair: u64, session: Arc<S>) -> bool {
        self.push(pair, Resource::Session(session)).await
    }

    async fn push(&self, pair: u64, resource: Resource<S>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            debug!(pair, "registry closed, registration refused");
            return false;
        }
        inner.entries.push(Entry { pair, resource });
        true
    }

    /// Remove and return every entry belonging to `pair`.
    pub async fn release(&self, pair: u64) -> Vec<Entry<S>> {
        let mut inner = self.inner.lock().await;
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.entries)
            .into_iter()
            .partition(|e| e.pair == pair);
        inner.entries = kept;
        released
    }

    /// Close the registry and take all remaining entries in registration order.
    pub async fn drain(&self) -> Vec<Entry<S>> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        std::mem::take(&mut inner.entries)
    }

    /// Number of registered sockets (local and destination).
    pub async fn socket_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| matches!(e.resource, Resource::Socket { .. }))
            .count()
    }

    /// Number of registered gateway sessions.
    pub async fn session_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| matches!(e.resource, Resource::Session(_)))
            .count()
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}
