//! Tunnel controller: listener, accept loop and shutdown.
//!
//! A [`Tunnel`] binds one local listener and hands every accepted connection
//! to the [`Forwarder`] on a tracked task. [`Tunnel::close`] cancels the
//! shutdown token; the accept loop then stops, the registry is drained in
//! registration order, and [`Tunnel::start`] returns once every forwarding
//! task has finished.
//!
//! ```text
//! Idle ──start──► Listening ──close──► Closing ──drained──► Closed
//!   │                                                          ▲
//!   └──────────── bind failure / close before start ───────────┘
//! ```

use crate::endpoint::Endpoint;
use crate::error::{TunnelError, TunnelResult};
use crate::forwarder::Forwarder;
use crate::registry::{Registry, Resource, SocketRole};
use crate::transport::{Transport, TransportSession};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Lifecycle of a [`Tunnel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Constructed, not started.
    Idle,
    /// Listener bound, accept loop running.
    Listening,
    /// Shutdown observed, draining open resources.
    Closing,
    /// Terminal.
    Closed,
}

/// Tunables for a [`Tunnel`].
#[derive(Debug, Clone, Default)]
pub struct TunnelOptions {
    /// Close an accepted connection as soon as its gateway or destination
    /// dial fails. By default the connection is kept open until shutdown.
    pub close_on_dial_failure: bool,
}

/// A single-use local port forward through a gateway.
pub struct Tunnel<T: Transport> {
    /// Requested local endpoint; holds the bound port once listening.
    local: RwLock<Endpoint>,
    gateway: Endpoint,
    destination: Endpoint,
    transport: Arc<T>,
    options: TunnelOptions,
    registry: Arc<Registry<T::Session>>,
    shutdown: CancellationToken,
    state: watch::Sender<TunnelState>,
    started: AtomicBool,
}

impl<T: Transport> Tunnel<T> {
    pub fn new(transport: T, local: Endpoint, gateway: Endpoint, destination: Endpoint) -> Self {
        let (state, _) = watch::channel(TunnelState::Idle);
        Self {
            local: RwLock::new(local),
            gateway,
            destination,
            transport: Arc::new(transport),
            options: TunnelOptions::default(),
            registry: Arc::new(Registry::new()),
            shutdown: CancellationToken::new(),
            state,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }

    /// The local endpoint. After the listener is bound this carries the
    /// actual port, even when port `0` was requested.
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn gateway(&self) -> &Endpoint {
        &self.gateway
    }

    pub fn destination(&self) -> &Endpoint {
        &self.destination
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Wait until the tunnel has left `Idle`. Returns the bound local
    /// endpoint if it is listening, `None` if it failed to start or has
    /// already moved on to closing.
    pub async fn wait_listening(&self) -> Option<Endpoint> {
        let mut rx = self.state.subscribe();
        let state = *rx.wait_for(|s| *s != TunnelState::Idle).await.ok()?;
        (state == TunnelState::Listening).then(|| self.local_endpoint())
    }

    /// Sockets currently registered (local connections and destination channels).
    pub async fn open_sockets(&self) -> usize {
        self.registry.socket_count().await
    }

    /// Gateway sessions currently registered.
    pub async fn open_sessions(&self) -> usize {
        self.registry.session_count().await
    }

    /// Request shutdown. Safe to call from any state, any number of times.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!(local = %self.local_endpoint(), "close requested");
        }
        self.shutdown.cancel();
    }

    /// Bind the listener and forward connections until [`Self::close`] is called.
    ///
    /// A tunnel can be started once; later calls fail with
    /// [`TunnelError::InvalidState`].
    pub async fn start(&self) -> TunnelResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::InvalidState(self.state()));
        }

        if self.shutdown.is_cancelled() {
            info!("close requested before start, not binding");
            self.state.send_replace(TunnelState::Closed);
            return Ok(());
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.send_replace(TunnelState::Closed);
                return Err(e);
            }
        };
        self.state.send_replace(TunnelState::Listening);
        info!(
            local = %self.local_endpoint(),
            gateway = %self.gateway,
            destination = %self.destination,
            "tunnel listening"
        );

        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&self.transport),
            self.gateway.clone(),
            self.destination.clone(),
            Arc::clone(&self.registry),
            self.options.close_on_dial_failure,
        ));
        let tracker = TaskTracker::new();

        self.accept_loop(&listener, &forwarder, &tracker).await;

        self.state.send_replace(TunnelState::Closing);
        self.drain().await;

        tracker.close();
        tracker.wait().await;
        drop(listener);

        self.state.send_replace(TunnelState::Closed);
        info!("tunnel closed");
        Ok(())
    }

    async fn bind(&self) -> TunnelResult<TcpListener> {
        let addr = self.local_endpoint().to_string();
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            warn!(addr = %addr, error = %source, "listen bind failed");
            TunnelError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;

        let bound = listener.local_addr()?;
        self.local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .port = bound.port();
        Ok(listener)
    }

    async fn accept_loop(&self, listener: &TcpListener, forwarder: &Arc<Forwarder<T>>, tracker: &TaskTracker) {
        loop {
            debug!("listening for new connections");
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("close signal received, closing");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let pair = self.registry.next_pair().await;
                        let cancel = CancellationToken::new();
                        self.registry
                            .register_socket(pair, SocketRole::Local, cancel.clone())
                            .await;
                        info!(pair, peer = %peer, "accepted connection");

                        tracker.spawn(Arc::clone(forwarder).forward(pair, stream, peer, cancel));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }

    /// Close everything still registered: sockets first, then sessions,
    /// each in registration order.
    async fn drain(&self) {
        let entries = self.registry.drain().await;
        let (sockets, sessions): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| matches!(e.resource, Resource::Socket { .. }));

        let total = sockets.len();
        for (i, entry) in sockets.into_iter().enumerate() {
            if let Resource::Socket { role, cancel } = entry.resource {
                debug!(pair = entry.pair, ?role, "closing socket ({} of {})", i + 1, total);
                cancel.cancel();
            }
        }

        let total = sessions.len();
        for (i, entry) in sessions.into_iter().enumerate() {
            if let Resource::Session(session) = entry.resource {
                debug!(pair = entry.pair, "closing session ({} of {})", i + 1, total);
                if let Err(e) = session.close().await {
                    warn!(pair = entry.pair, error = %e, "session close failed");
                }
            }
        }
    }
}
