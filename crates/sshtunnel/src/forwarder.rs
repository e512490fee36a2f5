//! Per-connection forwarding engine.
//!
//! For every accepted local connection the [`Forwarder`] dials a fresh
//! session to the gateway, opens a channel to the destination through it,
//! and relays bytes in both directions until both sides are done or the
//! tunnel shuts down.
//!
//! ```text
//! local client ──► TcpStream ──► Forwarder ──► session ──► channel ──► destination
//!                      ▲                                                  │
//!                      └──────────────────── relay ◄─────────────────────┘
//! ```
//!
//! Every resource is recorded in the shared [`Registry`]. When a pair ends
//! on its own it releases its entries and closes its session; when the
//! tunnel drains first, the pair's cancellation token fires and the pair
//! drops its sockets.

use crate::endpoint::Endpoint;
use crate::registry::{Registry, Resource, SocketRole};
use crate::transport::{Transport, TransportSession};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relay direction within a forwarding pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local client to destination.
    Outbound,
    /// Destination to local client.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("local->destination"),
            Self::Inbound => f.write_str("destination->local"),
        }
    }
}

/// Dials the gateway and destination for accepted connections.
pub struct Forwarder<T: Transport> {
    transport: Arc<T>,
    gateway: Endpoint,
    destination: Endpoint,
    registry: Arc<Registry<T::Session>>,
    /// Drop the local connection right away when a dial fails instead of
    /// holding it until the tunnel drains.
    close_on_dial_failure: bool,
}

impl<T: Transport> Forwarder<T> {
    pub fn new(
        transport: Arc<T>,
        gateway: Endpoint,
        destination: Endpoint,
        registry: Arc<Registry<T::Session>>,
        close_on_dial_failure: bool,
    ) -> Self {
        Self {
            transport,
            gateway,
            destination,
            registry,
            close_on_dial_failure,
        }
    }

    /// Forward one accepted connection. Runs until the pair is finished and
    /// all of its resources are released.
    ///
    /// The local socket must already be registered under `pair` with `cancel`.
    pub async fn forward(
        self: Arc<Self>,
        pair: u64,
        local: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) {
        self.run(pair, local, peer, &cancel).await;

        // Whatever the drain did not already take is ours to close.
        for entry in self.registry.release(pair).await {
            if let Resource::Session(session) = entry.resource {
                close_session(pair, &session).await;
            }
        }
        debug!(pair, "forwarding pair released");
    }

    async fn run(&self, pair: u64, local: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
        let session = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(pair, "cancelled while dialing gateway");
                return;
            }
            result = self.transport.dial(&self.gateway) => match result {
                Ok(session) => Arc::new(session),
                Err(e) => {
                    warn!(pair, gateway = %self.gateway, error = %e, "gateway dial failed");
                    self.abandon(pair, local, cancel).await;
                    return;
                }
            }
        };
        info!(pair, gateway = %self.gateway, "connected to gateway (1 of 2)");

        if !self.registry.register_session(pair, Arc::clone(&session)).await {
            close_session(pair, &session).await;
            return;
        }

        let channel = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(pair, "cancelled while opening destination channel");
                return;
            }
            result = session.open_channel(&self.destination, peer) => match result {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(pair, destination = %self.destination, error = %e, "destination dial failed");
                    self.abandon(pair, local, cancel).await;
                    return;
                }
            }
        };

        if !self
            .registry
            .register_socket(pair, SocketRole::Destination, cancel.clone())
            .await
        {
            return;
        }
        info!(pair, destination = %self.destination, "connected to destination (2 of 2)");

        relay(pair, local, channel, cancel).await;
    }

    /// Give up on a pair after a failed dial.
    async fn abandon(&self, pair: u64, local: TcpStream, cancel: &CancellationToken) {
        if self.close_on_dial_failure {
            debug!(pair, "closing local connection after dial failure");
            drop(local);
            return;
        }

        // The local socket stays registered until the tunnel drains.
        cancel.cancelled().await;
        drop(local);
    }
}

async fn close_session<S: TransportSession>(pair: u64, session: &Arc<S>) {
    if let Err(e) = session.close().await {
        warn!(pair, error = %e, "session close failed");
    }
}

/// Run both relay directions as a task group.
///
/// Each direction ends on its own; an error on one side leaves the other
/// running. Cancellation aborts both and drops every half.
async fn relay<L, C>(pair: u64, local: L, channel: C, cancel: &CancellationToken)
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (channel_read, channel_write) = tokio::io::split(channel);

    let mut relays = JoinSet::new();
    relays.spawn(copy_half(pair, Direction::Outbound, local_read, channel_write));
    relays.spawn(copy_half(pair, Direction::Inbound, channel_read, local_write));

    let finished = tokio::select! {
        _ = cancel.cancelled() => false,
        _ = join_all(&mut relays) => true,
    };

    if finished {
        debug!(pair, "both relay directions finished");
    } else {
        debug!(pair, "relay cancelled");
        relays.shutdown().await;
    }
}

async fn join_all(relays: &mut JoinSet<u64>) {
    while let Some(result) = relays.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "relay task failed");
        }
    }
}

/// Copy `reader` into `writer` until EOF or a read/write error, then shut the
/// writer down so the far side sees EOF too. Returns the number of bytes
/// copied, `0` on error.
pub(crate) async fn copy_half<R, W>(pair: u64, direction: Direction, mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => {
            if let Err(e) = writer.shutdown().await {
                debug!(pair, %direction, error = %e, "shutdown after copy failed");
            }
            debug!(pair, %direction, bytes, "relay finished");
            bytes
        }
        Err(e) => {
            warn!(pair, %direction, error = %e, "relay copy error");
            // Let the far side see EOF so the opposite direction winds down too.
            let _ = writer.shutdown().await;
            0
        }
    }
}
