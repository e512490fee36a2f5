//! Abstract two-hop transport used by the forwarding engine.
//!
//! The SSH implementation lives in [`crate::ssh`]; anything that can reach a
//! gateway and open a byte stream to a destination through it can drive a
//! [`Tunnel`](crate::Tunnel).

use crate::endpoint::Endpoint;
use crate::error::TunnelResult;
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Establishes sessions to the gateway.
pub trait Transport: Send + Sync + 'static {
    type Session: TransportSession;

    /// Dial and authenticate a new session to `gateway`.
    fn dial(&self, gateway: &Endpoint) -> impl Future<Output = TunnelResult<Self::Session>> + Send;
}

/// One authenticated session to the gateway.
pub trait TransportSession: Send + Sync + 'static {
    /// Byte stream to the destination, carried inside the session.
    type Channel: AsyncRead + AsyncWrite + Send + 'static;

    /// Ask the gateway to connect to `destination` on behalf of `originator`.
    fn open_channel(
        &self,
        destination: &Endpoint,
        originator: SocketAddr,
    ) -> impl Future<Output = TunnelResult<Self::Channel>> + Send;

    /// Tear the session down.
    fn close(&self) -> impl Future<Output = TunnelResult<()>> + Send;
}
