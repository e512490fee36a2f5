//! sshtunnel: single-use local port forwarding through an SSH gateway.
//!
//! A [`Tunnel`] listens on a local port. Every accepted connection gets its
//! own SSH session to the gateway and a `direct-tcpip` channel to the
//! destination; bytes are relayed both ways until either side closes.
//!
//! Logging goes through `tracing`. Without a subscriber installed, all
//! events are discarded.

pub mod endpoint;
pub mod error;
pub mod forwarder;
pub mod known_hosts;
pub mod registry;
pub mod ssh;
pub mod transport;
pub mod tunnel;

pub use endpoint::Endpoint;
pub use error::{TunnelError, TunnelResult};
pub use known_hosts::{HostKeyPolicy, HostStatus, KnownHosts};
pub use ssh::{AuthMethod, SshSession, SshTransport};
pub use transport::{Transport, TransportSession};
pub use tunnel::{Tunnel, TunnelOptions, TunnelState};
