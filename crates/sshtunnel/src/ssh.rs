//! SSH transport built on `russh`.
//!
//! Each forwarding pair gets its own SSH connection: [`SshTransport::dial`]
//! connects, checks the host key against the configured
//! [`HostKeyPolicy`], authenticates, and [`SshSession::open_channel`] opens a
//! `direct-tcpip` channel to the destination.

use crate::endpoint::Endpoint;
use crate::error::{TunnelError, TunnelResult};
use crate::known_hosts::HostKeyPolicy;
use crate::transport::{Transport, TransportSession};
use crate::tunnel::Tunnel;
use russh::client::{self, Handle, Msg};
use russh::keys::{self, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelStream, Disconnect};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Credentials presented to the gateway.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    PublicKey(Arc<PrivateKey>),
}

impl AuthMethod {
    /// Load an OpenSSH or PEM private key from disk.
    ///
    /// An encrypted key loaded without a passphrase fails with
    /// [`TunnelError::KeyEncrypted`], so callers can ask for one and retry.
    pub fn key_file(path: impl AsRef<Path>, passphrase: Option<&str>) -> TunnelResult<Self> {
        let path = path.as_ref();
        let key = keys::load_secret_key(path, passphrase).map_err(|e| match e {
            keys::Error::KeyIsEncrypted => TunnelError::KeyEncrypted {
                path: path.display().to_string(),
            },
            e => TunnelError::Key(e),
        })?;
        Ok(Self::PublicKey(Arc::new(key)))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PublicKey(_) => "publickey",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(..)"),
            Self::PublicKey(key) => write!(f, "PublicKey({})", key.algorithm()),
        }
    }
}

/// Dials SSH sessions to the gateway.
pub struct SshTransport {
    config: Arc<client::Config>,
    user: String,
    auth: AuthMethod,
    host_keys: Arc<HostKeyPolicy>,
}

impl SshTransport {
    pub fn new(user: impl Into<String>, auth: AuthMethod, host_keys: HostKeyPolicy) -> Self {
        Self {
            config: Arc::new(default_client_config()),
            user: user.into(),
            auth,
            host_keys: Arc::new(host_keys),
        }
    }
}

fn default_client_config() -> client::Config {
    client::Config {
        nodelay: true,
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    }
}

/// `russh` handler that defers host-key trust to the policy.
struct HostKeyCheck {
    /// `host:port` of the gateway.
    authority: String,
    policy: Arc<HostKeyPolicy>,
}

impl client::Handler for HostKeyCheck {
    type Error = TunnelError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        self.policy.verify(&self.authority, &fingerprint)?;
        Ok(true)
    }
}

impl Transport for SshTransport {
    type Session = SshSession;

    async fn dial(&self, gateway: &Endpoint) -> TunnelResult<SshSession> {
        let handler = HostKeyCheck {
            authority: gateway.to_string(),
            policy: Arc::clone(&self.host_keys),
        };
        let mut handle = client::connect(
            Arc::clone(&self.config),
            (gateway.host.as_str(), gateway.port),
            handler,
        )
        .await?;

        let result = match &self.auth {
            AuthMethod::Password(password) => {
                handle
                    .authenticate_password(self.user.clone(), password.clone())
                    .await?
            }
            AuthMethod::PublicKey(key) => {
                // rsa-sha2-256/512 when the server supports it, legacy ssh-rsa otherwise
                let hash_alg = if key.algorithm().is_rsa() {
                    handle.best_supported_rsa_hash().await?.flatten()
                } else {
                    None
                };
                let key = PrivateKeyWithHashAlg::new(Arc::clone(key), hash_alg);
                handle.authenticate_publickey(self.user.clone(), key).await?
            }
        };

        if !result.success() {
            return Err(TunnelError::AuthRejected {
                user: self.user.clone(),
                method: self.auth.name(),
            });
        }

        debug!(gateway = %gateway, user = %self.user, method = self.auth.name(), "ssh session authenticated");
        Ok(SshSession {
            handle: Mutex::new(handle),
        })
    }
}

/// An authenticated SSH connection to the gateway.
pub struct SshSession {
    handle: Mutex<Handle<HostKeyCheck>>,
}

impl TransportSession for SshSession {
    type Channel = ChannelStream<Msg>;

    async fn open_channel(&self, destination: &Endpoint, originator: SocketAddr) -> TunnelResult<Self::Channel> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(
                destination.host.clone(),
                u32::from(destination.port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await?;
        Ok(channel.into_stream())
    }

    async fn close(&self) -> TunnelResult<()> {
        self.handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await?;
        Ok(())
    }
}

impl Tunnel<SshTransport> {
    /// Build a tunnel through an SSH gateway.
    ///
    /// * `gateway` - `[user@]host[:port]`; the port defaults to 22 and the user
    ///   to the current login name.
    /// * `destination` - `host:port` as seen from the gateway.
    /// * `local_port` - port to listen on at `localhost`; `"0"` picks a free one.
    pub fn ssh(
        gateway: &str,
        auth: AuthMethod,
        host_keys: HostKeyPolicy,
        destination: &str,
        local_port: &str,
    ) -> Self {
        let local = Endpoint::parse(&format!("localhost:{local_port}"));
        let gateway = Endpoint::parse(gateway).with_default_port(22);
        let user = gateway.user.clone().unwrap_or_else(default_user);

        Tunnel::new(
            SshTransport::new(user, auth, host_keys),
            local,
            gateway,
            Endpoint::parse(destination),
        )
    }
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".into())
}
