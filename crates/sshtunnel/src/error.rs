use thiserror::Error;

use crate::tunnel::TunnelState;

/// Errors produced by the tunnel and its SSH transport.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid endpoint '{input}': {reason}")]
    InvalidEndpoint { input: String, reason: String },

    #[error("tunnel is {0:?}, expected Idle")]
    InvalidState(TunnelState),

    #[error("authentication rejected for user '{user}' ({method})")]
    AuthRejected { user: String, method: &'static str },

    #[error("host key for {host} is not trusted (fingerprint {fingerprint})")]
    HostKeyUnknown { host: String, fingerprint: String },

    #[error("host key for {host} does not match: expected {expected}, got {presented}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        presented: String,
    },

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("private key {path} is encrypted, a passphrase is required")]
    KeyEncrypted { path: String },

    #[error("key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
