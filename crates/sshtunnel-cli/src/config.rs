//! Configuration at `~/.sshtunnel/config.toml`.
//!
//! Supplies defaults for the gateway, destination, local port, identity and
//! host-key policy. CLI flags always override config file values.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sshtunnel::{Endpoint, HostKeyPolicy, KnownHosts};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub host_keys: HostKeySection,
}

/// `[tunnel]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    /// `[user@]host[:port]` of the SSH gateway.
    #[serde(default)]
    pub gateway: Option<String>,

    /// `host:port` reachable from the gateway.
    #[serde(default)]
    pub destination: Option<String>,

    /// Local listen port; "0" picks a free one.
    #[serde(default = "default_local_port")]
    pub local_port: String,

    /// Private key file.
    #[serde(default)]
    pub identity: Option<String>,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            gateway: None,
            destination: None,
            local_port: default_local_port(),
            identity: None,
        }
    }
}

/// `[host_keys]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostKeySection {
    /// Pinned `SHA256:...` fingerprint of the gateway.
    #[serde(default)]
    pub fingerprint: Option<String>,

    /// Known hosts file (default `~/.sshtunnel/known_hosts`).
    #[serde(default)]
    pub known_hosts: Option<String>,

    /// Trust and store unknown gateway keys on first use.
    #[serde(default)]
    pub accept_new: bool,

    /// Skip host-key verification entirely.
    #[serde(default)]
    pub insecure_accept_any: bool,
}

fn default_local_port() -> String {
    "0".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Default config location, `~/.sshtunnel/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".sshtunnel")
            .join("config.toml")
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub gateway: Option<String>,
    pub destination: Option<String>,
    pub local_port: Option<String>,
    pub identity: Option<String>,
    pub fingerprint: Option<String>,
    pub known_hosts: Option<String>,
    pub accept_new: bool,
    pub insecure_accept_any: bool,
}

/// How the gateway host key will be checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyChoice {
    Fingerprint(String),
    KnownHosts { path: Option<PathBuf>, accept_new: bool },
    InsecureAcceptAny,
}

/// Fully resolved settings, validated and ready to build a tunnel from.
#[derive(Debug, Clone)]
pub struct Settings {
    pub gateway: String,
    pub destination: String,
    pub local_port: String,
    pub identity: Option<PathBuf>,
    pub host_keys: HostKeyChoice,
}

impl Settings {
    /// Merge CLI overrides over the config file and validate the result.
    pub fn resolve(cli: Overrides, file: Config) -> Result<Self> {
        let gateway = cli
            .gateway
            .or(file.tunnel.gateway)
            .context("no gateway given (argument or [tunnel].gateway in config)")?;
        let destination = cli
            .destination
            .or(file.tunnel.destination)
            .context("no destination given (argument or [tunnel].destination in config)")?;

        gateway
            .parse::<Endpoint>()
            .with_context(|| format!("invalid gateway '{gateway}'"))?;
        let dest = destination
            .parse::<Endpoint>()
            .with_context(|| format!("invalid destination '{destination}'"))?;
        if dest.port == 0 {
            bail!("destination '{destination}' needs a port");
        }

        let local_port = cli.local_port.unwrap_or(file.tunnel.local_port);
        if local_port.parse::<u16>().is_err() {
            bail!("invalid local port '{local_port}'");
        }

        let fingerprint = cli.fingerprint.or(file.host_keys.fingerprint);
        let insecure = cli.insecure_accept_any || file.host_keys.insecure_accept_any;
        let host_keys = match (fingerprint, insecure) {
            (Some(_), true) => bail!("a pinned fingerprint and insecure host-key acceptance are mutually exclusive"),
            (Some(fp), false) => HostKeyChoice::Fingerprint(fp),
            (None, true) => HostKeyChoice::InsecureAcceptAny,
            (None, false) => HostKeyChoice::KnownHosts {
                path: cli
                    .known_hosts
                    .or(file.host_keys.known_hosts)
                    .map(|p| expand_tilde(Path::new(&p))),
                accept_new: cli.accept_new || file.host_keys.accept_new,
            },
        };

        Ok(Self {
            gateway,
            destination,
            local_port,
            identity: cli
                .identity
                .or(file.tunnel.identity)
                .map(|p| expand_tilde(Path::new(&p))),
            host_keys,
        })
    }

    pub fn host_key_policy(&self) -> Result<HostKeyPolicy> {
        let policy = match &self.host_keys {
            HostKeyChoice::Fingerprint(fp) => HostKeyPolicy::Fingerprint(fp.clone()),
            HostKeyChoice::InsecureAcceptAny => HostKeyPolicy::InsecureAcceptAny,
            HostKeyChoice::KnownHosts { path, accept_new } => {
                let store = match path {
                    Some(path) => KnownHosts::new(path),
                    None => KnownHosts::default_location().context("failed to locate known_hosts")?,
                };
                HostKeyPolicy::KnownHosts {
                    store,
                    accept_new: *accept_new,
                }
            }
        };
        Ok(policy)
    }

    /// The identity file to use: the configured one, or the first of
    /// `id_ed25519`, `id_ecdsa`, `id_rsa` under `~/.ssh` that exists.
    pub fn identity_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.identity {
            return Some(path.clone());
        }
        let ssh_dir = dirs::home_dir()?.join(".ssh");
        ["id_ed25519", "id_ecdsa", "id_rsa"]
            .iter()
            .map(|name| ssh_dir.join(name))
            .find(|path| path.exists())
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
