//! sshtunnel: forward a local port through an SSH gateway.
//!
//! Listens on a local port and relays every accepted connection to the
//! destination over its own SSH session. Runs until Ctrl-C or SIGTERM.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, Overrides, Settings};
use sshtunnel::{AuthMethod, Tunnel, TunnelError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// sshtunnel: local port forwarding through an SSH gateway
#[derive(Parser)]
#[command(name = "sshtunnel", version, about = "Forward a local port to a destination through an SSH gateway")]
struct Cli {
    /// SSH gateway in [user@]host[:port] format (port defaults to 22)
    gateway: Option<String>,

    /// Destination host:port, as reachable from the gateway
    destination: Option<String>,

    /// Local listen port ("0" picks a free port)
    #[arg(short = 'l', long = "local-port")]
    local_port: Option<String>,

    /// Private key file (default ~/.ssh/id_ed25519, id_ecdsa or id_rsa)
    #[arg(short = 'i', long = "identity")]
    identity: Option<String>,

    /// Prompt for a password instead of using a key
    #[arg(long)]
    password: bool,

    /// Pin the gateway host key (SHA256:... fingerprint)
    #[arg(long)]
    fingerprint: Option<String>,

    /// Trust and remember unknown gateway keys on first use
    #[arg(long = "accept-new")]
    accept_new: bool,

    /// Accept any gateway host key without verification
    #[arg(long = "insecure-accept-any-host", conflicts_with_all = ["fingerprint", "accept_new"])]
    insecure_accept_any_host: bool,

    /// Known hosts file (default ~/.sshtunnel/known_hosts)
    #[arg(long = "known-hosts")]
    known_hosts: Option<String>,

    /// Config file path (default ~/.sshtunnel/config.toml)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            gateway: self.gateway.clone(),
            destination: self.destination.clone(),
            local_port: self.local_port.clone(),
            identity: self.identity.clone(),
            fingerprint: self.fingerprint.clone(),
            known_hosts: self.known_hosts.clone(),
            accept_new: self.accept_new,
            insecure_accept_any: self.insecure_accept_any_host,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "sshtunnel=debug,sshtunnel_cli=debug"
    } else {
        "sshtunnel=info,sshtunnel_cli=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("sshtunnel: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let cfg = Config::load(&config_path)?;
    let settings = Settings::resolve(cli.overrides(), cfg)?;

    let auth = if cli.password {
        let password = dialoguer::Password::new()
            .with_prompt(format!("Password for {}", settings.gateway))
            .interact()
            .context("failed to read password")?;
        AuthMethod::Password(password)
    } else {
        let key_path = settings
            .identity_file()
            .context("no identity file found; pass --identity or --password")?;
        load_identity(&key_path, || {
            dialoguer::Password::new()
                .with_prompt(format!("Passphrase for {}", key_path.display()))
                .interact()
                .context("failed to read passphrase")
        })?
    };

    let tunnel = Arc::new(Tunnel::ssh(
        &settings.gateway,
        auth,
        settings.host_key_policy()?,
        &settings.destination,
        &settings.local_port,
    ));

    let announcer = Arc::clone(&tunnel);
    tokio::spawn(async move {
        if let Some(local) = announcer.wait_listening().await {
            println!("listening on {local}");
        }
    });

    let closer = Arc::clone(&tunnel);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        closer.close();
    });

    tunnel.start().await.with_context(|| {
        format!(
            "tunnel {} -> {} -> {} failed",
            tunnel.local_endpoint(),
            tunnel.gateway(),
            tunnel.destination()
        )
    })
}

/// Load a private key, asking for its passphrase only if it is encrypted.
fn load_identity(path: &Path, passphrase: impl FnOnce() -> Result<String>) -> Result<AuthMethod> {
    let loaded = match AuthMethod::key_file(path, None) {
        Err(TunnelError::KeyEncrypted { .. }) => AuthMethod::key_file(path, Some(passphrase()?.as_str())),
        other => other,
    };
    loaded.with_context(|| format!("failed to load key {}", path.display()))
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
