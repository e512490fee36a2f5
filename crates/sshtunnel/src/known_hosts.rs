//! Gateway host-key verification.
//!
//! [`HostKeyPolicy`] decides whether a gateway's key is trusted. Fingerprints
//! are the OpenSSH `SHA256:<base64>` form. The [`KnownHosts`] store keeps
//! one `host:port fingerprint` pair per line at `~/.sshtunnel/known_hosts`
//! unless another path is given.

use crate::error::{TunnelError, TunnelResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How the gateway's host key is checked.
#[derive(Debug)]
pub enum HostKeyPolicy {
    /// Accept only this fingerprint.
    Fingerprint(String),
    /// Look the host up in a known-hosts file. Unknown hosts are rejected
    /// unless `accept_new` is set, in which case they are stored and trusted.
    /// A changed key is always rejected.
    KnownHosts { store: KnownHosts, accept_new: bool },
    /// Accept any key. Every connection logs a warning.
    InsecureAcceptAny,
}

impl HostKeyPolicy {
    /// Check `fingerprint` presented by `host` (`host:port`).
    pub fn verify(&self, host: &str, fingerprint: &str) -> TunnelResult<()> {
        match self {
            Self::Fingerprint(expected) => {
                if expected == fingerprint {
                    debug!(host, "host key matches pinned fingerprint");
                    Ok(())
                } else {
                    Err(TunnelError::HostKeyMismatch {
                        host: host.to_string(),
                        expected: expected.clone(),
                        presented: fingerprint.to_string(),
                    })
                }
            }
            Self::KnownHosts { store, accept_new } => match store.verify_host(host, fingerprint)? {
                HostStatus::Known => {
                    debug!(host, "host key verified");
                    Ok(())
                }
                HostStatus::Unknown if *accept_new => {
                    store.add_host(host, fingerprint)?;
                    info!(host, fingerprint, path = %store.path().display(), "added new host key");
                    Ok(())
                }
                HostStatus::Unknown => Err(TunnelError::HostKeyUnknown {
                    host: host.to_string(),
                    fingerprint: fingerprint.to_string(),
                }),
                HostStatus::Changed { expected } => {
                    warn!(host, expected = %expected, presented = fingerprint, "host key has changed");
                    Err(TunnelError::HostKeyMismatch {
                        host: host.to_string(),
                        expected,
                        presented: fingerprint.to_string(),
                    })
                }
            },
            Self::InsecureAcceptAny => {
                warn!(host, fingerprint, "accepting unverified host key");
                Ok(())
            }
        }
    }
}

/// Result of looking a host up in [`KnownHosts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    Known,
    Unknown,
    /// Stored fingerprint differs from the presented one.
    Changed { expected: String },
}

/// Known hosts file.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.sshtunnel/known_hosts`.
    pub fn default_location() -> TunnelResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| TunnelError::Config("cannot determine home directory".into()))?;
        Ok(Self::new(home.join(".sshtunnel").join("known_hosts")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn verify_host(&self, host: &str, fingerprint: &str) -> TunnelResult<HostStatus> {
        let status = match self.load_entries()?.into_iter().find(|(h, _)| h == host) {
            Some((_, stored)) if stored == fingerprint => HostStatus::Known,
            Some((_, stored)) => HostStatus::Changed { expected: stored },
            None => HostStatus::Unknown,
        };
        Ok(status)
    }

    /// Add or replace a host's fingerprint.
    pub fn add_host(&self, host: &str, fingerprint: &str) -> TunnelResult<()> {
        let mut entries = self.load_entries()?;
        entries.retain(|(h, _)| h != host);
        entries.push((host.to_string(), fingerprint.to_string()));
        self.save_entries(&entries)
    }

    fn load_entries(&self) -> TunnelResult<Vec<(String, String)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let entries = content
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let (host, fp) = line.split_once(char::is_whitespace)?;
                let fp = fp.trim();
                (!fp.is_empty()).then(|| (host.to_string(), fp.to_string()))
            })
            .collect();

        Ok(entries)
    }

    fn save_entries(&self, entries: &[(String, String)]) -> TunnelResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        let content: String = entries
            .iter()
            .map(|(host, fp)| format!("{host} {fp}\n"))
            .collect();
        fs::write(&self.path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FP_A: &str = "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";
    const FP_B: &str = "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU";

    fn store(dir: &TempDir) -> KnownHosts {
        KnownHosts::new(dir.path().join("nested").join("known_hosts"))
    }

    #[test]
    fn unknown_then_known() {
        let dir = TempDir::new().unwrap();
        let kh = store(&dir);
        assert_eq!(kh.verify_host("bastion:22", FP_A).unwrap(), HostStatus::Unknown);
        kh.add_host("bastion:22", FP_A).unwrap();
        assert_eq!(kh.verify_host("bastion:22", FP_A).unwrap(), HostStatus::Known);
    }

    #[test]
    fn changed_fingerprint_detected() {
        let dir = TempDir::new().unwrap();
        let kh = store(&dir);
        kh.add_host("bastion:22", FP_A).unwrap();
        assert_eq!(
            kh.verify_host("bastion:22", FP_B).unwrap(),
            HostStatus::Changed {
                expected: FP_A.to_string()
            }
        );
    }

    #[test]
    fn hosts_are_keyed_by_port() {
        let dir = TempDir::new().unwrap();
        let kh = store(&dir);
        kh.add_host("bastion:22", FP_A).unwrap();
        assert_eq!(kh.verify_host("bastion:2222", FP_A).unwrap(), HostStatus::Unknown);
    }

    #[test]
    fn add_host_replaces_existing_entry() {
        let dir = TempDir::new().unwrap();
        let kh = store(&dir);
        kh.add_host("a:22", FP_A).unwrap();
        kh.add_host("b:22", FP_A).unwrap();
        kh.add_host("a:22", FP_B).unwrap();
        assert_eq!(kh.verify_host("a:22", FP_B).unwrap(), HostStatus::Known);
        assert_eq!(kh.verify_host("b:22", FP_A).unwrap(), HostStatus::Known);

        let content = fs::read_to_string(kh.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, format!("# gateways\n\nbastion:22 {FP_A}\nbroken-line\n")).unwrap();
        let kh = KnownHosts::new(path);
        assert_eq!(kh.verify_host("bastion:22", FP_A).unwrap(), HostStatus::Known);
        assert_eq!(kh.verify_host("broken-line", FP_A).unwrap(), HostStatus::Unknown);
    }

    #[test]
    fn pinned_fingerprint() {
        let policy = HostKeyPolicy::Fingerprint(FP_A.to_string());
        assert!(policy.verify("bastion:22", FP_A).is_ok());
        assert!(matches!(
            policy.verify("bastion:22", FP_B),
            Err(TunnelError::HostKeyMismatch { .. })
        ));
    }

    #[test]
    fn known_hosts_rejects_unknown_without_accept_new() {
        let dir = TempDir::new().unwrap();
        let policy = HostKeyPolicy::KnownHosts {
            store: store(&dir),
            accept_new: false,
        };
        assert!(matches!(
            policy.verify("bastion:22", FP_A),
            Err(TunnelError::HostKeyUnknown { .. })
        ));
    }

    #[test]
    fn accept_new_trusts_on_first_use_only() {
        let dir = TempDir::new().unwrap();
        let policy = HostKeyPolicy::KnownHosts {
            store: store(&dir),
            accept_new: true,
        };
        policy.verify("bastion:22", FP_A).unwrap();
        policy.verify("bastion:22", FP_A).unwrap();
        assert!(matches!(
            policy.verify("bastion:22", FP_B),
            Err(TunnelError::HostKeyMismatch { .. })
        ));
    }

    #[test]
    fn insecure_accepts_anything() {
        assert!(HostKeyPolicy::InsecureAcceptAny.verify("bastion:22", FP_B).is_ok());
    }
}
