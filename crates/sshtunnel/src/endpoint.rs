//! `[user@]host[:port]` endpoint descriptors.
//!
//! Used for the local listen address, the SSH gateway and the final
//! destination. Rendering always yields `host:port`; the user is only carried
//! along for gateway authentication.

use crate::error::{TunnelError, TunnelResult};
use std::fmt;
use std::str::FromStr;

/// A parsed `[user@]host[:port]` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    /// `0` when no (valid) port was given. For the local endpoint this asks
    /// the OS to pick a free port.
    pub port: u16,
    /// Login name, meaningful for the gateway only.
    pub user: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
        }
    }

    /// Parse leniently: a missing or malformed port becomes `0`.
    ///
    /// The user is everything before the last `@`; the port is whatever
    /// follows the first `:` after that.
    pub fn parse(s: &str) -> Self {
        let (user, rest) = split_user(s);
        let (host, port) = match rest.split_once(':') {
            Some((host, port)) => (host, port.parse().unwrap_or(0)),
            None => (rest, 0),
        };

        Self {
            host: host.to_string(),
            port,
            user,
        }
    }

    /// Replace a zero port with `port`.
    pub fn with_default_port(mut self, port: u16) -> Self {
        if self.port == 0 {
            self.port = port;
        }
        self
    }
}

fn split_user(s: &str) -> (Option<String>, &str) {
    match s.rsplit_once('@') {
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, s),
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Strict parsing: same grammar as [`Endpoint::parse`], but an empty host,
/// an empty user, or a port that is present but not a valid `u16` is an error.
impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> TunnelResult<Self> {
        let invalid = |reason: &str| TunnelError::InvalidEndpoint {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (user, rest) = split_user(s);
        if user.as_deref() == Some("") {
            return Err(invalid("empty user"));
        }

        let (host, port) = match rest.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid("port must be a number between 0 and 65535"))?;
                (host, port)
            }
            None => (rest, 0),
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            user,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_address() {
        let ep = Endpoint::parse("alice@gateway.example.com:2222");
        assert_eq!(ep.user.as_deref(), Some("alice"));
        assert_eq!(ep.host, "gateway.example.com");
        assert_eq!(ep.port, 2222);
    }

    #[test]
    fn render_drops_user() {
        let ep = Endpoint::parse("alice@gateway.example.com:2222");
        assert_eq!(ep.to_string(), "gateway.example.com:2222");
    }

    #[test]
    fn missing_port_is_zero() {
        let ep = Endpoint::parse("db.internal");
        assert_eq!(ep.host, "db.internal");
        assert_eq!(ep.port, 0);
        assert!(ep.user.is_none());
    }

    #[test]
    fn malformed_port_is_zero() {
        assert_eq!(Endpoint::parse("host:badport").port, 0);
        assert_eq!(Endpoint::parse("host:70000").port, 0);
        assert_eq!(Endpoint::parse("host:-1").port, 0);
        assert_eq!(Endpoint::parse("host:badport").host, "host");
    }

    #[test]
    fn user_splits_on_last_at() {
        let ep = Endpoint::parse("me@corp@bastion:22");
        assert_eq!(ep.user.as_deref(), Some("me@corp"));
        assert_eq!(ep.host, "bastion");
        assert_eq!(ep.port, 22);
    }

    #[test]
    fn default_port_only_fills_zero() {
        assert_eq!(Endpoint::parse("bastion").with_default_port(22).port, 22);
        assert_eq!(Endpoint::parse("bastion:2200").with_default_port(22).port, 2200);
    }

    #[test]
    fn strict_parse_accepts_valid() {
        let ep: Endpoint = "bob@10.0.0.5:5432".parse().unwrap();
        assert_eq!(ep, Endpoint {
            host: "10.0.0.5".into(),
            port: 5432,
            user: Some("bob".into()),
        });
        let ep: Endpoint = "localhost".parse().unwrap();
        assert_eq!(ep.port, 0);
    }

    #[test]
    fn strict_parse_rejects_bad_port() {
        let err = "host:badport".parse::<Endpoint>().unwrap_err();
        assert!(matches!(err, TunnelError::InvalidEndpoint { .. }));
    }

    #[test]
    fn strict_parse_rejects_empty_parts() {
        assert!(":22".parse::<Endpoint>().is_err());
        assert!("@host:22".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
    }
}
