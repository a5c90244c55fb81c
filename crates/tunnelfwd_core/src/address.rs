//! Pure validators for hosts, ports, and local bind/remote target addresses.
//!
//! None of these perform I/O or DNS lookups; they only reject
//! structurally invalid input so that `TunnelForwarder::start` can fail
//! fast with a single descriptive error before any session is opened.

use crate::error::{Result, TunnelError};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// One endpoint of a forwarding rule or gateway address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `(host, port)`. `host` may be empty, meaning "loopback by default".
    /// `port == 0` on a local bind means "let the OS assign one".
    Socket { host: String, port: u16 },
    /// An absolute filesystem path to a UNIX domain socket.
    Path(PathBuf),
}

impl Endpoint {
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self::Socket {
            host: host.into(),
            port,
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn is_path(&self) -> bool {
        matches!(self, Self::Path(_))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket { host, port } => {
                let host = if host.is_empty() { "127.0.0.1" } else { host };
                write!(f, "{host}:{port}")
            }
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Non-empty string that is either a valid IP literal, or a bare DNS name
/// (no lookup is performed here — resolution happens at connect time).
pub fn check_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Ok(());
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    // Not an IP literal: treat as a DNS name. Only reject the obviously
    // malformed case of embedded whitespace; a real lookup happens later,
    // at connect time, outside this pure validator.
    if host.chars().any(char::is_whitespace) {
        return Err(TunnelError::config(format!(
            "host {host:?} is neither a valid IP literal nor a DNS name"
        )));
    }
    Ok(())
}

/// Integer in `[0, 65535]`. `u16` already enforces the upper bound; this
/// exists for symmetry with the spec and for callers parsing from text.
pub fn check_port(port: u16) -> Result<()> {
    let _ = port;
    Ok(())
}

/// Validates a parsed-from-text port, since `u16::from_str` alone would
/// accept `"0x10"`-free input but give a less specific error.
pub fn check_port_str(raw: &str) -> Result<u16> {
    raw.parse::<u16>()
        .map_err(|_| TunnelError::config(format!("port {raw:?} is not in [0, 65535]")))
}

/// Validates a single endpoint. UNIX-socket paths are rejected on
/// platforms without UNIX domain socket support.
pub fn check_address(endpoint: &Endpoint) -> Result<()> {
    match endpoint {
        Endpoint::Socket { host, port: _ } => check_host(host),
        Endpoint::Path(path) => check_socket_path(path),
    }
}

#[cfg(unix)]
fn check_socket_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(TunnelError::config(format!(
            "socket path {path:?} must be absolute"
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_socket_path(path: &Path) -> Result<()> {
    Err(TunnelError::config(format!(
        "UNIX domain socket bind {path:?} is not supported on this platform"
    )))
}

/// A remote target's port must be a real, dialable port, unlike a local
/// bind port which may be `0` to mean "assign one".
pub fn check_remote_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(TunnelError::config(
            "remote target port must be greater than 0",
        ));
    }
    Ok(())
}

/// All entries must be homogeneous in family: either every endpoint is a
/// `(host, port)` pair, or every endpoint is a path. Mixing the two in one
/// list is rejected rather than silently accepted.
pub fn check_addresses(list: &[Endpoint]) -> Result<()> {
    for endpoint in list {
        check_address(endpoint)?;
    }
    let Some(first) = list.first() else {
        return Ok(());
    };
    let want_path = first.is_path();
    if list.iter().any(|e| e.is_path() != want_path) {
        return Err(TunnelError::config(
            "address list mixes socket-path and host:port entries",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ipv4_and_ipv6_literals() {
        assert!(check_host("127.0.0.1").is_ok());
        assert!(check_host("::1").is_ok());
        assert!(check_host("2001:db8::1").is_ok());
    }

    #[test]
    fn accepts_dns_names_without_lookup() {
        assert!(check_host("gateway.example.com").is_ok());
        assert!(check_host("localhost").is_ok());
    }

    #[test]
    fn accepts_empty_host_as_loopback_default() {
        assert!(check_host("").is_ok());
    }

    #[test]
    fn rejects_whitespace_in_host() {
        assert!(check_host("not a host").is_err());
    }

    #[test]
    fn remote_port_must_be_nonzero() {
        assert!(check_remote_port(0).is_err());
        assert!(check_remote_port(9000).is_ok());
    }

    #[test]
    fn addresses_must_be_homogeneous_in_family() {
        let mixed = vec![Endpoint::socket("127.0.0.1", 8080), Endpoint::path("/tmp/a.sock")];
        assert!(check_addresses(&mixed).is_err());

        let all_socket = vec![
            Endpoint::socket("127.0.0.1", 8080),
            Endpoint::socket("127.0.0.1", 8081),
        ];
        assert!(check_addresses(&all_socket).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn socket_path_must_be_absolute() {
        assert!(check_address(&Endpoint::path("relative.sock")).is_err());
        assert!(check_address(&Endpoint::path("/tmp/absolute.sock")).is_ok());
    }
}
