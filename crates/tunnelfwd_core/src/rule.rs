//! The `ForwardingRule` / `GatewaySpec` data model (§3).

use crate::address::{check_addresses, check_remote_port, Endpoint};
use crate::error::Result;

/// A local bind endpoint paired with a remote target reachable from the
/// gateway. Immutable once the forwarder has started.
#[derive(Debug, Clone)]
pub struct ForwardingRule {
    pub local_bind: Endpoint,
    pub remote_target: (String, u16),
}

impl ForwardingRule {
    pub fn new(local_bind: Endpoint, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_bind,
            remote_target: (remote_host.into(), remote_port),
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_addresses(std::slice::from_ref(&self.local_bind))?;
        crate::address::check_host(&self.remote_target.0)?;
        check_remote_port(self.remote_target.1)
    }

    /// A stable string key for `tunnel_is_up`, matching the spec's
    /// "mapping from local_bind to boolean".
    pub fn bind_key(&self) -> String {
        self.local_bind.to_string()
    }
}

/// How the gateway's presented host key is accepted or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// The key must match an entry in the known-hosts store.
    RequireKnown,
    /// Any key is accepted (insecure; intended for throwaway/dev use).
    AcceptAny,
    /// The key's fingerprint must equal the given hex string exactly
    /// (case-insensitive, colons optional).
    RequireSpecific(String),
}

impl HostKeyPolicy {
    /// Normalizes a pinned fingerprint the same way for both the stored
    /// policy and the fingerprint read off the wire, so that
    /// `"AA:BB:CC"`, `"aabbcc"`, and `"AABBCC"` all compare equal.
    pub fn normalize_fingerprint(fp: &str) -> String {
        fp.chars()
            .filter(|c| *c != ':')
            .flat_map(char::to_lowercase)
            .collect()
    }
}

/// Endpoint + credentials + policy for one SSH hop.
#[derive(Debug, Clone)]
pub struct GatewaySpec {
    pub address: Endpoint,
    pub username: Option<String>,
    pub host_key_policy: HostKeyPolicy,
    pub compression: bool,
    pub keepalive_interval: std::time::Duration,
}

impl GatewaySpec {
    pub fn new(address: Endpoint) -> Self {
        Self {
            address,
            username: None,
            host_key_policy: HostKeyPolicy::RequireKnown,
            compression: false,
            keepalive_interval: crate::constants::DEFAULT_KEEPALIVE_INTERVAL,
        }
    }

    pub fn validate(&self) -> Result<()> {
        // A jump via local UNIX socket is not supported for gateways.
        if self.address.is_path() {
            return Err(crate::error::TunnelError::config(
                "gateway address must be a host:port, not a socket path",
            ));
        }
        check_addresses(std::slice::from_ref(&self.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_remote_port() {
        let rule = ForwardingRule::new(Endpoint::socket("127.0.0.1", 0), "127.0.0.1", 0);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn accepts_ephemeral_local_port() {
        let rule = ForwardingRule::new(Endpoint::socket("127.0.0.1", 0), "127.0.0.1", 9000);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn bind_key_is_stable_string() {
        let rule = ForwardingRule::new(Endpoint::socket("127.0.0.1", 5432), "db.internal", 5432);
        assert_eq!(rule.bind_key(), "127.0.0.1:5432");
    }

    #[test]
    fn gateway_rejects_socket_path_address() {
        let gw = GatewaySpec::new(Endpoint::path("/tmp/gw.sock"));
        assert!(gw.validate().is_err());
    }

    #[test]
    fn fingerprint_normalization_ignores_case_and_colons() {
        assert_eq!(
            HostKeyPolicy::normalize_fingerprint("AA:BB:CC"),
            HostKeyPolicy::normalize_fingerprint("aabbcc")
        );
    }
}
