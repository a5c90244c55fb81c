//! SSH Session Manager (4.C).
//!
//! Opens one transport to a gateway, verifies its host key per policy,
//! and authenticates by trying resolved credentials in order until one
//! succeeds.

use crate::auth::Credential;
use log::{debug, info, warn};
use ssh2::{HashType, KnownHostFileKind};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;
use tunnelfwd_core::{Endpoint, HostKeyPolicy, Result, TunnelError};

/// The default known_hosts search paths: the user's, then (if present) a
/// system-wide one.
pub fn default_known_hosts_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".ssh/known_hosts"));
    }
    let system = PathBuf::from("/etc/ssh/ssh_known_hosts");
    if system.exists() {
        paths.push(system);
    }
    paths
}

/// Connects a TCP transport, performs the handshake, verifies the host
/// key, and returns the still-unauthenticated session plus the verified
/// key so the caller can authenticate next.
pub fn connect_transport(host: &str, port: u16, connect_timeout: Duration) -> Result<ssh2::Session> {
    let addr_host = if host.is_empty() { "127.0.0.1" } else { host };
    let tcp = TcpStream::connect((addr_host, port))
        .map_err(|e| TunnelError::session(format!("TCP connect to {addr_host}:{port} failed: {e}")))?;
    tcp.set_nodelay(true).ok();
    tcp.set_read_timeout(Some(connect_timeout)).ok();
    tcp.set_write_timeout(Some(connect_timeout)).ok();

    let mut session =
        ssh2::Session::new().map_err(|e| TunnelError::session(format!("session init failed: {e}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| TunnelError::session(format!("SSH handshake with {addr_host}:{port} failed: {e}")))?;
    Ok(session)
}

/// Verifies the session's presented host key against `policy`.
pub fn verify_host_key(
    session: &ssh2::Session,
    host: &str,
    port: u16,
    policy: &HostKeyPolicy,
    known_hosts_paths: &[PathBuf],
) -> Result<()> {
    match policy {
        HostKeyPolicy::AcceptAny => Ok(()),
        HostKeyPolicy::RequireSpecific(expected) => {
            let hash = session
                .host_key_hash(HashType::Sha256)
                .ok_or_else(|| TunnelError::host_key("gateway presented no host key"))?;
            let actual = to_hex(hash);
            if HostKeyPolicy::normalize_fingerprint(&actual)
                != HostKeyPolicy::normalize_fingerprint(expected)
            {
                return Err(TunnelError::host_key(format!(
                    "host key fingerprint {actual} does not match pinned {expected}"
                )));
            }
            Ok(())
        }
        HostKeyPolicy::RequireKnown => {
            let (key, _kind) = session
                .host_key()
                .ok_or_else(|| TunnelError::host_key("gateway presented no host key"))?;
            let mut known_hosts = session
                .known_hosts()
                .map_err(|e| TunnelError::host_key(format!("known_hosts unavailable: {e}")))?;
            for path in known_hosts_paths {
                // Missing known_hosts files are expected (first connection
                // ever, or no system-wide file); only a read error on a
                // file that does exist is worth a warning.
                if path.exists() {
                    if let Err(e) = known_hosts.read_file(path, KnownHostFileKind::OpenSSH) {
                        warn!("failed to read known_hosts {}: {e}", path.display());
                    }
                }
            }
            match known_hosts.check_port(host, port as i32, key) {
                ssh2::CheckResult::Match => Ok(()),
                ssh2::CheckResult::Mismatch => Err(TunnelError::host_key(format!(
                    "host key for {host}:{port} does not match known_hosts entry"
                ))),
                ssh2::CheckResult::NotFound => Err(TunnelError::host_key(format!(
                    "{host}:{port} is not a known host"
                ))),
                ssh2::CheckResult::Failure => {
                    Err(TunnelError::host_key("known_hosts lookup failed"))
                }
            }
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Tries each credential in order against an already-handshaked session.
/// The first one that authenticates wins; later ones are never tried.
pub fn authenticate(session: &ssh2::Session, username: &str, credentials: &[Credential]) -> Result<()> {
    let mut last_error = None;

    for credential in credentials {
        let outcome = match credential {
            Credential::InMemoryKey(key) => try_memory_key(session, username, key),
            Credential::KeyFile { path, passphrase } => {
                try_key_file(session, username, path, passphrase.as_deref())
            }
            Credential::Agent { blob, comment } => try_agent(session, username, blob, comment),
            Credential::Password(password) => session
                .userauth_password(username, password)
                .map_err(|e| e.to_string()),
        };

        match outcome {
            Ok(()) if session.authenticated() => {
                debug!("authenticated as {username} via {}", describe(credential));
                return Ok(());
            }
            Ok(()) => {
                last_error = Some(format!("{} not accepted by server", describe(credential)));
            }
            Err(e) => {
                warn!("credential {} failed: {e}", describe(credential));
                last_error = Some(e);
            }
        }
    }

    Err(TunnelError::authentication(
        last_error.unwrap_or_else(|| "no credentials available".to_string()),
    ))
}

fn describe(credential: &Credential) -> String {
    match credential {
        Credential::InMemoryKey(_) => "in-memory key".to_string(),
        Credential::KeyFile { path, .. } => format!("key file {}", path.display()),
        Credential::Agent { comment, .. } => format!("agent identity {comment}"),
        Credential::Password(_) => "password".to_string(),
    }
}

fn try_memory_key(
    session: &ssh2::Session,
    username: &str,
    key: &crate::auth::InMemoryKey,
) -> std::result::Result<(), String> {
    let private = std::str::from_utf8(&key.private).map_err(|e| e.to_string())?;
    let public = key
        .public
        .as_ref()
        .map(|p| std::str::from_utf8(p).map(|s| s.to_string()))
        .transpose()
        .map_err(|e| e.to_string())?;
    session
        .userauth_pubkey_memory(username, public.as_deref().unwrap_or(""), private, key.passphrase.as_deref())
        .map_err(|e| e.to_string())
}

fn try_key_file(
    session: &ssh2::Session,
    username: &str,
    path: &std::path::Path,
    passphrase: Option<&str>,
) -> std::result::Result<(), String> {
    if !path.exists() {
        return Err(format!("key file {} does not exist", path.display()));
    }
    session
        .userauth_pubkey_file(username, None, path, passphrase)
        .map_err(|e| e.to_string())
}

fn try_agent(
    session: &ssh2::Session,
    username: &str,
    blob: &[u8],
    comment: &str,
) -> std::result::Result<(), String> {
    let mut agent = session.agent().map_err(|e| e.to_string())?;
    agent.connect().map_err(|e| e.to_string())?;
    agent.list_identities().map_err(|e| e.to_string())?;
    let identities = agent.identities().map_err(|e| e.to_string())?;
    let identity = identities
        .iter()
        .find(|pk| pk.blob() == blob)
        .ok_or_else(|| format!("agent no longer offers identity {comment}"))?;
    agent.userauth(username, identity).map_err(|e| e.to_string())
}

/// Enables protocol-level keepalive probes (4.C).
pub fn set_keepalive(session: &ssh2::Session, interval: Duration) {
    let secs = interval.as_secs().clamp(1, u32::MAX as u64) as u32;
    session.set_keepalive(true, secs);
}

/// Requests a direct-tcpip channel to `remote_target`, as seen from the
/// gateway. Failure here is per-call, not fatal to the session (4.C).
///
/// `channel_direct_tcpip` is a multi-round-trip protocol exchange
/// (`SSH_MSG_CHANNEL_OPEN` plus the server's confirmation); it cannot
/// complete inside one non-blocking call over any real network latency.
/// The caller keeps the session in non-blocking mode so handler reads and
/// writes can poll a cancellation flag, so this toggles blocking mode on
/// just for the channel-open round trip and restores it afterward,
/// mirroring `chain::open_relayed_hop`'s handling of the same call.
pub fn open_direct_tcpip(
    session: &ssh2::Session,
    remote_target: &(String, u16),
    origin: Option<&Endpoint>,
) -> Result<ssh2::Channel> {
    let origin_tuple = origin.and_then(|e| match e {
        Endpoint::Socket { host, port } => Some((host.as_str(), *port)),
        Endpoint::Path(_) => None,
    });
    session.set_blocking(true);
    let result = session.channel_direct_tcpip(&remote_target.0, remote_target.1, origin_tuple);
    session.set_blocking(false);
    result.map_err(|e| {
        TunnelError::handler(
            format!("{}:{}", remote_target.0, remote_target.1),
            format!("channel open failed: {e}"),
        )
    })
}

/// Idempotent session close; safe to call more than once.
pub fn close(session: &ssh2::Session) {
    if session.authenticated() {
        let _ = session.disconnect(None, "tunnel forwarder shutting down", None);
    }
    info!("SSH session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_any_policy_never_fails() {
        // No live session is needed: AcceptAny short-circuits before
        // touching the session at all.
        let session = ssh2::Session::new().expect("session init");
        let result = verify_host_key(&session, "example.com", 22, &HostKeyPolicy::AcceptAny, &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn hex_encoding_matches_expected_format() {
        assert_eq!(to_hex(&[0xAB, 0x01, 0xFF]), "ab01ff");
    }

    #[test]
    fn open_direct_tcpip_restores_non_blocking_mode_even_on_failure() {
        // A session that never handshaked can't open a channel, but the
        // call must still toggle blocking mode on for the attempt and
        // back off afterward, matching the non-blocking mode the caller's
        // accept loop and handler shuttle rely on.
        let session = ssh2::Session::new().expect("session init");
        session.set_blocking(false);

        let result = open_direct_tcpip(&session, &("127.0.0.1".to_string(), 9000), None);

        assert!(result.is_err());
        assert!(!session.is_blocking());
    }
}
