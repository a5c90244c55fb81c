//! Authentication Resolver (4.B).
//!
//! Turns a permissive set of inputs (an explicit key, key files, an SSH
//! agent, directories to scan, a password) into a deterministic, deduped,
//! ordered list of [`Credential`]s that the SSH Session Manager tries one
//! at a time until one succeeds.

use log::warn;
use std::fs;
use std::path::{Path, PathBuf};
use tunnelfwd_core::{Result, TunnelError};

/// A private key supplied in memory rather than read from a file.
#[derive(Debug, Clone)]
pub struct InMemoryKey {
    pub private: Vec<u8>,
    pub public: Option<Vec<u8>>,
    pub passphrase: Option<String>,
}

/// One candidate credential, in the order it should be tried.
#[derive(Debug, Clone)]
pub enum Credential {
    /// An explicit in-memory private key (`ssh_pkey`).
    InMemoryKey(InMemoryKey),
    /// A private key file on disk, optionally passphrase-protected.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// An identity enumerated from a running SSH agent. `blob` is the
    /// public key blob used to re-locate this identity on the agent
    /// connected to the real session at authentication time.
    Agent { blob: Vec<u8>, comment: String },
    /// A plaintext password (tried last).
    Password(String),
}

impl Credential {
    fn dedup_key(&self) -> DedupKey {
        match self {
            Credential::InMemoryKey(k) => DedupKey::Bytes(k.private.clone()),
            Credential::KeyFile { path, .. } => DedupKey::Path(canonical_or_as_is(path)),
            Credential::Agent { blob, .. } => DedupKey::Bytes(blob.clone()),
            Credential::Password(p) => DedupKey::Password(p.clone()),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone)]
enum DedupKey {
    Bytes(Vec<u8>),
    Path(PathBuf),
    Password(String),
}

fn canonical_or_as_is(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Inputs recognized by the resolver, matching the constructor options in
/// §6 of the spec (`ssh_password`, `ssh_pkey`, `ssh_pkey_file`, …).
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub password: Option<String>,
    pub pkey: Option<InMemoryKey>,
    pub pkey_files: Vec<PathBuf>,
    pub pkey_password: Option<String>,
    pub allow_agent: bool,
    pub host_pkey_directories: Vec<PathBuf>,
}

impl AuthConfig {
    pub fn new() -> Self {
        Self {
            allow_agent: true,
            ..Default::default()
        }
    }

    /// Deprecated alias for adding to `pkey_files` (`ssh_private_key` in
    /// §6's option table). A no-op if `pkey_files` was already populated
    /// through the current name, which always wins.
    #[deprecated(note = "use pkey_files instead")]
    pub fn ssh_private_key(mut self, path: PathBuf) -> Self {
        warn!("ssh_private_key is deprecated; use pkey_files instead");
        if self.pkey_files.is_empty() {
            self.pkey_files.push(path);
        }
        self
    }
}

/// Enumerates identities from a local SSH agent, if one is reachable via
/// `SSH_AUTH_SOCK`. A throwaway `Session` is sufficient since the agent
/// protocol does not require a connected transport.
pub fn agent_identities() -> Vec<(Vec<u8>, String)> {
    let Ok(session) = ssh2::Session::new() else {
        return Vec::new();
    };
    let Ok(mut agent) = session.agent() else {
        return Vec::new();
    };
    if agent.connect().is_err() {
        return Vec::new();
    }
    if agent.list_identities().is_err() {
        return Vec::new();
    }
    match agent.identities() {
        Ok(identities) => identities
            .iter()
            .map(|pk| (pk.blob().to_vec(), pk.comment().to_string()))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Scans `host_pkey_directories` for files that look like private keys
/// (conventional names, skipping `.pub` companions) not already covered
/// by an explicit `pkey_file` entry.
fn scan_directories(dirs: &[PathBuf], already_explicit: &[PathBuf]) -> Vec<PathBuf> {
    const CONVENTIONAL_NAMES: &[&str] = &["id_rsa", "id_ed25519", "id_ecdsa", "id_dsa"];
    let mut found = Vec::new();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".pub") {
                continue;
            }
            if !CONVENTIONAL_NAMES.contains(&name) {
                continue;
            }
            if already_explicit
                .iter()
                .any(|p| canonical_or_as_is(p) == canonical_or_as_is(&path))
            {
                continue;
            }
            found.push(path);
        }
    }
    found
}

/// Produces the ordered, deduped credential list per the algorithm in
/// 4.B: explicit keys, then agent identities, then scanned directory
/// keys, then a password. Passphrase-protected keys are appended
/// unconditionally here — whether the passphrase actually unlocks the
/// key is only known once the Session Manager tries it (§4.B: "loading a
/// passphrase-protected key without the right passphrase drops that key
/// with a warning, not an error").
pub fn resolve_credentials(config: &AuthConfig) -> Result<Vec<Credential>> {
    let mut ordered = Vec::new();

    if let Some(key) = &config.pkey {
        ordered.push(Credential::InMemoryKey(key.clone()));
    }
    for path in &config.pkey_files {
        ordered.push(Credential::KeyFile {
            path: path.clone(),
            passphrase: config.pkey_password.clone(),
        });
    }

    if config.allow_agent {
        for (blob, comment) in agent_identities() {
            ordered.push(Credential::Agent { blob, comment });
        }
    }

    for path in scan_directories(&config.host_pkey_directories, &config.pkey_files) {
        ordered.push(Credential::KeyFile {
            path,
            passphrase: None,
        });
    }

    if let Some(password) = &config.password {
        ordered.push(Credential::Password(password.clone()));
    }

    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<Credential> = ordered
        .into_iter()
        .filter(|c| seen.insert(c.dedup_key()))
        .collect();

    if deduped.is_empty() {
        warn!("authentication resolver produced no candidate credentials");
        return Err(TunnelError::NoAuthMethods);
    }

    Ok(deduped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_a_hard_error() {
        let config = AuthConfig {
            allow_agent: false,
            ..AuthConfig::new()
        };
        let err = resolve_credentials(&config).unwrap_err();
        assert_eq!(err.kind(), "NoAuthMethodsError");
    }

    #[test]
    fn explicit_keys_precede_password() {
        let config = AuthConfig {
            allow_agent: false,
            pkey_files: vec![PathBuf::from("/tmp/does-not-exist-key")],
            password: Some("hunter2".to_string()),
            ..AuthConfig::new()
        };
        let creds = resolve_credentials(&config).expect("non-empty");
        assert_eq!(creds.len(), 2);
        assert!(matches!(creds[0], Credential::KeyFile { .. }));
        assert!(matches!(creds[1], Credential::Password(_)));
    }

    #[test]
    fn duplicate_key_file_paths_collapse_to_one() {
        let config = AuthConfig {
            allow_agent: false,
            pkey_files: vec![
                PathBuf::from("/tmp/same-key"),
                PathBuf::from("/tmp/same-key"),
            ],
            ..AuthConfig::new()
        };
        let creds = resolve_credentials(&config).expect("non-empty");
        assert_eq!(creds.len(), 1);
    }

    #[test]
    fn directory_scan_skips_explicit_path_duplicate() {
        let dir = tempdir();
        let key_path = dir.join("id_rsa");
        fs::write(&key_path, b"fake-key-material").unwrap();

        let config = AuthConfig {
            allow_agent: false,
            pkey_files: vec![key_path.clone()],
            host_pkey_directories: vec![dir.clone()],
            ..AuthConfig::new()
        };
        let creds = resolve_credentials(&config).expect("non-empty");
        assert_eq!(creds.len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn directory_scan_skips_pub_companion_files() {
        let dir = tempdir();
        fs::write(dir.join("id_ed25519"), b"private").unwrap();
        fs::write(dir.join("id_ed25519.pub"), b"public").unwrap();

        let config = AuthConfig {
            allow_agent: false,
            host_pkey_directories: vec![dir.clone()],
            ..AuthConfig::new()
        };
        let creds = resolve_credentials(&config).expect("non-empty");
        assert_eq!(creds.len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    #[allow(deprecated)]
    fn deprecated_ssh_private_key_is_ignored_when_pkey_files_already_set() {
        let config = AuthConfig::new()
            .ssh_private_key(PathBuf::from("/tmp/deprecated-key"))
            .ssh_private_key(PathBuf::from("/tmp/deprecated-key-2"));
        // The deprecated alias itself de-dupes against an empty list, so
        // only the first call takes effect; the second is a no-op.
        assert_eq!(config.pkey_files, vec![PathBuf::from("/tmp/deprecated-key")]);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "tunnelfwd-auth-test-{}-{}",
            std::process::id(),
            dir_suffix()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn dir_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos() as u64
    }
}
