//! A minimal OpenSSH user-config lookup.
//!
//! Full `ssh_config(5)` semantics (wildcard `Match` blocks, `Include`,
//! per-option first-match-wins across multiple `Host` blocks with
//! patterns) are an external collaborator per the spec — this crate only
//! needs enough of it to supply defaults for `User`, `Port`,
//! `IdentityFile`, `HostName`, and `ProxyCommand` when a gateway is named
//! by alias rather than by address. Anything parsing the full grammar is
//! out of scope; callers with a fuller implementation can supply their
//! own via the [`SshConfigLookup`] trait instead of [`FileConfigLookup`].

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshConfigEntry {
    pub host_name: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<PathBuf>,
    pub proxy_command: Option<String>,
}

/// Looks up defaults for a gateway alias in an SSH user-config.
pub trait SshConfigLookup {
    fn lookup(&self, alias: &str) -> Option<SshConfigEntry>;
}

/// Reads and pattern-matches a real `~/.ssh/config`-style file.
pub struct FileConfigLookup {
    text: String,
}

impl FileConfigLookup {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            text: fs::read_to_string(path)?,
        })
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl SshConfigLookup for FileConfigLookup {
    fn lookup(&self, alias: &str) -> Option<SshConfigEntry> {
        let mut entry = SshConfigEntry::default();
        let mut matched_any_block = false;
        let mut in_matching_block = false;

        for raw_line in self.text.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((keyword, rest)) = split_keyword(line) else {
                continue;
            };
            let keyword_lc = keyword.to_ascii_lowercase();

            if keyword_lc == "host" {
                in_matching_block = rest.split_whitespace().any(|pat| host_pattern_matches(pat, alias));
                if in_matching_block {
                    matched_any_block = true;
                }
                continue;
            }

            if !in_matching_block {
                continue;
            }

            match keyword_lc.as_str() {
                "hostname" if entry.host_name.is_none() => entry.host_name = Some(rest.to_string()),
                "user" if entry.user.is_none() => entry.user = Some(rest.to_string()),
                "port" if entry.port.is_none() => entry.port = rest.parse().ok(),
                "identityfile" => entry.identity_files.push(PathBuf::from(rest)),
                "proxycommand" if entry.proxy_command.is_none() => {
                    entry.proxy_command = Some(rest.to_string())
                }
                _ => {}
            }
        }

        matched_any_block.then_some(entry)
    }
}

fn split_keyword(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    let idx = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let keyword = &line[..idx];
    let rest = line[idx..].trim_start_matches(|c: char| c.is_whitespace() || c == '=');
    Some((keyword, rest.trim()))
}

/// Minimal glob matcher supporting `*` and `?`, enough for the common
/// `Host *.example.com` / `Host bastion*` patterns; `ssh_config(5)`'s full
/// negation (`!pattern`) semantics are not implemented.
fn host_pattern_matches(pattern: &str, alias: &str) -> bool {
    fn matches(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], text) || (!text.is_empty() && matches(pattern, &text[1..]))
            }
            (Some(b'?'), Some(_)) => matches(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p.eq_ignore_ascii_case(t) => matches(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), alias.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
Host bastion
    HostName 203.0.113.5
    User deploy
    Port 2222
    IdentityFile ~/.ssh/bastion_key

Host *.internal
    User admin
    ProxyCommand ssh -W %h:%p jump
";

    #[test]
    fn exact_alias_match_supplies_all_fields() {
        let lookup = FileConfigLookup::from_text(SAMPLE);
        let entry = lookup.lookup("bastion").expect("bastion entry");
        assert_eq!(entry.host_name.as_deref(), Some("203.0.113.5"));
        assert_eq!(entry.user.as_deref(), Some("deploy"));
        assert_eq!(entry.port, Some(2222));
        assert_eq!(entry.identity_files.len(), 1);
    }

    #[test]
    fn wildcard_pattern_matches_suffix() {
        let lookup = FileConfigLookup::from_text(SAMPLE);
        let entry = lookup.lookup("db.internal").expect("wildcard entry");
        assert_eq!(entry.user.as_deref(), Some("admin"));
        assert!(entry.proxy_command.is_some());
    }

    #[test]
    fn unmatched_alias_returns_none() {
        let lookup = FileConfigLookup::from_text(SAMPLE);
        assert!(lookup.lookup("nowhere").is_none());
    }
}
