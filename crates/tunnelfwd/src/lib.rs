//! SSH-based TCP port forwarding tunnels, built on `ssh2` (libssh2).
//!
//! [`TunnelForwarder`] is the orchestrator: give it one or more
//! [`tunnelfwd_core::GatewaySpec`]s (more than one chains through
//! intermediate hops, see [`chain`]) and a set of
//! [`tunnelfwd_core::ForwardingRule`]s, call `start()`, and each rule's
//! local endpoint begins forwarding to its remote target over the
//! authenticated session.

pub mod auth;
pub mod chain;
pub mod forwarder;
pub mod handler;
pub mod listener;
pub mod local_stream;
pub mod session;
pub mod ssh_config;

pub use auth::{AuthConfig, Credential, InMemoryKey};
pub use chain::GatewayChain;
pub use forwarder::{TunnelForwarder, TunnelForwarderConfig, TunnelGuard};
pub use ssh_config::{FileConfigLookup, SshConfigEntry, SshConfigLookup};

pub use tunnelfwd_core::*;
