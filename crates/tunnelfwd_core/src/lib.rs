//! Data model, address validators, error taxonomy, and the shutdown
//! primitive shared by the SSH tunnel forwarder (`tunnelfwd`).
//!
//! This crate has no network or SSH dependency; it is the pure,
//! unit-testable foundation the rest of the workspace builds on.

pub mod address;
pub mod constants;
pub mod error;
pub mod rule;
pub mod shutdown;
pub mod state;

pub use address::{
    check_address, check_addresses, check_host, check_port, check_port_str, check_remote_port,
    Endpoint,
};
pub use error::{Result, TunnelError};
pub use rule::{ForwardingRule, GatewaySpec, HostKeyPolicy};
pub use shutdown::ShutdownFlag;
pub use state::{ForwarderState, ListenerState};
