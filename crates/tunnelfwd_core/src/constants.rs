//! Default timing constants.
//!
//! These exist as named constants used to initialize `Default` impls on
//! the forwarder's configuration struct — they are not read at runtime
//! as ambient global state (see DESIGN.md's "Global module state" note).

use std::time::Duration;

/// Per-socket read slice on every blocking read owned by the orchestrator.
/// Tunes how quickly `stop` can unblock a worker.
pub const SSH_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on a graceful (non-forced) `stop`.
pub const TUNNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default SSH protocol-level keepalive probe interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed buffer size recommended for each direction of a byte shuttle.
pub const SHUTTLE_BUFFER_SIZE: usize = 16 * 1024;
