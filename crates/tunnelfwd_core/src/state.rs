//! Lifecycle states (§3, §4.F).

/// `TunnelForwarder` lifecycle: `Created -> Starting -> Running`, or
/// `Starting -> Stopped` on failure; `Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ForwarderState {
    /// Whether a `start()` call is permitted from this state. Restarting
    /// while `Running` is a no-op (with a warning), not an error.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Per-rule `Listener` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Pending,
    Active,
    Failed,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_allowed_only_from_created_or_stopped() {
        assert!(ForwarderState::Created.can_start());
        assert!(ForwarderState::Stopped.can_start());
        assert!(!ForwarderState::Starting.can_start());
        assert!(!ForwarderState::Running.can_start());
        assert!(!ForwarderState::Stopping.can_start());
    }
}
