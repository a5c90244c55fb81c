use thiserror::Error;

/// Failure taxonomy for the tunnel lifecycle.
///
/// Each variant corresponds to one of the kinds in the error handling
/// design: configuration and authentication failures are fatal to
/// `start`, listener failures are aggregated per the readiness policy,
/// and handler failures never escape the connection they belong to.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// An address, port, or path failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The authentication resolver produced an empty credential list.
    #[error("no authentication methods available")]
    NoAuthMethods,

    /// Every candidate credential was rejected by the gateway.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The gateway's host key violated the configured policy.
    #[error("host key verification failed: {0}")]
    HostKey(String),

    /// The transport opened but later failed (e.g. the gateway dropped).
    #[error("session error: {0}")]
    Session(String),

    /// One rule's local listener failed to bind or accept.
    #[error("listener for {bind} failed: {detail}")]
    Listener { bind: String, detail: String },

    /// Aggregates per-rule `Listener` failures raised during `start`.
    #[error("{count} listener(s) failed to start: {detail}")]
    Listeners { count: usize, detail: String },

    /// A single accepted connection's channel open or byte shuttle failed.
    #[error("connection handler error on {bind}: {detail}")]
    Handler { bind: String, detail: String },

    /// `stop` did not complete within `TUNNEL_TIMEOUT` and was escalated.
    #[error("shutdown exceeded timeout, forced remaining workers")]
    ShutdownTimeout,
}

impl TunnelError {
    /// Aggregates per-rule listener failures into a single fatal error,
    /// as surfaced by `start()` when `mute_exceptions` is false.
    pub fn listener_failures(failures: &[(String, String)]) -> Self {
        let detail = failures
            .iter()
            .map(|(bind, detail)| format!("{bind}: {detail}"))
            .collect::<Vec<_>>()
            .join("; ");
        Self::Listeners {
            count: failures.len(),
            detail,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn host_key(msg: impl Into<String>) -> Self {
        Self::HostKey(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    pub fn listener(bind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Listener {
            bind: bind.into(),
            detail: detail.into(),
        }
    }

    pub fn handler(bind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Handler {
            bind: bind.into(),
            detail: detail.into(),
        }
    }

    /// The short kind name used in the CLI's `ERROR: <kind>: <detail>` line.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::NoAuthMethods => "NoAuthMethodsError",
            Self::Authentication(_) => "AuthenticationError",
            Self::HostKey(_) => "HostKeyError",
            Self::Session(_) => "SessionError",
            Self::Listener { .. } | Self::Listeners { .. } => "ListenerError",
            Self::Handler { .. } => "HandlerError",
            Self::ShutdownTimeout => "ShutdownTimeout",
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_taxonomy() {
        assert_eq!(TunnelError::config("bad host").kind(), "ConfigError");
        assert_eq!(TunnelError::NoAuthMethods.kind(), "NoAuthMethodsError");
        assert_eq!(
            TunnelError::authentication("all rejected").kind(),
            "AuthenticationError"
        );
        assert_eq!(TunnelError::host_key("mismatch").kind(), "HostKeyError");
        assert_eq!(TunnelError::session("eof").kind(), "SessionError");
        assert_eq!(
            TunnelError::listener("127.0.0.1:0", "in use").kind(),
            "ListenerError"
        );
        assert_eq!(
            TunnelError::handler("127.0.0.1:0", "channel open failed").kind(),
            "HandlerError"
        );
        assert_eq!(TunnelError::ShutdownTimeout.kind(), "ShutdownTimeout");
    }

    #[test]
    fn listeners_aggregate_formats_each_failure() {
        let err = TunnelError::listener_failures(&[
            ("127.0.0.1:1".to_string(), "in use".to_string()),
            ("127.0.0.1:2".to_string(), "permission denied".to_string()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:1: in use"));
        assert!(msg.contains("127.0.0.1:2: permission denied"));
    }
}
