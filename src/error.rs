//! Error types for the MCP auth bridge

use std::io;

use thiserror::Error;

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// OAuth metadata discovery error (always recovered by the resolver)
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// OAuth flow error (registration, code exchange, refresh)
    #[error("Authorization error: {0}")]
    Auth(String),

    /// The remote endpoint answered with an authorization challenge
    #[error("Unauthorized")]
    Unauthorized {
        /// Raw `WWW-Authenticate` header, if the server sent one
        www_authenticate: Option<String>,
    },

    /// The remote endpoint does not speak the attempted transport variant
    #[error("Unsupported transport: HTTP {0}")]
    UnsupportedTransport(u16),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bounded retries were exhausted for the same failure class
    #[error("Giving up: {0}")]
    GivingUp(String),

    /// Contradictory TLS settings
    #[error("Security misconfiguration: {0}")]
    SecurityMisconfiguration(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Build an `Unauthorized` error from an optional challenge header
    pub fn unauthorized(www_authenticate: Option<String>) -> Self {
        Self::Unauthorized { www_authenticate }
    }

    /// True when the failure is an authorization challenge
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// True when the failure means "try the other transport variant"
    #[must_use]
    pub fn is_unsupported_transport(&self) -> bool {
        matches!(self, Self::UnsupportedTransport(_))
    }

    /// The challenge header carried by an `Unauthorized` error
    #[must_use]
    pub fn challenge(&self) -> Option<&str> {
        match self {
            Self::Unauthorized { www_authenticate } => www_authenticate.as_deref(),
            _ => None,
        }
    }

    /// Whether the binary should exit non-zero without attempting recovery
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SecurityMisconfiguration(_) | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        let err = Error::unauthorized(Some("Bearer realm=\"x\"".to_string()));
        assert!(err.is_unauthorized());
        assert!(!err.is_unsupported_transport());
        assert_eq!(err.challenge(), Some("Bearer realm=\"x\""));

        let err = Error::UnsupportedTransport(405);
        assert!(err.is_unsupported_transport());
        assert_eq!(err.challenge(), None);
        assert_eq!(err.to_string(), "Unsupported transport: HTTP 405");
    }

    #[test]
    fn security_misconfiguration_is_fatal() {
        assert!(Error::SecurityMisconfiguration("x".into()).is_fatal());
        assert!(!Error::Transport("x".into()).is_fatal());
    }
}
