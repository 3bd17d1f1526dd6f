//! TLS verification policy and URL security checks

use std::net::IpAddr;

use tracing::warn;
use url::{Host, Url};

use crate::{Error, Result};

/// Setting this to a truthy value forbids disabling certificate verification
pub const REQUIRE_TLS_VERIFY_ENV: &str = "MCP_BRIDGE_REQUIRE_TLS_VERIFY";

/// Whether HTTP clients built for remote servers verify certificates.
///
/// The policy only affects clients it builds; nothing process-global is
/// touched, so other connections keep verifying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsPolicy {
    insecure: bool,
}

impl TlsPolicy {
    /// Resolve the policy from the requested mode and the verification
    /// requirement. Asking for both is a fatal misconfiguration.
    pub fn resolve(insecure: bool, require_verify: bool) -> Result<Self> {
        if insecure && require_verify {
            return Err(Error::SecurityMisconfiguration(format!(
                "insecure TLS was requested but {REQUIRE_TLS_VERIFY_ENV} requires certificate verification"
            )));
        }
        if insecure {
            warn!("TLS certificate verification is disabled for the remote server");
        }
        Ok(Self { insecure })
    }

    /// Resolve against [`REQUIRE_TLS_VERIFY_ENV`]
    pub fn from_env(insecure: bool) -> Result<Self> {
        let require = std::env::var(REQUIRE_TLS_VERIFY_ENV).is_ok_and(|v| truthy(&v));
        Self::resolve(insecure, require)
    }

    /// True when certificate verification is off
    #[must_use]
    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Client builder carrying this policy
    #[must_use]
    pub fn client_builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(self.insecure)
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Require HTTPS unless the host is loopback or plain HTTP was allowed
pub fn require_secure_url(url: &Url, allow_http: bool) -> Result<()> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if allow_http || is_loopback(url) => Ok(()),
        "http" => Err(Error::Config(format!(
            "{url} uses plain HTTP; pass --allow-http to permit it for non-local hosts"
        ))),
        other => Err(Error::Config(format!("Unsupported URL scheme: {other}"))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_conflicts_with_required_verification() {
        let err = TlsPolicy::resolve(true, true).unwrap_err();
        assert!(matches!(err, Error::SecurityMisconfiguration(_)));
        assert!(err.is_fatal());

        assert!(TlsPolicy::resolve(true, false).unwrap().is_insecure());
        assert!(!TlsPolicy::resolve(false, true).unwrap().is_insecure());
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(truthy(v), "{v}");
        }
        for v in ["0", "false", "", "nope"] {
            assert!(!truthy(v), "{v}");
        }
    }

    #[test]
    fn plain_http_only_for_loopback_or_when_allowed() {
        let remote = Url::parse("http://mcp.example.com/mcp").unwrap();
        assert!(require_secure_url(&remote, false).is_err());
        assert!(require_secure_url(&remote, true).is_ok());

        for local in ["http://localhost:3000/mcp", "http://127.0.0.1/mcp", "http://[::1]:8080/"] {
            assert!(require_secure_url(&Url::parse(local).unwrap(), false).is_ok(), "{local}");
        }
        assert!(require_secure_url(&Url::parse("https://mcp.example.com").unwrap(), false).is_ok());
        assert!(require_secure_url(&Url::parse("ftp://mcp.example.com").unwrap(), true).is_err());
    }
}
