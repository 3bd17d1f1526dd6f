//! Configuration management
//!
//! Layered with figment: struct defaults, then an optional YAML file, then
//! `MCP_BRIDGE_*` environment variables (nested keys joined with `__`, e.g.
//! `MCP_BRIDGE_REFRESH__LEAD_TIME_SECS=300`). Command-line flags are applied
//! on top by the binary.

use std::{collections::BTreeMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::oauth::ClientRegistration;
use crate::transport::TransportStrategy;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Credential storage
    pub storage: StorageConfig,
    /// OAuth metadata discovery
    pub discovery: DiscoveryConfig,
    /// Interactive authorization
    pub auth: AuthConfig,
    /// Background token refresh
    pub refresh: RefreshConfig,
    /// Remote transport
    pub transport: TransportConfig,
}

/// Credential storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory override (default `~/.mcp-auth`)
    pub config_dir: Option<PathBuf>,
    /// Use a version-pinned storage directory
    pub versioned: bool,
}

/// Metadata discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Per-fetch timeout in milliseconds
    pub timeout_ms: u64,
    /// Refuse metadata fetches to private, loopback and link-local targets
    pub ssrf_protection: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            ssrf_protection: true,
        }
    }
}

/// Interactive authorization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Host placed in the redirect URI
    pub callback_host: String,
    /// Fixed callback port (otherwise reused from registration or ephemeral)
    pub callback_port: Option<u16>,
    /// Path of the OAuth redirect handler
    pub callback_path: String,
    /// How long to wait for the browser redirect
    pub auth_timeout_secs: u64,
    /// How long to wait for another process to finish authorizing
    pub wait_timeout_secs: u64,
    /// Grace period after another process reports completion
    pub settle_delay_ms: u64,
    /// Locks older than this are stale regardless of liveness
    pub lock_max_age_secs: u64,
    /// Poll interval while waiting on another process
    pub poll_interval_ms: u64,
    /// Explicit scope (highest priority)
    pub scope: Option<String>,
    /// Resource indicator override (RFC 8707)
    pub resource: Option<String>,
    /// Extra client metadata merged into dynamic registration
    pub static_client_metadata: Option<serde_json::Value>,
    /// Pre-registered client, skips dynamic registration
    pub static_client_info: Option<ClientRegistration>,
    /// Client name sent at dynamic registration
    pub client_name: String,
    /// Do not try to open a browser; print the URL only
    pub no_browser: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            callback_host: "localhost".to_string(),
            callback_port: None,
            callback_path: "/oauth/callback".to_string(),
            auth_timeout_secs: 300,
            wait_timeout_secs: 300,
            settle_delay_ms: 1_000,
            lock_max_age_secs: 30 * 60,
            poll_interval_ms: 1_000,
            scope: None,
            resource: None,
            static_client_metadata: None,
            static_client_info: None,
            client_name: "MCP Auth Bridge".to_string(),
            no_browser: false,
        }
    }
}

impl AuthConfig {
    /// Browser redirect timeout
    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Secondary-process wait timeout
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Settle delay
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Maximum lock age
    #[must_use]
    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }

    /// Poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Background refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Run the background refresh loop
    pub enabled: bool,
    /// Time between scans
    pub scan_interval_secs: u64,
    /// Refresh tokens expiring within this window
    pub lead_time_secs: u64,
    /// Lifetime of a refresh lock
    pub lock_ttl_secs: u64,
    /// Backoff after the first failure
    pub failure_backoff_secs: u64,
    /// Backoff ceiling after repeated failures
    pub max_failure_backoff_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 60,
            lead_time_secs: 10 * 60,
            lock_ttl_secs: 2 * 60,
            failure_backoff_secs: 5 * 60,
            max_failure_backoff_secs: 60 * 60,
        }
    }
}

/// Remote transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport variant preference
    pub strategy: TransportStrategy,
    /// Extra headers sent on every request (`${VAR}` expanded)
    pub headers: BTreeMap<String, String>,
    /// Permit plain HTTP to non-loopback hosts
    pub allow_http: bool,
    /// Disable TLS certificate validation
    pub insecure: bool,
    /// Per-request timeout for RPC POSTs
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            strategy: TransportStrategy::HttpFirst,
            headers: BTreeMap::new(),
            allow_http: false,
            insecure: false,
            request_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or a value fails to parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("MCP_BRIDGE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();
        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}` in header values
    pub fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("static regex is valid");

        for value in self.transport.headers.values_mut() {
            *value = Self::expand_string(&re, value);
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Parse a JSON argument given inline or as `@path`
pub fn json_arg(raw: &str) -> Result<serde_json::Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {path}: {e}")))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| Error::Config(format!("Invalid JSON argument: {e}")))
}
