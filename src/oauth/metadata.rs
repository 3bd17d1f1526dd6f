//! OAuth Metadata Discovery
//!
//! Implements RFC 9728 (OAuth Protected Resource Metadata) and RFC 8414
//! (OAuth Authorization Server Metadata) discovery for a remote MCP server.
//!
//! Discovery is staged and never fails: every stage that cannot produce a
//! usable document degrades to the next one, ending in a bundle tagged
//! [`DiscoverySource::None`] with the default scope.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, Response, header, redirect};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::challenge::BearerChallenge;
use crate::config::DiscoveryConfig;
use crate::protocol::PROTOCOL_VERSION;
use crate::security::ssrf;
use crate::transport::TlsPolicy;
use crate::{Error, Result};

/// Scope requested when nothing better is known
pub const DEFAULT_SCOPE: &str = "openid email profile";

const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
const AUTHORIZATION_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";
const OPENID_CONFIGURATION_PATH: &str = "/.well-known/openid-configuration";

/// Redirect hops followed per metadata fetch
const MAX_REDIRECTS: usize = 5;

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint (optional)
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Token revocation endpoint (optional)
    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported response types
    #[serde(default)]
    pub response_types_supported: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported token endpoint auth methods
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Pick the token endpoint auth method for a new public/confidential client
    #[must_use]
    pub fn preferred_auth_method(&self, has_secret: bool) -> &'static str {
        let supports = |m: &str| self.token_endpoint_auth_methods_supported.iter().any(|s| s == m);
        if !has_secret {
            "none"
        } else if self.token_endpoint_auth_methods_supported.is_empty() || supports("client_secret_basic") {
            "client_secret_basic"
        } else if supports("client_secret_post") {
            "client_secret_post"
        } else {
            "none"
        }
    }
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported bearer token methods
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Human-readable resource name
    #[serde(default)]
    pub resource_name: Option<String>,
}

/// Deserialize scopes that may be either a string or array
/// Some implementations incorrectly return `"read write"` instead of `["read", "write"]`
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
        Some(StringOrVec::Vec(v)) => Ok(v),
        None => Ok(Vec::new()),
    }
}

/// How the authorization server was located
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoverySource {
    /// Protected-resource metadata URL from a `WWW-Authenticate` challenge
    WwwAuthenticate,
    /// Path-specific protected-resource well-known URL
    WellKnownPath,
    /// Root protected-resource well-known URL
    WellKnownRoot,
    /// Authorization-server metadata at the resource's own origin
    OriginFallback,
    /// Nothing usable was found
    None,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WwwAuthenticate => "www-authenticate",
            Self::WellKnownPath => "well-known-path",
            Self::WellKnownRoot => "well-known-root",
            Self::OriginFallback => "origin-fallback",
            Self::None => "none",
        })
    }
}

/// Caller-side scope inputs, highest priority first
#[derive(Debug, Clone, Default)]
pub struct ScopeHints {
    /// Explicit scope from configuration or the command line
    pub static_scope: Option<String>,
    /// Scope from a previous client registration response
    pub registered_scope: Option<String>,
}

/// Result of one discovery run
#[derive(Debug, Clone)]
pub struct OAuthMetadataBundle {
    /// Validated protected-resource metadata
    pub protected_resource: Option<ProtectedResourceMetadata>,
    /// Authorization-server metadata
    pub authorization_server: Option<AuthorizationServerMetadata>,
    /// Base URL the authorization-server metadata was fetched for
    pub issuer: Option<String>,
    /// Scope to request; never empty
    pub effective_scope: String,
    /// How the authorization server was located
    pub source: DiscoverySource,
    /// Parsed challenge that triggered discovery
    pub challenge: Option<BearerChallenge>,
}

impl OAuthMetadataBundle {
    /// Resource indicator advertised by validated protected-resource metadata
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.protected_resource.as_ref().map(|m| m.resource.as_str())
    }

    /// Authorization-server metadata or an error naming the resource
    pub fn require_authorization_server(&self, resource_url: &str) -> Result<&AuthorizationServerMetadata> {
        self.authorization_server.as_ref().ok_or_else(|| {
            Error::Auth(format!(
                "No OAuth authorization server metadata found for {resource_url}"
            ))
        })
    }
}

/// Apply the scope priority: static > registered > resource `scopes_supported`
/// > authorization-server `scopes_supported` > [`DEFAULT_SCOPE`].
///
/// Empty strings and empty arrays count as absent at every tier.
#[must_use]
pub fn resolve_scope(
    hints: &ScopeHints,
    protected_resource: Option<&ProtectedResourceMetadata>,
    authorization_server: Option<&AuthorizationServerMetadata>,
) -> String {
    fn non_empty(s: Option<&str>) -> Option<String> {
        s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
    }
    fn joined(scopes: &[String]) -> Option<String> {
        let parts: Vec<&str> = scopes
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }

    non_empty(hints.static_scope.as_deref())
        .or_else(|| non_empty(hints.registered_scope.as_deref()))
        .or_else(|| protected_resource.and_then(|m| joined(&m.scopes_supported)))
        .or_else(|| authorization_server.and_then(|m| joined(&m.scopes_supported)))
        .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
}

/// Extract the origin (scheme + host + port) from a URL
pub fn origin(url: &Url) -> Result<Url> {
    let mut base = url.clone();
    if base.cannot_be_a_base() {
        return Err(Error::Discovery(format!("Invalid base URL: {url}")));
    }
    base.set_path("");
    base.set_query(None);
    base.set_fragment(None);
    Ok(base)
}

/// `origin + path` form used to compare resource identifiers
#[must_use]
pub fn normalize_resource(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let path = url.path().trim_end_matches('/');
    Some(format!("{}://{host}{port}{path}", url.scheme()))
}

/// Insert a well-known segment between origin and path
fn well_known(base: &Url, well_known_path: &str, path: &str) -> Result<Url> {
    let path = path.trim_end_matches('/');
    let mut url = origin(base)?;
    url.set_path(&format!("{well_known_path}{path}"));
    Ok(url)
}

/// Which outbound metadata targets are allowed
#[derive(Debug, Clone)]
enum TargetCheck {
    Off,
    Enforced,
    /// Enforced, except for one literal host (the local test server)
    #[cfg(test)]
    EnforcedExcept(String),
}

impl TargetCheck {
    async fn check(&self, url: &Url) -> Result<()> {
        match self {
            Self::Off => Ok(()),
            Self::Enforced => ssrf::check_target(url).await,
            #[cfg(test)]
            Self::EnforcedExcept(host) if url.host_str() == Some(host.as_str()) => Ok(()),
            #[cfg(test)]
            Self::EnforcedExcept(_) => ssrf::check_target(url).await,
        }
    }
}

/// Metadata resolver
#[derive(Debug, Clone)]
pub struct MetadataResolver {
    /// HTTP client for metadata fetches; redirects are followed by hand
    http: Client,
    /// Applied to the first request and to every redirect hop
    targets: TargetCheck,
}

impl MetadataResolver {
    /// Create a resolver from configuration with certificate verification on
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        Self::with_tls(config, &TlsPolicy::default())
    }

    /// Create a resolver whose client follows the connection's TLS policy
    pub fn with_tls(config: &DiscoveryConfig, tls: &TlsPolicy) -> Result<Self> {
        let http = tls
            .client_builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| Error::Discovery(format!("Failed to build HTTP client: {e}")))?;

        let targets = if config.ssrf_protection {
            TargetCheck::Enforced
        } else {
            TargetCheck::Off
        };
        Ok(Self { http, targets })
    }

    /// Discover OAuth metadata for `resource_url`.
    ///
    /// `www_authenticate` is the challenge header from a 401 response, if
    /// discovery was triggered by one.
    pub async fn discover(
        &self,
        resource_url: &str,
        www_authenticate: Option<&str>,
        hints: &ScopeHints,
    ) -> OAuthMetadataBundle {
        let challenge = www_authenticate.and_then(BearerChallenge::parse);

        let Ok(resource) = Url::parse(resource_url) else {
            warn!(url = %resource_url, "Cannot discover OAuth metadata for invalid URL");
            return Self::empty_bundle(hints, challenge);
        };

        let (protected_resource, prm_source) = self
            .discover_protected_resource(&resource, challenge.as_ref())
            .await
            .map_or((None, None), |(m, s)| (Some(m), Some(s)));

        let mut found = None;
        if let (Some(prm), Some(source)) = (&protected_resource, prm_source) {
            for issuer in &prm.authorization_servers {
                if let Some(meta) = self.fetch_authorization_server(issuer).await {
                    found = Some((meta, issuer.clone(), source));
                    break;
                }
            }
        }

        if found.is_none() {
            if let Ok(base) = origin(&resource) {
                let base = base.as_str().trim_end_matches('/').to_string();
                if let Some(meta) = self.fetch_authorization_server(&base).await {
                    found = Some((meta, base, DiscoverySource::OriginFallback));
                }
            }
        }

        let (authorization_server, issuer, source) = match found {
            Some((meta, issuer, source)) => (Some(meta), Some(issuer), source),
            None => (None, None, prm_source.unwrap_or(DiscoverySource::None)),
        };

        let effective_scope = resolve_scope(hints, protected_resource.as_ref(), authorization_server.as_ref());
        info!(
            resource = %resource_url,
            source = %source,
            issuer = issuer.as_deref().unwrap_or("-"),
            scope = %effective_scope,
            "OAuth metadata discovery finished"
        );

        OAuthMetadataBundle {
            protected_resource,
            authorization_server,
            issuer,
            effective_scope,
            source,
            challenge,
        }
    }

    fn empty_bundle(hints: &ScopeHints, challenge: Option<BearerChallenge>) -> OAuthMetadataBundle {
        OAuthMetadataBundle {
            protected_resource: None,
            authorization_server: None,
            issuer: None,
            effective_scope: resolve_scope(hints, None, None),
            source: DiscoverySource::None,
            challenge,
        }
    }

    async fn discover_protected_resource(
        &self,
        resource: &Url,
        challenge: Option<&BearerChallenge>,
    ) -> Option<(ProtectedResourceMetadata, DiscoverySource)> {
        if let Some(url) = challenge
            .and_then(|c| c.resource_metadata.as_deref())
            .and_then(|u| Url::parse(u).ok())
        {
            if let Some(meta) = self.fetch_protected_resource(&url, resource).await {
                return Some((meta, DiscoverySource::WwwAuthenticate));
            }
            debug!(url = %url, "Challenge metadata URL unusable, falling back to well-known");
        }

        let path = resource.path();
        if !path.trim_end_matches('/').is_empty() {
            if let Ok(url) = well_known(resource, PROTECTED_RESOURCE_PATH, path) {
                if let Some(meta) = self.fetch_protected_resource(&url, resource).await {
                    return Some((meta, DiscoverySource::WellKnownPath));
                }
            }
        }

        let url = well_known(resource, PROTECTED_RESOURCE_PATH, "").ok()?;
        self.fetch_protected_resource(&url, resource)
            .await
            .map(|meta| (meta, DiscoverySource::WellKnownRoot))
    }

    /// Fetch protected-resource metadata and reject it unless its `resource`
    /// identifies the resource we are connecting to.
    async fn fetch_protected_resource(&self, url: &Url, resource: &Url) -> Option<ProtectedResourceMetadata> {
        let meta: ProtectedResourceMetadata = self.fetch_json(url).await?;

        let expected = normalize_resource(resource.as_str());
        let advertised = normalize_resource(&meta.resource);
        if expected.is_none() || expected != advertised {
            warn!(
                url = %url,
                advertised = %meta.resource,
                expected = %resource,
                "Rejecting protected resource metadata for a different resource"
            );
            return None;
        }

        debug!(url = %url, servers = ?meta.authorization_servers, "Found protected resource metadata");
        Some(meta)
    }

    /// Try RFC 8414 (path-inserted, then root) and OpenID Connect discovery
    /// for an issuer, returning the first document that parses.
    async fn fetch_authorization_server(&self, issuer: &str) -> Option<AuthorizationServerMetadata> {
        let issuer_url = Url::parse(issuer).ok()?;
        let path = issuer_url.path().trim_end_matches('/').to_string();

        let mut candidates = Vec::new();
        if !path.is_empty() {
            candidates.extend(well_known(&issuer_url, AUTHORIZATION_SERVER_PATH, &path).ok());
        }
        candidates.extend(well_known(&issuer_url, AUTHORIZATION_SERVER_PATH, "").ok());
        if let Ok(mut oidc) = origin(&issuer_url) {
            oidc.set_path(&format!("{path}{OPENID_CONFIGURATION_PATH}"));
            candidates.push(oidc);
        }

        for url in candidates {
            if let Some(meta) = self.fetch_json::<AuthorizationServerMetadata>(&url).await {
                debug!(url = %url, issuer = %meta.issuer, "Found authorization server metadata");
                return Some(meta);
            }
        }
        None
    }

    /// GET a JSON document. Every failure, including an SSRF rejection, is
    /// logged and reported as `None`; a blocked target never produces a request.
    async fn fetch_json<T: DeserializeOwned>(&self, url: &Url) -> Option<T> {
        let response = self.get_following_redirects(url).await?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = %url, status = %status, "Metadata not available");
            return None;
        }

        match response.json::<T>().await {
            Ok(doc) => Some(doc),
            Err(e) => {
                debug!(url = %url, error = %e, "Malformed metadata document");
                None
            }
        }
    }

    /// GET `url`, re-checking the target before every redirect hop
    async fn get_following_redirects(&self, url: &Url) -> Option<Response> {
        let mut current = url.clone();

        for _ in 0..=MAX_REDIRECTS {
            if let Err(e) = self.targets.check(&current).await {
                warn!(url = %current, error = %e, "Skipping metadata fetch");
                return None;
            }

            let response = match self
                .http
                .get(current.clone())
                .header(header::ACCEPT, "application/json")
                .header("MCP-Protocol-Version", PROTOCOL_VERSION)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    debug!(url = %current, error = %e, "Metadata fetch failed");
                    return None;
                }
            };

            if !response.status().is_redirection() {
                return Some(response);
            }

            let next = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| current.join(location).ok());
            let Some(next) = next else {
                debug!(url = %current, status = %response.status(), "Redirect without a usable Location");
                return None;
            };
            debug!(from = %current, to = %next, "Following metadata redirect");
            current = next;
        }

        debug!(url = %url, "Too many metadata redirects");
        None
    }
}
