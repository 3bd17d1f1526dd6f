//! Persisted OAuth records
//!
//! Every file the credential store manages has exactly one record type here.
//! Decoding is the single entry point per file kind: malformed or invalid
//! content decodes to `None` and is treated as absent by the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

/// Number of hex characters kept from the SHA-256 digest
const SERVER_KEY_LEN: usize = 32;

/// Stable identifier for a remote server, used to namespace every file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey(String);

impl ServerKey {
    /// Derive the key for a server URL with no resource indicator or headers
    #[must_use]
    pub fn from_url(server_url: &str) -> Self {
        Self::derive(server_url, None, &BTreeMap::new())
    }

    /// Derive the key from everything that changes which credentials apply.
    ///
    /// Headers are hashed in sorted order so map iteration order never
    /// changes the key.
    #[must_use]
    pub fn derive(
        server_url: &str,
        resource: Option<&str>,
        headers: &BTreeMap<String, String>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(server_url.as_bytes());
        if let Some(resource) = resource.filter(|r| !r.is_empty()) {
            hasher.update(b"\0resource:");
            hasher.update(resource.as_bytes());
        }
        for (name, value) in headers {
            hasher.update(b"\0header:");
            hasher.update(name.to_ascii_lowercase().as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self(digest[..SERVER_KEY_LEN].to_string())
    }

    /// Rebuild a key from a file name prefix found on disk
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        (raw.len() == SERVER_KEY_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Self(raw.to_ascii_lowercase()))
    }

    /// The hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The files kept per server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// OAuth client registration
    ClientInfo,
    /// Access/refresh token pair
    Tokens,
    /// Derived timing bookkeeping
    TokenState,
    /// Connection parameters for background refresh
    Server,
    /// Background refresh mutual exclusion
    RefreshLock,
    /// PKCE verifier for the in-flight authorization
    CodeVerifier,
    /// Interactive authorization lock
    AuthLock,
}

impl FileKind {
    /// File name suffix following `{serverKey}_`
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::ClientInfo => "client_info.json",
            Self::Tokens => "tokens.json",
            Self::TokenState => "token_state.json",
            Self::Server => "server.json",
            Self::RefreshLock => "refresh_lock.json",
            Self::CodeVerifier => "code_verifier.txt",
            Self::AuthLock => "lock.json",
        }
    }

    /// File name for a server
    #[must_use]
    pub fn file_name(self, key: &ServerKey) -> String {
        format!("{key}_{}", self.suffix())
    }
}

/// A record the credential store can persist
pub trait StoredRecord: Sized {
    /// Which file this record lives in
    const KIND: FileKind;

    /// Decode file contents; `None` means malformed or invalid
    fn decode(raw: &str) -> Option<Self>;

    /// Encode to the on-disk representation
    fn encode(&self) -> Result<String>;
}

fn decode_json<T: DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_str(raw).ok()
}

fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// OAuth client identity, from dynamic registration or static configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Client identifier
    pub client_id: String,

    /// Client secret (confidential clients only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Registered redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,

    /// How the client authenticates at the token endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,

    /// Scope granted at registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Registered client name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Issue time (seconds since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<i64>,

    /// Secret expiry (seconds since epoch, 0 = never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
}

impl ClientRegistration {
    /// Port of the first loopback redirect URI, if any
    #[must_use]
    pub fn loopback_redirect_port(&self) -> Option<u16> {
        self.redirect_uris.iter().find_map(|uri| {
            let parsed = url::Url::parse(uri).ok()?;
            match parsed.host_str()? {
                "localhost" | "127.0.0.1" | "[::1]" => parsed.port(),
                _ => None,
            }
        })
    }

    /// Whether the client secret has expired at `now`
    #[must_use]
    pub fn secret_expired(&self, now: DateTime<Utc>) -> bool {
        match self.client_secret_expires_at {
            Some(0) | None => false,
            Some(at) => at <= now.timestamp(),
        }
    }
}

impl StoredRecord for ClientRegistration {
    const KIND: FileKind = FileKind::ClientInfo;

    fn decode(raw: &str) -> Option<Self> {
        decode_json::<Self>(raw).filter(|c| !c.client_id.is_empty())
    }

    fn encode(&self) -> Result<String> {
        encode_json(self)
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth token response as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Access token
    pub access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Lifetime in seconds from issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// Refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Granted scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// OpenID Connect ID token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl TokenRecord {
    /// A bearer token with no refresh token or expiry
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expires_in: None,
            refresh_token: None,
            scope: None,
            id_token: None,
        }
    }

    /// Value for the `Authorization` header
    #[must_use]
    pub fn authorization_header(&self) -> String {
        // Some servers return "bearer"; the header scheme is case-insensitive
        // but several resource servers only accept the canonical form.
        let scheme = if self.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{scheme} {}", self.access_token)
    }
}

impl StoredRecord for TokenRecord {
    const KIND: FileKind = FileKind::Tokens;

    fn decode(raw: &str) -> Option<Self> {
        decode_json::<Self>(raw).filter(|t| !t.access_token.is_empty())
    }

    fn encode(&self) -> Result<String> {
        encode_json(self)
    }
}

/// Timing bookkeeping derived from the token record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// When the current token was written
    pub issued_at: DateTime<Utc>,

    /// When the current token expires, if the server said
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Last background refresh attempt that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_attempt: Option<DateTime<Utc>>,

    /// Message from the last failed refresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_error: Option<String>,
}

impl TokenState {
    /// Fresh state for a token written at `now`
    #[must_use]
    pub fn for_token(token: &TokenRecord, now: DateTime<Utc>) -> Self {
        let expires_at = token
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime));
        Self {
            issued_at: now,
            expires_at,
            last_refresh_attempt: None,
            last_refresh_error: None,
        }
    }

    /// Record a failed refresh
    pub fn record_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.last_refresh_attempt = Some(now);
        self.last_refresh_error = Some(message.into());
    }
}

impl StoredRecord for TokenState {
    const KIND: FileKind = FileKind::TokenState;

    fn decode(raw: &str) -> Option<Self> {
        decode_json(raw)
    }

    fn encode(&self) -> Result<String> {
        encode_json(self)
    }
}

/// Whether a token should be refreshed ahead of expiry.
///
/// Unknown expiry never counts as expiring.
#[must_use]
pub fn is_expiring_soon(state: Option<&TokenState>, now: DateTime<Utc>, lead_time: TimeDelta) -> bool {
    let Some(expires_at) = state.and_then(|s| s.expires_at) else {
        return false;
    };
    expires_at <= now || expires_at - now <= lead_time
}

/// Proof-of-possession secret for one authorization-code flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceVerifier(pub String);

impl StoredRecord for PkceVerifier {
    const KIND: FileKind = FileKind::CodeVerifier;

    fn decode(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    fn encode(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Connection parameters needed to rebuild a provider without a live process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Remote MCP server URL
    pub server_url: String,

    /// Host used in the redirect URI
    pub callback_host: String,

    /// Port the callback listener was bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_port: Option<u16>,

    /// Extra client metadata sent at dynamic registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_client_metadata: Option<serde_json::Value>,

    /// Pre-registered client identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_client_info: Option<ClientRegistration>,

    /// Resource indicator (RFC 8707)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// Caller-supplied scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// When this snapshot was written
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord for ServerRegistration {
    const KIND: FileKind = FileKind::Server;

    fn decode(raw: &str) -> Option<Self> {
        decode_json::<Self>(raw).filter(|s| !s.server_url.is_empty())
    }

    fn encode(&self) -> Result<String> {
        encode_json(self)
    }
}

/// Marks an interactive authorization in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthLock {
    /// Owning process id
    pub pid: u32,

    /// Owning coordinator instance
    pub instance_id: String,

    /// Port of the owner's callback listener
    pub port: u16,

    /// When the lock was taken
    pub timestamp: DateTime<Utc>,
}

impl StoredRecord for AuthLock {
    const KIND: FileKind = FileKind::AuthLock;

    fn decode(raw: &str) -> Option<Self> {
        decode_json::<Self>(raw).filter(|l| l.port != 0)
    }

    fn encode(&self) -> Result<String> {
        encode_json(self)
    }
}

/// Mutual exclusion marker for background refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshLock {
    /// Owning process id
    pub pid: u32,

    /// Owning refresh manager instance
    pub instance_id: String,

    /// When the lock lapses if never released
    pub expires_at: DateTime<Utc>,
}

impl StoredRecord for RefreshLock {
    const KIND: FileKind = FileKind::RefreshLock;

    fn decode(raw: &str) -> Option<Self> {
        decode_json(raw)
    }

    fn encode(&self) -> Result<String> {
        encode_json(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_key_is_stable_and_sensitive_to_inputs() {
        let a = ServerKey::from_url("https://mcp.example.com/mcp");
        let b = ServerKey::from_url("https://mcp.example.com/mcp");
        let c = ServerKey::from_url("https://mcp.example.com/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), SERVER_KEY_LEN);

        let mut headers = BTreeMap::new();
        headers.insert("X-Tenant".to_string(), "acme".to_string());
        let with_headers = ServerKey::derive("https://mcp.example.com/mcp", None, &headers);
        assert_ne!(a, with_headers);

        let with_resource =
            ServerKey::derive("https://mcp.example.com/mcp", Some("https://api.example.com"), &BTreeMap::new());
        assert_ne!(a, with_resource);
        // An empty resource is the same as none
        assert_eq!(a, ServerKey::derive("https://mcp.example.com/mcp", Some(""), &BTreeMap::new()));
    }

    #[test]
    fn server_key_parse_rejects_foreign_names() {
        let key = ServerKey::from_url("https://x.example.com");
        assert_eq!(ServerKey::parse(key.as_str()), Some(key));
        assert_eq!(ServerKey::parse("not-a-key"), None);
        assert_eq!(ServerKey::parse(&"z".repeat(SERVER_KEY_LEN)), None);
    }

    #[test]
    fn token_record_rejects_empty_access_token() {
        assert!(TokenRecord::decode(r#"{"access_token": ""}"#).is_none());
        assert!(TokenRecord::decode("{not json").is_none());
        let token = TokenRecord::decode(r#"{"access_token": "abc"}"#).unwrap();
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.authorization_header(), "Bearer abc");
    }

    #[test]
    fn lowercase_bearer_is_normalized_in_header() {
        let mut token = TokenRecord::bearer("abc");
        token.token_type = "bearer".to_string();
        assert_eq!(token.authorization_header(), "Bearer abc");
    }

    #[test]
    fn token_state_derives_expiry() {
        let now = Utc::now();
        let mut token = TokenRecord::bearer("abc");
        token.expires_in = Some(3600);
        let state = TokenState::for_token(&token, now);
        assert_eq!(state.issued_at, now);
        assert_eq!(state.expires_at, Some(now + TimeDelta::seconds(3600)));

        token.expires_in = None;
        assert_eq!(TokenState::for_token(&token, now).expires_at, None);
    }

    fn state_expiring_at(at: DateTime<Utc>) -> TokenState {
        TokenState {
            issued_at: at - TimeDelta::hours(1),
            expires_at: Some(at),
            last_refresh_attempt: None,
            last_refresh_error: None,
        }
    }

    #[test]
    fn expiry_classification_boundaries() {
        let now = Utc::now();
        let lead = TimeDelta::minutes(10);
        let one = TimeDelta::seconds(1);

        assert!(is_expiring_soon(Some(&state_expiring_at(now + lead - one)), now, lead));
        assert!(!is_expiring_soon(Some(&state_expiring_at(now + lead + one)), now, lead));
        assert!(is_expiring_soon(Some(&state_expiring_at(now)), now, lead));
        assert!(is_expiring_soon(Some(&state_expiring_at(now - one)), now, lead));
        assert!(!is_expiring_soon(None, now, lead));

        let mut unknown = state_expiring_at(now);
        unknown.expires_at = None;
        assert!(!is_expiring_soon(Some(&unknown), now, lead));
    }

    #[test]
    fn pkce_verifier_is_plain_text() {
        assert_eq!(PkceVerifier::decode("  abc\n"), Some(PkceVerifier("abc".into())));
        assert_eq!(PkceVerifier::decode("\n"), None);
        assert_eq!(PkceVerifier("abc".into()).encode().unwrap(), "abc");
    }

    #[test]
    fn loopback_redirect_port_is_extracted() {
        let reg = ClientRegistration {
            client_id: "c".into(),
            client_secret: None,
            redirect_uris: vec![
                "https://example.com/cb".into(),
                "http://localhost:3334/oauth/callback".into(),
            ],
            token_endpoint_auth_method: None,
            scope: None,
            client_name: None,
            client_id_issued_at: None,
            client_secret_expires_at: None,
        };
        assert_eq!(reg.loopback_redirect_port(), Some(3334));
    }

    #[test]
    fn client_secret_expiry() {
        let now = Utc::now();
        let mut reg = ClientRegistration::decode(r#"{"client_id": "c"}"#).unwrap();
        assert!(!reg.secret_expired(now));
        reg.client_secret_expires_at = Some(0);
        assert!(!reg.secret_expired(now));
        reg.client_secret_expires_at = Some(now.timestamp() - 1);
        assert!(reg.secret_expired(now));
    }

    #[test]
    fn file_names_follow_layout() {
        let key = ServerKey::from_url("https://x.example.com");
        assert_eq!(FileKind::Tokens.file_name(&key), format!("{key}_tokens.json"));
        assert_eq!(FileKind::CodeVerifier.file_name(&key), format!("{key}_code_verifier.txt"));
        assert_eq!(FileKind::AuthLock.file_name(&key), format!("{key}_lock.json"));
    }
}
