//! Transports for the bridge
//!
//! The local side speaks newline-delimited JSON over stdio; the remote side
//! is either Streamable HTTP or the older HTTP+SSE transport, chosen by the
//! [`TransportNegotiator`].

mod http;
mod negotiate;
mod sse;
mod stdio;
mod tls;

pub use self::http::StreamableHttpTransport;
pub use self::negotiate::{RemoteConnection, RetryReason, TransportNegotiator};
pub use self::sse::{SseDecoder, SseEvent, SseTransport};
pub use self::stdio::StdioTransport;
pub use self::tls::{REQUIRE_TLS_VERIFY_ENV, TlsPolicy, require_secure_url};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::oauth::{CredentialStore, ServerKey};
use crate::protocol::PROTOCOL_VERSION;
use crate::{Error, Result};

/// Capacity of a transport's event channel
pub(crate) const EVENT_BUFFER: usize = 64;

/// Something a transport observed
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound JSON-RPC message
    Message(Value),
    /// A failure that did not close the transport
    Error(Error),
    /// The transport closed
    Closed,
}

/// A bidirectional JSON-RPC message channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start receiving; inbound messages, errors and closure arrive on the
    /// returned channel. May only be called once.
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Send one message
    async fn send(&self, message: Value) -> Result<()>;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}

/// Remote transport variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportVariant {
    /// Streamable HTTP (single endpoint, POST + optional GET stream)
    StreamableHttp,
    /// HTTP+SSE (GET event stream, POST to announced endpoint)
    Sse,
}

impl fmt::Display for TransportVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StreamableHttp => "streamable-http",
            Self::Sse => "sse",
        })
    }
}

/// Which variants to try, in order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TransportStrategy {
    /// Streamable HTTP, falling back to SSE
    #[default]
    HttpFirst,
    /// SSE, falling back to Streamable HTTP
    SseFirst,
    /// Streamable HTTP only
    HttpOnly,
    /// SSE only
    SseOnly,
}

impl TransportStrategy {
    /// Variants in preference order
    #[must_use]
    pub fn order(self) -> &'static [TransportVariant] {
        use TransportVariant::{Sse, StreamableHttp};
        match self {
            Self::HttpFirst => &[StreamableHttp, Sse],
            Self::SseFirst => &[Sse, StreamableHttp],
            Self::HttpOnly => &[StreamableHttp],
            Self::SseOnly => &[Sse],
        }
    }
}

/// Reads the current bearer token from the credential store on every request
#[derive(Debug, Clone)]
pub struct TokenSource {
    store: Arc<CredentialStore>,
    key: ServerKey,
}

impl TokenSource {
    /// Token source for `key`
    #[must_use]
    pub fn new(store: Arc<CredentialStore>, key: ServerKey) -> Self {
        Self { store, key }
    }

    /// `Authorization` header value, if tokens are stored
    pub async fn authorization(&self) -> Option<String> {
        self.store
            .tokens(&self.key)
            .await
            .map(|t| t.authorization_header())
    }
}

/// Settings shared by the remote transports
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// HTTP client (no total timeout; streams are long-lived)
    pub http: reqwest::Client,
    /// Extra headers for every request
    pub headers: HeaderMap,
    /// Bearer token source
    pub tokens: Option<TokenSource>,
    /// Timeout for individual POSTs and the SSE endpoint handshake
    pub request_timeout: Duration,
}

impl RemoteOptions {
    /// Headers for one request: protocol version, custom headers, then the
    /// bearer token unless a custom `Authorization` header is configured
    pub(crate) async fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("mcp-protocol-version"),
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        headers.extend(self.headers.clone());

        if !headers.contains_key(header::AUTHORIZATION) {
            if let Some(tokens) = &self.tokens {
                if let Some(value) = tokens.authorization().await {
                    match HeaderValue::from_str(&value) {
                        Ok(mut v) => {
                            v.set_sensitive(true);
                            headers.insert(header::AUTHORIZATION, v);
                        }
                        Err(_) => tracing::warn!("Stored access token is not a valid header value"),
                    }
                }
            }
        }
        headers
    }
}

/// Convert configured headers to a [`HeaderMap`]
pub fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("Invalid value for header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Classify a failed HTTP response
pub(crate) fn status_error(response: &reqwest::Response) -> Error {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        return Error::unauthorized(challenge);
    }
    Error::Transport(format!("HTTP {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_orders() {
        assert_eq!(
            TransportStrategy::HttpFirst.order(),
            &[TransportVariant::StreamableHttp, TransportVariant::Sse]
        );
        assert_eq!(
            TransportStrategy::SseFirst.order(),
            &[TransportVariant::Sse, TransportVariant::StreamableHttp]
        );
        assert_eq!(TransportStrategy::HttpOnly.order().len(), 1);
        assert_eq!(TransportStrategy::SseOnly.order(), &[TransportVariant::Sse]);
    }

    #[test]
    fn strategy_serde_is_kebab_case() {
        let s: TransportStrategy = serde_json::from_str("\"sse-first\"").unwrap();
        assert_eq!(s, TransportStrategy::SseFirst);
        assert_eq!(serde_json::to_string(&TransportStrategy::HttpOnly).unwrap(), "\"http-only\"");
    }

    #[test]
    fn header_map_rejects_invalid_names() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Ok".to_string(), "1".to_string());
        assert_eq!(header_map(&headers).unwrap()["x-ok"], "1");

        headers.insert("bad header".to_string(), "1".to_string());
        assert!(matches!(header_map(&headers), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn custom_authorization_wins_over_stored_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");
        store
            .save_tokens(&key, &crate::oauth::TokenRecord::bearer("stored"), chrono::Utc::now())
            .await
            .unwrap();

        let mut options = RemoteOptions {
            http: reqwest::Client::new(),
            headers: HeaderMap::new(),
            tokens: Some(TokenSource::new(store, key)),
            request_timeout: Duration::from_secs(5),
        };
        assert_eq!(options.request_headers().await[header::AUTHORIZATION], "Bearer stored");

        options
            .headers
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Token custom"));
        let headers = options.request_headers().await;
        assert_eq!(headers[header::AUTHORIZATION], "Token custom");
        assert_eq!(headers["mcp-protocol-version"], PROTOCOL_VERSION);
    }
}
