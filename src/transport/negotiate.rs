//! Remote transport negotiation
//!
//! Tries the transport variants in strategy order, falls back once when a
//! server rejects a variant, and runs the authorization flow once when a
//! server demands credentials. Seeing the same failure class twice ends the
//! attempt instead of looping.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use super::{
    RemoteOptions, SseTransport, StreamableHttpTransport, TlsPolicy, TokenSource, Transport, TransportEvent,
    TransportStrategy, TransportVariant, header_map, require_secure_url,
};
use crate::config::TransportConfig;
use crate::oauth::{AuthInitializer, OAuthProvider};
use crate::{Error, Result};

/// Why a connection attempt is being retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// The server rejected the attempted variant
    TransportFallback,
    /// The server answered 401
    AuthNeeded,
    /// Another process stored new tokens while the request was in flight
    TokensReplaced,
}

/// A started remote transport
pub struct RemoteConnection {
    /// The transport
    pub transport: Arc<dyn Transport>,
    /// Its event channel
    pub events: mpsc::Receiver<TransportEvent>,
    /// Which variant was negotiated
    pub variant: TransportVariant,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

/// Connects to one remote server, authorizing when asked to
pub struct TransportNegotiator {
    server_url: Url,
    provider: Arc<OAuthProvider>,
    auth: Arc<dyn AuthInitializer>,
    options: RemoteOptions,
    strategy: TransportStrategy,
}

impl TransportNegotiator {
    /// Build a negotiator. Fails on plain HTTP to a remote host (unless
    /// allowed), invalid headers, or contradictory TLS settings.
    pub fn new(
        server_url: Url,
        provider: Arc<OAuthProvider>,
        auth: Arc<dyn AuthInitializer>,
        config: &TransportConfig,
    ) -> Result<Self> {
        require_secure_url(&server_url, config.allow_http)?;
        let tls = TlsPolicy::from_env(config.insecure)?;
        let http = tls
            .client_builder()
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {e}")))?;

        let options = RemoteOptions {
            http,
            headers: header_map(&config.headers)?,
            tokens: Some(TokenSource::new(provider.store().clone(), provider.key().clone())),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        };

        Ok(Self {
            server_url,
            provider,
            auth,
            options,
            strategy: config.strategy,
        })
    }

    /// Remote server URL
    #[must_use]
    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    /// Connect using the configured strategy
    pub async fn connect(&self) -> Result<RemoteConnection> {
        let order = self.strategy.order();
        let mut seen: HashSet<RetryReason> = HashSet::new();
        let mut index = 0;

        loop {
            let variant = order[index];
            info!(url = %self.server_url, transport = %variant, "Connecting to remote server");
            let attempted_with = self.current_authorization().await;

            let err = match self.open(variant).await {
                Ok(connection) => {
                    info!(transport = %variant, "Connected to remote server");
                    return Ok(connection);
                }
                Err(e) => e,
            };

            if err.is_unauthorized() {
                if self.current_authorization().await != attempted_with && seen.insert(RetryReason::TokensReplaced) {
                    info!("Credentials changed during the attempt, retrying with the stored ones");
                    continue;
                }
                if !seen.insert(RetryReason::AuthNeeded) {
                    return Err(Error::GivingUp(
                        "the server still rejects our credentials after authorization".to_string(),
                    ));
                }
                self.authorize(err.challenge()).await?;
                continue;
            }

            if err.is_unsupported_transport() && index + 1 < order.len() {
                if !seen.insert(RetryReason::TransportFallback) {
                    return Err(Error::GivingUp(format!("no transport variant accepted ({err})")));
                }
                warn!(transport = %variant, error = %err, "Transport rejected, trying the next one");
                index += 1;
                continue;
            }

            return Err(err);
        }
    }

    /// Run (or wait for) the authorization flow after a 401
    pub async fn authorize(&self, www_authenticate: Option<&str>) -> Result<()> {
        let state = self.auth.initialize_auth().await?;
        if state.skip_browser_auth {
            info!("Authorization completed by another process");
            return Ok(());
        }

        let callback = state
            .callback
            .clone()
            .ok_or_else(|| Error::Auth("No callback listener for the authorization flow".to_string()))?;

        let result = self
            .provider
            .authorize(www_authenticate, &callback, state.auth_timeout)
            .await;
        self.auth.auth_finished(result.is_ok()).await;
        result.map(|_| ())
    }

    async fn current_authorization(&self) -> Option<String> {
        match &self.options.tokens {
            Some(tokens) => tokens.authorization().await,
            None => None,
        }
    }

    async fn open(&self, variant: TransportVariant) -> Result<RemoteConnection> {
        let transport: Arc<dyn Transport> = match variant {
            TransportVariant::StreamableHttp => {
                let transport = StreamableHttpTransport::new(self.server_url.clone(), self.options.clone());
                transport.probe().await?;
                Arc::new(transport)
            }
            TransportVariant::Sse => Arc::new(SseTransport::new(self.server_url.clone(), self.options.clone())),
        };
        let events = transport.start().await?;
        Ok(RemoteConnection {
            transport,
            events,
            variant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::DiscoveryConfig;
    use crate::oauth::{AuthState, CredentialStore, MetadataResolver, ServerKey, ServerRegistration};

    /// Pretends another process always finishes the flow
    #[derive(Default)]
    struct OtherProcessAuth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthInitializer for OtherProcessAuth {
        async fn initialize_auth(&self) -> Result<AuthState> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AuthState {
                skip_browser_auth: true,
                callback: None,
                auth_timeout: Duration::from_secs(1),
            })
        }

        async fn auth_finished(&self, _succeeded: bool) {}
    }

    fn negotiator(
        server: &MockServer,
        dir: &tempfile::TempDir,
        strategy: TransportStrategy,
        auth: Arc<OtherProcessAuth>,
    ) -> TransportNegotiator {
        let url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url(url.as_str());
        let resolver = MetadataResolver::new(&DiscoveryConfig {
            ssrf_protection: false,
            ..DiscoveryConfig::default()
        })
        .unwrap();
        let registration = ServerRegistration {
            server_url: url.to_string(),
            callback_host: "localhost".to_string(),
            callback_port: None,
            static_client_metadata: None,
            static_client_info: None,
            resource: None,
            scope: None,
            updated_at: Utc::now(),
        };
        let provider = Arc::new(OAuthProvider::new(
            reqwest::Client::new(),
            store,
            resolver,
            key,
            registration,
        ));
        let config = TransportConfig {
            strategy,
            ..TransportConfig::default()
        };
        TransportNegotiator::new(url, provider, auth, &config).unwrap()
    }

    #[tokio::test]
    async fn falls_back_to_sse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("event: endpoint\ndata: /messages\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(OtherProcessAuth::default());
        let negotiator = negotiator(&server, &dir, TransportStrategy::HttpFirst, auth.clone());
        let connection = negotiator.connect().await.unwrap();
        assert_eq!(connection.variant, TransportVariant::Sse);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_variant_strategy_surfaces_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let negotiator = negotiator(
            &server,
            &dir,
            TransportStrategy::HttpOnly,
            Arc::new(OtherProcessAuth::default()),
        );
        let err = negotiator.connect().await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedTransport(404)));
    }

    #[tokio::test]
    async fn gives_up_after_second_challenge() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", "Bearer"))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(OtherProcessAuth::default());
        let negotiator = negotiator(&server, &dir, TransportStrategy::HttpOnly, auth.clone());
        let err = negotiator.connect().await.unwrap_err();
        assert!(matches!(err, Error::GivingUp(_)), "{err}");
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn plain_http_to_remote_host_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let url = Url::parse("http://mcp.example.com/mcp").unwrap();
        let provider = Arc::new(OAuthProvider::new(
            reqwest::Client::new(),
            store,
            MetadataResolver::new(&DiscoveryConfig::default()).unwrap(),
            ServerKey::from_url(url.as_str()),
            ServerRegistration {
                server_url: url.to_string(),
                callback_host: "localhost".to_string(),
                callback_port: None,
                static_client_metadata: None,
                static_client_info: None,
                resource: None,
                scope: None,
                updated_at: Utc::now(),
            },
        ));
        let result = TransportNegotiator::new(
            url,
            provider,
            Arc::new(OtherProcessAuth::default()),
            &TransportConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
