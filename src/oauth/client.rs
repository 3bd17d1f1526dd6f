//! OAuth Client
//!
//! Authorization-code flow with PKCE (RFC 7636), dynamic client registration
//! (RFC 7591), resource indicators (RFC 8707) and the refresh-token grant,
//! all persisted through the [`CredentialStore`].

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use super::callback::CallbackServer;
use super::metadata::{AuthorizationServerMetadata, MetadataResolver, OAuthMetadataBundle, ScopeHints};
use super::records::{ClientRegistration, PkceVerifier, ServerKey, ServerRegistration, TokenRecord};
use super::storage::{CredentialStore, Invalidation};
use crate::config::AuthConfig;
use crate::{Error, Result};

/// Shows the authorization URL to the user
pub trait BrowserLauncher: Send + Sync {
    /// Present `url`; an error means the user must open it manually
    fn launch(&self, url: &Url) -> Result<()>;
}

/// Opens the system browser, or only prints the URL when `print_only`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser {
    /// Skip the browser and rely on the printed URL
    pub print_only: bool,
}

impl BrowserLauncher for SystemBrowser {
    fn launch(&self, url: &Url) -> Result<()> {
        if self.print_only {
            return Err(Error::Auth("Browser launch disabled".to_string()));
        }
        open::that(url.as_str()).map_err(|e| Error::Auth(format!("Failed to open browser: {e}")))
    }
}

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    /// Secret verifier, persisted until the code exchange
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`
    pub challenge: String,
}

impl Pkce {
    /// Generate a fresh pair
    #[must_use]
    pub fn generate() -> Self {
        let verifier_bytes: [u8; 32] = rand::random();
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let challenge = Self::challenge_for(&verifier);
        Self { verifier, challenge }
    }

    /// S256 challenge for a verifier
    #[must_use]
    pub fn challenge_for(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }
}

/// Generate a random state parameter
fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}

/// Build the authorization request URL
pub fn authorization_url(
    metadata: &AuthorizationServerMetadata,
    client: &ClientRegistration,
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
    scope: &str,
    resource: Option<&str>,
) -> Result<Url> {
    let mut url = Url::parse(&metadata.authorization_endpoint)
        .map_err(|e| Error::Auth(format!("Invalid authorization endpoint: {e}")))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("response_type", "code");
        params.append_pair("client_id", &client.client_id);
        params.append_pair("redirect_uri", redirect_uri);
        params.append_pair("state", state);
        params.append_pair("code_challenge", code_challenge);
        params.append_pair("code_challenge_method", "S256");
        if !scope.is_empty() {
            params.append_pair("scope", scope);
        }
        if let Some(resource) = resource {
            params.append_pair("resource", resource);
        }
    }

    Ok(url)
}

/// Token endpoint grant being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

/// Error body of a failed token request (RFC 6749 §5.2)
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth provider for one remote server
pub struct OAuthProvider {
    /// HTTP client for registration and token requests
    http: Client,
    store: Arc<CredentialStore>,
    resolver: MetadataResolver,
    key: ServerKey,
    /// Connection parameters, persisted when a flow starts
    server: ServerRegistration,
    client_name: String,
    launcher: Arc<dyn BrowserLauncher>,
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("key", &self.key)
            .field("server_url", &self.server.server_url)
            .finish_non_exhaustive()
    }
}

impl OAuthProvider {
    /// Create a provider from a server snapshot
    #[must_use]
    pub fn new(
        http: Client,
        store: Arc<CredentialStore>,
        resolver: MetadataResolver,
        key: ServerKey,
        server: ServerRegistration,
    ) -> Self {
        Self {
            http,
            store,
            resolver,
            key,
            server,
            client_name: "MCP Auth Bridge".to_string(),
            launcher: Arc::new(SystemBrowser::default()),
        }
    }

    /// Create a provider from command-line/file configuration
    #[must_use]
    pub fn from_config(
        http: Client,
        store: Arc<CredentialStore>,
        resolver: MetadataResolver,
        key: ServerKey,
        server_url: &str,
        config: &AuthConfig,
    ) -> Self {
        let server = ServerRegistration {
            server_url: server_url.to_string(),
            callback_host: config.callback_host.clone(),
            callback_port: config.callback_port,
            static_client_metadata: config.static_client_metadata.clone(),
            static_client_info: config.static_client_info.clone(),
            resource: config.resource.clone(),
            scope: config.scope.clone(),
            updated_at: Utc::now(),
        };
        Self::new(http, store, resolver, key, server)
            .with_client_name(&config.client_name)
            .with_launcher(Arc::new(SystemBrowser {
                print_only: config.no_browser,
            }))
    }

    /// Override the client name sent at registration
    #[must_use]
    pub fn with_client_name(mut self, name: &str) -> Self {
        self.client_name = name.to_string();
        self
    }

    /// Override how the authorization URL is presented
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Storage key of this server
    #[must_use]
    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    /// Remote server URL
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server.server_url
    }

    /// Credential store
    #[must_use]
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Current tokens from disk
    pub async fn tokens(&self) -> Option<TokenRecord> {
        self.store.tokens(&self.key).await
    }

    /// Discover metadata with this server's scope hints
    pub async fn discover(&self, www_authenticate: Option<&str>) -> OAuthMetadataBundle {
        let registered_scope = self
            .store
            .client_registration(&self.key)
            .await
            .and_then(|c| c.scope);
        let hints = ScopeHints {
            static_scope: self.server.scope.clone(),
            registered_scope,
        };
        self.resolver
            .discover(&self.server.server_url, www_authenticate, &hints)
            .await
    }

    /// Resource indicator to send: validated metadata first, then configuration
    #[must_use]
    pub fn resource_indicator(&self, bundle: &OAuthMetadataBundle) -> Option<String> {
        bundle
            .resource()
            .map(str::to_string)
            .or_else(|| self.server.resource.clone())
    }

    /// Persist the connection snapshot used by background refresh
    pub async fn save_server_registration(&self, callback_port: Option<u16>) -> Result<()> {
        let snapshot = ServerRegistration {
            callback_port: callback_port.or(self.server.callback_port),
            updated_at: Utc::now(),
            ..self.server.clone()
        };
        self.store.write(&self.key, &snapshot).await
    }

    /// Client identity without registering: static, then stored
    pub async fn existing_client(&self) -> Option<ClientRegistration> {
        if let Some(client) = &self.server.static_client_info {
            return Some(client.clone());
        }
        self.store
            .client_registration(&self.key)
            .await
            .filter(|c| !c.secret_expired(Utc::now()))
    }

    /// Client identity for an interactive flow, registering if needed
    pub async fn ensure_client(
        &self,
        metadata: &AuthorizationServerMetadata,
        redirect_uri: &str,
        scope: &str,
    ) -> Result<ClientRegistration> {
        if let Some(client) = &self.server.static_client_info {
            debug!(client_id = %client.client_id, "Using static OAuth client");
            return Ok(client.clone());
        }

        if let Some(client) = self.store.client_registration(&self.key).await {
            let redirect_ok = client.redirect_uris.is_empty()
                || client.redirect_uris.iter().any(|u| u == redirect_uri);
            if redirect_ok && !client.secret_expired(Utc::now()) {
                debug!(client_id = %client.client_id, "Reusing registered OAuth client");
                return Ok(client);
            }
            info!(server = %self.key, "Stored client registration no longer usable, re-registering");
        }

        let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
            Error::Auth(format!(
                "Authorization server {} does not support dynamic client registration; configure a static client",
                metadata.issuer
            ))
        })?;

        let client = self.register_client(endpoint, redirect_uri, scope).await?;
        self.store.write(&self.key, &client).await?;
        Ok(client)
    }

    /// Register a new client dynamically with the specified redirect URI
    async fn register_client(&self, endpoint: &str, redirect_uri: &str, scope: &str) -> Result<ClientRegistration> {
        let mut body = serde_json::json!({
            "client_name": self.client_name,
            "redirect_uris": [redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
            "scope": scope,
        });
        if let (Some(base), Some(serde_json::Value::Object(extra))) =
            (body.as_object_mut(), self.server.static_client_metadata.as_ref())
        {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }

        let response = self
            .http
            .post(endpoint)
            .header(header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Client registration failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!(
                "Client registration failed: HTTP {status} - {body}"
            )));
        }

        let mut client: ClientRegistration = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Failed to parse registration response: {e}")))?;
        if client.client_id.is_empty() {
            return Err(Error::Auth("Registration response has no client_id".to_string()));
        }
        if client.redirect_uris.is_empty() {
            client.redirect_uris.push(redirect_uri.to_string());
        }

        info!(client_id = %client.client_id, "Registered OAuth client");
        Ok(client)
    }

    /// Drive an interactive authorization through `callback` and persist the
    /// resulting tokens.
    ///
    /// A stored refresh token is tried first; the browser is only involved
    /// when that fails.
    pub async fn authorize(
        &self,
        www_authenticate: Option<&str>,
        callback: &CallbackServer,
        timeout: Duration,
    ) -> Result<TokenRecord> {
        let bundle = self.discover(www_authenticate).await;

        if self.tokens().await.is_some_and(|t| t.refresh_token.is_some()) {
            match self.refresh(&bundle).await {
                Ok(token) => return Ok(token),
                Err(e) => warn!(server = %self.key, error = %e, "Refresh failed, starting interactive authorization"),
            }
        }

        let metadata = bundle.require_authorization_server(&self.server.server_url)?;
        let redirect_uri = callback.redirect_uri();
        let scope = bundle.effective_scope.clone();
        let resource = self.resource_indicator(&bundle);

        let client = self.ensure_client(metadata, redirect_uri, &scope).await?;
        self.save_server_registration(Some(callback.port())).await?;

        let pkce = Pkce::generate();
        self.store.write(&self.key, &PkceVerifier(pkce.verifier.clone())).await?;

        let state = generate_state();
        callback.expect_state(&state);

        let url = authorization_url(
            metadata,
            &client,
            redirect_uri,
            &state,
            &pkce.challenge,
            &scope,
            resource.as_deref(),
        )?;
        self.present(&url);

        let code = callback.wait_for_code(timeout).await?;
        debug!(server = %self.key, "Received authorization code");

        self.exchange_code(metadata, &client, &code, redirect_uri, resource.as_deref())
            .await
    }

    fn present(&self, url: &Url) {
        info!(server = %self.key, "Authorization required");
        eprintln!("\nAuthorize this client by visiting:\n{url}\n");
        if let Err(e) = self.launcher.launch(url) {
            warn!(error = %e, "Could not open a browser");
            eprintln!("Copy the URL above into a browser to continue; this process will wait.\n");
        }
    }

    /// Exchange an authorization code for tokens using the stored verifier
    pub async fn exchange_code(
        &self,
        metadata: &AuthorizationServerMetadata,
        client: &ClientRegistration,
        code: &str,
        redirect_uri: &str,
        resource: Option<&str>,
    ) -> Result<TokenRecord> {
        let verifier = self
            .store
            .code_verifier(&self.key)
            .await
            .ok_or_else(|| Error::Auth("No PKCE verifier stored for this flow".to_string()))?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("code_verifier", verifier.0),
        ];
        if let Some(resource) = resource {
            form.push(("resource", resource.to_string()));
        }

        let token = self
            .token_request(&metadata.token_endpoint, client, form, Grant::AuthorizationCode)
            .await?;
        self.store.save_tokens(&self.key, &token, Utc::now()).await?;
        self.store.invalidate(&self.key, Invalidation::Verifier).await?;

        info!(server = %self.key, "Authorization completed");
        Ok(token)
    }

    /// Run the refresh-token grant against the discovered token endpoint
    pub async fn refresh(&self, bundle: &OAuthMetadataBundle) -> Result<TokenRecord> {
        let current = self
            .tokens()
            .await
            .ok_or_else(|| Error::Auth("No stored tokens to refresh".to_string()))?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| Error::Auth("Stored tokens have no refresh token".to_string()))?;
        let metadata = bundle.require_authorization_server(&self.server.server_url)?;
        let client = self
            .existing_client()
            .await
            .ok_or_else(|| Error::Auth("No OAuth client registered for refresh".to_string()))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
        ];
        if let Some(resource) = self.resource_indicator(bundle) {
            form.push(("resource", resource));
        }

        let mut token = self
            .token_request(&metadata.token_endpoint, &client, form, Grant::RefreshToken)
            .await?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token);
        }
        self.store.save_tokens(&self.key, &token, Utc::now()).await?;

        info!(server = %self.key, "Token refreshed successfully");
        Ok(token)
    }

    async fn token_request(
        &self,
        endpoint: &str,
        client: &ClientRegistration,
        mut form: Vec<(&'static str, String)>,
        grant: Grant,
    ) -> Result<TokenRecord> {
        let method = client.token_endpoint_auth_method.as_deref().unwrap_or(
            if client.client_secret.is_some() {
                "client_secret_basic"
            } else {
                "none"
            },
        );

        let mut request = self.http.post(endpoint).header(header::ACCEPT, "application/json");
        match (method, client.client_secret.as_deref()) {
            ("client_secret_basic", Some(secret)) => {
                request = request.basic_auth(&client.client_id, Some(secret));
            }
            ("client_secret_post", Some(secret)) => {
                form.push(("client_id", client.client_id.clone()));
                form.push(("client_secret", secret.to_string()));
            }
            _ => form.push(("client_id", client.client_id.clone())),
        }

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.token_error(status, &body, grant).await);
        }

        let token: TokenRecord = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Failed to parse token response: {e}")))?;
        if token.access_token.is_empty() {
            return Err(Error::Auth("Token response has no access_token".to_string()));
        }
        Ok(token)
    }

    /// Map a token endpoint failure, invalidating credentials it condemns.
    ///
    /// A rejected refresh keeps everything so the refresh manager can record
    /// the failure and retry.
    async fn token_error(&self, status: StatusCode, body: &str, grant: Grant) -> Error {
        let Ok(parsed) = serde_json::from_str::<OAuthErrorBody>(body) else {
            return Error::Auth(format!("Token request failed: HTTP {status} - {body}"));
        };

        let scope = match (grant, parsed.error.as_str()) {
            (Grant::RefreshToken, _) => None,
            (Grant::AuthorizationCode, "invalid_grant") => Some(Invalidation::Verifier),
            (Grant::AuthorizationCode, "invalid_client" | "unauthorized_client") => Some(Invalidation::Client),
            (Grant::AuthorizationCode, _) => None,
        };
        if let Some(scope) = scope {
            warn!(server = %self.key, error = %parsed.error, "Invalidating rejected credentials");
            if let Err(e) = self.store.invalidate(&self.key, scope).await {
                warn!(server = %self.key, error = %e, "Failed to invalidate credentials");
            }
        }

        Error::Auth(format!(
            "Token request failed: HTTP {status} - {}{}",
            parsed.error,
            parsed
                .error_description
                .map(|d| format!(": {d}"))
                .unwrap_or_default()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn pkce_verifier_is_base64url_safe() {
        for _ in 0..10 {
            let pkce = Pkce::generate();
            assert!(pkce.verifier.len() >= 43);
            for s in [&pkce.verifier, &pkce.challenge] {
                assert!(!s.contains('+'));
                assert!(!s.contains('/'));
                assert!(!s.contains('='));
            }
        }
    }

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        // RFC 7636 appendix B
        assert_eq!(
            Pkce::challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn pkce_generates_unique_values() {
        let a = Pkce::generate();
        let b = Pkce::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    #[test]
    fn state_generates_unique_values() {
        let s1 = generate_state();
        assert_ne!(s1, generate_state());
        assert!(s1.len() >= 20);
    }

    fn metadata(base: &str) -> AuthorizationServerMetadata {
        serde_json::from_value(serde_json::json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "registration_endpoint": format!("{base}/register"),
        }))
        .unwrap()
    }

    fn client(id: &str) -> ClientRegistration {
        ClientRegistration {
            client_id: id.to_string(),
            client_secret: None,
            redirect_uris: vec![],
            token_endpoint_auth_method: None,
            scope: None,
            client_name: None,
            client_id_issued_at: None,
            client_secret_expires_at: None,
        }
    }

    #[test]
    fn authorization_url_carries_all_parameters() {
        let url = authorization_url(
            &metadata("https://auth.example.com"),
            &client("abc"),
            "http://localhost:3334/oauth/callback",
            "st",
            "ch",
            "read write",
            Some("https://mcp.example.com/mcp"),
        )
        .unwrap();

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "abc");
        assert_eq!(pairs["redirect_uri"], "http://localhost:3334/oauth/callback");
        assert_eq!(pairs["state"], "st");
        assert_eq!(pairs["code_challenge"], "ch");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["scope"], "read write");
        assert_eq!(pairs["resource"], "https://mcp.example.com/mcp");
    }

    fn provider(dir: &std::path::Path, server_url: &str) -> OAuthProvider {
        let store = Arc::new(CredentialStore::new(dir, false));
        let resolver = MetadataResolver::new(&DiscoveryConfig {
            timeout_ms: 2_000,
            ssrf_protection: false,
        })
        .unwrap();
        let key = ServerKey::from_url(server_url);
        let config = AuthConfig {
            no_browser: true,
            ..AuthConfig::default()
        };
        OAuthProvider::from_config(Client::new(), store, resolver, key, server_url, &config)
    }

    #[tokio::test]
    async fn registers_and_persists_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .and(body_string_contains("http://localhost:9999/oauth/callback"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "dyn-client",
                "token_endpoint_auth_method": "none"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path(), &format!("{}/mcp", server.uri()));
        let meta = metadata(&server.uri());

        let c = p.ensure_client(&meta, "http://localhost:9999/oauth/callback", "read").await.unwrap();
        assert_eq!(c.client_id, "dyn-client");
        assert_eq!(c.redirect_uris, vec!["http://localhost:9999/oauth/callback"]);

        // second call reuses the stored registration
        let again = p.ensure_client(&meta, "http://localhost:9999/oauth/callback", "read").await.unwrap();
        assert_eq!(again.client_id, "dyn-client");
    }

    #[tokio::test]
    async fn refresh_keeps_old_refresh_token_and_uses_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header_exists("authorization"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "token_type": "bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path(), &format!("{}/mcp", server.uri()));
        let mut confidential = client("conf");
        confidential.client_secret = Some("s3cret".into());
        p.store.write(&p.key, &confidential).await.unwrap();
        let mut token = TokenRecord::bearer("at-1");
        token.refresh_token = Some("rt-1".into());
        p.store.save_tokens(&p.key, &token, Utc::now()).await.unwrap();

        let bundle = OAuthMetadataBundle {
            protected_resource: None,
            authorization_server: Some(metadata(&server.uri())),
            issuer: Some(server.uri()),
            effective_scope: "read".into(),
            source: super::super::metadata::DiscoverySource::OriginFallback,
            challenge: None,
        };
        let refreshed = p.refresh(&bundle).await.unwrap();
        assert_eq!(refreshed.access_token, "at-2");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(p.tokens().await.unwrap().access_token, "at-2");
    }

    #[tokio::test]
    async fn rejected_refresh_keeps_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path(), &format!("{}/mcp", server.uri()));
        p.store.write(&p.key, &client("pub")).await.unwrap();
        let mut token = TokenRecord::bearer("at-1");
        token.refresh_token = Some("rt-1".into());
        p.store.save_tokens(&p.key, &token, Utc::now()).await.unwrap();

        let bundle = OAuthMetadataBundle {
            protected_resource: None,
            authorization_server: Some(metadata(&server.uri())),
            issuer: None,
            effective_scope: "read".into(),
            source: super::super::metadata::DiscoverySource::OriginFallback,
            challenge: None,
        };
        let err = p.refresh(&bundle).await.unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
        assert_eq!(p.tokens().await.unwrap().refresh_token.as_deref(), Some("rt-1"));
        assert!(p.store.client_registration(&p.key).await.is_some());
    }

    #[tokio::test]
    async fn rejected_exchange_drops_condemned_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=stale"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "invalid_grant"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=fresh"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "invalid_client"})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path(), &format!("{}/mcp", server.uri()));
        let meta = metadata(&server.uri());
        p.store.write(&p.key, &client("pub")).await.unwrap();

        p.store.write(&p.key, &PkceVerifier("v1".into())).await.unwrap();
        let err = p
            .exchange_code(&meta, &client("pub"), "stale", "http://localhost/cb", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
        assert!(p.store.code_verifier(&p.key).await.is_none());
        assert!(p.store.client_registration(&p.key).await.is_some());

        p.store.write(&p.key, &PkceVerifier("v2".into())).await.unwrap();
        let err = p
            .exchange_code(&meta, &client("pub"), "fresh", "http://localhost/cb", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_client"));
        assert!(p.store.client_registration(&p.key).await.is_none());
    }

    #[tokio::test]
    async fn exchange_requires_verifier_and_consumes_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code_verifier=the-verifier"))
            .and(body_string_contains("client_id=pub"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 60
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path(), &format!("{}/mcp", server.uri()));
        let meta = metadata(&server.uri());

        let err = p.exchange_code(&meta, &client("pub"), "code", "http://localhost/cb", None).await;
        assert!(err.is_err());

        p.store.write(&p.key, &PkceVerifier("the-verifier".into())).await.unwrap();
        let token = p
            .exchange_code(&meta, &client("pub"), "code", "http://localhost/cb", None)
            .await
            .unwrap();
        assert_eq!(token.access_token, "at");
        assert!(p.store.code_verifier(&p.key).await.is_none());
    }
}
