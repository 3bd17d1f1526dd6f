//! OAuth Callback Server
//!
//! A loopback HTTP listener owned by the process driving an interactive
//! authorization. It receives the redirect carrying the authorization code
//! and answers `/wait-for-auth` so other processes can tell whether the
//! owner is alive and whether it has finished.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Path other processes poll for the owner's status
pub const WAIT_FOR_AUTH_PATH: &str = "/wait-for-auth";

/// Upper bound on a long-poll of `/wait-for-auth`
const LONG_POLL: Duration = Duration::from_secs(30);

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    poll: Option<bool>,
}

/// What the redirect delivered
#[derive(Debug, Clone, PartialEq, Eq)]
enum CallbackOutcome {
    Code(String),
    Rejected(String),
}

/// State shared with the handlers
struct Shared {
    expected_state: Mutex<Option<String>>,
    outcome: watch::Sender<Option<CallbackOutcome>>,
    completed: watch::Sender<bool>,
}

/// Handle to a running callback listener
pub struct CallbackServer {
    port: u16,
    redirect_uri: String,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CallbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackServer")
            .field("port", &self.port)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl CallbackServer {
    /// Bind a loopback listener on `port` (0 for ephemeral) and start serving.
    ///
    /// `host` only shapes the redirect URI; the socket is always bound to
    /// 127.0.0.1.
    pub async fn bind(host: &str, port: u16, callback_path: &str) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Auth(format!("Failed to bind callback server on port {port}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Auth(format!("Failed to get callback server address: {e}")))?
            .port();

        let path = if callback_path.starts_with('/') {
            callback_path.to_string()
        } else {
            format!("/{callback_path}")
        };
        let redirect_uri = format!("http://{host}:{port}{path}");

        let (outcome, _) = watch::channel(None);
        let (completed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            expected_state: Mutex::new(None),
            outcome,
            completed,
        });

        let app = Router::new()
            .route(&path, get(handle_callback))
            .route(WAIT_FOR_AUTH_PATH, get(handle_wait_for_auth))
            .with_state(Arc::clone(&shared));

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                token.cancelled().await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "Callback server error");
            }
        });

        info!(url = %redirect_uri, "OAuth callback server listening");
        Ok(Self {
            port,
            redirect_uri,
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Bound port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Redirect URI to register and send in the authorization request
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Arm the listener for a new flow with its `state` value
    pub fn expect_state(&self, state: &str) {
        *self.shared.expected_state.lock() = Some(state.to_string());
        self.shared.outcome.send_replace(None);
    }

    /// Wait for the redirect to deliver a code
    pub async fn wait_for_code(&self, timeout: Duration) -> Result<String> {
        let mut rx = self.shared.outcome.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map_err(|_| Error::Timeout(format!("No authorization code received within {}s", timeout.as_secs())))?
            .map_err(|_| Error::Auth("Callback server closed".to_string()))?
            .clone();

        match outcome {
            Some(CallbackOutcome::Code(code)) => Ok(code),
            Some(CallbackOutcome::Rejected(reason)) => Err(Error::Auth(reason)),
            None => Err(Error::Auth("Callback server closed".to_string())),
        }
    }

    /// Report completion to processes polling `/wait-for-auth`
    pub fn mark_completed(&self) {
        self.shared.completed.send_replace(true);
    }

    /// Whether the flow has been marked complete
    #[must_use]
    pub fn is_completed(&self) -> bool {
        *self.shared.completed.borrow()
    }

    /// Stop serving and wait for the listener to close
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            debug!(port = self.port, "Callback server stopped");
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle the OAuth redirect
async fn handle_callback(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    debug!(has_code = params.code.is_some(), error = ?params.error, "Received OAuth callback");

    let expected = shared.expected_state.lock().clone();

    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_else(|| "Unknown error".to_string());
        shared
            .outcome
            .send_replace(Some(CallbackOutcome::Rejected(format!("OAuth error: {error} - {description}"))));
        return (StatusCode::BAD_REQUEST, Html(error_page(&error, &description)));
    }

    // State is checked before the code so a forged redirect cannot end the flow
    if expected.is_none() || params.state != expected {
        warn!("OAuth callback with unexpected state ignored");
        return (
            StatusCode::BAD_REQUEST,
            Html(error_page("state_mismatch", "Invalid state parameter")),
        );
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        shared
            .outcome
            .send_replace(Some(CallbackOutcome::Rejected("Missing authorization code".to_string())));
        return (
            StatusCode::BAD_REQUEST,
            Html(error_page("missing_code", "Authorization code not provided")),
        );
    };

    shared.outcome.send_replace(Some(CallbackOutcome::Code(code)));
    (StatusCode::OK, Html(success_page()))
}

/// `200` once authorization completed, `202` while pending
async fn handle_wait_for_auth(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<WaitParams>,
) -> impl IntoResponse {
    if *shared.completed.borrow() {
        return (StatusCode::OK, "Authentication completed");
    }
    if params.poll == Some(false) {
        return (StatusCode::ACCEPTED, "Authentication in progress");
    }

    let mut rx = shared.completed.subscribe();
    match tokio::time::timeout(LONG_POLL, rx.wait_for(|done| *done)).await {
        Ok(Ok(_)) => (StatusCode::OK, "Authentication completed"),
        _ => (StatusCode::ACCEPTED, "Authentication in progress"),
    }
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Successful</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #1f2933;
            color: white;
        }
        .container { text-align: center; padding: 2rem; }
        h1 { margin: 0 0 0.5rem 0; }
        p { margin: 0; opacity: 0.9; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Authorization Successful</h1>
        <p>You can close this window and return to your MCP client.</p>
    </div>
    <script>setTimeout(() => window.close(), 3000);</script>
</body>
</html>"#
        .to_string()
}

fn error_page(error: &str, description: &str) -> String {
    let error = html_escape(error);
    let description = html_escape(description);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Failed</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #7f1d1d;
            color: white;
        }}
        .container {{ text-align: center; padding: 2rem; max-width: 400px; }}
        .error-code {{ font-family: monospace; margin-top: 1rem; opacity: 0.7; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Authorization Failed</h1>
        <p>{description}</p>
        <p class="error-code">Error: {error}</p>
    </div>
</body>
</html>"#
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_params_deserialize() {
        let params: CallbackParams = serde_urlencoded::from_str("code=abc123&state=xyz789").unwrap();

        assert_eq!(params.code, Some("abc123".to_string()));
        assert_eq!(params.state, Some("xyz789".to_string()));
    }

    #[test]
    fn error_page_escapes_markup() {
        let page = error_page("<script>", "a & b");
        assert!(page.contains("&lt;script&gt;"));
        assert!(page.contains("a &amp; b"));
    }

    #[tokio::test]
    async fn delivers_code_for_matching_state() {
        let server = CallbackServer::bind("localhost", 0, "/oauth/callback").await.unwrap();
        server.expect_state("s1");
        assert_eq!(
            server.redirect_uri(),
            format!("http://localhost:{}/oauth/callback", server.port())
        );

        let url = format!("http://127.0.0.1:{}/oauth/callback?code=the-code&state=s1", server.port());
        let status = reqwest::get(&url).await.unwrap().status();
        assert_eq!(status, 200);

        let code = server.wait_for_code(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, "the-code");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn wrong_state_is_ignored() {
        let server = CallbackServer::bind("localhost", 0, "oauth/callback").await.unwrap();
        server.expect_state("good");

        let url = format!("http://127.0.0.1:{}/oauth/callback?code=x&state=evil", server.port());
        assert_eq!(reqwest::get(&url).await.unwrap().status(), 400);

        let err = server.wait_for_code(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn provider_error_ends_wait() {
        let server = CallbackServer::bind("localhost", 0, "/cb").await.unwrap();
        server.expect_state("s");

        let url = format!(
            "http://127.0.0.1:{}/cb?error=access_denied&error_description=nope&state=s",
            server.port()
        );
        reqwest::get(&url).await.unwrap();

        let err = server.wait_for_code(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("access_denied"));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn wait_for_auth_reports_progress() {
        let server = CallbackServer::bind("localhost", 0, "/oauth/callback").await.unwrap();
        let url = format!("http://127.0.0.1:{}{WAIT_FOR_AUTH_PATH}?poll=false", server.port());

        assert_eq!(reqwest::get(&url).await.unwrap().status(), 202);
        server.mark_completed();
        assert!(server.is_completed());
        assert_eq!(reqwest::get(&url).await.unwrap().status(), 200);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn long_poll_returns_on_completion() {
        let server = Arc::new(CallbackServer::bind("localhost", 0, "/oauth/callback").await.unwrap());
        let url = format!("http://127.0.0.1:{}{WAIT_FOR_AUTH_PATH}", server.port());

        let poller = tokio::spawn(async move { reqwest::get(&url).await.unwrap().status() });
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.mark_completed();

        assert_eq!(poller.await.unwrap(), 200);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_port() {
        let server = CallbackServer::bind("localhost", 0, "/oauth/callback").await.unwrap();
        let port = server.port();
        server.shutdown().await;
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
