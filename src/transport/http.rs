//! Streamable HTTP transport
//!
//! Every client message is POSTed to a single endpoint. The server answers
//! with `202 Accepted`, a JSON body (one message or a batch), or an SSE
//! stream carrying the responses. Session ids handed out in
//! `Mcp-Session-Id` are echoed on later requests and released with DELETE
//! on close.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::sse::{event_stream, forward_messages};
use super::{EVENT_BUFFER, RemoteOptions, Transport, TransportEvent, status_error};
use crate::protocol::{InitializeParams, JsonRpcRequest};
use crate::{Error, Result};

const SESSION_HEADER: &str = "mcp-session-id";
const POST_ACCEPT: &str = "application/json, text/event-stream";

/// Streamable HTTP transport
pub struct StreamableHttpTransport {
    url: Url,
    options: RemoteOptions,
    session_id: RwLock<Option<String>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    /// Set once the server accepted a POST; later 404/405 are not a
    /// transport mismatch
    established: AtomicBool,
    listening: AtomicBool,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    /// Transport for the endpoint at `url`
    #[must_use]
    pub fn new(url: Url, options: RemoteOptions) -> Self {
        Self {
            url,
            options,
            session_id: RwLock::new(None),
            events: Mutex::new(None),
            established: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Current session id
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Check that the endpoint speaks Streamable HTTP and accepts our
    /// credentials by sending an `initialize` on a throwaway session.
    pub async fn probe(&self) -> Result<()> {
        let request = JsonRpcRequest::new(
            "bridge-probe",
            "initialize",
            Some(serde_json::to_value(InitializeParams::for_bridge(env!("CARGO_PKG_NAME")))?),
        );

        let response = self
            .options
            .http
            .post(self.url.clone())
            .headers(self.options.request_headers().await)
            .header(ACCEPT, POST_ACCEPT)
            .timeout(self.options.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Request failed: {e}")))?;

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED) {
            return Err(Error::UnsupportedTransport(status.as_u16()));
        }
        if !status.is_success() {
            return Err(status_error(&response));
        }

        if let Some(session) = session_header(response.headers()) {
            drop(response);
            self.terminate_session(&session).await;
        }
        debug!(url = %self.url, "Streamable HTTP probe succeeded");
        Ok(())
    }

    fn sender(&self) -> Result<mpsc::Sender<TransportEvent>> {
        self.events
            .lock()
            .clone()
            .ok_or_else(|| Error::Transport("Streamable HTTP transport is not started".to_string()))
    }

    async fn emit(&self, events: &mpsc::Sender<TransportEvent>, body: Value) {
        let messages = match body {
            Value::Array(batch) => batch,
            single => vec![single],
        };
        for message in messages {
            if events.send(TransportEvent::Message(message)).await.is_err() {
                return;
            }
        }
    }

    fn remember_session(&self, headers: &HeaderMap) -> bool {
        let Some(session) = session_header(headers) else {
            return false;
        };
        let mut current = self.session_id.write();
        if current.as_deref() == Some(session.as_str()) {
            return false;
        }
        info!(session_id = %session, "Stored session ID from response");
        *current = Some(session);
        true
    }

    /// Open the optional GET stream for server-initiated messages
    fn open_listen_stream(&self, events: mpsc::Sender<TransportEvent>) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let options = self.options.clone();
        let url = self.url.clone();
        let session = self.session_id();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut request = options
                .http
                .get(url)
                .headers(options.request_headers().await)
                .header(ACCEPT, "text/event-stream");
            if let Some(session) = session {
                request = request.header(SESSION_HEADER, session);
            }
            let response = tokio::select! {
                () = cancel.cancelled() => return,
                r = request.send() => r,
            };
            match response {
                Ok(r) if r.status() == StatusCode::METHOD_NOT_ALLOWED => {
                    debug!("Server does not offer a GET event stream");
                }
                Ok(r) if r.status().is_success() && is_event_stream(r.headers()) => {
                    forward_messages(event_stream(r), events, cancel, false).await;
                }
                Ok(r) => debug!(status = %r.status(), "GET event stream not available"),
                Err(e) => debug!(error = %e, "GET event stream failed"),
            }
        });
    }

    async fn terminate_session(&self, session: &str) {
        let result = self
            .options
            .http
            .delete(self.url.clone())
            .headers(self.options.request_headers().await)
            .header(SESSION_HEADER, session)
            .timeout(self.options.request_timeout)
            .send()
            .await;
        match result {
            Ok(r) if r.status().is_success() || r.status() == StatusCode::METHOD_NOT_ALLOWED => {
                debug!(session_id = %session, "Session terminated");
            }
            Ok(r) => debug!(status = %r.status(), "Session termination rejected"),
            Err(e) => debug!(error = %e, "Session termination failed"),
        }
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"))
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut slot = self.events.lock();
        if slot.is_some() {
            return Err(Error::Transport("Streamable HTTP transport already started".to_string()));
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        *slot = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: Value) -> Result<()> {
        let events = self.sender()?;

        let mut request = self
            .options
            .http
            .post(self.url.clone())
            .headers(self.options.request_headers().await)
            .header(ACCEPT, POST_ACCEPT)
            .timeout(self.options.request_timeout)
            .json(&message);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Request failed: {e}")))?;

        let status = response.status();
        if !self.established.load(Ordering::SeqCst)
            && matches!(status, StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED)
        {
            return Err(Error::UnsupportedTransport(status.as_u16()));
        }
        if status == StatusCode::NOT_FOUND && self.session_id.write().take().is_some() {
            return Err(Error::Transport("Session expired".to_string()));
        }
        if !status.is_success() {
            let err = status_error(&response);
            if !err.is_unauthorized() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Transport(format!("HTTP {status}: {body}")));
            }
            return Err(err);
        }

        self.established.store(true, Ordering::SeqCst);
        if self.remember_session(response.headers()) {
            self.open_listen_stream(events.clone());
        }

        if matches!(status, StatusCode::ACCEPTED | StatusCode::NO_CONTENT) {
            return Ok(());
        }

        if is_event_stream(response.headers()) {
            tokio::spawn(forward_messages(
                event_stream(response),
                events,
                self.cancel.child_token(),
                false,
            ));
            return Ok(());
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read response: {e}")))?;
        if body.trim().is_empty() {
            return Ok(());
        }
        let body: Value = serde_json::from_str(&body)
            .map_err(|e| Error::Protocol(format!("Failed to parse response: {e}")))?;
        self.emit(&events, body).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let session = self.session_id.write().take();
        if let Some(session) = session {
            self.terminate_session(&session).await;
        }
        let events = self.events.lock().take();
        if let Some(events) = events {
            let _ = events.send(TransportEvent::Closed).await;
        }
        Ok(())
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> StreamableHttpTransport {
        let options = RemoteOptions {
            http: reqwest::Client::new(),
            headers: HeaderMap::new(),
            tokens: None,
            request_timeout: Duration::from_secs(5),
        };
        StreamableHttpTransport::new(Url::parse(&format!("{}/mcp", server.uri())).unwrap(), options)
    }

    async fn next_message(events: &mut mpsc::Receiver<TransportEvent>) -> Value {
        match events.recv().await.unwrap() {
            TransportEvent::Message(v) => v,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_responses_and_session_echo() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("mcp-session-id", "s-1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "s-1")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(header("mcp-session-id", "s-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(&server);
        let mut events = transport.start().await.unwrap();

        transport
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .await
            .unwrap();
        assert_eq!(next_message(&mut events).await["id"], 1);
        assert_eq!(transport.session_id().as_deref(), Some("s-1"));

        transport
            .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .unwrap();

        transport.close().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Closed));
    }

    #[tokio::test]
    async fn sse_response_body_and_batches() {
        let server = MockServer::start().await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ok\":true}}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"jsonrpc": "2.0", "id": 3, "result": {}},
                {"jsonrpc": "2.0", "id": 4, "result": {}}
            ])))
            .mount(&server)
            .await;

        let transport = transport(&server);
        let mut events = transport.start().await.unwrap();

        transport.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})).await.unwrap();
        assert_eq!(next_message(&mut events).await["result"]["ok"], true);

        transport.send(json!([{"jsonrpc": "2.0", "id": 3, "method": "ping"}])).await.unwrap();
        assert_eq!(next_message(&mut events).await["id"], 3);
        assert_eq!(next_message(&mut events).await["id"], 4);
    }

    #[tokio::test]
    async fn not_found_before_handshake_is_unsupported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = transport(&server);
        let _events = transport.start().await.unwrap();
        let err = transport.send(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})).await;
        assert!(err.unwrap_err().is_unsupported_transport());
        assert!(transport.probe().await.unwrap_err().is_unsupported_transport());
    }

    #[tokio::test]
    async fn probe_reports_challenge_and_releases_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("www-authenticate", "Bearer resource_metadata=\"https://x/prm\""),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "probe")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": "bridge-probe", "result": {}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(header("mcp-session-id", "probe"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(&server);
        let err = transport.probe().await.unwrap_err();
        assert_eq!(err.challenge(), Some("Bearer resource_metadata=\"https://x/prm\""));

        transport.probe().await.unwrap();
        assert_eq!(transport.session_id(), None);
    }
}
