//! Server-Sent Events: incremental decoding and the HTTP+SSE transport
//!
//! The HTTP+SSE transport opens a long-lived GET stream. The server first
//! sends an `endpoint` event naming the URL to POST messages to, then
//! delivers its own messages as `message` events on the stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{EVENT_BUFFER, RemoteOptions, Transport, TransportEvent, status_error};
use crate::{Error, Result};

/// One dispatched SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field; `None` means the default `message` type
    pub event: Option<String>,
    /// Joined `data:` lines
    pub data: String,
    /// `id:` field
    pub id: Option<String>,
}

impl SseEvent {
    /// True for events carrying JSON-RPC messages
    #[must_use]
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental SSE decoder; feed it chunks as they arrive.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    /// Feed a chunk, returning every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event,
            data,
            id: self.id.clone(),
        })
    }
}

/// Decode a response body as a stream of SSE events
pub(crate) fn event_stream(response: reqwest::Response) -> BoxStream<'static, Result<SseEvent>> {
    let state = (response.bytes_stream().boxed(), SseDecoder::default(), VecDeque::new());
    futures::stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
        loop {
            if let Some(event) = pending.pop_front() {
                return Some((Ok(event), (bytes, decoder, pending)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => pending.extend(decoder.feed(&chunk)),
                Some(Err(e)) => {
                    let err = Error::Transport(format!("Event stream failed: {e}"));
                    return Some((Err(err), (bytes, decoder, pending)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

/// Turn a `message` event into a transport event
pub(crate) fn message_event(event: &SseEvent) -> TransportEvent {
    match serde_json::from_str::<Value>(&event.data) {
        Ok(value) => TransportEvent::Message(value),
        Err(e) => TransportEvent::Error(Error::Protocol(format!("Invalid JSON in event stream: {e}"))),
    }
}

/// Forward message events from `stream` until it ends or `cancel` fires.
/// Sends `Closed` when `closes` is set.
pub(crate) async fn forward_messages(
    mut stream: BoxStream<'static, Result<SseEvent>>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    closes: bool,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) if event.is_message() => {
                if events.send(message_event(&event)).await.is_err() {
                    return;
                }
            }
            Some(Ok(event)) => debug!(event = ?event.event, "Ignoring SSE event"),
            Some(Err(e)) => {
                let _ = events.send(TransportEvent::Error(e)).await;
                break;
            }
            None => break,
        }
    }
    if closes {
        let _ = events.send(TransportEvent::Closed).await;
    }
}

/// Resolve the `endpoint` event against the stream URL; it must stay on the
/// same origin
fn resolve_endpoint(base: &Url, data: &str) -> Result<Url> {
    let endpoint = base
        .join(data.trim())
        .map_err(|e| Error::Transport(format!("Invalid endpoint event {data:?}: {e}")))?;
    if endpoint.origin() != base.origin() {
        return Err(Error::Transport(format!(
            "Endpoint {endpoint} is not on the same origin as {base}"
        )));
    }
    Ok(endpoint)
}

/// HTTP+SSE transport
pub struct SseTransport {
    url: Url,
    options: RemoteOptions,
    endpoint: RwLock<Option<Url>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl SseTransport {
    /// Transport for the event stream at `url`
    #[must_use]
    pub fn new(url: Url, options: RemoteOptions) -> Self {
        Self {
            url,
            options,
            endpoint: RwLock::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// The announced message endpoint, once the stream is open
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().clone()
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Transport("SSE transport already started".to_string()));
        }

        let response = self
            .options
            .http
            .get(self.url.clone())
            .headers(self.options.request_headers().await)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to connect to SSE endpoint: {e}")))?;

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED) {
            return Err(Error::UnsupportedTransport(status.as_u16()));
        }
        if !status.is_success() {
            return Err(status_error(&response));
        }
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        if !is_sse {
            return Err(Error::UnsupportedTransport(status.as_u16()));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        tokio::spawn(read_stream(
            event_stream(response),
            self.url.clone(),
            endpoint_tx,
            tx,
            self.cancel.clone(),
        ));

        let endpoint = match tokio::time::timeout(self.options.request_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => Err(Error::Transport(
                "SSE stream ended without an endpoint event".to_string(),
            )),
            Err(_) => Err(Error::Timeout("waiting for the SSE endpoint event".to_string())),
        };
        let endpoint = endpoint.inspect_err(|_| self.cancel.cancel())?;

        info!(endpoint = %endpoint, "SSE transport connected");
        *self.endpoint.write() = Some(endpoint);
        Ok(rx)
    }

    async fn send(&self, message: Value) -> Result<()> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| Error::Transport("SSE transport is not connected".to_string()))?;

        let response = self
            .options
            .http
            .post(endpoint)
            .headers(self.options.request_headers().await)
            .timeout(self.options.request_timeout)
            .json(&message)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("POST failed: {e}")))?;

        if !response.status().is_success() {
            let err = status_error(&response);
            if !err.is_unauthorized() {
                let body = response.text().await.unwrap_or_default();
                warn!(body = %body, "SSE message POST rejected");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wait for the endpoint event, then forward messages
async fn read_stream(
    mut stream: BoxStream<'static, Result<SseEvent>>,
    base: Url,
    endpoint_tx: oneshot::Sender<Result<Url>>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) if event.event.as_deref() == Some("endpoint") => {
                let _ = endpoint_tx.send(resolve_endpoint(&base, &event.data));
                break;
            }
            Some(Ok(event)) => debug!(event = ?event.event, "Event before endpoint announcement ignored"),
            Some(Err(e)) => {
                let _ = endpoint_tx.send(Err(e));
                return;
            }
            None => return,
        }
    }
    forward_messages(stream, events, cancel, true).await;
}
