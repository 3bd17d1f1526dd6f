//! Forwarding between the local client and the remote server
//!
//! [`ProxyBridge`] relays messages in both directions until either side
//! closes. [`RequestClient`] drives a remote connection directly for the
//! one-shot `client` command.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    InitializeParams, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, response_id,
};
use crate::transport::{RemoteConnection, Transport, TransportEvent, TransportNegotiator};
use crate::{Error, Result};

/// Appended to the client name in `initialize` so servers can tell bridged
/// sessions apart
pub const CLIENT_NAME_SUFFIX: &str = " (via mcp-auth-bridge)";

/// JSON-RPC error code for failures forwarding to the remote server
const FORWARD_ERROR: i32 = -32000;

/// Append [`CLIENT_NAME_SUFFIX`] to `params.clientInfo.name` of an
/// `initialize` request. Returns whether the message was changed.
pub fn rewrite_client_info(message: &mut Value) -> bool {
    if message.get("method").and_then(Value::as_str) != Some("initialize") {
        return false;
    }
    let Some(name) = message.pointer_mut("/params/clientInfo/name") else {
        return false;
    };
    let Some(current) = name.as_str() else {
        return false;
    };
    if current.ends_with(CLIENT_NAME_SUFFIX) {
        return false;
    }
    *name = Value::String(format!("{current}{CLIENT_NAME_SUFFIX}"));
    true
}

fn request_id(message: &Value) -> Option<RequestId> {
    message.get("method")?;
    serde_json::from_value(message.get("id")?.clone()).ok()
}

/// Relays messages between a local and a remote transport
pub struct ProxyBridge {
    local: Arc<dyn Transport>,
    remote: RemoteConnection,
    negotiator: Option<Arc<TransportNegotiator>>,
}

impl ProxyBridge {
    /// Bridge `local` to an already negotiated remote connection
    #[must_use]
    pub fn new(local: Arc<dyn Transport>, remote: RemoteConnection) -> Self {
        Self {
            local,
            remote,
            negotiator: None,
        }
    }

    /// Re-run authorization through `negotiator` when the remote server
    /// rejects a forwarded message with 401
    #[must_use]
    pub fn with_reauthorization(mut self, negotiator: Arc<TransportNegotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Forward until either side closes or `shutdown` fires, then close both
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            local,
            remote,
            negotiator,
        } = self;
        let RemoteConnection {
            transport: remote,
            events: mut remote_events,
            variant,
        } = remote;

        let mut local_events = local.start().await?;
        info!(transport = %variant, "Proxy started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutting down proxy");
                    break;
                }
                event = local_events.recv() => match event {
                    Some(TransportEvent::Message(mut message)) => {
                        if rewrite_client_info(&mut message) {
                            debug!("Tagged client name in initialize request");
                        }
                        forward_to_remote(&*local, &*remote, negotiator.as_deref(), message).await;
                    }
                    Some(TransportEvent::Error(e)) => warn!(error = %e, "Local transport error"),
                    Some(TransportEvent::Closed) | None => {
                        info!("Local client disconnected");
                        break;
                    }
                },
                event = remote_events.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        if let Err(e) = local.send(message).await {
                            error!(error = %e, "Failed to deliver message to local client");
                            break;
                        }
                    }
                    Some(TransportEvent::Error(e)) => warn!(error = %e, "Remote transport error"),
                    Some(TransportEvent::Closed) | None => {
                        info!("Remote server closed the connection");
                        break;
                    }
                },
            }
        }

        if let Err(e) = remote.close().await {
            debug!(error = %e, "Closing remote transport failed");
        }
        if let Err(e) = local.close().await {
            debug!(error = %e, "Closing local transport failed");
        }
        Ok(())
    }
}

/// Send to the remote side, authorizing once on 401. Requests that cannot
/// be delivered are answered locally with an error.
async fn forward_to_remote(
    local: &dyn Transport,
    remote: &dyn Transport,
    negotiator: Option<&TransportNegotiator>,
    message: Value,
) {
    let id = request_id(&message);

    let mut result = remote.send(message.clone()).await;
    let challenge = match &result {
        Err(e) if e.is_unauthorized() => Some(e.challenge().map(str::to_string)),
        _ => None,
    };
    if let (Some(challenge), Some(negotiator)) = (challenge, negotiator) {
        info!("Remote server requires authorization again");
        result = match negotiator.authorize(challenge.as_deref()).await {
            Ok(()) => remote.send(message).await,
            Err(e) => Err(e),
        };
    }

    let Err(e) = result else {
        return;
    };
    warn!(error = %e, "Failed to forward message to remote server");
    if let Some(id) = id {
        let response = JsonRpcResponse::error(Some(id), FORWARD_ERROR, e.to_string());
        match serde_json::to_value(response) {
            Ok(value) => {
                if let Err(e) = local.send(value).await {
                    error!(error = %e, "Failed to report forwarding error to local client");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode error response"),
        }
    }
}

/// Issues requests over a remote connection and waits for their responses
pub struct RequestClient {
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    next_id: i64,
    timeout: Duration,
}

impl RequestClient {
    /// Client over a negotiated connection
    #[must_use]
    pub fn new(connection: RemoteConnection, timeout: Duration) -> Self {
        Self {
            transport: connection.transport,
            events: connection.events,
            next_id: 1,
            timeout,
        }
    }

    /// Send a request and wait for its result
    pub async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = RequestId::from(self.next_id);
        self.next_id += 1;

        let request = JsonRpcRequest::new(id.clone(), method, params);
        self.transport.send(serde_json::to_value(&request)?).await?;

        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(TransportEvent::Message(message)) => {
                        if response_id(&message).as_ref() == Some(&id) {
                            let response: JsonRpcResponse = serde_json::from_value(message)?;
                            return response.into_result();
                        }
                        debug!(message = %message, "Ignoring unrelated message");
                    }
                    Some(TransportEvent::Error(e)) => warn!(error = %e, "Transport error while waiting"),
                    Some(TransportEvent::Closed) | None => {
                        return Err(Error::Transport("Connection closed before a response arrived".to_string()));
                    }
                }
            }
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("waiting for {method} response")))?
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.transport.send(serde_json::to_value(&notification)?).await
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        self.transport.close().await
    }
}

/// Initialize, list tools and resources, close. Returns a summary document.
pub async fn run_client(connection: RemoteConnection, timeout: Duration) -> Result<Value> {
    let mut client = RequestClient::new(connection, timeout);

    let params = serde_json::to_value(InitializeParams::for_bridge(env!("CARGO_PKG_NAME")))?;
    let server = client.request("initialize", Some(params)).await?;
    client.notify("notifications/initialized", None).await?;

    let tools = client.request("tools/list", None).await?;
    let resources = match client.request("resources/list", None).await {
        Ok(resources) => resources,
        Err(e) => {
            warn!(error = %e, "Listing resources failed");
            json!({ "error": e.to_string() })
        }
    };

    if let Err(e) = client.close().await {
        debug!(error = %e, "Closing connection failed");
    }

    Ok(json!({
        "server": server,
        "tools": tools.get("tools").cloned().unwrap_or(Value::Array(Vec::new())),
        "resources": resources.get("resources").cloned().unwrap_or(resources),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::transport::{StdioTransport, TransportVariant};

    /// Answers requests on its own event channel
    struct ScriptedRemote {
        events: mpsc::Sender<TransportEvent>,
        sent: Mutex<Vec<Value>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Transport for ScriptedRemote {
        async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
            Err(Error::Transport("already started".to_string()))
        }

        async fn send(&self, message: Value) -> Result<()> {
            self.sent.lock().push(message.clone());
            let (Some(id), Some(method)) = (message.get("id"), message.get("method").and_then(Value::as_str))
            else {
                return Ok(());
            };
            let reply = match method {
                "initialize" => json!({"jsonrpc": "2.0", "id": id, "result": {"serverInfo": {"name": "remote"}}}),
                "tools/list" => json!({"jsonrpc": "2.0", "id": id, "result": {"tools": [{"name": "search"}]}}),
                _ => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}}),
            };
            let _ = self.events.send(TransportEvent::Message(reply)).await;
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scripted() -> (Arc<ScriptedRemote>, RemoteConnection) {
        let (tx, rx) = mpsc::channel(16);
        let remote = Arc::new(ScriptedRemote {
            events: tx,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let connection = RemoteConnection {
            transport: remote.clone(),
            events: rx,
            variant: TransportVariant::StreamableHttp,
        };
        (remote, connection)
    }

    #[test]
    fn rewrites_only_initialize_once() {
        let mut init = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"clientInfo": {"name": "editor", "version": "1"}}});
        assert!(rewrite_client_info(&mut init));
        assert_eq!(init["params"]["clientInfo"]["name"], "editor (via mcp-auth-bridge)");
        assert!(!rewrite_client_info(&mut init));

        let mut other = json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"});
        assert!(!rewrite_client_info(&mut other));
    }

    #[tokio::test]
    async fn proxy_forwards_and_closes_remote_on_local_eof() {
        let (remote, connection) = scripted();
        let (bridge_io, peer) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(bridge_io);
        let local: Arc<dyn Transport> = Arc::new(StdioTransport::new(reader, writer));

        let bridge = tokio::spawn(ProxyBridge::new(local, connection).run(CancellationToken::new()));

        let (peer_read, mut peer_write) = tokio::io::split(peer);
        peer_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{\"clientInfo\":{\"name\":\"editor\",\"version\":\"1\"}}}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(peer_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["result"]["serverInfo"]["name"], "remote");

        peer_write.shutdown().await.unwrap();
        drop(peer_write);
        bridge.await.unwrap().unwrap();

        assert!(remote.closed.load(Ordering::SeqCst));
        let sent = remote.sent.lock();
        assert_eq!(sent[0]["params"]["clientInfo"]["name"], "editor (via mcp-auth-bridge)");
    }

    #[tokio::test]
    async fn client_lists_tools_and_tolerates_missing_resources() {
        let (remote, connection) = scripted();
        let summary = run_client(connection, Duration::from_secs(5)).await.unwrap();

        assert_eq!(summary["server"]["serverInfo"]["name"], "remote");
        assert_eq!(summary["tools"], json!([{"name": "search"}]));
        assert!(summary["resources"]["error"].as_str().unwrap().contains("Method not found"));

        let sent = remote.sent.lock();
        let methods: Vec<&str> = sent.iter().filter_map(|m| m["method"].as_str()).collect();
        assert_eq!(
            methods,
            vec!["initialize", "notifications/initialized", "tools/list", "resources/list"]
        );
        assert!(remote.closed.load(Ordering::SeqCst));
    }
}
