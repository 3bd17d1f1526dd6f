//! Stdio transport (newline-delimited JSON)

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EVENT_BUFFER, Transport, TransportEvent};
use crate::{Error, Result};

/// One JSON-RPC message per line over a reader/writer pair
pub struct StdioTransport<R, W> {
    reader: parking_lot::Mutex<Option<R>>,
    writer: Mutex<W>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl StdioTransport<Stdin, Stdout> {
    /// Transport over this process's stdin/stdout
    #[must_use]
    pub fn process() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    /// Transport over an arbitrary reader/writer pair
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: parking_lot::Mutex::new(Some(reader)),
            writer: Mutex::new(writer),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| Error::Transport("stdio transport already started".to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_lines(reader, tx, self.cancel.clone()));
        Ok(rx)
    }

    async fn send(&self, message: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("stdio transport is closed".to_string()));
        }
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "stdio writer shutdown failed");
            }
        }
        Ok(())
    }
}

async fn read_lines<R>(reader: R, events: mpsc::Sender<TransportEvent>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let event = match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                Ok(value) => TransportEvent::Message(value),
                Err(e) => {
                    warn!(error = %e, "Discarding malformed line");
                    TransportEvent::Error(Error::Protocol(format!("Invalid JSON: {e}")))
                }
            },
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.into())).await;
                break;
            }
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
    let _ = events.send(TransportEvent::Closed).await;
}
