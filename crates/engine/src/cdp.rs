//! Low-level DevTools protocol client over WebSocket.
//!
//! One client per debugger session against a page target. Commands are
//! matched to responses by an auto-incrementing id; events fan out to
//! subscribers. A watch channel flips to `true` when the socket goes away
//! (the view was destroyed or the browser exited) so the engine can clear
//! its attachment.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, warn};

use netwatch_core::{Error, Result};

use crate::headers::HeaderEntry;

const COMMAND_TIMEOUT_SECS: u64 = 30;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// A DevTools WebSocket client that can send commands and receive
/// responses and events.
pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by command id.
    pending: PendingMap,
    /// Auto-incrementing command id.
    next_id: AtomicU64,
    /// Event listeners (domain.event -> channels).
    event_listeners: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>,
    /// Flips to `true` once the socket is gone.
    closed_rx: watch::Receiver<bool>,
    /// Handle to the reader task so we can abort on drop.
    _reader_handle: tokio::task::JoinHandle<()>,
    /// Handle to the writer task.
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a page target's WebSocket debugger endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url).await.map_err(|e| {
            Error::Protocol(format!("Failed to connect to debugger endpoint {}: {}", ws_url, e))
        })?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();

        // Channel for outgoing messages
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let event_listeners: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let events_clone = event_listeners.clone();

        let (closed_tx, closed_rx) = watch::channel(false);

        // Writer task: owns the sink, forwards messages from the channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("Debugger WebSocket write error: {}", e);
                    break;
                }
            }
        });

        // Reader task: dispatches responses and events, signals close
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Ok(val) = serde_json::from_str::<Value>(&text) {
                            if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                                // This is a command response
                                let mut pending = pending_clone.lock().await;
                                if let Some(tx) = pending.remove(&id) {
                                    let _ = tx.send(val);
                                }
                            } else if let Some(method) = val.get("method").and_then(|v| v.as_str())
                            {
                                // This is an event
                                let listeners = events_clone.lock().await;
                                if let Some(senders) = listeners.get(method) {
                                    let params =
                                        val.get("params").cloned().unwrap_or(Value::Null);
                                    for tx in senders {
                                        let _ = tx.try_send(params.clone());
                                    }
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Debugger WebSocket closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!("Debugger WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            closed_rx,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Put a command on the outgoing channel and hand back its response
    /// slot. The command is queued when this returns, so consecutive calls
    /// keep their order on the wire.
    async fn enqueue(&self, method: &str, params: Value) -> Result<(u64, oneshot::Receiver<Value>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Protocol(format!(
                "Debugger connection closed while sending '{}'",
                method
            )));
        }

        Ok((id, rx))
    }

    fn unwrap_response(method: &str, response: Value) -> Result<Value> {
        if let Some(error) = response.get("error") {
            Err(Error::Protocol(format!("Debugger error from '{}': {}", method, error)))
        } else {
            Ok(response.get("result").cloned().unwrap_or(Value::Null))
        }
    }

    async fn wait(&self, method: &str, id: u64, rx: oneshot::Receiver<Value>) -> Result<Value> {
        let timeout = tokio::time::timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), rx);
        match timeout.await {
            Ok(Ok(response)) => Self::unwrap_response(method, response),
            Ok(Err(_)) => Err(Error::Protocol(format!(
                "Debugger response channel closed for '{}'",
                method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!(
                    "Debugger command '{}' timed out after {}s",
                    method, COMMAND_TIMEOUT_SECS
                )))
            }
        }
    }

    /// Send a command and wait for its response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let (id, rx) = self.enqueue(method, params).await?;
        self.wait(method, id, rx).await
    }

    /// Queue a command whose acknowledgment only matters for logging. The
    /// command is on the wire when this returns; the response is awaited
    /// in the background.
    async fn send_and_forget(&self, method: &'static str, params: Value) -> Result<()> {
        let (_, rx) = self.enqueue(method, params).await?;
        tokio::spawn(async move {
            if let Ok(Ok(response)) =
                tokio::time::timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), rx).await
            {
                if let Err(e) = Self::unwrap_response(method, response) {
                    debug!(error = %e, "Debugger command rejected");
                }
            }
        });
        Ok(())
    }

    /// Subscribe to a protocol event. Returns a receiver that will get the
    /// event params.
    pub async fn subscribe(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        let mut listeners = self.event_listeners.lock().await;
        listeners.entry(method.to_string()).or_default().push(tx);
        rx
    }

    /// Watch channel that flips to `true` when the socket is gone.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Enable request interception for both pause stages.
    pub async fn enable_interception(&self) -> Result<()> {
        self.send_command(
            "Fetch.enable",
            json!({
                "patterns": [
                    { "requestStage": "Request" },
                    { "requestStage": "Response" },
                ]
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn disable_interception(&self) -> Result<()> {
        self.send_command("Fetch.disable", json!({})).await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}

/// A fetched response body, as the protocol reports it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub body: String,
    pub base64_encoded: bool,
}

/// An in-flight `Fetch.getResponseBody` round-trip. The command is already
/// on the wire when this exists; resolving it never blocks the dispatch of
/// other events.
pub enum PendingBody {
    Wire {
        id: u64,
        rx: oneshot::Receiver<Value>,
        pending: PendingMap,
    },
    /// Pre-resolved, for tests.
    Ready(Option<ResponseBody>),
}

impl PendingBody {
    pub async fn resolve(self) -> Result<ResponseBody> {
        match self {
            PendingBody::Ready(Some(body)) => Ok(body),
            PendingBody::Ready(None) => {
                Err(Error::Protocol("Response body unavailable".to_string()))
            }
            PendingBody::Wire { id, rx, pending } => {
                let timeout = tokio::time::timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), rx);
                let response = match timeout.await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) => {
                        return Err(Error::Protocol(
                            "Debugger response channel closed for 'Fetch.getResponseBody'"
                                .to_string(),
                        ))
                    }
                    Err(_) => {
                        pending.lock().await.remove(&id);
                        return Err(Error::Timeout(format!(
                            "Debugger command 'Fetch.getResponseBody' timed out after {}s",
                            COMMAND_TIMEOUT_SECS
                        )));
                    }
                };
                let result = CdpClient::unwrap_response("Fetch.getResponseBody", response)?;
                Ok(ResponseBody {
                    body: result
                        .get("body")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    base64_encoded: result
                        .get("base64Encoded")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                })
            }
        }
    }
}

/// The command surface the traffic dispatcher drives. `continue` and
/// `fulfill` are fire-and-forget (the paused request must never hang on a
/// slow acknowledgment); the body fetch hands back a [`PendingBody`] whose
/// command is ordered ahead of any later continue.
#[async_trait]
pub trait FetchControl: Send + Sync {
    /// Let the paused network operation proceed unmodified.
    async fn continue_request(&self, request_id: &str) -> Result<()>;

    /// Satisfy the paused request locally, bypassing the network. `body`
    /// must already be base64-encoded.
    async fn fulfill_request(
        &self,
        request_id: &str,
        status: u16,
        headers: &[HeaderEntry],
        body_base64: &str,
    ) -> Result<()>;

    /// Start retrieving the body of a response-phase pause.
    async fn fetch_response_body(&self, request_id: &str) -> Result<PendingBody>;
}

#[async_trait]
impl FetchControl for CdpClient {
    async fn continue_request(&self, request_id: &str) -> Result<()> {
        self.send_and_forget("Fetch.continueRequest", json!({ "requestId": request_id }))
            .await
    }

    async fn fulfill_request(
        &self,
        request_id: &str,
        status: u16,
        headers: &[HeaderEntry],
        body_base64: &str,
    ) -> Result<()> {
        let headers: Vec<Value> = headers
            .iter()
            .map(|h| json!({ "name": h.name, "value": h.value }))
            .collect();
        self.send_and_forget(
            "Fetch.fulfillRequest",
            json!({
                "requestId": request_id,
                "responseCode": status,
                "responseHeaders": headers,
                "body": body_base64,
            }),
        )
        .await
    }

    async fn fetch_response_body(&self, request_id: &str) -> Result<PendingBody> {
        let (id, rx) = self
            .enqueue("Fetch.getResponseBody", json!({ "requestId": request_id }))
            .await?;
        Ok(PendingBody::Wire {
            id,
            rx,
            pending: self.pending.clone(),
        })
    }
}
