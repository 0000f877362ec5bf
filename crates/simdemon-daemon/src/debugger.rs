//! JS debugger attachment over the Chrome DevTools Protocol
//!
//! Only the slice of CDP needed to follow the app is implemented: console
//! output, pause/resume notifications, and the `resume` / `stepOver` commands.
//!
//! ## Architecture
//!
//! ```text
//! CdpConnection ──cmd chan──▶ background task ──▶ WebSocket
//!                             background task ◀── WebSocket
//!                                   │
//!                                   └──▶ broadcast<DebuggerEvent>
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use simdemon_core::events::DebuggerEvent;
use simdemon_core::prelude::*;
use simdemon_core::LogLevel;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CMD_CHANNEL_CAPACITY: usize = 32;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Attaches debugger connections; events of every connection go to one channel
#[async_trait]
pub trait DebuggerConnector: Send + Sync {
    async fn attach(&self, url: &str) -> Result<Arc<dyn DebugConnection>>;

    fn subscribe(&self) -> broadcast::Receiver<DebuggerEvent>;
}

/// A live debugger connection
#[async_trait]
pub trait DebugConnection: Send + Sync {
    async fn resume(&self) -> Result<()>;

    async fn step_over(&self) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);
}

/// Map a CDP notification to a [`DebuggerEvent`]
pub fn parse_cdp_event(text: &str) -> Option<DebuggerEvent> {
    let message: Value = serde_json::from_str(text).ok()?;
    let method = message.get("method")?.as_str()?;
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    match method {
        "Debugger.paused" => Some(DebuggerEvent::Paused {
            reason: params
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("other")
                .to_string(),
        }),
        "Debugger.resumed" => Some(DebuggerEvent::Resumed),
        "Runtime.consoleAPICalled" => {
            let kind = params.get("type").and_then(Value::as_str).unwrap_or("log");
            let message = params
                .get("args")
                .and_then(Value::as_array)
                .map(|args| {
                    args.iter()
                        .map(format_remote_object)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            Some(DebuggerEvent::ConsoleLog {
                level: LogLevel::from_console_type(kind),
                message,
            })
        }
        _ => None,
    }
}

/// Render a CDP `RemoteObject` the way a console would
fn format_remote_object(object: &Value) -> String {
    match object.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => object
            .get("description")
            .and_then(Value::as_str)
            .or_else(|| object.get("type").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CDP Connector
// ─────────────────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum ClientCommand {
    Send { method: String, params: Value },
    Disconnect,
}

/// Connects to the JS runtime through the bundler's inspector proxy
pub struct CdpConnector {
    events: broadcast::Sender<DebuggerEvent>,
}

impl CdpConnector {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { events }
    }
}

impl Default for CdpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DebuggerConnector for CdpConnector {
    async fn attach(&self, url: &str) -> Result<Arc<dyn DebugConnection>> {
        let connection = CdpConnection::connect(url, self.events.clone()).await?;
        Ok(Arc::new(connection))
    }

    fn subscribe(&self) -> broadcast::Receiver<DebuggerEvent> {
        self.events.subscribe()
    }
}

/// One CDP WebSocket session
pub struct CdpConnection {
    cmd_tx: mpsc::Sender<ClientCommand>,
    connected: Arc<AtomicBool>,
}

impl CdpConnection {
    pub async fn connect(url: &str, events: broadcast::Sender<DebuggerEvent>) -> Result<Self> {
        info!("Attaching debugger at {}", url);
        let ws_stream = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| Error::debugger_attach(format!("timed out connecting to {url}")))?
            .map(|(stream, _response)| stream)
            .map_err(|e| Error::debugger_attach(format!("failed to connect to {url}: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        tokio::spawn(run_io_loop(ws_stream, cmd_rx, events, Arc::clone(&connected)));

        let connection = Self { cmd_tx, connected };
        connection.send("Runtime.enable", json!({})).await?;
        connection.send("Debugger.enable", json!({})).await?;
        Ok(connection)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn send(&self, method: &str, params: Value) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send {
                method: method.to_string(),
                params,
            })
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

#[async_trait]
impl DebugConnection for CdpConnection {
    async fn resume(&self) -> Result<()> {
        self.send("Debugger.resume", json!({})).await
    }

    async fn step_over(&self) -> Result<()> {
        self.send("Debugger.stepOver", json!({})).await
    }

    async fn disconnect(&self) {
        // The task may already be gone
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }
}

async fn run_io_loop(
    ws_stream: WsStream,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    events: broadcast::Sender<DebuggerEvent>,
    connected: Arc<AtomicBool>,
) {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(event) = parse_cdp_event(text.as_str()) {
                            let _ = events.send(event);
                        } else {
                            trace!("cdp: {}", text.as_str());
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("Debugger connection closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("Debugger WebSocket error: {}", err);
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send { method, params }) => {
                        next_id += 1;
                        let request = json!({ "id": next_id, "method": method, "params": params });
                        if let Err(err) = ws_sink.send(WsMessage::Text(request.to_string().into())).await {
                            warn!("Failed to send {}: {}", method, err);
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        send_close(&mut ws_sink).await;
                        break;
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    debug!("Debugger task exiting");
}

async fn send_close(ws_sink: &mut SplitSink<WsStream, WsMessage>) {
    let _ = ws_sink.send(WsMessage::Close(None)).await;
}
