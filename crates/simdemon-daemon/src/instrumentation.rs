//! Instrumentation channel to the running app
//!
//! The app connects to a local WebSocket server whose port is passed at launch.
//! Exactly one connection is current: a new connection supersedes the previous
//! one. Commands sent while no app is connected are queued (bounded, oldest
//! dropped first) and flushed to the next connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use simdemon_core::prelude::*;
use simdemon_core::{AppCommand, AppEvent};

/// Commands kept while no app is connected
pub const MAX_QUEUED_COMMANDS: usize = 32;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bidirectional message channel to the app
#[async_trait]
pub trait AppTransport: Send + Sync {
    /// Port the app should connect to
    fn port(&self) -> u16;

    /// Resolve once the transport accepts connections
    async fn ready(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Deliver a command to the current connection. Never fails.
    fn send(&self, command: AppCommand);

    /// Validated events from the app
    fn subscribe(&self) -> broadcast::Receiver<AppEvent>;
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

struct Shared {
    current: Mutex<Option<Connection>>,
    queue: Mutex<VecDeque<String>>,
    next_id: AtomicU64,
    events: broadcast::Sender<AppEvent>,
}

impl Shared {
    fn enqueue(&self, message: String) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() == MAX_QUEUED_COMMANDS {
            if let Some(dropped) = queue.pop_front() {
                warn!("App command queue full, dropping {}", dropped);
            }
        }
        queue.push_back(message);
    }

    /// Make `tx` the current connection and flush queued commands to it
    fn install(&self, id: u64, tx: mpsc::UnboundedSender<String>) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_some() {
            info!("New app connection supersedes the previous one");
        }

        let queued: Vec<String> = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        if !queued.is_empty() {
            debug!("Flushing {} queued app commands", queued.len());
        }
        for message in queued {
            let _ = tx.send(message);
        }

        // Dropping the old sender closes the superseded connection
        *current = Some(Connection { id, tx });
    }

    fn remove(&self, id: u64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|c| c.id == id) {
            *current = None;
            info!("App disconnected");
        }
    }
}

/// WebSocket server the app connects to
pub struct InstrumentationServer {
    port: u16,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl InstrumentationServer {
    /// Bind to a free local port and start accepting connections
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            current: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            events,
        });

        let accept_task = tokio::spawn(Self::accept_loop(listener, Arc::clone(&shared)));
        info!("Instrumentation server listening on port {}", port);

        Ok(Self {
            port,
            shared,
            accept_task,
        })
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("App connection from {}", addr);
                    tokio::spawn(Self::serve_connection(stream, Arc::clone(&shared)));
                }
                Err(e) => {
                    error!("Instrumentation accept failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("App WebSocket handshake failed: {}", e);
                return;
            }
        };

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        shared.install(id, tx);

        let (mut sink, mut source) = ws.split();
        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => match AppEvent::parse(text.as_str()) {
                            Ok(event) => {
                                trace!("app event: {:?}", event);
                                let _ = shared.events.send(event);
                            }
                            Err(reason) => warn!("Dropping app message: {}", reason),
                        },
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("App connection error: {}", e);
                            break;
                        }
                    }
                }

                outgoing = rx.recv() => {
                    match outgoing {
                        Some(message) => {
                            if let Err(e) = sink.send(WsMessage::Text(message.into())).await {
                                debug!("Failed to send to app: {}", e);
                                break;
                            }
                        }
                        // Superseded by a newer connection
                        None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }

        shared.remove(id);
    }
}

#[async_trait]
impl AppTransport for InstrumentationServer {
    fn port(&self) -> u16 {
        self.port
    }

    async fn ready(&self) -> Result<()> {
        if self.accept_task.is_finished() {
            return Err(Error::protocol("instrumentation server stopped"));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn send(&self, command: AppCommand) {
        let message = command.to_message();
        // Hold the connection lock while queueing so a concurrent connect
        // cannot flush the queue in between
        let current = self.shared.current.lock().unwrap_or_else(|e| e.into_inner());
        let undelivered = match current.as_ref() {
            Some(connection) => connection.tx.send(message).err().map(|e| e.0),
            None => Some(message),
        };

        if let Some(message) = undelivered {
            debug!("No app connected, queueing {}", command.type_name());
            self.shared.enqueue(message);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for InstrumentationServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use serde_json::json;
    use tokio_tungstenite::connect_async;

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn connect(port: u16) -> Client {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
        ws
    }

    async fn wait_connected(server: &InstrumentationServer, expected: bool) {
        for _ in 0..100 {
            if server.is_connected() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("connection state never became {expected}");
    }

    async fn next_json(ws: &mut Client) -> serde_json::Value {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_events_are_validated() {
        let server = InstrumentationServer::start().await.unwrap();
        server.ready().await.unwrap();
        let mut events = server.subscribe();

        let mut app = connect(server.port()).await;
        app.send(WsMessage::Text("{not json".to_string().into()))
            .await
            .unwrap();
        app.send(WsMessage::Text(r#"{"type":"bogus"}"#.to_string().into()))
            .await
            .unwrap();
        app.send(WsMessage::Text(r#"{"type":"appReady"}"#.to_string().into()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, AppEvent::AppReady);
    }

    #[tokio::test]
    async fn test_commands_queue_until_connected() {
        let server = InstrumentationServer::start().await.unwrap();
        assert!(!server.is_connected());

        server.send(AppCommand::OpenUrl {
            url: "myapp://home".into(),
        });
        server.send(AppCommand::IosDevMenu);

        let mut app = connect(server.port()).await;
        wait_connected(&server, true).await;

        assert_eq!(
            next_json(&mut app).await,
            json!({ "type": "openUrl", "data": { "url": "myapp://home" } })
        );
        assert_eq!(next_json(&mut app).await, json!({ "type": "iosDevMenu" }));

        server.send(AppCommand::OpenNavigation { id: "route".into() });
        assert_eq!(next_json(&mut app).await["type"], "openNavigation");
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let server = InstrumentationServer::start().await.unwrap();
        for i in 0..(MAX_QUEUED_COMMANDS + 2) {
            server.send(AppCommand::OpenNavigation { id: i.to_string() });
        }

        let queue = server.shared.queue.lock().unwrap();
        assert_eq!(queue.len(), MAX_QUEUED_COMMANDS);
        let oldest: serde_json::Value = serde_json::from_str(queue.front().unwrap()).unwrap();
        assert_eq!(oldest["data"]["id"], "2");
    }

    #[tokio::test]
    async fn test_new_connection_supersedes_previous() {
        let server = InstrumentationServer::start().await.unwrap();

        let mut first = connect(server.port()).await;
        wait_connected(&server, true).await;
        let mut second = connect(server.port()).await;

        // The first connection is closed by the server
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match first.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        server.send(AppCommand::IosDevMenu);
        assert_eq!(next_json(&mut second).await, json!({ "type": "iosDevMenu" }));
        assert!(server.is_connected());

        drop(second);
        wait_connected(&server, false).await;
    }
}
