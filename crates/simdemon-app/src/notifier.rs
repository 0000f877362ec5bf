//! Typed event hub between the running app, the orchestrator and observers
//!
//! Listeners register per [`EventKind`]. Events from the app arrive through the
//! [`AppTransport`] and are dispatched like local events; commands for the app
//! go straight to the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use simdemon_core::prelude::*;
use simdemon_core::{AppCommand, Event, EventKind, ProjectEvent};
use simdemon_daemon::AppTransport;

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ListenOptions {
    /// Remove the listener after its first event
    pub once: bool,
}

struct Entry {
    id: u64,
    once: bool,
    handler: Handler,
}

struct Registry {
    listeners: Mutex<HashMap<EventKind, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        let listeners = EventKind::ALL
            .iter()
            .map(|kind| (*kind, Vec::new()))
            .collect();
        Self {
            listeners: Mutex::new(listeners),
            next_id: AtomicU64::new(1),
        }
    }

    fn add(&self, kind: EventKind, handler: Handler, once: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(Entry { id, once, handler });
        id
    }

    fn remove(&self, kind: EventKind, id: u64) {
        if let Some(entries) = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&kind)
        {
            entries.retain(|entry| entry.id != id);
        }
    }

    fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        // Snapshot so handlers can add or remove listeners
        let handlers: Vec<Handler> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entries) = listeners.get_mut(&kind) else {
                return;
            };
            let handlers = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
            entries.retain(|entry| !entry.once);
            handlers
        };

        trace!("Dispatching {:?} to {} listeners", kind, handlers.len());
        for handler in handlers {
            handler(event);
        }
    }

    fn count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Handle to a registered listener
#[derive(Clone)]
pub struct Listener {
    kind: EventKind,
    id: u64,
    registry: Weak<Registry>,
}

impl Listener {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Unregister. Removing twice is harmless.
    pub fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

pub struct Notifier {
    registry: Arc<Registry>,
    transport: Arc<dyn AppTransport>,
    pump: JoinHandle<()>,
}

impl Notifier {
    /// Create a notifier and start forwarding app events to listeners
    pub fn new(transport: Arc<dyn AppTransport>) -> Self {
        let registry = Arc::new(Registry::new());
        let pump = tokio::spawn(Self::pump_app_events(
            transport.subscribe(),
            Arc::downgrade(&registry),
        ));
        Self {
            registry,
            transport,
            pump,
        }
    }

    async fn pump_app_events(
        mut events: broadcast::Receiver<simdemon_core::AppEvent>,
        registry: Weak<Registry>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    registry.dispatch(&Event::App(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} app events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn listen(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
        options: ListenOptions,
    ) -> Listener {
        let id = self.registry.add(kind, Arc::new(handler), options.once);
        Listener {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Next event of `kind`.
    ///
    /// The listener is registered before this returns, so events dispatched
    /// after the call are never missed.
    pub fn wait_for(&self, kind: EventKind) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.listen(
            kind,
            move |event| {
                if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(event.clone());
                }
            },
            ListenOptions { once: true },
        );
        rx
    }

    /// Dispatch an observer event to local listeners
    pub fn send(&self, event: ProjectEvent) {
        self.registry.dispatch(&Event::Project(event));
    }

    /// Dispatch any event to local listeners
    pub fn dispatch(&self, event: Event) {
        self.registry.dispatch(&event);
    }

    /// Deliver a command to the running app. Never fails.
    pub fn send_to_app(&self, command: AppCommand) {
        self.transport.send(command);
    }

    pub fn connected_to_app(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn instrumentation_port(&self) -> u16 {
        self.transport.port()
    }

    pub async fn ready(&self) -> Result<()> {
        self.transport.ready().await
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry.count(kind)
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
