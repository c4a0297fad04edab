//! Server half of the HMR channel.
//!
//! Payloads fan out to every connected socket through a broadcast channel;
//! each client also owns a direct queue for payloads addressed to it alone.
//! The socket task (see `hotwire serve`) drains a [`ClientSubscription`] and
//! writes one JSON text frame per payload.
//!
//! Client → server traffic is `custom` events only, dispatched to listeners
//! registered with [`HmrChannel::on`].

use hotwire_proto::HmrPayload;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Broadcast buffer depth per client before it starts lagging.
const BROADCAST_CAPACITY: usize = 256;

/// Identity of one connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Handler for a client-originated custom event.
pub type CustomListener = Arc<dyn Fn(&Value, ClientId) + Send + Sync>;

struct Inner {
    broadcast: broadcast::Sender<HmrPayload>,
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<HmrPayload>>>,
    listeners: RwLock<HashMap<String, Vec<CustomListener>>>,
    /// Last error sent while nobody was connected.
    buffered_error: Mutex<Option<HmrPayload>>,
    next_id: AtomicU64,
}

/// Handle to the HMR channel. Cheap to clone.
#[derive(Clone)]
pub struct HmrChannel {
    inner: Arc<Inner>,
}

impl Default for HmrChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HmrChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BROADCAST_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                broadcast,
                clients: Mutex::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                buffered_error: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Send a payload to every connected client.
    ///
    /// An `error` sent while no client is connected is kept and delivered to
    /// the next client that connects.
    pub fn send(&self, payload: HmrPayload) {
        let clients = self.client_count();
        if clients == 0 {
            if matches!(payload, HmrPayload::Error { .. }) {
                *self.inner.buffered_error.lock() = Some(payload);
            }
            return;
        }
        debug!(kind = payload.kind(), clients, "hmr broadcast");
        // Receivers only go away after `disconnect`; a send error means the
        // last one disconnected in between.
        let _ = self.inner.broadcast.send(payload);
    }

    /// Send a payload to one client. Returns `false` if it is not connected.
    pub fn send_to(&self, client: ClientId, payload: HmrPayload) -> bool {
        self.inner
            .clients
            .lock()
            .get(&client)
            .is_some_and(|tx| tx.send(payload).is_ok())
    }

    /// Register a new client socket.
    #[must_use]
    pub fn connect(&self) -> ClientSubscription {
        let id = ClientId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(error) = self.inner.buffered_error.lock().take() {
            let _ = tx.send(error);
        }
        self.inner.clients.lock().insert(id, tx);
        debug!(client = %id, "hmr client connected");

        ClientSubscription {
            id,
            broadcast: self.inner.broadcast.subscribe(),
            direct: rx,
        }
    }

    /// Forget a client. Its subscription yields `None` afterwards.
    pub fn disconnect(&self, client: ClientId) {
        if self.inner.clients.lock().remove(&client).is_some() {
            debug!(client = %client, "hmr client disconnected");
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Listen for a custom event sent by clients.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&Value, ClientId) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Run the listeners of `event`. Returns whether any listener ran.
    pub fn dispatch(&self, event: &str, data: &Value, client: ClientId) -> bool {
        // Clone out so listeners may register further listeners.
        let listeners = self.inner.listeners.read().get(event).cloned();
        let Some(listeners) = listeners else {
            return false;
        };
        for listener in &listeners {
            listener(data, client);
        }
        !listeners.is_empty()
    }
}

/// Everything one socket task needs to receive.
pub struct ClientSubscription {
    pub id: ClientId,
    broadcast: broadcast::Receiver<HmrPayload>,
    direct: mpsc::UnboundedReceiver<HmrPayload>,
}

impl ClientSubscription {
    /// Next payload for this client. `None` once the client is disconnected
    /// or the channel is dropped.
    pub async fn recv(&mut self) -> Option<HmrPayload> {
        loop {
            tokio::select! {
                biased;
                direct = self.direct.recv() => return direct,
                shared = self.broadcast.recv() => match shared {
                    Ok(payload) => return Some(payload),
                    Err(RecvError::Lagged(skipped)) => {
                        // Missed updates leave the page in an unknown state.
                        warn!(client = %self.id, skipped, "hmr client lagged, forcing reload");
                        return Some(HmrPayload::FullReload { path: None });
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}
