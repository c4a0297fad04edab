//! Per-module hot contexts and the page-wide registry they write into.
//!
//! Every module execution asks the runtime for a [`HotContext`] bound to its
//! own path (the owner). Creating a context for an owner that already ran
//! drops the callbacks and event listeners the previous execution registered,
//! so repeated hot updates never stack duplicate handlers. Persisted
//! [`HotData`] is the one thing that survives.

use futures::channel::mpsc::UnboundedSender;
use futures::future::{BoxFuture, FutureExt};
use hotwire_proto::{events, ClientMessage, InvalidatePayload};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-module state that survives re-execution.
pub type HotData = Arc<Mutex<Map<String, Value>>>;

/// Receives one slot per declared dependency; only the slot of the module
/// that actually changed is filled.
pub type AcceptCallback = Arc<dyn Fn(&[Option<Value>]) + Send + Sync>;

pub type DisposeCallback = Arc<dyn Fn(HotData) -> BoxFuture<'static, ()> + Send + Sync>;

pub type PruneCallback = Arc<dyn Fn(HotData) + Send + Sync>;

pub type EventListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// What an `accept` registration covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptDeps {
    /// The owner module itself.
    SelfModule,
    One(String),
    Many(Vec<String>),
}

/// One `accept` registration.
#[derive(Clone)]
pub(crate) struct HotCallback {
    pub deps: Vec<String>,
    pub callback: AcceptCallback,
}

#[derive(Default)]
struct Registry {
    /// Owner path -> accept registrations of its latest execution.
    hot_modules: HashMap<String, Vec<HotCallback>>,
    dispose: HashMap<String, DisposeCallback>,
    prune: HashMap<String, PruneCallback>,
    data: HashMap<String, HotData>,
    /// Event name -> listeners, tagged so an owner can remove its own.
    listeners: HashMap<String, Vec<(u64, EventListener)>>,
    /// Owner path -> listeners its latest execution registered.
    owner_listeners: HashMap<String, Vec<(String, u64)>>,
    next_listener: u64,
}

#[derive(Default)]
struct Outbox {
    /// Set while the socket is open.
    socket: Option<UnboundedSender<String>>,
    buffer: Vec<String>,
}

impl Outbox {
    fn flush(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let mut pending = std::mem::take(&mut self.buffer).into_iter();
        while let Some(message) = pending.next() {
            if let Err(err) = socket.unbounded_send(message) {
                self.buffer.push(err.into_inner());
                self.buffer.extend(pending);
                self.socket = None;
                return;
            }
        }
    }
}

/// Client state shared by the runtime and every hot context.
#[derive(Default)]
pub(crate) struct ClientState {
    registry: Mutex<Registry>,
    outbox: Mutex<Outbox>,
}

impl ClientState {
    pub(crate) fn hot_context(self: &Arc<Self>, owner: &str) -> HotContext {
        let mut registry = self.registry.lock();
        registry.data.entry(owner.to_string()).or_default();
        if let Some(callbacks) = registry.hot_modules.get_mut(owner) {
            callbacks.clear();
        }
        if let Some(stale) = registry.owner_listeners.remove(owner) {
            for (event, id) in stale {
                if let Some(listeners) = registry.listeners.get_mut(&event) {
                    listeners.retain(|(listener, _)| *listener != id);
                }
            }
        }
        registry
            .owner_listeners
            .insert(owner.to_string(), Vec::new());

        HotContext {
            owner: owner.to_string(),
            state: Arc::clone(self),
        }
    }

    /// Accept registrations of `path`, or `None` if it never registered a
    /// hot context.
    pub(crate) fn callbacks(&self, path: &str) -> Option<Vec<HotCallback>> {
        self.registry.lock().hot_modules.get(path).cloned()
    }

    pub(crate) fn callback_count(&self, owner: &str) -> usize {
        self.registry.lock().hot_modules.get(owner).map_or(0, Vec::len)
    }

    pub(crate) fn disposer(&self, path: &str) -> Option<(DisposeCallback, HotData)> {
        let mut registry = self.registry.lock();
        let dispose = registry.dispose.get(path).cloned()?;
        Some((dispose, registry.data.entry(path.to_string()).or_default().clone()))
    }

    pub(crate) fn pruner(&self, path: &str) -> Option<(PruneCallback, HotData)> {
        let mut registry = self.registry.lock();
        let prune = registry.prune.get(path).cloned()?;
        Some((prune, registry.data.entry(path.to_string()).or_default().clone()))
    }

    pub(crate) fn listener_count(&self, event: &str) -> usize {
        self.registry.lock().listeners.get(event).map_or(0, Vec::len)
    }

    /// Run every listener of `event`.
    pub(crate) fn notify_listeners(&self, event: &str, data: &Value) {
        let listeners: Vec<EventListener> = match self.registry.lock().listeners.get(event) {
            Some(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(data);
        }
    }

    /// Queue a message and send everything queued if the socket is open.
    pub(crate) fn send_message(&self, message: &ClientMessage) {
        match message.to_json() {
            Ok(text) => {
                let mut outbox = self.outbox.lock();
                outbox.buffer.push(text);
                outbox.flush();
            }
            Err(err) => warn!(error = %err, "dropping unserializable client message"),
        }
    }

    /// Send a message only if the socket is open. Never buffers.
    pub(crate) fn send_now(&self, message: &ClientMessage) {
        let outbox = self.outbox.lock();
        if let (Some(socket), Ok(text)) = (outbox.socket.as_ref(), message.to_json()) {
            let _ = socket.unbounded_send(text);
        }
    }

    pub(crate) fn attach_socket(&self, socket: UnboundedSender<String>) {
        self.outbox.lock().socket = Some(socket);
    }

    pub(crate) fn detach_socket(&self) {
        self.outbox.lock().socket = None;
    }

    pub(crate) fn flush_messages(&self) {
        self.outbox.lock().flush();
    }

    pub(crate) fn pending_messages(&self) -> usize {
        self.outbox.lock().buffer.len()
    }
}

/// The `import.meta.hot` handle of one module execution.
#[derive(Clone)]
pub struct HotContext {
    owner: String,
    state: Arc<ClientState>,
}

impl HotContext {
    /// Path of the module this context belongs to.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// State persisted across executions of this module.
    #[must_use]
    pub fn data(&self) -> HotData {
        self.state
            .registry
            .lock()
            .data
            .entry(self.owner.clone())
            .or_default()
            .clone()
    }

    /// Register an accept callback.
    pub fn accept<F>(&self, deps: AcceptDeps, callback: F)
    where
        F: Fn(&[Option<Value>]) + Send + Sync + 'static,
    {
        let deps = match deps {
            AcceptDeps::SelfModule => vec![self.owner.clone()],
            AcceptDeps::One(dep) => vec![dep],
            AcceptDeps::Many(deps) => deps,
        };
        self.state
            .registry
            .lock()
            .hot_modules
            .entry(self.owner.clone())
            .or_default()
            .push(HotCallback {
                deps,
                callback: Arc::new(callback),
            });
    }

    /// Accept updates of this module. The callback gets the new namespace.
    pub fn accept_self<F>(&self, callback: F)
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.accept(AcceptDeps::SelfModule, move |modules| {
            callback(modules.first().and_then(Option::as_ref));
        });
    }

    pub fn accept_dep<F>(&self, dep: &str, callback: F)
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.accept(AcceptDeps::One(dep.to_string()), move |modules| {
            callback(modules.first().and_then(Option::as_ref));
        });
    }

    pub fn accept_deps<F>(&self, deps: &[&str], callback: F)
    where
        F: Fn(&[Option<Value>]) + Send + Sync + 'static,
    {
        let deps = deps.iter().map(ToString::to_string).collect();
        self.accept(AcceptDeps::Many(deps), callback);
    }

    /// Accept updates that only touch the listed exports.
    ///
    /// Whether an importer can skip the update is decided on the server; on
    /// the client this is a self-accept.
    pub fn accept_exports<F>(&self, _exports: &[&str], callback: F)
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.accept_self(callback);
    }

    /// Run before this module is re-imported. Receives [`HotContext::data`].
    pub fn dispose<F, Fut>(&self, callback: F)
    where
        F: Fn(HotData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: DisposeCallback = Arc::new(move |data| callback(data).boxed());
        self.state
            .registry
            .lock()
            .dispose
            .insert(self.owner.clone(), callback);
    }

    /// Run when the server reports this module as no longer imported.
    pub fn prune<F>(&self, callback: F)
    where
        F: Fn(HotData) + Send + Sync + 'static,
    {
        self.state
            .registry
            .lock()
            .prune
            .insert(self.owner.clone(), Arc::new(callback));
    }

    /// Declining updates is not supported; changes that reach a declining
    /// module propagate as if it had not been called.
    pub fn decline(&self) {}

    /// Ask the server to treat this module as changed and propagate from
    /// its importers.
    pub fn invalidate(&self, message: Option<&str>) {
        let payload = InvalidatePayload {
            path: self.owner.clone(),
            message: message.map(ToString::to_string),
        };
        let data = serde_json::to_value(&payload).unwrap_or_default();
        self.state.notify_listeners(events::INVALIDATE, &data);
        self.send(events::INVALIDATE, data);
        debug!(path = %self.owner, message = ?message, "invalidate");
    }

    /// Listen for a custom or lifecycle event.
    pub fn on<F>(&self, event: &str, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut registry = self.state.registry.lock();
        let id = registry.next_listener;
        registry.next_listener += 1;
        registry
            .listeners
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        registry
            .owner_listeners
            .entry(self.owner.clone())
            .or_default()
            .push((event.to_string(), id));
    }

    /// Send a custom event to the server. Queued until the socket is open.
    pub fn send(&self, event: &str, data: Value) {
        self.state.send_message(&ClientMessage::Custom {
            event: event.to_string(),
            data,
        });
    }
}
