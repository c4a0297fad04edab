//! The client runtime state machine.
//!
//! [`HmrRuntime::run`] owns the socket: it dials the server, falls back to
//! the direct target when the primary address never opens, decodes payloads
//! and hands them to [`HmrRuntime::handle_messages`]. When the connection is
//! lost it polls the server until it answers again and reloads the page.

use crate::config::ClientConfig;
use crate::context::{ClientState, HotCallback, HotContext};
use crate::error::Result;
use crate::host::{ClientHost, ElementId};
use crate::queue::{Apply, UpdateQueue};
use crate::transport::{Connection, SocketEvent, Transport};
use futures::future::{self, BoxFuture, Either, FutureExt};
use futures::StreamExt;
use hotwire_proto::{events, ClientMessage, HmrPayload, Update, UpdateKind, HMR_SUBPROTOCOL};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

/// How a socket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Clean,
    /// Closed before it ever opened.
    NeverOpened,
    Lost,
}

enum Tick {
    Event(Option<SocketEvent>),
    Heartbeat,
}

struct Inner<H> {
    host: H,
    config: ClientConfig,
    state: Arc<ClientState>,
    queue: UpdateQueue,
    /// Links being replaced by an in-flight stylesheet swap.
    superseded: Mutex<HashSet<ElementId>>,
    /// Latest sequence number per `(path, accepted_path)`.
    fences: Mutex<HashMap<(String, String), u64>>,
    next_seq: AtomicU64,
    first_update: AtomicBool,
}

/// One per page. Cheap to clone.
pub struct HmrRuntime<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for HmrRuntime<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ClientHost + 'static> HmrRuntime<H> {
    pub fn new(host: H, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                config,
                state: Arc::new(ClientState::default()),
                queue: UpdateQueue::new(),
                superseded: Mutex::new(HashSet::new()),
                fences: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                first_update: AtomicBool::new(true),
            }),
        }
    }

    pub fn host(&self) -> &H {
        &self.inner.host
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Hot context for one execution of the module at `owner`.
    pub fn create_hot_context(&self, owner: &str) -> HotContext {
        self.inner.state.hot_context(owner)
    }

    /// Client messages waiting for the socket to open.
    pub fn pending_messages(&self) -> usize {
        self.inner.state.pending_messages()
    }

    /// Accept registrations held for `owner`.
    pub fn callback_count(&self, owner: &str) -> usize {
        self.inner.state.callback_count(owner)
    }

    /// Connect and process payloads until the socket closes.
    ///
    /// Returns after a clean close, or after the page was reloaded because
    /// the server came back.
    ///
    /// # Errors
    /// Returns an error if the configured socket address is not a valid URL.
    pub async fn run<T: Transport + ?Sized>(&self, transport: &T) -> Result<()> {
        let config = &self.inner.config;
        let mut conn = open(transport, &config.socket_url()?).await;
        let mut direct = false;

        loop {
            match self.drive(conn, direct).await {
                Closed::Clean => return Ok(()),
                Closed::NeverOpened if !direct && !config.explicit_port => {
                    direct = true;
                    conn = open(transport, &config.direct_socket_url()?).await;
                }
                closed => {
                    if closed == Closed::NeverOpened && direct {
                        error!(
                            host_and_path = %config.host_and_path,
                            direct_target = %config.direct_target,
                            "failed to connect to websocket; check the hmr host and port settings"
                        );
                    }
                    self.inner
                        .state
                        .notify_listeners(events::WS_DISCONNECT, &Value::Null);
                    info!("server connection lost, polling for restart");
                    self.wait_for_successful_ping().await;
                    self.inner.host.reload();
                    return Ok(());
                }
            }
        }
    }

    async fn drive(&self, conn: Connection, direct: bool) -> Closed {
        let Connection {
            outgoing,
            mut incoming,
        } = conn;
        let state = &self.inner.state;
        let mut opened = false;
        let mut deferred = None;
        let mut heartbeat: Option<BoxFuture<'_, ()>> = None;

        loop {
            let tick = if let Some(event) = deferred.take() {
                Tick::Event(Some(event))
            } else {
                match heartbeat.as_mut() {
                    Some(timer) => match future::select(incoming.next(), timer).await {
                        Either::Left((event, _)) => Tick::Event(event),
                        Either::Right(_) => Tick::Heartbeat,
                    },
                    None => Tick::Event(incoming.next().await),
                }
            };

            match tick {
                Tick::Heartbeat => {
                    state.send_now(&ClientMessage::Ping);
                    heartbeat = Some(self.inner.host.sleep(self.inner.config.heartbeat_interval));
                }
                Tick::Event(Some(SocketEvent::Open)) => {
                    opened = true;
                    state.attach_socket(outgoing.clone());
                    if direct {
                        info!("direct websocket connection fallback; configure the hmr host to remove the previous connection error");
                    }
                    state.notify_listeners(events::WS_CONNECT, &Value::Null);
                }
                Tick::Event(Some(SocketEvent::Message(text))) => {
                    // Coalesce everything that already arrived.
                    let mut burst = vec![text];
                    while let Some(next) = incoming.next().now_or_never() {
                        match next {
                            Some(SocketEvent::Message(text)) => burst.push(text),
                            other => {
                                deferred = Some(other.unwrap_or(SocketEvent::Close { clean: false }));
                                break;
                            }
                        }
                    }

                    let payloads: Vec<HmrPayload> = burst
                        .iter()
                        .filter_map(|text| match HmrPayload::from_json(text) {
                            Ok(payload) => Some(payload),
                            Err(err) => {
                                warn!(error = %err, "ignoring malformed hmr payload");
                                None
                            }
                        })
                        .collect();
                    if heartbeat.is_none()
                        && payloads.iter().any(|p| matches!(p, HmrPayload::Connected))
                    {
                        heartbeat = Some(self.inner.host.sleep(self.inner.config.heartbeat_interval));
                    }
                    self.handle_messages(payloads).await;
                }
                Tick::Event(Some(SocketEvent::Close { clean })) => {
                    state.detach_socket();
                    return match (clean, opened) {
                        (true, _) => Closed::Clean,
                        (false, false) => Closed::NeverOpened,
                        (false, true) => Closed::Lost,
                    };
                }
                Tick::Event(None) => {
                    state.detach_socket();
                    return if opened { Closed::Lost } else { Closed::NeverOpened };
                }
            }
        }
    }

    /// Probe the server until it answers. Probing pauses while the page is
    /// hidden.
    async fn wait_for_successful_ping(&self) {
        let host = &self.inner.host;
        let url = self.inner.config.ping_url();
        let interval = self.inner.config.ping_interval;

        if host.ping(&url).await {
            return;
        }
        host.sleep(interval).await;
        loop {
            if host.is_document_hidden() {
                host.wait_until_visible().await;
                continue;
            }
            if host.ping(&url).await {
                return;
            }
            host.sleep(interval).await;
        }
    }

    /// Handle one payload.
    pub async fn handle_message(&self, payload: HmrPayload) {
        self.handle_messages([payload]).await;
    }

    /// Handle payloads that arrived together. Consecutive `update` payloads
    /// are applied as one batch.
    pub async fn handle_messages(&self, payloads: impl IntoIterator<Item = HmrPayload>) {
        for payload in payloads {
            if !matches!(payload, HmrPayload::Update { .. }) {
                self.inner.queue.flush().await;
            }
            self.process(payload);
        }
        self.inner.queue.flush().await;
    }

    fn process(&self, payload: HmrPayload) {
        let state = &self.inner.state;
        let host = &self.inner.host;

        match payload {
            HmrPayload::Connected => {
                debug!("connected");
                state.flush_messages();
            }
            HmrPayload::Update { ref updates } => {
                state.notify_listeners(events::BEFORE_UPDATE, &to_value(&payload));
                if self.inner.first_update.load(Ordering::SeqCst) && host.has_error_overlay() {
                    host.reload();
                    return;
                }
                host.clear_error_overlay();
                self.inner.first_update.store(false, Ordering::SeqCst);

                for update in updates {
                    match update.kind {
                        UpdateKind::Js => self.inner.queue.enqueue(self.fetch_update(update.clone())),
                        UpdateKind::Css => {
                            if let Some(swap) = self.begin_css_swap(update) {
                                self.inner.queue.enqueue(swap.map(|()| None));
                            }
                        }
                    }
                }
            }
            HmrPayload::FullReload { ref path } => {
                state.notify_listeners(events::BEFORE_FULL_RELOAD, &to_value(&payload));
                match path {
                    Some(path) if path.ends_with(".html") => {
                        if self.is_current_page(path) {
                            host.reload();
                        }
                    }
                    _ => host.reload(),
                }
            }
            HmrPayload::Prune { ref paths } => {
                state.notify_listeners(events::BEFORE_PRUNE, &to_value(&payload));
                for path in paths {
                    if let Some((prune, data)) = state.pruner(path) {
                        prune(data);
                    }
                }
            }
            HmrPayload::Custom { event, data } => state.notify_listeners(&event, &data),
            HmrPayload::Error { ref err } => {
                state.notify_listeners(events::ERROR, &to_value(&payload));
                if self.inner.config.overlay {
                    host.show_error_overlay(err);
                } else {
                    error!(message = %err.message, stack = %err.stack, "internal server error");
                }
            }
        }
    }

    /// Whether a reload scoped to the HTML file at `path` targets this page.
    fn is_current_page(&self, path: &str) -> bool {
        let page = self.inner.host.location_pathname();
        let payload_path = self.inner.config.module_url(path);
        page == payload_path
            || path == "/index.html"
            || (page.ends_with('/') && format!("{page}index.html") == payload_path)
    }

    /// Find the stylesheet link for `update` and mark it superseded. The
    /// returned future inserts the replacement and removes the old link once
    /// the replacement has loaded.
    fn begin_css_swap(&self, update: &Update) -> Option<BoxFuture<'static, ()>> {
        let search = update.path.as_str();
        let link = {
            let mut superseded = self.inner.superseded.lock();
            let link = self
                .inner
                .host
                .link_elements()
                .into_iter()
                .find(|el| !superseded.contains(&el.id) && clean_url(&el.href).contains(search))?;
            superseded.insert(link.id);
            link
        };

        let separator = if search.contains('?') { '&' } else { '?' };
        let href = format!(
            "{}{separator}t={}",
            self.inner.config.module_url(search),
            update.timestamp
        );
        let this = self.clone();
        let path = update.path.clone();
        Some(
            async move {
                let host = &this.inner.host;
                host.insert_link_after(link.id, &href).await;
                host.remove_element(link.id);
                this.inner.superseded.lock().remove(&link.id);
                debug!(path = %path, "css hot updated");
            }
            .boxed(),
        )
    }

    /// Dispose and re-import the accepted module of `update`. Yields the step
    /// that runs the accept callbacks, or `None` if the update is dropped.
    fn fetch_update(&self, update: Update) -> BoxFuture<'static, Option<Apply>> {
        let key = (update.path.clone(), update.accepted_path.clone());
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        self.inner.fences.lock().insert(key.clone(), seq);
        let this = self.clone();

        async move {
            let callbacks = this.inner.state.callbacks(&update.path)?;
            let is_self_update = update.is_self_update();
            let qualified: Vec<HotCallback> = callbacks
                .into_iter()
                .filter(|cb| cb.deps.contains(&update.accepted_path))
                .collect();

            let mut fetched = None;
            if is_self_update || !qualified.is_empty() {
                if let Some((dispose, data)) = this.inner.state.disposer(&update.accepted_path) {
                    dispose(data).await;
                }
                let url = this.import_url(&update);
                match this.inner.host.import_module(&url).await {
                    Ok(module) => fetched = Some(module),
                    Err(err) => {
                        warn!(
                            path = %update.accepted_path,
                            error = %err,
                            "failed to reload module; this could be due to syntax errors or importing non-existent modules"
                        );
                        return None;
                    }
                }
            }

            let apply: Apply = Box::new(move || {
                {
                    let mut fences = this.inner.fences.lock();
                    if fences.get(&key) != Some(&seq) {
                        debug!(path = %update.path, "dropping superseded update");
                        return;
                    }
                    fences.remove(&key);
                }
                for cb in &qualified {
                    let modules: Vec<Option<Value>> = cb
                        .deps
                        .iter()
                        .map(|dep| {
                            if *dep == update.accepted_path {
                                fetched.clone()
                            } else {
                                None
                            }
                        })
                        .collect();
                    (cb.callback)(&modules);
                }
                if is_self_update {
                    debug!(path = %update.path, "hot updated");
                } else {
                    debug!(path = %update.path, via = %update.accepted_path, "hot updated");
                }
            });
            Some(apply)
        }
        .boxed()
    }

    /// `<base><accepted path>?[import&]t=<timestamp>[&<query>]`
    fn import_url(&self, update: &Update) -> String {
        let (path, query) = match update.accepted_path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (update.accepted_path.as_str(), None),
        };
        let import = if update.explicit_import_required == Some(true) {
            "import&"
        } else {
            ""
        };
        let mut url = format!(
            "{}?{import}t={}",
            self.inner.config.module_url(path),
            update.timestamp
        );
        if let Some(query) = query {
            url.push('&');
            url.push_str(query);
        }
        url
    }
}

async fn open<T: Transport + ?Sized>(transport: &T, url: &Url) -> Connection {
    debug!(url = %url, "connecting");
    transport
        .connect(url, HMR_SUBPROTOCOL)
        .await
        .unwrap_or_else(|err| {
            warn!(url = %url, error = %err, "websocket connect failed");
            Connection::refused()
        })
}

fn to_value(payload: &HmrPayload) -> Value {
    serde_json::to_value(payload).unwrap_or_default()
}

fn clean_url(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}
