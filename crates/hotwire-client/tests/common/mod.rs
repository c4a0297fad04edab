//! In-memory page and socket used by the runtime tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use hotwire_client::{
    ClientConfig, ClientError, ClientHost, Connection, ElementId, LinkElement, SocketEvent,
    Transport,
};
use hotwire_proto::{ErrorPayload, HmrPayload, HMR_SUBPROTOCOL};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub fn config() -> ClientConfig {
    let mut config =
        ClientConfig::from_page_url(&Url::parse("http://localhost:5173/").unwrap()).unwrap();
    config.ping_interval = Duration::from_millis(1);
    config.heartbeat_interval = Duration::from_millis(5);
    config
}

/// Poll `cond` until it holds, failing the test after a second.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[derive(Default)]
pub struct PageState {
    pub links: Vec<LinkElement>,
    pub next_element: u64,
    pub reloads: usize,
    pub pathname: String,
    pub overlay: Option<ErrorPayload>,
    /// Answers of `is_document_hidden`, `false` once exhausted.
    pub hidden: VecDeque<bool>,
    pub visibility_waits: usize,
    /// Answers of `ping`, `true` once exhausted.
    pub ping_results: VecDeque<bool>,
    pub pings: usize,
    /// Imports whose URL contains one of these fail.
    pub failing: Vec<String>,
}

#[derive(Default)]
pub struct FakeHost {
    pub page: Mutex<PageState>,
    /// Shared effect log: imports, link inserts and removals.
    pub log: Arc<Mutex<Vec<String>>>,
    import_gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    link_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let host = Self::default();
        host.page.lock().pathname = "/".to_string();
        host
    }

    pub fn with_link(self, href: &str) -> Self {
        {
            let mut page = self.page.lock();
            page.next_element += 1;
            let id = ElementId(page.next_element);
            page.links.push(LinkElement {
                id,
                href: href.to_string(),
            });
        }
        self
    }

    /// Hold imports whose URL contains `needle` until the sender fires.
    pub fn gate_import(&self, needle: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.import_gates.lock().insert(needle.to_string(), rx);
        tx
    }

    /// Hold the next stylesheet load until the sender fires.
    pub fn gate_link_load(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.link_gate.lock() = Some(rx);
        tx
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn reloads(&self) -> usize {
        self.page.lock().reloads
    }

    pub fn hrefs(&self) -> Vec<String> {
        self.page.lock().links.iter().map(|l| l.href.clone()).collect()
    }
}

#[async_trait]
impl ClientHost for FakeHost {
    async fn import_module(&self, url: &str) -> hotwire_client::Result<Value> {
        self.log.lock().push(format!("import {url}"));
        let gate = {
            let mut gates = self.import_gates.lock();
            let key = gates.keys().find(|needle| url.contains(needle.as_str())).cloned();
            key.and_then(|key| gates.remove(&key))
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.page.lock().failing.iter().any(|f| url.contains(f.as_str())) {
            return Err(ClientError::import(url, "404 Not Found"));
        }
        Ok(json!({ "url": url }))
    }

    fn reload(&self) {
        self.page.lock().reloads += 1;
    }

    fn location_pathname(&self) -> String {
        self.page.lock().pathname.clone()
    }

    fn link_elements(&self) -> Vec<LinkElement> {
        self.page.lock().links.clone()
    }

    async fn insert_link_after(&self, existing: ElementId, href: &str) -> ElementId {
        let id = {
            let mut page = self.page.lock();
            page.next_element += 1;
            let id = ElementId(page.next_element);
            let at = page
                .links
                .iter()
                .position(|l| l.id == existing)
                .map_or(page.links.len(), |i| i + 1);
            page.links.insert(
                at,
                LinkElement {
                    id,
                    href: href.to_string(),
                },
            );
            id
        };
        self.log.lock().push(format!("insert {href}"));
        let gate = self.link_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        id
    }

    fn remove_element(&self, id: ElementId) {
        self.page.lock().links.retain(|l| l.id != id);
        self.log.lock().push(format!("remove {}", id.0));
    }

    fn is_document_hidden(&self) -> bool {
        self.page.lock().hidden.pop_front().unwrap_or(false)
    }

    async fn wait_until_visible(&self) {
        self.page.lock().visibility_waits += 1;
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn ping(&self, _url: &str) -> bool {
        let mut page = self.page.lock();
        page.pings += 1;
        page.ping_results.pop_front().unwrap_or(true)
    }

    fn show_error_overlay(&self, err: &ErrorPayload) {
        self.page.lock().overlay = Some(err.clone());
    }

    fn clear_error_overlay(&self) {
        self.page.lock().overlay = None;
    }

    fn has_error_overlay(&self) -> bool {
        self.page.lock().overlay.is_some()
    }
}

/// Server end of a fake socket.
pub struct Remote {
    pub events: mpsc::UnboundedSender<SocketEvent>,
    pub sent: mpsc::UnboundedReceiver<String>,
}

impl Remote {
    pub fn emit(&self, event: SocketEvent) {
        self.events.unbounded_send(event).unwrap();
    }

    pub fn push(&self, payload: &HmrPayload) {
        self.emit(SocketEvent::Message(payload.to_json().unwrap()));
    }
}

/// Hands out queued connections in order; refuses once the queue is empty.
#[derive(Default)]
pub struct FakeTransport {
    sockets: Mutex<VecDeque<Connection>>,
    pub dialed: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn push_socket(&self) -> Remote {
        let (outgoing, sent) = mpsc::unbounded();
        let (events, incoming) = mpsc::unbounded();
        self.sockets
            .lock()
            .push_back(Connection { outgoing, incoming });
        Remote { events, sent }
    }

    pub fn push_refused(&self) {
        self.sockets.lock().push_back(Connection::refused());
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, url: &Url, protocol: &str) -> hotwire_client::Result<Connection> {
        assert_eq!(protocol, HMR_SUBPROTOCOL);
        self.dialed.lock().push(url.to_string());
        Ok(self
            .sockets
            .lock()
            .pop_front()
            .unwrap_or_else(Connection::refused))
    }
}
