//! `hotwire connect` command implementation.
//!
//! Runs the HMR client runtime outside a browser. Modules are fetched over
//! HTTP instead of imported, and a "page reload" reconnects the runtime.
//! Useful for watching what a dev server pushes, and for driving a server
//! from scripts.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use hotwire_client::{
    ClientConfig, ClientError, ClientHost, Connection, ElementId, HmrRuntime, LinkElement,
    SocketEvent, Transport,
};
use hotwire_proto::{events, ClientEnv, ErrorPayload, CLIENT_ENV_PATH, PING_ACCEPT};
use miette::{IntoDiagnostic, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

/// Connect action.
#[derive(Debug, Clone)]
pub struct ConnectAction {
    /// Page URL the client pretends to run on.
    pub url: String,
    /// Override the public base path.
    pub base: Option<String>,
    /// Dial this socket port and never fall back.
    pub hmr_port: Option<u16>,
    /// Modules to register as self-accepting.
    pub accept: Vec<String>,
}

/// Run the headless client until the server goes away for good.
pub async fn run(action: ConnectAction) -> Result<()> {
    let page = Url::parse(&action.url).into_diagnostic()?;
    let http = reqwest::Client::new();

    let mut config = match fetch_env(&http, &page).await {
        Ok(env) => ClientConfig::from_env(&env, &page).into_diagnostic()?,
        Err(e) => {
            debug!(error = %e, "no client env, deriving socket settings from page url");
            ClientConfig::from_page_url(&page).into_diagnostic()?
        }
    };
    if let Some(base) = &action.base {
        config = config.with_base(base);
    }
    if let Some(port) = action.hmr_port {
        config = config.with_port(port);
    }

    let host = NativeHost::new(http, page);
    let transport = TungsteniteTransport;

    loop {
        let runtime = HmrRuntime::new(host.clone(), config.clone());
        for module in &action.accept {
            let path = module.clone();
            runtime.create_hot_context(module).accept_self(move |namespace| {
                info!(path = %path, module = ?namespace, "hot updated");
            });
        }
        log_lifecycle(&runtime);

        runtime.run(&transport).await.into_diagnostic()?;

        if !host.take_reload() {
            return Ok(());
        }
        info!("reconnecting");
    }
}

async fn fetch_env(http: &reqwest::Client, page: &Url) -> Result<ClientEnv> {
    let url = page.join(CLIENT_ENV_PATH).into_diagnostic()?;
    http.get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .into_diagnostic()?
        .json::<ClientEnv>()
        .await
        .into_diagnostic()
}

fn log_lifecycle(runtime: &HmrRuntime<NativeHost>) {
    let hot = runtime.create_hot_context("/@hotwire/connect");
    hot.on(events::WS_CONNECT, |_| println!("  [hmr] connected"));
    hot.on(events::WS_DISCONNECT, |_| println!("  [hmr] server connection lost"));
    hot.on(events::BEFORE_UPDATE, |payload| {
        let paths = payload["updates"]
            .as_array()
            .map(|updates| {
                updates
                    .iter()
                    .filter_map(|u| u["acceptedPath"].as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        println!("  [hmr] update {paths}");
    });
    hot.on(events::BEFORE_FULL_RELOAD, |payload| {
        match payload["path"].as_str() {
            Some(path) => println!("  [hmr] full reload ({path})"),
            None => println!("  [hmr] full reload"),
        }
    });
    hot.on(events::BEFORE_PRUNE, |payload| {
        println!("  [hmr] prune {}", payload["paths"]);
    });
}

// ============================================================================
// Host
// ============================================================================

/// Page effects over HTTP. There is no document, so no stylesheet links.
#[derive(Clone)]
struct NativeHost {
    http: reqwest::Client,
    page: Url,
    reload_requested: Arc<AtomicBool>,
    overlay: Arc<Mutex<Option<ErrorPayload>>>,
}

impl NativeHost {
    fn new(http: reqwest::Client, page: Url) -> Self {
        Self {
            http,
            page,
            reload_requested: Arc::new(AtomicBool::new(false)),
            overlay: Arc::new(Mutex::new(None)),
        }
    }

    fn take_reload(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientHost for NativeHost {
    async fn import_module(&self, url: &str) -> hotwire_client::Result<Value> {
        let target = self.page.join(url)?;
        let body = self
            .http
            .get(target.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ClientError::import(url, e.to_string()))?
            .bytes()
            .await
            .map_err(|e| ClientError::import(url, e.to_string()))?;
        Ok(json!({ "url": target.as_str(), "bytes": body.len() }))
    }

    fn reload(&self) {
        info!(page = %self.page, "page reload");
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    fn location_pathname(&self) -> String {
        self.page.path().to_string()
    }

    fn link_elements(&self) -> Vec<LinkElement> {
        Vec::new()
    }

    async fn insert_link_after(&self, existing: ElementId, _href: &str) -> ElementId {
        existing
    }

    fn remove_element(&self, _id: ElementId) {}

    fn is_document_hidden(&self) -> bool {
        false
    }

    async fn wait_until_visible(&self) {}

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn ping(&self, url: &str) -> bool {
        self.http
            .get(url)
            .header(reqwest::header::ACCEPT, PING_ACCEPT)
            .send()
            .await
            .is_ok()
    }

    fn show_error_overlay(&self, err: &ErrorPayload) {
        error!(
            message = %err.message,
            id = ?err.id,
            plugin = ?err.plugin,
            "server error"
        );
        if let Some(frame) = &err.frame {
            eprintln!("{frame}");
        }
        *self.overlay.lock() = Some(err.clone());
    }

    fn clear_error_overlay(&self) {
        self.overlay.lock().take();
    }

    fn has_error_overlay(&self) -> bool {
        self.overlay.lock().is_some()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// WebSocket transport over `tokio-tungstenite`.
struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, url: &Url, protocol: &str) -> hotwire_client::Result<Connection> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::transport(e.to_string()))?;
        let protocol =
            HeaderValue::from_str(protocol).map_err(|e| ClientError::transport(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        let stream = match connect_async(request).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                warn!(url = %url, error = %e, "websocket connect failed");
                return Ok(Connection::refused());
            }
        };

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded::<String>();
        let (events, incoming) = mpsc::unbounded();
        let _ = events.unbounded_send(SocketEvent::Open);

        tokio::spawn(async move {
            let mut writing = true;
            let clean = loop {
                tokio::select! {
                    text = outgoing_rx.next(), if writing => match text {
                        Some(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break false;
                            }
                        }
                        None => {
                            // Runtime is gone; say goodbye and wait for the close frame.
                            writing = false;
                            let _ = sink.close().await;
                        }
                    },
                    msg = source.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let _ = events.unbounded_send(SocketEvent::Message(text.as_str().to_string()));
                        }
                        Some(Ok(Message::Close(_))) => break true,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "websocket read failed");
                            break false;
                        }
                        None => break false,
                    },
                }
            };
            let _ = events.unbounded_send(SocketEvent::Close { clean });
        });

        Ok(Connection { outgoing, incoming })
    }
}
