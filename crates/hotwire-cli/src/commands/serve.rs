//! `hotwire serve` command implementation.
//!
//! Serves a project directory and pushes HMR payloads to connected clients.
//!
//! ```text
//! GET /src/main.js                  → read file, record it in the module graph, serve
//! file change (notify)              → HmrEngine → update / full-reload / prune
//! WS  <base><hmr.path>              → `vite-hmr` subprotocol, one JSON payload per frame
//!                                     (also on `hmr.port` when that differs from the HTTP port)
//! GET /@hotwire/env                 → socket settings for clients
//! GET * (Accept: text/x-vite-ping)  → 204, answered while clients poll for a restart
//! ```

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hotwire_core::urls::{is_css_request, is_js_request};
use hotwire_core::{
    load_config, now_ms, FsResolver, HmrChannel, HmrConfig, HmrEngine, ModuleGraph,
};
use hotwire_proto::{
    ClientEnv, ClientMessage, ErrorPayload, HmrPayload, CLIENT_ENV_PATH, HMR_SUBPROTOCOL,
    PING_ACCEPT,
};
use miette::{IntoDiagnostic, Result};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PORT: u16 = 5173;
pub const DEFAULT_HOST: &str = "localhost";

/// Quiet period before a burst of file events is handed to the engine.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Serve action.
#[derive(Debug, Clone)]
pub struct ServeAction {
    /// Project root.
    pub root: PathBuf,
    /// Port to listen on.
    pub port: u16,
    /// Host to bind to.
    pub host: String,
    /// Explicit config file path (overrides auto-discovery).
    pub config: Option<PathBuf>,
}

/// Effective server settings (CLI flags override the config file).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    port: u16,
    host: String,
}

impl Settings {
    fn resolve(action: &ServeAction, config: &HmrConfig) -> Self {
        let port = if action.port != DEFAULT_PORT {
            action.port
        } else {
            config.server.port.unwrap_or(action.port)
        };
        let host = if action.host != DEFAULT_HOST {
            action.host.clone()
        } else {
            config
                .server
                .host
                .clone()
                .unwrap_or_else(|| action.host.clone())
        };
        Self { port, host }
    }
}

struct ServeState {
    engine: HmrEngine,
    root: PathBuf,
    /// Base path without the trailing `/`, empty for `/`.
    base_prefix: String,
    env: ClientEnv,
}

/// A file event after debouncing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

/// Run the dev server.
pub async fn run(action: ServeAction) -> Result<()> {
    let root = action.root.canonicalize().into_diagnostic()?;

    let config = match load_config(&root, action.config.as_deref()) {
        Ok(Some((path, config))) => {
            let rel_path = path.strip_prefix(&root).unwrap_or(&path);
            info!(path = %rel_path.display(), "loaded config");
            config
        }
        Ok(None) => HmrConfig::default(),
        Err(e) => {
            warn!(error = %e, "failed to load config, using defaults");
            HmrConfig::default()
        }
    };
    let settings = Settings::resolve(&action, &config);
    let socket_path = config.socket_path();

    let graph = Arc::new(ModuleGraph::new(Arc::new(FsResolver::new(root.clone()))));
    let engine = HmrEngine::new(graph, HmrChannel::new(), root.clone())
        .with_policy(config.propagation.unanalyzed);
    let state = Arc::new(ServeState {
        engine,
        root: root.clone(),
        base_prefix: config.base().trim_end_matches('/').to_string(),
        env: config.client_env(&settings.host, settings.port),
    });

    // Set up file watcher
    let (events_tx, mut events_rx) = mpsc::channel::<Vec<FileEvent>>(16);
    let watch_root = root.clone();
    std::thread::spawn(move || {
        if let Err(e) = watch_files(&watch_root, &events_tx) {
            error!(error = ?e, "file watcher stopped");
        }
    });

    let change_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(events) = events_rx.recv().await {
            handle_file_events(&change_state, events);
        }
    });

    let socket_app = socket_port(&config, settings.port)
        .map(|port| (port, socket_router(Arc::clone(&state), &socket_path)));
    let app = router(state, &socket_path);

    let host_ip = if settings.host == DEFAULT_HOST {
        "127.0.0.1"
    } else {
        settings.host.as_str()
    };
    let addr: SocketAddr = format!("{host_ip}:{}", settings.port)
        .parse()
        .into_diagnostic()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;

    if let Some((port, socket_app)) = socket_app {
        let addr: SocketAddr = format!("{host_ip}:{port}").parse().into_diagnostic()?;
        let socket_listener = tokio::net::TcpListener::bind(addr)
            .await
            .into_diagnostic()?;
        info!(port, "hmr socket server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(socket_listener, socket_app).await {
                error!(error = ?e, "hmr socket server stopped");
            }
        });
    }

    println!();
    println!(
        "  Dev server running at http://{}:{}{}",
        settings.host,
        settings.port,
        config.base()
    );
    println!("  HMR socket at {socket_path}");
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    axum::serve(listener, app).await.into_diagnostic()?;

    Ok(())
}

fn router(state: Arc<ServeState>, socket_path: &str) -> Router {
    let mut app = Router::new()
        .route(CLIENT_ENV_PATH, get(client_env))
        .route("/", get(socket_or_file));
    if socket_path != "/" {
        app = app.route(socket_path, get(socket_or_file));
    }
    app.route("/*path", get(serve_file))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Port of a dedicated socket server, when `hmr.port` differs from the HTTP port.
fn socket_port(config: &HmrConfig, http_port: u16) -> Option<u16> {
    config.hmr.port.filter(|&port| port != http_port)
}

/// Router of the dedicated socket server: the socket path and the ping probe.
fn socket_router(state: Arc<ServeState>, socket_path: &str) -> Router {
    let mut app = Router::new().route(socket_path, get(socket_or_file));
    if socket_path != "/" {
        app = app.route("/", get(socket_or_file));
    }
    app.with_state(state)
}

// ============================================================================
// Route Handlers
// ============================================================================

type AppState = Arc<ServeState>;

async fn client_env(State(state): State<AppState>) -> Json<ClientEnv> {
    Json(state.env.clone())
}

/// The socket path also serves files and answers pings; only upgrades that
/// offer the HMR subprotocol are taken over.
async fn socket_or_file(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    uri: Uri,
    State(state): State<AppState>,
) -> Response {
    if let Some(ws) = ws {
        if offers_hmr_protocol(&headers) {
            return ws
                .protocols([HMR_SUBPROTOCOL])
                .on_upgrade(move |socket| handle_hmr_socket(socket, state))
                .into_response();
        }
    }
    serve_path(&state, uri.path(), &headers).await
}

async fn serve_file(headers: HeaderMap, uri: Uri, State(state): State<AppState>) -> Response {
    serve_path(&state, uri.path(), &headers).await
}

/// Serve a file from the project root. JS and CSS are recorded in the module
/// graph on the way out.
async fn serve_path(state: &ServeState, path: &str, headers: &HeaderMap) -> Response {
    if is_ping(headers) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let path = path.strip_prefix(&state.base_prefix).unwrap_or(path);
    let url = if path.ends_with('/') {
        format!("{path}index.html")
    } else {
        path.to_string()
    };
    let Some(file) = resolve_file(&state.root, &url) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(code) = tokio::fs::read_to_string(&file).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let is_css = is_css_request(&url);
    let is_js = !is_css && is_js_request(&url);
    if is_css || is_js {
        if let Err(e) = state.engine.register_module(&url, &code).await {
            warn!(url = %url, error = %e, "failed to analyze module");
            state.engine.channel().send(HmrPayload::Error {
                err: ErrorPayload {
                    message: e.to_string(),
                    id: Some(url.clone()),
                    ..Default::default()
                },
            });
        }
    }

    let content_type = if is_css {
        "text/css"
    } else if is_js {
        "application/javascript"
    } else if url.ends_with(".html") {
        "text/html; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    };
    ([(header::CONTENT_TYPE, content_type)], code).into_response()
}

/// Map a URL path to a file under `root`. Rejects paths that leave the root.
fn resolve_file(root: &Path, url: &str) -> Option<PathBuf> {
    let relative = Path::new(url.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    let file = root.join(relative);
    file.is_file().then_some(file)
}

fn is_ping(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(PING_ACCEPT))
}

fn offers_hmr_protocol(headers: &HeaderMap) -> bool {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|p| p.trim() == HMR_SUBPROTOCOL))
}

// ============================================================================
// WebSocket HMR
// ============================================================================

/// Handle an HMR WebSocket connection.
async fn handle_hmr_socket(mut socket: WebSocket, state: AppState) {
    let channel = state.engine.channel().clone();
    let mut client = channel.connect();
    let id = client.id;

    let connected = HmrPayload::Connected.to_json().unwrap_or_default();
    if socket.send(Message::Text(connected)).await.is_err() {
        channel.disconnect(id);
        return;
    }

    // Bidirectional: forward server→client payloads, dispatch client→server events
    loop {
        tokio::select! {
            payload = client.recv() => {
                let Some(payload) = payload else { break };
                match payload.to_json() {
                    Ok(json) => {
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, kind = payload.kind(), "dropping unserializable payload"),
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                    Ok(message) => state.engine.handle_client_message(id, message),
                    Err(e) => debug!(client = %id, error = %e, "ignoring client message"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(client = %id, error = ?e, "hmr socket error");
                    break;
                }
            },
        }
    }

    channel.disconnect(id);
}

// ============================================================================
// File Watching
// ============================================================================

/// Check if a path should be ignored by the file watcher.
fn should_ignore(path: &Path) -> bool {
    let path_str = path.to_string_lossy();

    if path_str.contains("/node_modules/")
        || path_str.contains("/target/")
        || path_str.contains("/.git/")
        || path_str.contains("/dist/")
    {
        return true;
    }

    if let Some(name) = path.file_name() {
        if name.to_string_lossy().starts_with('.') {
            return true;
        }
    }

    false
}

fn is_watched(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    matches!(ext, "js" | "mjs" | "jsx" | "ts" | "tsx" | "css" | "html") && !should_ignore(path)
}

/// Watch the project root, handing debounced batches to `events_tx`.
fn watch_files(root: &Path, events_tx: &mpsc::Sender<Vec<FileEvent>>) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();

    let mut watcher = RecommendedWatcher::new(tx, Config::default()).into_diagnostic()?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .into_diagnostic()?;

    // path -> removed
    let mut pending: HashMap<PathBuf, bool> = HashMap::new();

    loop {
        match rx.recv_timeout(DEBOUNCE) {
            Ok(Ok(event)) => {
                let removed = matches!(event.kind, EventKind::Remove(_));
                for path in event.paths {
                    if is_watched(&path) {
                        let removed = removed || !path.exists();
                        pending.insert(path, removed);
                    }
                }
            }
            Ok(Err(e)) => warn!(error = %e, "watch error"),
            Err(RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let batch = pending
                    .drain()
                    .map(|(path, removed)| {
                        if removed {
                            FileEvent::Removed(path)
                        } else {
                            FileEvent::Changed(path)
                        }
                    })
                    .collect();
                if events_tx.blocking_send(batch).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

/// Feed a debounced batch of file events to the HMR engine.
fn handle_file_events(state: &ServeState, events: Vec<FileEvent>) {
    let timestamp = now_ms();
    for event in events {
        let (path, removed) = match &event {
            FileEvent::Changed(path) => (path, false),
            FileEvent::Removed(path) => (path, true),
        };
        let file = path.display().to_string();
        let shown = path.strip_prefix(&state.root).unwrap_or(path).display();
        let outcome = if removed {
            info!(file = %shown, "file removed");
            state.engine.handle_file_delete(&file, timestamp)
        } else {
            info!(file = %shown, "file changed");
            state.engine.handle_file_change(&file, timestamp)
        };
        debug!(file = %shown, outcome = ?outcome, "hmr outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn action(port: u16, host: &str) -> ServeAction {
        ServeAction {
            root: PathBuf::from("."),
            port,
            host: host.to_string(),
            config: None,
        }
    }

    #[test]
    fn test_cli_flags_win_over_config() {
        let mut config = HmrConfig::default();
        config.server.port = Some(4000);
        config.server.host = Some("0.0.0.0".to_string());

        let defaults = Settings::resolve(&action(DEFAULT_PORT, DEFAULT_HOST), &config);
        assert_eq!(defaults.port, 4000);
        assert_eq!(defaults.host, "0.0.0.0");

        let explicit = Settings::resolve(&action(8080, "127.0.0.1"), &config);
        assert_eq!(explicit.port, 8080);
        assert_eq!(explicit.host, "127.0.0.1");
    }

    #[test]
    fn test_socket_port_only_when_separate() {
        let mut config = HmrConfig::default();
        assert_eq!(socket_port(&config, 5173), None);
        config.hmr.port = Some(5173);
        assert_eq!(socket_port(&config, 5173), None);
        config.hmr.port = Some(24678);
        assert_eq!(socket_port(&config, 5173), Some(24678));
    }

    #[test]
    fn test_should_ignore() {
        assert!(should_ignore(Path::new("/p/node_modules/x/index.js")));
        assert!(should_ignore(Path::new("/p/.git/HEAD")));
        assert!(should_ignore(Path::new("/p/src/.main.js.swp")));
        assert!(!should_ignore(Path::new("/p/src/main.js")));
        assert!(is_watched(Path::new("/p/index.html")));
        assert!(!is_watched(Path::new("/p/README.md")));
    }

    #[test]
    fn test_resolve_file_stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.js"), "").unwrap();
        assert_eq!(
            resolve_file(dir.path(), "/main.js"),
            Some(dir.path().join("main.js"))
        );
        assert_eq!(resolve_file(dir.path(), "/../main.js"), None);
        assert_eq!(resolve_file(dir.path(), "/missing.js"), None);
    }

    #[test]
    fn test_protocol_and_ping_headers() {
        let mut headers = HeaderMap::new();
        assert!(!offers_hmr_protocol(&headers));
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("graphql-ws, vite-hmr"),
        );
        assert!(offers_hmr_protocol(&headers));

        assert!(!is_ping(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static(PING_ACCEPT));
        assert!(is_ping(&headers));
    }
}
