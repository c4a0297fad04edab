//! Configuration file discovery and parsing for `hotwire serve`.
//!
//! Loads `hotwire.config.json` from the project root. Every field is optional;
//! command-line flags override whatever the file sets.
//!
//! ## Format
//!
//! ```json
//! {
//!   "server": { "port": 5173, "host": "localhost" },
//!   "base": "/",
//!   "hmr": { "path": "/__hmr", "clientPort": 443, "overlay": true },
//!   "propagation": { "unanalyzed": "full-reload" }
//! }
//! ```

use crate::error::{Error, Result};
use hotwire_proto::ClientEnv;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file names in priority order.
const CONFIG_FILES: &[&str] = &["hotwire.config.json", ".hotwirerc.json"];

/// Default time the client waits for the socket handshake.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Configuration loaded from a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HmrConfig {
    pub server: ServerOptions,
    pub hmr: HmrOptions,
    pub propagation: PropagationOptions,
    /// Base public path.
    pub base: Option<String>,
}

impl HmrConfig {
    /// Public base path with a leading and trailing `/`.
    #[must_use]
    pub fn base(&self) -> String {
        let trimmed = self.base.as_deref().unwrap_or("/").trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }

    /// Path the HMR socket is served at.
    #[must_use]
    pub fn socket_path(&self) -> String {
        let path = self.hmr.path.as_deref().unwrap_or("").trim_start_matches('/');
        format!("{}{path}", self.base())
    }

    /// Settings published to clients of a server bound to `host:port`.
    #[must_use]
    pub fn client_env(&self, host: &str, port: u16) -> ClientEnv {
        let base = self.base();
        let direct_host = self.hmr.host.as_deref().unwrap_or(host);
        ClientEnv {
            protocol: self.hmr.protocol.clone(),
            hostname: self.hmr.host.clone(),
            port: self
                .hmr
                .has_explicit_port()
                .then(|| self.hmr.client_port(port)),
            path: self.socket_path(),
            direct_target: format!("{direct_host}:{port}{base}"),
            base,
            overlay: self.hmr.overlay,
            timeout_ms: self.hmr.timeout_ms,
        }
    }
}

/// HTTP server options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerOptions {
    pub port: Option<u16>,
    pub host: Option<String>,
}

/// HMR socket options, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HmrOptions {
    /// `ws` or `wss`. Derived from the page protocol when unset.
    pub protocol: Option<String>,
    pub host: Option<String>,
    /// Port the socket server listens on, when separate from the HTTP port.
    pub port: Option<u16>,
    /// Port the client connects to, e.g. behind a reverse proxy.
    pub client_port: Option<u16>,
    /// Socket path relative to `base`.
    pub path: Option<String>,
    pub timeout_ms: u64,
    /// Render server errors in an overlay.
    pub overlay: bool,
}

impl Default for HmrOptions {
    fn default() -> Self {
        Self {
            protocol: None,
            host: None,
            port: None,
            client_port: None,
            path: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            overlay: true,
        }
    }
}

impl HmrOptions {
    /// Port the client should dial, given the port the server listens on.
    #[must_use]
    pub fn client_port(&self, server_port: u16) -> u16 {
        self.client_port.or(self.port).unwrap_or(server_port)
    }

    /// Whether the client was given a port it must not fall back from.
    #[must_use]
    pub fn has_explicit_port(&self) -> bool {
        self.client_port.is_some() || self.port.is_some()
    }
}

/// Update propagation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PropagationOptions {
    pub unanalyzed: UnanalyzedPolicy,
}

/// What the propagator does when it reaches a module that has never been
/// analyzed by a transform pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnanalyzedPolicy {
    /// Stop walking this path; no boundary and no dead end.
    #[default]
    Halt,
    /// Treat the module as a dead end and reload the page.
    FullReload,
}

/// Find a config file in the given root directory.
#[must_use]
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

/// Load configuration from a config file in the given root directory.
///
/// If `config_path` is `Some`, use that specific file. Otherwise, auto-discover
/// and return `Ok(None)` when there is nothing to load.
pub fn load_config(
    root: &Path,
    config_path: Option<&Path>,
) -> Result<Option<(PathBuf, HmrConfig)>> {
    let path = match config_path {
        Some(p) => {
            let abs = if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            };
            if !abs.exists() {
                return Err(Error::ConfigNotFound(abs));
            }
            abs
        }
        None => match find_config_file(root) {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    let source = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
        path: path.clone(),
        source,
    })?;
    let config = serde_json::from_str(&source).map_err(|source| Error::ConfigParse {
        path: path.clone(),
        source,
    })?;
    Ok(Some((path, config)))
}
