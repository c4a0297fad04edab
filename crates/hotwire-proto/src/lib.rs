#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Protocol types for hotwire HMR communication.
//!
//! This crate defines the payloads exchanged between the dev server and the
//! client runtime over the HMR WebSocket.
//!
//! ## Wire format
//! One JSON object per WebSocket text frame, discriminated by a `type` field.
//! The socket is opened with the [`HMR_SUBPROTOCOL`] subprotocol so HMR traffic
//! never mixes with other WebSocket users on the same port.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// WebSocket subprotocol identifier used by both ends of the HMR channel.
pub const HMR_SUBPROTOCOL: &str = "vite-hmr";

/// `Accept` header value of the liveness probe sent while polling for a restart.
pub const PING_ACCEPT: &str = "text/x-vite-ping";

/// Path the dev server publishes [`ClientEnv`] at.
pub const CLIENT_ENV_PATH: &str = "/@hotwire/env";

/// Well-known custom event names.
///
/// Lifecycle events are dispatched to client-side `on()` listeners; the
/// invalidate event additionally travels client → server.
pub mod events {
    pub const BEFORE_UPDATE: &str = "vite:beforeUpdate";
    pub const BEFORE_FULL_RELOAD: &str = "vite:beforeFullReload";
    pub const BEFORE_PRUNE: &str = "vite:beforePrune";
    pub const INVALIDATE: &str = "vite:invalidate";
    pub const ERROR: &str = "vite:error";
    pub const WS_CONNECT: &str = "vite:ws:connect";
    pub const WS_DISCONNECT: &str = "vite:ws:disconnect";
}

/// A message pushed from the server to one or all clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrPayload {
    /// Handshake acknowledgement.
    Connected,

    /// A batch of boundary updates that must apply as one step.
    Update { updates: Vec<Update> },

    /// Reload the page. When `path` names an HTML file, only pages served
    /// from that file reload.
    FullReload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// Modules that are no longer referenced by any importer.
    Prune { paths: Vec<String> },

    /// User-defined event.
    Custom {
        event: String,
        #[serde(default)]
        data: Value,
    },

    /// Server-side error to render or log.
    Error { err: ErrorPayload },
}

impl HmrPayload {
    /// Short name of the payload kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Update { .. } => "update",
            Self::FullReload { .. } => "full-reload",
            Self::Prune { .. } => "prune",
            Self::Custom { .. } => "custom",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to the JSON text sent over the socket.
    ///
    /// # Errors
    /// Returns an error if a custom `data` value cannot be serialized.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a payload received from the socket.
    ///
    /// # Errors
    /// Returns an error if the text is not a known payload.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Which kind of module an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    #[serde(rename = "js-update")]
    Js,
    #[serde(rename = "css-update")]
    Css,
}

/// One boundary update inside an `update` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Boundary module being reloaded.
    pub path: String,
    /// Module whose `accept()` registration captured the change.
    pub accepted_path: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_import_required: Option<bool>,
}

impl Update {
    /// Whether the boundary accepted its own change.
    #[must_use]
    pub fn is_self_update(&self) -> bool {
        self.path == self.accepted_path
    }
}

/// Error details carried by an `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub stack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<ErrorLocation>,
}

/// Source position of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// A message sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Keep-alive heartbeat. The server does not answer it.
    Ping,

    /// User-defined event dispatched to server-side listeners by name.
    Custom {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

impl ClientMessage {
    /// Serialize to the JSON text sent over the socket.
    ///
    /// # Errors
    /// Returns an error if a custom `data` value cannot be serialized.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a message received from a client.
    ///
    /// # Errors
    /// Returns an error if the text is not a known client message.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Payload of the `vite:invalidate` custom event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidatePayload {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Values a client needs before it can open the HMR socket.
///
/// Unset fields fall back to the page's own URL.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnv {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Explicitly configured socket port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Socket path, always starting with `/`.
    pub path: String,
    /// `host:port/base` of the server itself.
    pub direct_target: String,
    pub base: String,
    pub overlay: bool,
    /// Heartbeat interval in milliseconds.
    pub timeout_ms: u64,
}
