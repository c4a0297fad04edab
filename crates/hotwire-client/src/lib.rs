#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Client runtime for hotwire HMR.
//!
//! The runtime receives payloads from the dev server, keeps the per-module
//! `accept`/`dispose`/`prune` registrations made through [`HotContext`], and
//! applies updates in batches: stylesheet swaps, module re-imports or a full
//! page reload.
//!
//! Page effects go through [`ClientHost`] and the socket through
//! [`Transport`], so the same state machine runs in a browser build, in the
//! `hotwire connect` headless client and in tests.

pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod queue;
pub mod runtime;
pub mod transport;

pub use config::ClientConfig;
pub use context::{AcceptDeps, HotContext, HotData};
pub use error::{ClientError, Result};
pub use host::{ClientHost, ElementId, LinkElement};
pub use queue::UpdateQueue;
pub use runtime::HmrRuntime;
pub use transport::{Connection, SocketEvent, Transport};
