#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Server half of hotwire's hot module replacement.
//!
//! A file change flows through three layers:
//!
//! ```text
//! watcher event
//!   → ModuleGraph: find modules backed by the file, drop cached transforms
//!   → propagate: walk importer edges to HMR boundaries or a dead end
//!   → HmrChannel: one `update` or `full-reload` payload to every client
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lexer;
pub mod propagate;
pub mod urls;

pub use channel::{ClientId, ClientSubscription, CustomListener, HmrChannel};
pub use config::{load_config, HmrConfig, HmrOptions, UnanalyzedPolicy};
pub use engine::{now_ms, HmrEngine, HmrOutcome};
pub use error::{Error, Result};
pub use graph::{
    FsResolver, ModuleGraph, ModuleInfo, ModuleNode, ModuleType, NodeId, ResolvedId, Resolver,
    TransformResult,
};
pub use lexer::{analyze_module, analyze_stylesheet, ImportRecord, ModuleAnalysis};
pub use propagate::{Propagation, PropagationBoundary, Propagator};
