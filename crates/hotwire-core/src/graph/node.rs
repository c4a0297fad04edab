use crate::urls;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Stable handle of a module in the graph's node table.
///
/// Ids are allocated in creation order and never reused, so ordering by id
/// is ordering by first resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a module is served as a script or as a stylesheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleType {
    Js,
    Css,
}

impl ModuleType {
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        if urls::is_css_request(url) {
            Self::Css
        } else {
            Self::Js
        }
    }
}

/// Cached output of the transform pipeline for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult {
    pub code: String,
    pub map: Option<String>,
    /// BLAKE3 digest of `code`, used as the HTTP etag.
    pub etag: String,
}

impl TransformResult {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        let etag = blake3::hash(code.as_bytes()).to_hex().to_string();
        Self {
            code,
            map: None,
            etag,
        }
    }
}

/// A node in the module graph.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    /// Public served URL path, e.g. `/src/App.tsx`.
    pub url: String,
    /// Resolved id. Differs from `url` for aliased or virtual modules.
    /// `None` for file-only entries.
    pub id: Option<String>,
    /// Backing file, `None` for virtual modules.
    pub file: Option<String>,
    pub module_type: ModuleType,
    /// Modules that import this module.
    pub importers: BTreeSet<NodeId>,
    /// Modules this module imports.
    pub imported_modules: BTreeSet<NodeId>,
    /// Dependencies whose updates this module absorbs.
    pub accepted_hmr_deps: BTreeSet<NodeId>,
    /// Export names accepted by `acceptExports`, if any.
    pub accepted_hmr_exports: Option<HashSet<String>>,
    /// Bindings imported from each dependency, keyed by the dependency id.
    pub imported_bindings: Option<HashMap<String, HashSet<String>>>,
    /// `None` until a transform pass has analyzed the module.
    pub is_self_accepting: Option<bool>,
    /// Resolver metadata, passed through untouched.
    pub meta: Option<serde_json::Value>,
    pub transform_result: Option<Arc<TransformResult>>,
    pub last_hmr_timestamp: u64,
    pub last_invalidation_timestamp: u64,
    /// Set once the client asked to invalidate the current HMR version.
    pub last_hmr_invalidation_received: bool,
}

impl ModuleNode {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            module_type: ModuleType::from_url(&url),
            url,
            id: None,
            file: None,
            importers: BTreeSet::new(),
            imported_modules: BTreeSet::new(),
            accepted_hmr_deps: BTreeSet::new(),
            accepted_hmr_exports: None,
            imported_bindings: None,
            is_self_accepting: None,
            meta: None,
            transform_result: None,
            last_hmr_timestamp: 0,
            last_invalidation_timestamp: 0,
            last_hmr_invalidation_received: false,
        }
    }

    #[must_use]
    pub fn is_css(&self) -> bool {
        self.module_type == ModuleType::Css
    }
}
