use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Output of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedId {
    pub id: String,
    pub meta: Option<serde_json::Value>,
}

impl ResolvedId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: None,
        }
    }
}

/// Maps an import URL to a canonical module id.
///
/// `Ok(None)` means "nothing claimed this URL"; the graph then uses the URL
/// itself as the id. Errors propagate to the caller of
/// [`ModuleGraph::ensure_entry_from_url`](super::ModuleGraph::ensure_entry_from_url).
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_id(&self, url: &str, importer: Option<&str>) -> Result<Option<ResolvedId>>;
}

/// Resolves root-relative URLs to absolute files under a project root.
///
/// This is the fallback used when no plugin pipeline is configured: `/src/a.js`
/// becomes `<root>/src/a.js`. Non-rooted specifiers are left unresolved.
#[derive(Debug, Clone)]
pub struct FsResolver {
    root: PathBuf,
}

impl FsResolver {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Resolver for FsResolver {
    async fn resolve_id(&self, url: &str, _importer: Option<&str>) -> Result<Option<ResolvedId>> {
        let path = crate::urls::clean_url(url);
        let query = &url[path.len()..];
        let Some(rel) = path.strip_prefix('/') else {
            return Ok(None);
        };
        if rel.starts_with('@') {
            return Ok(None);
        }
        let file = self.root.join(rel);
        Ok(Some(ResolvedId::new(format!("{}{query}", file.display()))))
    }
}
