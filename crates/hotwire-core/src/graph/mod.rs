//! Module graph for HMR boundary detection.
//!
//! Nodes live in a flat table keyed by [`NodeId`]; edges are id sets, so the
//! importer/imported cycles of a real application never become ownership
//! cycles. Three indexes point into the table:
//!
//! - served URL → node (several URLs may alias one node)
//! - resolved id → node (unique)
//! - file → nodes (one file can back several query variants)
//!
//! Nodes are created lazily by [`ModuleGraph::ensure_entry_from_url`] and only
//! removed through [`ModuleGraph::on_file_delete`].

mod node;
mod resolver;

pub use node::{ModuleNode, ModuleType, NodeId, TransformResult};
pub use resolver::{FsResolver, ResolvedId, Resolver};

use crate::error::Result;
use crate::urls::{self, clean_url, strip_volatile_query, FS_PREFIX};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Analysis output of one transform pass, applied by
/// [`ModuleGraph::update_module_info`].
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub imported: BTreeSet<NodeId>,
    pub imported_bindings: Option<HashMap<String, HashSet<String>>>,
    pub accepted: BTreeSet<NodeId>,
    pub accepted_exports: Option<HashSet<String>>,
    pub is_self_accepting: bool,
}

/// Result of a successful `vite:invalidate` claim.
#[derive(Debug, Clone)]
pub struct InvalidationClaim {
    pub node: NodeId,
    pub importers: Vec<NodeId>,
    pub timestamp: u64,
    pub file: Option<String>,
}

/// The node table and its indexes.
#[derive(Debug, Default)]
pub struct ModuleTable {
    nodes: HashMap<NodeId, ModuleNode>,
    url_to_module: HashMap<String, NodeId>,
    id_to_module: HashMap<String, NodeId>,
    file_to_modules: HashMap<String, BTreeSet<NodeId>>,
    next_id: u32,
}

impl ModuleTable {
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&ModuleNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ModuleNode)> {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    fn insert(&mut self, node: ModuleNode, register_url: bool) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        if register_url {
            self.url_to_module.insert(node.url.clone(), id);
        }
        if let Some(resolved) = &node.id {
            self.id_to_module.insert(resolved.clone(), id);
        }
        if let Some(file) = &node.file {
            self.file_to_modules
                .entry(file.clone())
                .or_default()
                .insert(id);
        }
        self.nodes.insert(id, node);
        id
    }

    /// Drop cached output of `node` and of every importer that does not
    /// accept it, transitively. `seen` guards against cycles.
    fn invalidate(
        &mut self,
        node: NodeId,
        seen: &mut HashSet<NodeId>,
        timestamp: u64,
        is_hmr: bool,
    ) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(module) = self.nodes.get_mut(&current) else {
                continue;
            };

            if is_hmr {
                module.last_hmr_timestamp = timestamp;
                module.last_hmr_invalidation_received = false;
            } else {
                module.last_invalidation_timestamp = timestamp;
            }
            module.transform_result = None;

            let importers: Vec<NodeId> = module.importers.iter().copied().collect();
            for importer in importers {
                let accepts = self
                    .nodes
                    .get(&importer)
                    .is_some_and(|m| m.accepted_hmr_deps.contains(&current));
                if !accepts {
                    stack.push(importer);
                }
            }
        }
    }

    fn remove(&mut self, id: NodeId) -> Option<ModuleNode> {
        let node = self.nodes.remove(&id)?;

        for dep in &node.imported_modules {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.importers.remove(&id);
            }
        }
        for importer in &node.importers {
            if let Some(importer_node) = self.nodes.get_mut(importer) {
                importer_node.imported_modules.remove(&id);
                importer_node.accepted_hmr_deps.remove(&id);
            }
        }

        self.url_to_module.retain(|_, v| *v != id);
        if let Some(resolved) = &node.id {
            self.id_to_module.remove(resolved);
        }
        if let Some(file) = &node.file {
            if let Some(set) = self.file_to_modules.get_mut(file) {
                set.remove(&id);
                if set.is_empty() {
                    self.file_to_modules.remove(file);
                }
            }
        }
        Some(node)
    }
}

/// The HMR module graph.
pub struct ModuleGraph {
    table: RwLock<ModuleTable>,
    /// URL without volatile query → node, shared by concurrent resolutions.
    unresolved: Mutex<HashMap<String, Arc<OnceCell<NodeId>>>>,
    resolver: Arc<dyn Resolver>,
}

impl ModuleGraph {
    /// Create an empty graph backed by `resolver`.
    #[must_use]
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            table: RwLock::new(ModuleTable::default()),
            unresolved: Mutex::new(HashMap::new()),
            resolver,
        }
    }

    /// Read access to the node table.
    ///
    /// The propagator runs under this guard; do not hold it across an await.
    pub fn table(&self) -> RwLockReadGuard<'_, ModuleTable> {
        self.table.read()
    }

    /// Snapshot of a node.
    #[must_use]
    pub fn module(&self, id: NodeId) -> Option<ModuleNode> {
        self.table.read().get(id).cloned()
    }

    #[must_use]
    pub fn url_of(&self, id: NodeId) -> Option<String> {
        self.table.read().get(id).map(|m| m.url.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Look up a node by served URL. Cache-busting parameters are ignored.
    #[must_use]
    pub fn get_module_by_url(&self, raw_url: &str) -> Option<NodeId> {
        let url = strip_volatile_query(raw_url);
        if let Some(&id) = self.table.read().url_to_module.get(&url) {
            return Some(id);
        }
        self.unresolved
            .lock()
            .get(&url)
            .and_then(|cell| cell.get().copied())
    }

    /// Look up a node by resolved id.
    #[must_use]
    pub fn get_module_by_id(&self, id: &str) -> Option<NodeId> {
        let id = urls::remove_timestamp_query(id);
        self.table.read().id_to_module.get(&id).copied()
    }

    /// All nodes backed by `file`.
    #[must_use]
    pub fn get_modules_by_file(&self, file: &str) -> Vec<NodeId> {
        self.table
            .read()
            .file_to_modules
            .get(file)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Return the node for `raw_url`, resolving and registering it on first use.
    ///
    /// Concurrent callers for the same URL, cache-busting parameters aside,
    /// await one resolution and get the same node. A failed resolution is
    /// not cached.
    pub async fn ensure_entry_from_url(&self, raw_url: &str) -> Result<NodeId> {
        let cell = {
            let mut unresolved = self.unresolved.lock();
            Arc::clone(unresolved.entry(strip_volatile_query(raw_url)).or_default())
        };
        let id = cell.get_or_try_init(|| self.create_entry(raw_url)).await?;
        Ok(*id)
    }

    async fn create_entry(&self, raw_url: &str) -> Result<NodeId> {
        let (url, resolved_id, meta) = self.resolve_url(raw_url).await?;

        let mut table = self.table.write();
        if let Some(&existing) = table.id_to_module.get(&resolved_id) {
            // Another URL already resolved to this module: alias it.
            table.url_to_module.entry(url).or_insert(existing);
            return Ok(existing);
        }

        let mut node = ModuleNode::new(url);
        node.file = (!urls::is_virtual_id(&resolved_id)).then(|| clean_url(&resolved_id).to_string());
        node.id = Some(resolved_id);
        node.meta = meta;
        let id = table.insert(node, true);
        debug!(node = %id, url = raw_url, "module entry created");
        Ok(id)
    }

    async fn resolve_url(
        &self,
        raw_url: &str,
    ) -> Result<(String, String, Option<serde_json::Value>)> {
        let url = strip_volatile_query(raw_url);
        let resolved = self.resolver.resolve_id(&url, None).await?;
        let (resolved_id, meta) = match resolved {
            Some(r) => (r.id, r.meta),
            None => (url.clone(), None),
        };
        let url = align_extension(url, &resolved_id);
        Ok((url, resolved_id, meta))
    }

    /// Node for a file that is depended on but never served by URL, such as a
    /// stylesheet pulled in through `@import`.
    pub fn create_file_only_entry(&self, file: &str) -> NodeId {
        let url = format!("{FS_PREFIX}{}", file.trim_start_matches('/'));
        let mut table = self.table.write();

        if let Some(existing) = table.file_to_modules.get(file).and_then(|set| {
            set.iter().copied().find(|id| {
                table
                    .nodes
                    .get(id)
                    .is_some_and(|m| m.url == url || m.id.as_deref() == Some(file))
            })
        }) {
            return existing;
        }

        let mut node = ModuleNode::new(url);
        node.file = Some(file.to_string());
        table.insert(node, false)
    }

    /// Rebind a module's edges after a transform pass.
    ///
    /// Returns the dependencies that were imported before, are not anymore,
    /// and are left without importers. They stay in the graph; the caller
    /// decides whether to notify clients.
    pub fn update_module_info(&self, node: NodeId, info: ModuleInfo) -> BTreeSet<NodeId> {
        let mut pruned = BTreeSet::new();
        let mut table = self.table.write();

        let next: BTreeSet<NodeId> = info
            .imported
            .into_iter()
            .filter(|dep| table.nodes.contains_key(dep))
            .collect();
        let accepted: BTreeSet<NodeId> = info
            .accepted
            .into_iter()
            .filter(|dep| table.nodes.contains_key(dep))
            .collect();

        let Some(module) = table.nodes.get_mut(&node) else {
            return pruned;
        };
        module.is_self_accepting = Some(info.is_self_accepting);
        module.accepted_hmr_deps = accepted;
        module.accepted_hmr_exports = info.accepted_exports;
        module.imported_bindings = info.imported_bindings;
        let prev = std::mem::replace(&mut module.imported_modules, next.clone());

        for dep in &next {
            if let Some(dep_node) = table.nodes.get_mut(dep) {
                dep_node.importers.insert(node);
            }
        }
        for dep in prev.difference(&next) {
            if let Some(dep_node) = table.nodes.get_mut(dep) {
                dep_node.importers.remove(&node);
                if dep_node.importers.is_empty() {
                    pruned.insert(*dep);
                }
            }
        }
        pruned
    }

    /// Clear cached output of `node` and propagate to importers that do not
    /// accept it. Each node is processed at most once per `seen` set.
    pub fn invalidate_module(
        &self,
        node: NodeId,
        seen: &mut HashSet<NodeId>,
        timestamp: u64,
        is_hmr: bool,
    ) {
        self.table.write().invalidate(node, seen, timestamp, is_hmr);
    }

    /// Invalidate every module backed by `file`.
    pub fn on_file_change(&self, file: &str) {
        let timestamp = crate::engine::now_ms();
        let mut table = self.table.write();
        let Some(mods) = table.file_to_modules.get(file).cloned() else {
            return;
        };
        let mut seen = HashSet::new();
        for id in mods {
            table.invalidate(id, &mut seen, timestamp, false);
        }
    }

    /// Invalidate every module in the graph.
    pub fn invalidate_all(&self) {
        let timestamp = crate::engine::now_ms();
        let mut table = self.table.write();
        let ids: Vec<NodeId> = table.nodes.keys().copied().collect();
        let mut seen = HashSet::new();
        for id in ids {
            table.invalidate(id, &mut seen, timestamp, false);
        }
    }

    pub fn set_transform_result(&self, node: NodeId, result: TransformResult) {
        if let Some(module) = self.table.write().nodes.get_mut(&node) {
            module.transform_result = Some(Arc::new(result));
        }
    }

    #[must_use]
    pub fn transform_result(&self, node: NodeId) -> Option<Arc<TransformResult>> {
        self.table
            .read()
            .get(node)
            .and_then(|m| m.transform_result.clone())
    }

    pub fn set_last_hmr_timestamp(&self, nodes: impl IntoIterator<Item = NodeId>, timestamp: u64) {
        let mut table = self.table.write();
        for id in nodes {
            if let Some(module) = table.nodes.get_mut(&id) {
                module.last_hmr_timestamp = timestamp;
            }
        }
    }

    /// Record a client's request to invalidate the module at `url`.
    ///
    /// Succeeds once per HMR version of a self-accepting module that has
    /// already been hot updated.
    pub fn claim_hmr_invalidation(&self, url: &str) -> Option<InvalidationClaim> {
        let url = strip_volatile_query(url);
        let mut table = self.table.write();
        let id = *table.url_to_module.get(&url)?;
        let module = table.nodes.get_mut(&id)?;

        if module.is_self_accepting != Some(true)
            || module.last_hmr_timestamp == 0
            || module.last_hmr_invalidation_received
        {
            return None;
        }
        module.last_hmr_invalidation_received = true;
        Some(InvalidationClaim {
            node: id,
            importers: module.importers.iter().copied().collect(),
            timestamp: module.last_hmr_timestamp,
            file: module.file.clone(),
        })
    }

    /// Remove the modules of a deleted file that nothing imports anymore.
    ///
    /// Modules that still have importers are kept until those importers are
    /// re-analyzed. Returns the removed nodes.
    pub fn on_file_delete(&self, file: &str) -> Vec<ModuleNode> {
        let mut table = self.table.write();
        let Some(ids) = table.file_to_modules.get(file).cloned() else {
            return Vec::new();
        };

        let mut removed_ids = HashSet::new();
        let mut removed = Vec::new();
        for id in ids {
            let orphan = table.nodes.get(&id).is_some_and(|m| m.importers.is_empty());
            if orphan {
                if let Some(node) = table.remove(id) {
                    removed_ids.insert(id);
                    removed.push(node);
                }
            }
        }
        drop(table);

        if !removed_ids.is_empty() {
            self.unresolved
                .lock()
                .retain(|_, cell| !cell.get().is_some_and(|id| removed_ids.contains(id)));
            debug!(file, count = removed.len(), "removed deleted modules");
        }
        removed
    }
}

/// Give `url` the extension of the file it resolved to, so `/src/App`
/// and `/src/App.tsx` share one served URL.
fn align_extension(url: String, resolved_id: &str) -> String {
    if url == resolved_id || url.contains('\0') || url.starts_with("virtual:") {
        return url;
    }
    let resolved_path = clean_url(resolved_id);
    let file_name = resolved_path.rsplit('/').next().unwrap_or(resolved_path);
    let Some(dot) = file_name.rfind('.') else {
        return url;
    };
    let ext = &file_name[dot..];

    let pathname = clean_url(&url);
    if pathname.ends_with(ext) {
        return url;
    }
    let rest = &url[pathname.len()..];
    format!("{pathname}{ext}{rest}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn graph() -> ModuleGraph {
        ModuleGraph::new(Arc::new(FsResolver::new(PathBuf::from("/project"))))
    }

    fn imports(ids: &[NodeId]) -> ModuleInfo {
        ModuleInfo {
            imported: ids.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_entry_registers_all_indexes() {
        let graph = graph();
        let id = graph.ensure_entry_from_url("/src/App.tsx").await.unwrap();

        assert_eq!(graph.get_module_by_url("/src/App.tsx"), Some(id));
        assert_eq!(graph.get_module_by_id("/project/src/App.tsx"), Some(id));
        assert_eq!(graph.get_modules_by_file("/project/src/App.tsx"), vec![id]);

        let node = graph.module(id).unwrap();
        assert_eq!(node.is_self_accepting, None);
        assert_eq!(node.module_type, ModuleType::Js);
    }

    #[tokio::test]
    async fn test_ensure_entry_is_idempotent() {
        let graph = graph();
        let a = graph.ensure_entry_from_url("/src/a.js").await.unwrap();
        let b = graph.ensure_entry_from_url("/src/a.js?t=1700000000000").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(graph.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_converges() {
        let graph = Arc::new(graph());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let graph = Arc::clone(&graph);
                tokio::spawn(async move { graph.ensure_entry_from_url("/src/race.js").await })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(graph.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_strips_volatile_query() {
        let graph = graph();
        let id = graph.ensure_entry_from_url("/logo.svg?import").await.unwrap();
        assert_eq!(graph.get_module_by_url("/logo.svg?import&t=123"), Some(id));
        assert_eq!(graph.get_module_by_url("/missing.js"), None);
    }

    #[tokio::test]
    async fn test_cache_busted_urls_share_one_pending_entry() {
        let graph = graph();
        for t in 1..=5 {
            graph
                .ensure_entry_from_url(&format!("/src/a.js?t={t}"))
                .await
                .unwrap();
        }
        graph.ensure_entry_from_url("/src/a.js?import").await.unwrap();
        assert_eq!(graph.unresolved.lock().len(), 1);
        assert_eq!(graph.len(), 1);
    }

    #[tokio::test]
    async fn test_update_module_info_symmetric_edges() {
        let graph = graph();
        let main = graph.ensure_entry_from_url("/main.js").await.unwrap();
        let a = graph.ensure_entry_from_url("/a.js").await.unwrap();
        let b = graph.ensure_entry_from_url("/b.js").await.unwrap();

        let pruned = graph.update_module_info(main, imports(&[a, b]));
        assert!(pruned.is_empty());
        assert!(graph.module(a).unwrap().importers.contains(&main));
        assert!(graph.module(b).unwrap().importers.contains(&main));

        let pruned = graph.update_module_info(main, imports(&[a]));
        assert_eq!(pruned, BTreeSet::from([b]));
        assert!(graph.module(b).unwrap().importers.is_empty());
        // Pruned nodes are reported, not deleted.
        assert!(graph.module(b).is_some());

        let table = graph.table();
        for (id, node) in table.iter() {
            for dep in &node.imported_modules {
                assert!(table.get(*dep).unwrap().importers.contains(&id));
            }
            for importer in &node.importers {
                assert!(table.get(*importer).unwrap().imported_modules.contains(&id));
            }
        }
    }

    #[tokio::test]
    async fn test_shared_dep_not_pruned_while_imported_elsewhere() {
        let graph = graph();
        let x = graph.ensure_entry_from_url("/x.js").await.unwrap();
        let y = graph.ensure_entry_from_url("/y.js").await.unwrap();
        let shared = graph.ensure_entry_from_url("/shared.js").await.unwrap();

        graph.update_module_info(x, imports(&[shared]));
        graph.update_module_info(y, imports(&[shared]));
        let pruned = graph.update_module_info(x, imports(&[]));
        assert!(pruned.is_empty());
        assert_eq!(
            graph.module(shared).unwrap().importers,
            BTreeSet::from([y])
        );
    }

    #[tokio::test]
    async fn test_invalidate_all_drops_every_transform() {
        let graph = graph();
        let a = graph.ensure_entry_from_url("/a.js").await.unwrap();
        let b = graph.ensure_entry_from_url("/b.js").await.unwrap();
        let css = graph.create_file_only_entry("/project/node_modules/x.css");
        for (node, code) in [(a, "a"), (b, "b"), (css, "x")] {
            graph.set_transform_result(node, TransformResult::new(code));
        }

        graph.invalidate_all();

        for node in [a, b, css] {
            assert!(graph.transform_result(node).is_none());
        }
    }

    #[tokio::test]
    async fn test_invalidate_reaches_non_accepting_importer() {
        let graph = graph();
        let a = graph.ensure_entry_from_url("/a.js").await.unwrap();
        let b = graph.ensure_entry_from_url("/b.js").await.unwrap();
        graph.update_module_info(a, imports(&[b]));
        graph.set_transform_result(a, TransformResult::new("a"));
        graph.set_transform_result(b, TransformResult::new("b"));

        graph.invalidate_module(b, &mut HashSet::new(), 10, false);

        assert!(graph.transform_result(b).is_none());
        assert!(graph.transform_result(a).is_none());
        assert_eq!(graph.module(a).unwrap().last_invalidation_timestamp, 10);
    }

    #[tokio::test]
    async fn test_invalidate_stops_at_accepting_importer() {
        let graph = graph();
        let a = graph.ensure_entry_from_url("/a.js").await.unwrap();
        let b = graph.ensure_entry_from_url("/b.js").await.unwrap();
        graph.update_module_info(
            a,
            ModuleInfo {
                imported: BTreeSet::from([b]),
                accepted: BTreeSet::from([b]),
                ..Default::default()
            },
        );
        graph.set_transform_result(a, TransformResult::new("a"));
        graph.set_transform_result(b, TransformResult::new("b"));

        graph.invalidate_module(b, &mut HashSet::new(), 10, true);

        assert!(graph.transform_result(b).is_none());
        assert!(graph.transform_result(a).is_some());
        assert_eq!(graph.module(b).unwrap().last_hmr_timestamp, 10);
    }

    #[tokio::test]
    async fn test_invalidate_terminates_on_cycle() {
        let graph = graph();
        let a = graph.ensure_entry_from_url("/a.js").await.unwrap();
        let b = graph.ensure_entry_from_url("/b.js").await.unwrap();
        graph.update_module_info(a, imports(&[b]));
        graph.update_module_info(b, imports(&[a]));

        let mut seen = HashSet::new();
        graph.invalidate_module(a, &mut seen, 5, false);
        assert_eq!(seen, HashSet::from([a, b]));
    }

    #[tokio::test]
    async fn test_file_only_entry_deduped() {
        let graph = graph();
        let first = graph.create_file_only_entry("/project/src/base.css");
        let second = graph.create_file_only_entry("/project/src/base.css");
        assert_eq!(first, second);
        let node = graph.module(first).unwrap();
        assert_eq!(node.url, "/@fs/project/src/base.css");
        assert!(node.is_css());
        assert_eq!(graph.get_module_by_url(&node.url), None);
    }

    #[tokio::test]
    async fn test_on_file_delete_removes_orphans_only() {
        let graph = graph();
        let main = graph.ensure_entry_from_url("/main.js").await.unwrap();
        let dep = graph.ensure_entry_from_url("/dep.js").await.unwrap();
        graph.update_module_info(main, imports(&[dep]));

        assert!(graph.on_file_delete("/project/dep.js").is_empty());
        assert!(graph.module(dep).is_some());

        graph.update_module_info(main, imports(&[]));
        let removed = graph.on_file_delete("/project/dep.js");
        assert_eq!(removed.len(), 1);
        assert_eq!(graph.get_module_by_url("/dep.js"), None);
        assert!(graph.get_modules_by_file("/project/dep.js").is_empty());

        // A fresh request resolves a new node.
        let again = graph.ensure_entry_from_url("/dep.js").await.unwrap();
        assert_ne!(again, dep);
    }

    #[test]
    fn test_align_extension() {
        assert_eq!(
            align_extension("/src/App".to_string(), "/project/src/App.tsx"),
            "/src/App.tsx"
        );
        assert_eq!(
            align_extension("/src/App?x".to_string(), "/project/src/App.tsx?x"),
            "/src/App.tsx?x"
        );
        assert_eq!(
            align_extension("virtual:x".to_string(), "\0virtual:x.js"),
            "virtual:x"
        );
    }
}
