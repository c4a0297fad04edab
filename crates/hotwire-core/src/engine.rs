//! HMR engine: turns file events and client requests into channel payloads.

use crate::channel::{ClientId, HmrChannel};
use crate::config::UnanalyzedPolicy;
use crate::error::Result;
use crate::graph::{ModuleGraph, ModuleInfo, NodeId, TransformResult};
use crate::lexer::{analyze_module, analyze_stylesheet};
use crate::propagate::Propagation;
use crate::urls::{
    is_explicit_import_required, is_html_file, join_import, normalize_hmr_url, FS_PREFIX,
};
use hotwire_proto::{events, ClientMessage, HmrPayload, InvalidatePayload, Update, UpdateKind};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What the engine sent for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmrOutcome {
    Updated(Vec<Update>),
    FullReload { path: Option<String> },
    Pruned(Vec<String>),
    /// Nothing was sent.
    NoUpdate,
}

/// The HMR engine owns the module graph and the server channel.
pub struct HmrEngine {
    graph: Arc<ModuleGraph>,
    channel: HmrChannel,
    root: PathBuf,
    policy: UnanalyzedPolicy,
}

impl HmrEngine {
    #[must_use]
    pub fn new(graph: Arc<ModuleGraph>, channel: HmrChannel, root: PathBuf) -> Self {
        Self {
            graph,
            channel,
            root,
            policy: UnanalyzedPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: UnanalyzedPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<ModuleGraph> {
        &self.graph
    }

    #[must_use]
    pub fn channel(&self) -> &HmrChannel {
        &self.channel
    }

    /// Record a freshly transformed module in the graph.
    ///
    /// Imports are resolved relative to `url`; bare package specifiers are
    /// not tracked, except stylesheet `@import`s found under `node_modules`,
    /// which get a file-only node. Stylesheets accept their own updates. Dependencies the
    /// module stopped importing are pruned on the client.
    pub async fn register_module(&self, url: &str, code: &str) -> Result<NodeId> {
        let node = self.graph.ensure_entry_from_url(url).await?;
        let is_css = self.graph.module(node).is_some_and(|m| m.is_css());
        let mut info = ModuleInfo::default();

        if is_css {
            for spec in analyze_stylesheet(code) {
                if let Some(dep_url) = join_import(url, &spec) {
                    info.imported
                        .insert(self.graph.ensure_entry_from_url(&dep_url).await?);
                } else if let Some(file) = self.package_stylesheet(&spec) {
                    info.imported
                        .insert(self.graph.create_file_only_entry(&file.display().to_string()));
                }
            }
            info.is_self_accepting = true;
        } else {
            let analysis = analyze_module(code)?;
            let mut bindings: HashMap<String, HashSet<String>> = HashMap::new();
            for record in &analysis.imports {
                let Some(dep_url) = join_import(url, &record.specifier) else {
                    continue;
                };
                let dep = self.graph.ensure_entry_from_url(&dep_url).await?;
                info.imported.insert(dep);
                if record.dynamic {
                    continue;
                }
                if let Some(id) = self.graph.module(dep).and_then(|m| m.id) {
                    bindings
                        .entry(id)
                        .or_default()
                        .extend(record.bindings.iter().cloned());
                }
            }
            for spec in &analysis.accepted_deps {
                if let Some(dep_url) = join_import(url, spec) {
                    info.accepted
                        .insert(self.graph.ensure_entry_from_url(&dep_url).await?);
                }
            }
            info.imported_bindings = Some(bindings);
            info.accepted_exports = analysis.accepted_exports;
            info.is_self_accepting = analysis.is_self_accepting;
        }

        let pruned = self.graph.update_module_info(node, info);
        self.graph.set_transform_result(node, TransformResult::new(code));
        if !pruned.is_empty() {
            self.handle_pruned_modules(pruned, now_ms());
        }
        Ok(node)
    }

    /// Handle a changed file reported by the watcher.
    pub fn handle_file_change(&self, file: &str, timestamp: u64) -> HmrOutcome {
        self.graph.on_file_change(file);

        let modules = self.graph.get_modules_by_file(file);
        if modules.is_empty() {
            if is_html_file(file) {
                // Pages are not modules; reload the ones served from this file.
                let path = self.short_url(file);
                info!(path = %path, "page reload");
                let path = Some(path);
                self.channel.send(HmrPayload::FullReload { path: path.clone() });
                return HmrOutcome::FullReload { path };
            }
            debug!(file, "no modules matched");
            return HmrOutcome::NoUpdate;
        }

        self.update_modules(file, &modules, timestamp)
    }

    /// Invalidate `modules`, propagate, and send one `update` or one
    /// `full-reload` for the whole batch.
    pub fn update_modules(&self, file: &str, modules: &[NodeId], timestamp: u64) -> HmrOutcome {
        let mut invalidated = HashSet::new();
        for &module in modules {
            self.graph
                .invalidate_module(module, &mut invalidated, timestamp, true);
        }

        let boundaries = match self.graph.propagate(modules, self.policy) {
            Propagation::FullReload { dead_end } => {
                let reason = self.graph.url_of(dead_end).unwrap_or_default();
                info!(file = %self.short_url(file), dead_end = %reason, "page reload");
                self.channel.send(HmrPayload::FullReload { path: None });
                return HmrOutcome::FullReload { path: None };
            }
            Propagation::Boundaries(boundaries) => boundaries,
        };

        if boundaries.is_empty() {
            debug!(file = %self.short_url(file), "no update happened");
            return HmrOutcome::NoUpdate;
        }

        let updates: Vec<Update> = {
            let table = self.graph.table();
            boundaries
                .iter()
                .filter_map(|b| {
                    let boundary = table.get(b.boundary)?;
                    let accepted_via = table.get(b.accepted_via)?;
                    let kind = if boundary.is_css() {
                        UpdateKind::Css
                    } else {
                        UpdateKind::Js
                    };
                    Some(Update {
                        kind,
                        path: normalize_hmr_url(&boundary.url),
                        accepted_path: normalize_hmr_url(&accepted_via.url),
                        timestamp,
                        explicit_import_required: (kind == UpdateKind::Js)
                            .then(|| is_explicit_import_required(&accepted_via.url)),
                    })
                })
                .collect()
        };

        let paths: Vec<&str> = updates.iter().map(|u| u.path.as_str()).collect();
        info!(paths = %paths.join(", "), "hmr update");
        self.channel.send(HmrPayload::Update {
            updates: updates.clone(),
        });
        HmrOutcome::Updated(updates)
    }

    /// Tell clients about modules that lost their last importer.
    pub fn handle_pruned_modules(
        &self,
        pruned: impl IntoIterator<Item = NodeId>,
        timestamp: u64,
    ) -> HmrOutcome {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        for node in pruned {
            let Some(url) = self.graph.url_of(node) else {
                continue;
            };
            self.graph.invalidate_module(node, &mut seen, timestamp, true);
            paths.push(normalize_hmr_url(&url));
        }
        if paths.is_empty() {
            return HmrOutcome::NoUpdate;
        }
        debug!(count = paths.len(), "pruning modules");
        self.channel.send(HmrPayload::Prune {
            paths: paths.clone(),
        });
        HmrOutcome::Pruned(paths)
    }

    /// A client asked to invalidate a hot-updated module it could not
    /// apply. The update is re-propagated from the module's importers, once
    /// per HMR version of the module.
    pub fn handle_invalidate(&self, payload: &InvalidatePayload) -> HmrOutcome {
        let Some(claim) = self.graph.claim_hmr_invalidation(&payload.path) else {
            return HmrOutcome::NoUpdate;
        };
        match &payload.message {
            Some(message) => info!(path = %payload.path, message = %message, "hmr invalidate"),
            None => info!(path = %payload.path, "hmr invalidate"),
        }

        if claim.importers.is_empty() {
            // Nothing above the module can take the update.
            self.channel.send(HmrPayload::FullReload { path: None });
            return HmrOutcome::FullReload { path: None };
        }
        let file = claim.file.unwrap_or_else(|| payload.path.clone());
        self.update_modules(&file, &claim.importers, claim.timestamp)
    }

    /// Handle one message read from a client socket.
    pub fn handle_client_message(&self, client: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::Ping => {}
            ClientMessage::Custom { event, data } => {
                if event == events::INVALIDATE {
                    match serde_json::from_value::<InvalidatePayload>(data.clone()) {
                        Ok(payload) => {
                            self.handle_invalidate(&payload);
                        }
                        Err(e) => warn!(client = %client, error = %e, "malformed invalidate event"),
                    }
                }
                self.channel.dispatch(&event, &data, client);
            }
        }
    }

    /// Handle a file removed from disk.
    ///
    /// Modules nothing imports anymore are dropped and pruned on the client.
    /// Modules still imported are treated as changed so their importers
    /// re-fetch and fail visibly.
    pub fn handle_file_delete(&self, file: &str, timestamp: u64) -> HmrOutcome {
        let removed = self.graph.on_file_delete(file);
        let remaining = self.graph.get_modules_by_file(file);

        let mut outcome = HmrOutcome::NoUpdate;
        if !remaining.is_empty() {
            outcome = self.update_modules(file, &remaining, timestamp);
        }
        if !removed.is_empty() {
            let paths: Vec<String> = removed.iter().map(|m| normalize_hmr_url(&m.url)).collect();
            debug!(file, count = paths.len(), "pruning deleted modules");
            self.channel.send(HmrPayload::Prune {
                paths: paths.clone(),
            });
            if outcome == HmrOutcome::NoUpdate {
                outcome = HmrOutcome::Pruned(paths);
            }
        }
        outcome
    }

    /// File behind a bare stylesheet `@import`, looked up in `node_modules`.
    fn package_stylesheet(&self, spec: &str) -> Option<PathBuf> {
        let spec = spec.strip_prefix('~').unwrap_or(spec);
        if spec.contains("://") || spec.starts_with("data:") {
            return None;
        }
        let file = self.root.join("node_modules").join(spec);
        file.is_file().then_some(file)
    }

    /// URL of `file` relative to the project root.
    fn short_url(&self, file: &str) -> String {
        match Path::new(file).strip_prefix(&self.root) {
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => format!("{FS_PREFIX}{}", file.trim_start_matches('/')),
        }
    }
}
