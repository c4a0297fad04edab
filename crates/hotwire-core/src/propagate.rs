//! Update propagation: from changed modules to HMR boundaries.
//!
//! For every changed module the propagator walks importer edges until each
//! path ends at a module that absorbs the change (a boundary) or at a module
//! nothing absorbs (a dead end). One dead end anywhere in the batch turns the
//! whole batch into a full reload.
//!
//! The walk performs no I/O and never suspends; it reads the node table under
//! one read guard.

use crate::config::UnanalyzedPolicy;
use crate::graph::{ModuleGraph, ModuleTable, NodeId};
use std::collections::HashSet;
use tracing::debug;

/// A module that absorbs an update, and the dependency it absorbs it from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropagationBoundary {
    pub boundary: NodeId,
    pub accepted_via: NodeId,
}

/// Outcome of propagating one change batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagation {
    /// Apply these boundaries. May be empty when every path halted.
    Boundaries(Vec<PropagationBoundary>),
    /// Reload the page. `dead_end` is the first module where the walk failed.
    FullReload { dead_end: NodeId },
}

/// Ordered boundary list that records each `(boundary, accepted_via)` once.
#[derive(Debug, Default)]
struct Boundaries {
    seen: HashSet<PropagationBoundary>,
    list: Vec<PropagationBoundary>,
}

impl Boundaries {
    fn add(&mut self, boundary: NodeId, accepted_via: NodeId) {
        let entry = PropagationBoundary {
            boundary,
            accepted_via,
        };
        if self.seen.insert(entry) {
            self.list.push(entry);
        }
    }
}

/// Walks one graph snapshot.
pub struct Propagator<'a> {
    table: &'a ModuleTable,
    policy: UnanalyzedPolicy,
}

impl<'a> Propagator<'a> {
    #[must_use]
    pub fn new(table: &'a ModuleTable, policy: UnanalyzedPolicy) -> Self {
        Self { table, policy }
    }

    /// Propagate every changed module with one traversal set shared across
    /// the batch.
    #[must_use]
    pub fn propagate(&self, changed: &[NodeId]) -> Propagation {
        let mut traversed = HashSet::new();
        let mut boundaries = Boundaries::default();

        for &node in changed {
            let mut chain = vec![node];
            if let Some(dead_end) =
                self.propagate_update(node, &mut traversed, &mut boundaries, &mut chain)
            {
                debug!(node = %dead_end, "propagation reached a dead end");
                return Propagation::FullReload { dead_end };
            }
        }
        Propagation::Boundaries(boundaries.list)
    }

    /// Returns the dead-end node if the walk from `node` found one.
    fn propagate_update(
        &self,
        node: NodeId,
        traversed: &mut HashSet<NodeId>,
        boundaries: &mut Boundaries,
        chain: &mut Vec<NodeId>,
    ) -> Option<NodeId> {
        if !traversed.insert(node) {
            return None;
        }
        let module = self.table.get(node)?;

        let self_accepting = match module.is_self_accepting {
            Some(self_accepting) => self_accepting,
            // File-only nodes are never transformed; their importers decide.
            None if module.id.is_none() => false,
            // Accept behaviour unknown until the module has been transformed.
            None => {
                return match self.policy {
                    UnanalyzedPolicy::Halt => None,
                    UnanalyzedPolicy::FullReload => Some(node),
                };
            }
        };

        if self_accepting {
            boundaries.add(node, node);
            // Style updates cascade through stylesheets that import this one.
            for &importer in &module.importers {
                let is_css = self.table.get(importer).is_some_and(|m| m.is_css());
                if is_css && !chain.contains(&importer) {
                    chain.push(importer);
                    // A stylesheet importer cannot turn a self-accepted
                    // update into a reload.
                    let _ = self.propagate_update(importer, traversed, boundaries, chain);
                    chain.pop();
                }
            }
            return None;
        }

        if module.accepted_hmr_exports.is_some() {
            // Partially accepted: the module covers the exports it accepts
            // and importers of anything else are checked below.
            boundaries.add(node, node);
        } else {
            if module.importers.is_empty() {
                return Some(node);
            }
            let only_css_importers = module
                .importers
                .iter()
                .all(|id| self.table.get(*id).is_some_and(|m| m.is_css()));
            if !module.is_css() && only_css_importers {
                return Some(node);
            }
        }

        for &importer in &module.importers {
            let Some(importer_node) = self.table.get(importer) else {
                continue;
            };
            if importer_node.accepted_hmr_deps.contains(&node) {
                boundaries.add(importer, node);
                continue;
            }

            if let (Some(id), Some(accepted), Some(bindings)) = (
                module.id.as_deref(),
                module.accepted_hmr_exports.as_ref(),
                importer_node.imported_bindings.as_ref(),
            ) {
                let all_accepted = bindings
                    .get(id)
                    .is_some_and(|names| names.iter().all(|name| accepted.contains(name)));
                if all_accepted {
                    continue;
                }
            }

            chain.push(importer);
            let dead_end = self.propagate_update(importer, traversed, boundaries, chain);
            chain.pop();
            if dead_end.is_some() {
                return dead_end;
            }
        }
        None
    }
}

impl ModuleGraph {
    /// Run the propagator over the current graph.
    #[must_use]
    pub fn propagate(&self, changed: &[NodeId], policy: UnanalyzedPolicy) -> Propagation {
        let table = self.table();
        Propagator::new(&table, policy).propagate(changed)
    }
}
