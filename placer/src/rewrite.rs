// rewrite.rs — Optimizer rewrites over placed graphs
//
// A `GraphRewrite` may merge, duplicate or remove nodes after placement.
// Rewrites do not maintain group invariants themselves; the pipeline runs
// `validate::reconcile` after each one.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::{EdgeKind, Graph, NodeRole};
use crate::id::NodeId;
use crate::registry::OutputKind;

pub trait GraphRewrite: Send + Sync {
    fn name(&self) -> &str;

    /// Apply the rewrite; returns the number of nodes changed.
    fn rewrite(&self, graph: &mut Graph) -> Result<usize>;
}

/// Names accepted by `rewrite_by_name`.
pub const REWRITE_NAMES: &[&str] = &["merge_duplicates"];

pub fn rewrite_by_name(name: &str) -> Option<Arc<dyn GraphRewrite>> {
    match name {
        "merge_duplicates" => Some(Arc::new(MergeDuplicates)),
        _ => None,
    }
}

/// Common-subexpression elimination: side-effect-free nodes with the same
/// operation kind and the same inputs are merged into the one with the
/// smallest id. Device requests of the removed nodes are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeDuplicates;

impl MergeDuplicates {
    fn is_mergeable(graph: &Graph, node: NodeId) -> bool {
        let Ok(n) = graph.node(node) else {
            return false;
        };
        if n.role != NodeRole::Op || n.inputs.is_empty() {
            return false;
        }
        match graph.registry().output_kind(&n.op) {
            Some(OutputKind::Forward(_)) => true,
            Some(OutputKind::Tensor) => !graph.input_edges(node).any(|e| e.is_handle()),
            _ => false,
        }
    }
}

impl GraphRewrite for MergeDuplicates {
    fn name(&self) -> &str {
        "merge_duplicates"
    }

    fn rewrite(&self, graph: &mut Graph) -> Result<usize> {
        let mut seen: HashMap<(crate::id::GraphId, String, Vec<NodeId>), NodeId> = HashMap::new();
        let mut merges = Vec::new();
        for n in graph.nodes() {
            if !Self::is_mergeable(graph, n.id) {
                continue;
            }
            let sources: Vec<NodeId> = graph
                .input_edges(n.id)
                .filter(|e| e.kind == EdgeKind::Data)
                .map(|e| e.source)
                .collect();
            match seen.entry((n.graph, n.op.clone(), sources)) {
                std::collections::hash_map::Entry::Occupied(keep) => {
                    merges.push((*keep.get(), n.id));
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(n.id);
                }
            }
        }
        for &(keep, remove) in &merges {
            tracing::debug!(keep = %keep, remove = %remove, "merging duplicate node");
            graph.merge_nodes(keep, remove)?;
        }
        Ok(merges.len())
    }
}
