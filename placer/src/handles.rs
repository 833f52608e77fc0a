// handles.rs — Resource-handle tracker
//
// Types every value from static operation metadata, then turns colocation
// requests into unions: explicit `request_colocation` directives first, then
// one union per handle data edge (producer with consumer). A handle entering
// a device-boundary op is not a union; the boundary op starts a new lineage. Handle fan-out
// needs no special casing since every consumer unions with the same
// producer.
//
// Preconditions: the graph is fully constructed; frames are lowered.
// Postconditions: node output kinds and inferred edge kinds are final;
//                 `handle_source` names the originating producer of every
//                 handle a node consumes; `uf` holds all direct colocations.
// Failure modes: none.
// Side effects: writes output kinds, edge kinds and lineage into the graph.

use crate::colocation::UnionFind;
use crate::graph::{EdgeKind, Graph, NodeRole, ValueKind};
use crate::id::NodeId;
use crate::registry::OutputKind;

/// Counts reported by `mark_handles`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleSummary {
    pub handle_nodes: usize,
    pub handle_edges: usize,
    pub unions: usize,
}

pub fn mark_handles(graph: &mut Graph, uf: &mut UnionFind) -> HandleSummary {
    infer_value_kinds(graph);
    let origins = handle_origins(graph);
    record_lineage(graph, &origins);

    let mut summary = HandleSummary {
        handle_nodes: graph.nodes().filter(|n| n.produces_handle()).count(),
        ..HandleSummary::default()
    };

    let explicit: Vec<(NodeId, NodeId)> = graph.colocations().collect();
    for (a, b) in explicit {
        if uf.union(a, b) {
            summary.unions += 1;
            tracing::trace!(a = %a, b = %b, "explicit colocation");
        }
    }

    let handle_edges: Vec<(NodeId, NodeId)> = graph
        .edges()
        .filter(|e| graph.is_colocating_edge(e))
        .map(|e| (e.source, e.target))
        .collect();
    summary.handle_edges = handle_edges.len();
    for (producer, consumer) in handle_edges {
        if uf.union(producer, consumer) {
            summary.unions += 1;
            tracing::trace!(producer = %producer, consumer = %consumer, "handle colocation");
        }
    }
    summary
}

/// Output kind a node has before anything is forwarded to it.
fn base_kind(graph: &Graph, node: NodeId) -> ValueKind {
    let Ok(n) = graph.node(node) else {
        return ValueKind::Tensor;
    };
    match (n.role, graph.registry().output_kind(&n.op)) {
        (NodeRole::Op, Some(kind)) if kind.produces_handle() => ValueKind::Handle,
        _ => ValueKind::Tensor,
    }
}

/// Kind forwarded into `node` by its inputs, if any input decides it.
fn forwarded_kind(graph: &Graph, node: NodeId) -> Option<ValueKind> {
    let n = graph.node(node).ok()?;
    match n.role {
        NodeRole::Param { .. } => graph
            .capture_edge(node)
            .and_then(|e| graph.node(e.source).ok())
            .map(|src| src.output),
        NodeRole::Frame(frame) => {
            let frame = graph.frame(frame).ok()?;
            let returns_handle = frame.branches.iter().any(|&b| {
                graph.subgraph(b).is_ok_and(|sub| {
                    sub.returns
                        .iter()
                        .any(|&r| graph.node(r).is_ok_and(|rn| rn.produces_handle()))
                })
            });
            returns_handle.then_some(ValueKind::Handle)
        }
        NodeRole::Op => match graph.registry().output_kind(&n.op) {
            Some(OutputKind::Forward(i)) => {
                let edge = graph
                    .input_edges(node)
                    .filter(|e| e.kind == EdgeKind::Data)
                    .nth(i)?;
                if edge.declared {
                    Some(edge.value)
                } else {
                    graph.node(edge.source).ok().map(|src| src.output)
                }
            }
            _ => None,
        },
    }
}

/// Reset every node to its base kind, then forward handle-ness until
/// nothing changes. Kinds only move from tensor to handle, so this
/// terminates.
fn infer_value_kinds(graph: &mut Graph) {
    let ids: Vec<NodeId> = graph.nodes().map(|n| n.id).collect();
    for &id in &ids {
        let kind = base_kind(graph, id);
        graph.set_output_kind(id, kind);
    }
    loop {
        let mut changed = false;
        for &id in &ids {
            if graph.node(id).is_ok_and(|n| n.produces_handle()) {
                continue;
            }
            if forwarded_kind(graph, id) == Some(ValueKind::Handle) {
                graph.set_output_kind(id, ValueKind::Handle);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    let updates: Vec<_> = graph
        .edges()
        .filter(|e| !e.declared)
        .filter_map(|e| graph.node(e.source).ok().map(|src| (e.id, src.output)))
        .collect();
    for (edge, kind) in updates {
        graph.set_edge_value(edge, kind);
    }
}

/// For every handle-valued node, the node that originally produced the
/// handle (itself for a registered handle producer).
fn handle_origins(graph: &Graph) -> Vec<Option<NodeId>> {
    let mut origin: Vec<Option<NodeId>> = vec![None; graph.node_capacity()];
    for n in graph.nodes() {
        if n.produces_handle() && base_kind(graph, n.id) == ValueKind::Handle {
            origin[n.id.index()] = Some(n.id);
        }
    }
    loop {
        let mut changed = false;
        for n in graph.nodes() {
            if !n.produces_handle() || origin[n.id.index()].is_some() {
                continue;
            }
            let from = match n.role {
                NodeRole::Param { .. } => graph.capture_edge(n.id).map(|e| e.source),
                NodeRole::Frame(frame) => graph.frame(frame).ok().and_then(|f| {
                    f.branches
                        .iter()
                        .filter_map(|&b| graph.subgraph(b).ok())
                        .flat_map(|sub| sub.returns.iter().copied())
                        .find(|&r| origin[r.index()].is_some())
                }),
                NodeRole::Op => graph
                    .input_edges(n.id)
                    .find(|e| e.is_handle() && origin[e.source.index()].is_some())
                    .map(|e| e.source),
            };
            if let Some(src) = from.and_then(|s| origin[s.index()]) {
                origin[n.id.index()] = Some(src);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    origin
}

fn record_lineage(graph: &mut Graph, origins: &[Option<NodeId>]) {
    let updates: Vec<(NodeId, Option<NodeId>)> = graph
        .nodes()
        .map(|n| {
            let source = graph
                .input_edges(n.id)
                .filter(|e| e.is_handle())
                .filter(|e| e.kind != EdgeKind::Data || graph.is_colocating_edge(e))
                .find_map(|e| origins[e.source.index()]);
            (n.id, source)
        })
        .collect();
    for (node, source) in updates {
        graph.set_handle_source(node, source);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
