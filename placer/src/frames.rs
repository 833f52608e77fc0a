// frames.rs — Capture propagation across lowered frames
//
// For every frame, a captured value that is a handle, or whose source
// already sits in a non-trivial colocation group, is unioned with the
// matching parameter of every branch/body. A branch returning a handle is
// unioned with the frame's call site. Frames are visited parent before child
// with an explicit worklist, and the sweep repeats until no union changes
// anything: a union inside an inner frame can make an outer capture
// non-trivial after that frame was already visited.
//
// Preconditions: `handles::mark_handles` has run on the same union-find.
// Postconditions: every constrained capture shares a group with each of its
//                 parameters, at any nesting depth.
// Failure modes: none.
// Side effects: none on the graph; mutates `uf`.

use crate::colocation::UnionFind;
use crate::graph::Graph;
use crate::id::NodeId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSummary {
    pub frames: usize,
    pub sweeps: usize,
    pub unions: usize,
}

pub fn propagate_frames(graph: &Graph, uf: &mut UnionFind) -> FrameSummary {
    let order = graph.frames_outermost_first();
    let mut summary = FrameSummary {
        frames: order.len(),
        ..FrameSummary::default()
    };
    loop {
        summary.sweeps += 1;
        let mut changed = false;
        for &frame_id in &order {
            let Ok(frame) = graph.frame(frame_id) else {
                continue;
            };
            for (i, &source) in frame.captures.iter().enumerate() {
                let is_handle = graph.node(source).is_ok_and(|n| n.produces_handle());
                if !is_handle && uf.size(source) < 2 {
                    continue;
                }
                for (b, &branch) in frame.branches.iter().enumerate() {
                    let Some(&param) = graph
                        .subgraph(branch)
                        .ok()
                        .and_then(|sub| sub.params.get(i))
                    else {
                        continue;
                    };
                    if uf.union(source, param) {
                        changed = true;
                        summary.unions += 1;
                        tracing::trace!(frame = %frame_id, branch = b, capture = %source, param = %param, "capture colocation");
                    }
                }
            }
            for &branch in &frame.branches {
                let returns: Vec<NodeId> = graph
                    .subgraph(branch)
                    .map(|sub| sub.returns.clone())
                    .unwrap_or_default();
                for ret in returns {
                    if graph.node(ret).is_ok_and(|n| n.produces_handle()) && uf.union(ret, frame.node) {
                        changed = true;
                        summary.unions += 1;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FrameDef, FrameKind};
    use crate::handles::mark_handles;
    use crate::id::GraphId;

    fn lower(g: &mut Graph, parent: GraphId, name: &str, captures: &[NodeId], branches: &[GraphId]) {
        g.lower_frame(
            parent,
            FrameDef {
                kind: FrameKind::While,
                name,
                inputs: &[],
                captures,
                branches,
                device: None,
            },
        )
        .unwrap();
    }

    fn propagate(g: &mut Graph) -> (UnionFind, FrameSummary) {
        let mut uf = UnionFind::new(g.node_capacity());
        mark_handles(g, &mut uf);
        let summary = propagate_frames(g, &mut uf);
        (uf, summary)
    }

    #[test]
    fn handle_capture_joins_every_branch_param() {
        let mut g = Graph::new();
        let ds = g.add_named_node(GraphId::ROOT, "ds", "RangeDataset", None).unwrap();
        let then_g = g.add_subgraph("c/then");
        let else_g = g.add_subgraph("c/else");
        let p0 = g.add_param(then_g, "c/then/d").unwrap();
        let p1 = g.add_param(else_g, "c/else/d").unwrap();
        lower(&mut g, GraphId::ROOT, "c", &[ds], &[then_g, else_g]);
        let (mut uf, summary) = propagate(&mut g);
        assert!(uf.same(ds, p0) && uf.same(ds, p1));
        assert_eq!(summary.unions, 2);
    }

    #[test]
    fn plain_tensor_capture_is_not_constrained() {
        let mut g = Graph::new();
        let x = g.add_named_node(GraphId::ROOT, "x", "Const", None).unwrap();
        let body = g.add_subgraph("l/body");
        let p = g.add_param(body, "l/body/x").unwrap();
        lower(&mut g, GraphId::ROOT, "l", &[x], &[body]);
        let (mut uf, _) = propagate(&mut g);
        assert!(!uf.same(x, p));
    }

    #[test]
    fn colocated_tensor_capture_is_constrained() {
        let mut g = Graph::new();
        let x = g.add_named_node(GraphId::ROOT, "x", "Const", None).unwrap();
        let y = g.add_named_node(GraphId::ROOT, "y", "Const", None).unwrap();
        g.request_colocation(x, y).unwrap();
        let body = g.add_subgraph("l/body");
        let p = g.add_param(body, "l/body/x").unwrap();
        lower(&mut g, GraphId::ROOT, "l", &[x], &[body]);
        let (mut uf, _) = propagate(&mut g);
        assert!(uf.same(y, p));
    }

    #[test]
    fn deep_nesting_reaches_innermost_param() {
        let mut g = Graph::new();
        let ds = g.add_named_node(GraphId::ROOT, "ds", "RangeDataset", None).unwrap();
        let depth = 64;
        // Build innermost first, the way a tracer finishes inner bodies first.
        let bodies: Vec<GraphId> = (0..depth).map(|i| g.add_subgraph(&format!("l{i}/body"))).collect();
        let params: Vec<NodeId> = bodies
            .iter()
            .enumerate()
            .map(|(i, &b)| g.add_param(b, &format!("l{i}/body/d")).unwrap())
            .collect();
        for i in (1..depth).rev() {
            lower(&mut g, bodies[i - 1], &format!("l{i}"), &[params[i - 1]], &[bodies[i]]);
        }
        lower(&mut g, GraphId::ROOT, "l0", &[ds], &[bodies[0]]);
        let (mut uf, _) = propagate(&mut g);
        for &p in &params {
            assert!(uf.same(ds, p));
        }
    }

    #[test]
    fn colocated_tensor_capture_propagates_through_nesting() {
        // `x` is a tensor colocated with a variable at the root, captured
        // into an outer body and re-captured from there into an inner body.
        let mut g = Graph::new();
        let x = g.add_named_node(GraphId::ROOT, "x", "Const", None).unwrap();
        let v = g.add_named_node(GraphId::ROOT, "v", "VarHandleOp", None).unwrap();
        g.request_colocation(x, v).unwrap();
        let outer = g.add_subgraph("o/body");
        let ox = g.add_param(outer, "o/body/x").unwrap();
        let inner = g.add_subgraph("o/body/i/body");
        let ix = g.add_param(inner, "o/body/i/body/x").unwrap();
        lower(&mut g, outer, "o/body/i", &[ox], &[inner]);
        lower(&mut g, GraphId::ROOT, "o", &[x], &[outer]);
        let (mut uf, summary) = propagate(&mut g);
        assert!(uf.same(v, ox));
        assert!(uf.same(v, ix));
        assert_eq!(summary.frames, 2);
        // One sweep doing the work, one confirming the fixpoint.
        assert_eq!(summary.sweeps, 2);
    }
}
