// dot.rs — Graphviz DOT output for placed graphs
//
// One cluster per subgraph (the root graph and every branch/body), nodes
// labelled with their operation and device, handle edges in red, capture
// edges dashed across cluster boundaries.
//
// Preconditions: none; unplaced nodes are drawn grey.
// Postconditions: returns a DOT string; output is deterministic.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::{self, Write};

use crate::graph::*;
use crate::id::GraphId;

/// Emit the graph as a Graphviz DOT string.
pub fn emit_dot(graph: &Graph) -> String {
    let mut buf = String::new();
    // Writing into a String cannot fail.
    let _ = write_dot(&mut buf, graph);
    buf
}

fn write_dot(buf: &mut String, graph: &Graph) -> fmt::Result {
    writeln!(buf, "digraph placement {{")?;
    writeln!(buf, "    rankdir=LR;")?;
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];")?;
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];")?;

    for sub in graph.subgraphs() {
        let live: Vec<&Node> = sub
            .nodes
            .iter()
            .filter_map(|&id| graph.node(id).ok())
            .collect();
        if live.is_empty() && sub.owner.is_none() && sub.id != GraphId::ROOT {
            continue;
        }
        writeln!(buf)?;
        writeln!(buf, "    subgraph cluster_g{} {{", sub.id.index())?;
        writeln!(buf, "        label=\"{}\";", cluster_label(graph, sub))?;
        match sub.owner {
            Some(_) => {
                writeln!(buf, "        style=dashed;")?;
                writeln!(buf, "        color=gray70;")?;
            }
            None => {
                writeln!(buf, "        style=rounded;")?;
                writeln!(buf, "        color=gray50;")?;
            }
        }
        for node in live {
            writeln!(buf, "        n{} [{}];", node.id.index(), node_attrs(node))?;
        }
        writeln!(buf, "    }}")?;
    }

    writeln!(buf)?;
    for edge in graph.edges() {
        let attrs = match (edge.kind, edge.is_handle()) {
            (EdgeKind::Capture { branch, .. }, true) => {
                format!(" [style=dashed, color=red, label=\"b{branch}\"]")
            }
            (EdgeKind::Capture { branch, .. }, false) => {
                format!(" [style=dashed, label=\"b{branch}\"]")
            }
            (EdgeKind::Data, true) => " [color=red, penwidth=2]".to_string(),
            (EdgeKind::Data, false) => String::new(),
        };
        writeln!(
            buf,
            "    n{} -> n{}{};",
            edge.source.index(),
            edge.target.index(),
            attrs
        )?;
    }

    writeln!(buf, "}}")
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn cluster_label(graph: &Graph, sub: &Subgraph) -> String {
    match sub.owner.and_then(|(frame, branch)| {
        graph.frame(frame).ok().map(|f| (f.kind, f.node, branch))
    }) {
        Some((kind, node, branch)) => format!(
            "{}: {} '{}' branch {}",
            escape(&sub.name),
            kind,
            escape(graph.name(node)),
            branch
        ),
        None => escape(&sub.name),
    }
}

/// Return DOT attributes string for a node.
fn node_attrs(node: &Node) -> String {
    let shape = match node.role {
        NodeRole::Op => "box",
        NodeRole::Param { .. } => "ellipse",
        NodeRole::Frame(_) => "diamond",
    };
    let (device, color) = match &node.assigned_device {
        Some(d) => {
            let text = d.to_string();
            let color = device_color(&text);
            (text, color)
        }
        None => ("unplaced".to_string(), "gray85"),
    };
    let border = if node.produces_handle() {
        ", penwidth=2"
    } else {
        ""
    };
    format!(
        "shape={shape}, style=filled, fillcolor={color}{border}, label=\"{}\\n{}\\n{}\"",
        escape(&node.name),
        escape(&node.op),
        escape(&device)
    )
}

/// A stable fill colour per device so groups on one device read alike.
fn device_color(device: &str) -> &'static str {
    const PALETTE: [&str; 6] = [
        "lightblue",
        "lightyellow",
        "lightgreen",
        "lightsalmon",
        "plum",
        "lightcyan",
    ];
    let hash = device
        .bytes()
        .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlacementOptions;
    use crate::device::DeviceSpec;
    use crate::pipeline::place;

    fn placed() -> Graph {
        let mut g = Graph::new();
        let ds = g.add_named_node(GraphId::ROOT, "ds", "RangeDataset", None).unwrap();
        let pred = g.add_named_node(GraphId::ROOT, "pred", "Const", None).unwrap();
        let then_g = g.add_subgraph("out/then");
        let d = g.add_param(then_g, "out/then/d").unwrap();
        let m = g.add_named_node(then_g, "out/then/m", "MapDataset", None).unwrap();
        g.add_edge(d, m).unwrap();
        g.set_returns(then_g, &[m]).unwrap();
        g.lower_frame(
            GraphId::ROOT,
            FrameDef {
                kind: FrameKind::Cond,
                name: "out",
                inputs: &[pred],
                captures: &[ds],
                branches: &[then_g],
                device: None,
            },
        )
        .unwrap();
        place(&mut g, &PlacementOptions::with_default_device(DeviceSpec::cpu(0))).unwrap();
        g
    }

    #[test]
    fn valid_dot_structure() {
        let dot = emit_dot(&placed());
        assert!(dot.starts_with("digraph placement {"));
        assert!(dot.trim_end().ends_with('}'));
        assert!(dot.contains("subgraph cluster_g0 {"));
        assert!(dot.contains("label=\"main\""));
        assert!(dot.contains("label=\"out/then: if 'out' branch 0\""));
    }

    #[test]
    fn edges_styled_by_kind() {
        let dot = emit_dot(&placed());
        assert!(dot.contains("[style=dashed, color=red, label=\"b0\"]"), "{dot}");
        assert!(dot.contains("[color=red, penwidth=2]"), "{dot}");
        // pred -> out is a plain tensor edge.
        assert!(dot.lines().any(|l| l.trim() == "n1 -> n4;"), "{dot}");
    }

    #[test]
    fn nodes_show_devices() {
        let dot = emit_dot(&placed());
        assert!(dot.contains("label=\"ds\\nRangeDataset\\n/device:CPU:0\""), "{dot}");
        assert!(dot.contains("shape=diamond"));
        assert!(dot.contains("shape=ellipse"));
    }

    #[test]
    fn unplaced_nodes_are_grey() {
        let mut g = Graph::new();
        g.add_named_node(GraphId::ROOT, "c", "Const", None).unwrap();
        let dot = emit_dot(&g);
        assert!(dot.contains("fillcolor=gray85"));
        assert!(dot.contains("unplaced"));
    }

    #[test]
    fn deterministic_output() {
        assert_eq!(emit_dot(&placed()), emit_dot(&placed()));
    }
}
