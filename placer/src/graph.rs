// graph.rs — Colocation graph model
//
// Arena-allocated nodes, edges, subgraphs and control-flow frames. The root
// graph and every branch/body function share one arena so that colocation
// constraints (and the union-find built over them) span frame boundaries
// without pointer cycles.
//
// Preconditions: none; a fresh `Graph` holds only the empty root subgraph.
// Postconditions: every node belongs to exactly one subgraph; data edges never
//                 cross subgraphs (values enter a branch only through the
//                 capture edges created by `lower_frame`).
// Failure modes: references to missing, removed or out-of-scope items fail
//                with `PlacementError::InvalidReference`.
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::ast::Span;
use crate::device::DeviceSpec;
use crate::error::{FrameContext, PlacementError, Result};
use crate::id::{EdgeId, FrameId, GraphId, IdAllocator, NodeId};
use crate::registry::OpRegistry;

// ── Public types ────────────────────────────────────────────────────────────

/// Value type carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Tensor,
    /// A stateful resource handle. Handle edges are hard colocation
    /// constraints.
    Handle,
}

/// Which control-flow construct a frame lowers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Cond,
    While,
}

impl FrameKind {
    /// Operation kind of the node standing for the frame in its parent.
    pub fn op_name(self) -> &'static str {
        match self {
            FrameKind::Cond => "If",
            FrameKind::While => "While",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Cond => write!(f, "if"),
            FrameKind::While => write!(f, "while"),
        }
    }
}

/// What a node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Op,
    /// Input parameter `index` of a branch/body subgraph.
    Param { index: usize },
    /// The call site of a lowered frame in its parent graph.
    Frame(FrameId),
}

/// Operation kind used for parameter nodes.
pub const PARAM_OP: &str = "_Arg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Data,
    /// Carries a captured value into parameter `index` of `branch`.
    Capture { frame: FrameId, branch: usize },
}

/// An operation instance.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: String,
    pub graph: GraphId,
    pub role: NodeRole,
    pub inputs: Vec<EdgeId>,
    pub outputs: Vec<EdgeId>,
    /// Explicit device request, possibly partial.
    pub requested_device: Option<DeviceSpec>,
    /// Value kind of the node's output.
    pub output: ValueKind,
    /// For handle consumers: the node that originally produced the handle.
    pub handle_source: Option<NodeId>,
    /// Colocation group (smallest member id), set by resolution.
    pub group: Option<NodeId>,
    /// Device chosen by resolution.
    pub assigned_device: Option<DeviceSpec>,
    pub span: Option<Span>,
    pub live: bool,
}

impl Node {
    pub fn produces_handle(&self) -> bool {
        self.output == ValueKind::Handle
    }

    pub fn consumes_handle(&self) -> bool {
        self.handle_source.is_some()
    }

    pub fn is_param(&self) -> bool {
        matches!(self.role, NodeRole::Param { .. })
    }
}

/// A directed value edge.
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub value: ValueKind,
    /// The value kind was given by the caller rather than inferred.
    pub declared: bool,
    pub kind: EdgeKind,
    pub live: bool,
}

impl Edge {
    pub fn is_handle(&self) -> bool {
        self.value == ValueKind::Handle
    }
}

/// The root graph or one branch/body function.
#[derive(Debug, Clone)]
pub struct Subgraph {
    pub id: GraphId,
    pub name: String,
    pub nodes: Vec<NodeId>,
    pub params: Vec<NodeId>,
    pub returns: Vec<NodeId>,
    /// Frame and branch index this subgraph was lowered into.
    pub owner: Option<(FrameId, usize)>,
}

/// One lowered control-flow construct.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub kind: FrameKind,
    /// Call-site node in the enclosing graph.
    pub node: NodeId,
    /// Enclosing graph.
    pub graph: GraphId,
    /// Frame whose branch encloses this one.
    pub parent: Option<FrameId>,
    /// Captured values, in parameter order.
    pub captures: Vec<NodeId>,
    pub branches: Vec<GraphId>,
}

/// Arguments of `Graph::lower_frame`.
#[derive(Debug, Clone)]
pub struct FrameDef<'a> {
    pub kind: FrameKind,
    pub name: &'a str,
    /// Plain data inputs of the call site (predicate, loop bounds).
    pub inputs: &'a [NodeId],
    pub captures: &'a [NodeId],
    pub branches: &'a [GraphId],
    pub device: Option<DeviceSpec>,
}

/// The placement graph.
#[derive(Debug, Clone)]
pub struct Graph {
    registry: Arc<OpRegistry>,
    ids: IdAllocator,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    subgraphs: Vec<Subgraph>,
    frames: Vec<Frame>,
    colocations: BTreeSet<(NodeId, NodeId)>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

// ── Construction ────────────────────────────────────────────────────────────

impl Graph {
    /// A graph using the built-in operation registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(OpRegistry::with_builtins()))
    }

    pub fn with_registry(registry: Arc<OpRegistry>) -> Self {
        let mut ids = IdAllocator::new();
        let root = ids.alloc_graph();
        Graph {
            registry,
            ids,
            nodes: Vec::new(),
            edges: Vec::new(),
            subgraphs: vec![Subgraph {
                id: root,
                name: "main".to_string(),
                nodes: Vec::new(),
                params: Vec::new(),
                returns: Vec::new(),
                owner: None,
            }],
            frames: Vec::new(),
            colocations: BTreeSet::new(),
        }
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    /// Create an empty, not yet lowered branch/body subgraph.
    pub fn add_subgraph(&mut self, name: &str) -> GraphId {
        let id = self.ids.alloc_graph();
        self.subgraphs.push(Subgraph {
            id,
            name: name.to_string(),
            nodes: Vec::new(),
            params: Vec::new(),
            returns: Vec::new(),
            owner: None,
        });
        id
    }

    /// Add an operation node with a generated name.
    pub fn add_node(
        &mut self,
        graph: GraphId,
        op: &str,
        device: Option<DeviceSpec>,
    ) -> Result<NodeId> {
        let name = format!("{}_{}", op, self.nodes.len());
        self.add_named_node(graph, &name, op, device)
    }

    /// Add an operation node.
    pub fn add_named_node(
        &mut self,
        graph: GraphId,
        name: &str,
        op: &str,
        device: Option<DeviceSpec>,
    ) -> Result<NodeId> {
        self.check_graph(graph)?;
        let output = match self.registry.output_kind(op) {
            Some(kind) if kind.produces_handle() => ValueKind::Handle,
            _ => ValueKind::Tensor,
        };
        Ok(self.push_node(graph, name, op, NodeRole::Op, output, device))
    }

    /// Append an input parameter to a branch/body subgraph.
    pub fn add_param(&mut self, graph: GraphId, name: &str) -> Result<NodeId> {
        self.check_graph(graph)?;
        if graph == GraphId::ROOT {
            return Err(PlacementError::invalid("the root graph takes no parameters"));
        }
        if self.subgraphs[graph.index()].owner.is_some() {
            return Err(PlacementError::invalid(format!(
                "subgraph '{}' is already lowered into a frame",
                self.subgraphs[graph.index()].name
            )));
        }
        let index = self.subgraphs[graph.index()].params.len();
        let id = self.push_node(
            graph,
            name,
            PARAM_OP,
            NodeRole::Param { index },
            ValueKind::Tensor,
            None,
        );
        self.subgraphs[graph.index()].params.push(id);
        Ok(id)
    }

    /// Declare the values a branch/body subgraph returns.
    pub fn set_returns(&mut self, graph: GraphId, values: &[NodeId]) -> Result<()> {
        self.check_graph(graph)?;
        for &v in values {
            self.check_in_graph(v, graph)?;
        }
        self.subgraphs[graph.index()].returns = values.to_vec();
        Ok(())
    }

    pub fn set_span(&mut self, node: NodeId, span: Span) -> Result<()> {
        self.check_node(node)?;
        self.nodes[node.index()].span = Some(span);
        Ok(())
    }

    /// Add a data edge whose value kind follows the producer's output.
    pub fn add_edge(&mut self, source: NodeId, target: NodeId) -> Result<EdgeId> {
        self.check_data_edge(source, target)?;
        let value = self.nodes[source.index()].output;
        Ok(self.push_edge(source, target, value, false, EdgeKind::Data))
    }

    /// Add a data edge with an explicitly declared value kind.
    pub fn add_typed_edge(
        &mut self,
        source: NodeId,
        target: NodeId,
        value: ValueKind,
    ) -> Result<EdgeId> {
        self.check_data_edge(source, target)?;
        Ok(self.push_edge(source, target, value, true, EdgeKind::Data))
    }

    /// Explicit "colocate with" directive. Symmetric and idempotent.
    pub fn request_colocation(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        self.check_node(a)?;
        self.check_node(b)?;
        if a != b {
            self.colocations.insert((a.min(b), a.max(b)));
        }
        Ok(())
    }

    /// Lower a conditional or loop into `parent`: creates the call-site node,
    /// connects inputs and captures to it, and wires capture `i` into
    /// parameter `i` of every branch.
    pub fn lower_frame(&mut self, parent: GraphId, def: FrameDef<'_>) -> Result<FrameId> {
        self.check_graph(parent)?;
        if def.branches.is_empty() {
            return Err(PlacementError::invalid(format!(
                "frame '{}' has no branches",
                def.name
            )));
        }
        let ancestors = self.enclosing_graphs(parent);
        let mut seen = BTreeSet::new();
        for (b, &branch) in def.branches.iter().enumerate() {
            self.check_graph(branch)?;
            let sub = &self.subgraphs[branch.index()];
            if branch == GraphId::ROOT || ancestors.contains(&branch) {
                return Err(PlacementError::invalid(format!(
                    "frame '{}' branch {} would enclose its own parent graph",
                    def.name, b
                )));
            }
            if sub.owner.is_some() || !seen.insert(branch) {
                return Err(PlacementError::invalid(format!(
                    "subgraph '{}' is already lowered into a frame",
                    sub.name
                )));
            }
            if sub.params.len() != def.captures.len() {
                return Err(PlacementError::invalid(format!(
                    "branch {} of frame '{}' declares {} parameter(s) but {} value(s) are captured",
                    b,
                    def.name,
                    sub.params.len(),
                    def.captures.len()
                )));
            }
        }
        for &v in def.inputs.iter().chain(def.captures) {
            self.check_in_graph(v, parent)?;
        }

        let frame = self.ids.alloc_frame();
        let node = self.push_node(
            parent,
            def.name,
            def.kind.op_name(),
            NodeRole::Frame(frame),
            ValueKind::Tensor,
            def.device,
        );
        for &input in def.inputs {
            let value = self.nodes[input.index()].output;
            self.push_edge(input, node, value, false, EdgeKind::Data);
        }
        for &capture in def.captures {
            let value = self.nodes[capture.index()].output;
            self.push_edge(capture, node, value, false, EdgeKind::Data);
        }
        for (b, &branch) in def.branches.iter().enumerate() {
            let params = self.subgraphs[branch.index()].params.clone();
            for (&capture, &param) in def.captures.iter().zip(&params) {
                let value = self.nodes[capture.index()].output;
                self.nodes[param.index()].output = value;
                self.push_edge(capture, param, value, false, EdgeKind::Capture { frame, branch: b });
            }
            self.subgraphs[branch.index()].owner = Some((frame, b));
        }

        let parent_frame = self.subgraphs[parent.index()].owner.map(|(f, _)| f);
        for inner in self.frames.iter_mut() {
            if def.branches.contains(&inner.graph) {
                inner.parent = Some(frame);
            }
        }
        self.frames.push(Frame {
            id: frame,
            kind: def.kind,
            node,
            graph: parent,
            parent: parent_frame,
            captures: def.captures.to_vec(),
            branches: def.branches.to_vec(),
        });
        tracing::trace!(frame = %frame, name = def.name, branches = def.branches.len(), "lowered frame");
        Ok(frame)
    }

    fn push_node(
        &mut self,
        graph: GraphId,
        name: &str,
        op: &str,
        role: NodeRole,
        output: ValueKind,
        device: Option<DeviceSpec>,
    ) -> NodeId {
        let id = self.ids.alloc_node();
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            op: op.to_string(),
            graph,
            role,
            inputs: Vec::new(),
            outputs: Vec::new(),
            requested_device: device,
            output,
            handle_source: None,
            group: None,
            assigned_device: None,
            span: None,
            live: true,
        });
        self.subgraphs[graph.index()].nodes.push(id);
        id
    }

    fn push_edge(
        &mut self,
        source: NodeId,
        target: NodeId,
        value: ValueKind,
        declared: bool,
        kind: EdgeKind,
    ) -> EdgeId {
        let id = self.ids.alloc_edge();
        self.edges.push(Edge {
            id,
            source,
            target,
            value,
            declared,
            kind,
            live: true,
        });
        self.nodes[source.index()].outputs.push(id);
        self.nodes[target.index()].inputs.push(id);
        id
    }

    /// `graph` and every graph enclosing it, innermost first.
    fn enclosing_graphs(&self, graph: GraphId) -> Vec<GraphId> {
        let mut chain = vec![graph];
        let mut current = graph;
        while let Some((frame, _)) = self.subgraphs[current.index()].owner {
            current = self.frames[frame.index()].graph;
            if chain.contains(&current) {
                break;
            }
            chain.push(current);
        }
        chain
    }
}

// ── Checks ──────────────────────────────────────────────────────────────────

impl Graph {
    fn check_graph(&self, graph: GraphId) -> Result<()> {
        if graph.index() < self.subgraphs.len() {
            Ok(())
        } else {
            Err(PlacementError::invalid(format!("subgraph {graph} does not exist")))
        }
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        match self.nodes.get(node.index()) {
            Some(n) if n.live => Ok(()),
            Some(n) => Err(PlacementError::invalid(format!(
                "node '{}' ({node}) has been removed",
                n.name
            ))),
            None => Err(PlacementError::invalid(format!("node {node} does not exist"))),
        }
    }

    fn check_edge(&self, edge: EdgeId) -> Result<()> {
        match self.edges.get(edge.index()) {
            Some(e) if e.live => Ok(()),
            Some(_) => Err(PlacementError::invalid(format!("edge e{} has been removed", edge.0))),
            None => Err(PlacementError::invalid(format!("edge e{} does not exist", edge.0))),
        }
    }

    fn check_in_graph(&self, node: NodeId, graph: GraphId) -> Result<()> {
        self.check_node(node)?;
        let n = &self.nodes[node.index()];
        if n.graph != graph {
            return Err(PlacementError::invalid(format!(
                "node '{}' belongs to subgraph '{}', not '{}'",
                n.name,
                self.subgraphs[n.graph.index()].name,
                self.subgraphs[graph.index()].name
            )));
        }
        Ok(())
    }

    fn check_data_edge(&self, source: NodeId, target: NodeId) -> Result<()> {
        self.check_node(source)?;
        self.check_node(target)?;
        let (s, t) = (&self.nodes[source.index()], &self.nodes[target.index()]);
        if s.graph != t.graph {
            return Err(PlacementError::invalid(format!(
                "edge '{}' -> '{}' crosses a frame boundary; capture the value instead",
                s.name, t.name
            )));
        }
        if t.is_param() {
            return Err(PlacementError::invalid(format!(
                "parameter '{}' only receives captured values",
                t.name
            )));
        }
        Ok(())
    }
}

// ── Queries ─────────────────────────────────────────────────────────────────

impl Graph {
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.check_node(id)?;
        Ok(&self.nodes[id.index()])
    }

    pub fn edge(&self, id: EdgeId) -> Result<&Edge> {
        self.check_edge(id)?;
        Ok(&self.edges[id.index()])
    }

    pub fn subgraph(&self, id: GraphId) -> Result<&Subgraph> {
        self.check_graph(id)?;
        Ok(&self.subgraphs[id.index()])
    }

    pub fn frame(&self, id: FrameId) -> Result<&Frame> {
        self.frames
            .get(id.index())
            .ok_or_else(|| PlacementError::invalid(format!("frame {id} does not exist")))
    }

    /// Live nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.live)
    }

    /// Live edges in id order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|e| e.live)
    }

    pub fn subgraphs(&self) -> &[Subgraph] {
        &self.subgraphs
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Explicit colocation directives as (smaller, larger) id pairs.
    pub fn colocations(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.colocations.iter().copied()
    }

    /// Arena size, including removed nodes. Union-find structures are sized
    /// by this.
    pub fn node_capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn live_node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn name(&self, id: NodeId) -> &str {
        self.nodes
            .get(id.index())
            .map(|n| n.name.as_str())
            .unwrap_or("<missing>")
    }

    /// Live input edges of `node`. Unknown ids have none.
    pub fn input_edges(&self, node: NodeId) -> impl Iterator<Item = &Edge> {
        self.nodes
            .get(node.index())
            .into_iter()
            .flat_map(|n| n.inputs.iter())
            .map(|e| &self.edges[e.index()])
            .filter(|e| e.live)
    }

    /// Live output edges of `node`.
    pub fn output_edges(&self, node: NodeId) -> impl Iterator<Item = &Edge> {
        self.nodes
            .get(node.index())
            .into_iter()
            .flat_map(|n| n.outputs.iter())
            .map(|e| &self.edges[e.index()])
            .filter(|e| e.live)
    }

    /// A handle data edge that forces its endpoints onto one device. Handles
    /// entering a device-boundary op are read across devices.
    pub fn is_colocating_edge(&self, edge: &Edge) -> bool {
        edge.live
            && edge.is_handle()
            && edge.kind == EdgeKind::Data
            && !self
                .nodes
                .get(edge.target.index())
                .is_some_and(|n| n.role == NodeRole::Op && self.registry.is_device_boundary(&n.op))
    }

    /// The edge delivering capture `index` into `param`.
    pub fn capture_edge(&self, param: NodeId) -> Option<&Edge> {
        self.input_edges(param)
            .find(|e| matches!(e.kind, EdgeKind::Capture { .. }))
    }

    /// Frame and branch that `node`'s subgraph was lowered into.
    pub fn frame_context(&self, node: NodeId) -> Option<FrameContext> {
        let n = self.nodes.get(node.index())?;
        let (frame, branch) = self.subgraphs[n.graph.index()].owner?;
        let frame_node = self.frames[frame.index()].node;
        Some(FrameContext {
            frame,
            frame_name: self.name(frame_node).to_string(),
            branch,
        })
    }

    /// Frames in parent-before-child order, computed with an explicit
    /// worklist so nesting depth is not bounded by the call stack.
    pub fn frames_outermost_first(&self) -> Vec<FrameId> {
        let mut order = Vec::with_capacity(self.frames.len());
        let mut queue: std::collections::VecDeque<FrameId> = self
            .frames
            .iter()
            .filter(|f| f.parent.is_none())
            .map(|f| f.id)
            .collect();
        while let Some(frame) = queue.pop_front() {
            order.push(frame);
            queue.extend(
                self.frames
                    .iter()
                    .filter(|f| f.parent == Some(frame))
                    .map(|f| f.id),
            );
        }
        order
    }
}

// ── Placement state (written by the passes) ─────────────────────────────────

impl Graph {
    pub(crate) fn set_output_kind(&mut self, node: NodeId, value: ValueKind) {
        self.nodes[node.index()].output = value;
    }

    pub(crate) fn set_edge_value(&mut self, edge: EdgeId, value: ValueKind) {
        self.edges[edge.index()].value = value;
    }

    pub(crate) fn set_handle_source(&mut self, node: NodeId, source: Option<NodeId>) {
        self.nodes[node.index()].handle_source = source;
    }

    pub(crate) fn set_group(&mut self, node: NodeId, group: Option<NodeId>) {
        self.nodes[node.index()].group = group;
    }

    /// Record the device a node runs on. Resolution does this for every
    /// node; execution engines and tests may set it directly.
    pub fn assign_device(&mut self, node: NodeId, device: Option<DeviceSpec>) -> Result<()> {
        self.check_node(node)?;
        self.nodes[node.index()].assigned_device = device;
        Ok(())
    }

    /// Forget all group and device assignments.
    pub fn clear_placement(&mut self) {
        for node in self.nodes.iter_mut() {
            node.group = None;
            node.assigned_device = None;
        }
    }
}

// ── Rewrite primitives ──────────────────────────────────────────────────────
//
// Used by optimization passes between placement and execution. Each of them
// may break group invariants; callers must run `validate::reconcile`
// afterwards.

impl Graph {
    fn check_rewritable(&self, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        let n = &self.nodes[node.index()];
        if n.role != NodeRole::Op {
            return Err(PlacementError::invalid(format!(
                "'{}' is a parameter or frame call site and cannot be rewritten",
                n.name
            )));
        }
        Ok(())
    }

    /// Copy an operation node with the same inputs, device request and
    /// colocation directives. The copy has no outputs and no placement.
    pub fn duplicate_node(&mut self, node: NodeId) -> Result<NodeId> {
        self.check_rewritable(node)?;
        let original = self.nodes[node.index()].clone();
        let name = format!("{}/dup{}", original.name, self.nodes.len());
        let copy = self.push_node(
            original.graph,
            &name,
            &original.op,
            NodeRole::Op,
            original.output,
            original.requested_device.clone(),
        );
        self.nodes[copy.index()].span = original.span;
        for edge_id in original.inputs {
            let e = self.edges[edge_id.index()].clone();
            if e.live {
                self.push_edge(e.source, copy, e.value, e.declared, e.kind);
            }
        }
        let peers: Vec<NodeId> = self
            .colocations
            .iter()
            .filter_map(|&(a, b)| {
                if a == node {
                    Some(b)
                } else if b == node {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        for peer in peers {
            self.colocations.insert((peer.min(copy), peer.max(copy)));
        }
        Ok(copy)
    }

    /// Point an existing data edge at a different producer in the same
    /// subgraph.
    pub fn redirect_input(&mut self, edge: EdgeId, new_source: NodeId) -> Result<()> {
        self.check_edge(edge)?;
        self.check_node(new_source)?;
        let e = self.edges[edge.index()].clone();
        if e.kind != EdgeKind::Data {
            return Err(PlacementError::invalid(format!(
                "edge e{} is a capture edge and cannot be redirected",
                edge.0
            )));
        }
        self.check_in_graph(new_source, self.nodes[e.target.index()].graph)?;
        self.nodes[e.source.index()].outputs.retain(|&x| x != edge);
        self.nodes[new_source.index()].outputs.push(edge);
        let value = if e.declared {
            e.value
        } else {
            self.nodes[new_source.index()].output
        };
        let slot = &mut self.edges[edge.index()];
        slot.source = new_source;
        slot.value = value;
        Ok(())
    }

    /// Move a capture edge's source to `new_source` in the same enclosing
    /// graph. The parameter and frame binding are unchanged.
    fn redirect_capture(&mut self, edge: EdgeId, new_source: NodeId) {
        let old_source = self.edges[edge.index()].source;
        self.nodes[old_source.index()].outputs.retain(|&x| x != edge);
        self.nodes[new_source.index()].outputs.push(edge);
        let slot = &mut self.edges[edge.index()];
        slot.source = new_source;
        if !slot.declared {
            slot.value = self.nodes[new_source.index()].output;
        }
    }

    /// Delete an operation node and every edge touching it.
    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        self.check_rewritable(node)?;
        let graph = self.nodes[node.index()].graph;
        if self.subgraphs[graph.index()].returns.contains(&node) {
            return Err(PlacementError::invalid(format!(
                "'{}' is returned from its subgraph and cannot be removed",
                self.nodes[node.index()].name
            )));
        }
        let touching: Vec<EdgeId> = self.nodes[node.index()]
            .inputs
            .iter()
            .chain(&self.nodes[node.index()].outputs)
            .copied()
            .collect();
        for edge in touching {
            let (source, target) = {
                let e = &mut self.edges[edge.index()];
                e.live = false;
                (e.source, e.target)
            };
            self.nodes[source.index()].outputs.retain(|&x| x != edge);
            self.nodes[target.index()].inputs.retain(|&x| x != edge);
        }
        self.colocations.retain(|&(a, b)| a != node && b != node);
        self.subgraphs[graph.index()].nodes.retain(|&x| x != node);
        self.nodes[node.index()].live = false;
        Ok(())
    }

    /// Replace `remove` by `keep`: consumers and colocation directives move
    /// to `keep`, then `remove` is deleted.
    pub fn merge_nodes(&mut self, keep: NodeId, remove: NodeId) -> Result<()> {
        self.check_rewritable(keep)?;
        self.check_rewritable(remove)?;
        if keep == remove {
            return Err(PlacementError::invalid("cannot merge a node into itself"));
        }
        let graph = self.nodes[remove.index()].graph;
        self.check_in_graph(keep, graph)?;

        let outputs = self.nodes[remove.index()].outputs.clone();
        for edge in outputs {
            match self.edges[edge.index()].kind {
                EdgeKind::Data => self.redirect_input(edge, keep)?,
                // Branch parameters stay bound to the frame's captured value.
                EdgeKind::Capture { .. } => self.redirect_capture(edge, keep),
            }
        }
        for frame in self.frames.iter_mut().filter(|f| f.graph == graph) {
            for slot in frame.captures.iter_mut() {
                if *slot == remove {
                    *slot = keep;
                }
            }
        }
        for slot in self.subgraphs[graph.index()].returns.iter_mut() {
            if *slot == remove {
                *slot = keep;
            }
        }
        let peers: Vec<NodeId> = self
            .colocations
            .iter()
            .filter_map(|&(a, b)| {
                if a == remove {
                    Some(b)
                } else if b == remove {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        for peer in peers {
            if peer != keep {
                self.colocations.insert((peer.min(keep), peer.max(keep)));
            }
        }
        self.remove_node(remove)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph ({} nodes, {} subgraphs, {} frames)",
            self.live_node_count(),
            self.subgraphs.len(),
            self.frames.len()
        )?;
        for sub in &self.subgraphs {
            match sub.owner {
                Some((frame, branch)) => writeln!(
                    f,
                    "  {} [{} '{}' branch {}]",
                    sub.name,
                    self.frames[frame.index()].kind,
                    self.name(self.frames[frame.index()].node),
                    branch
                )?,
                None => writeln!(f, "  {}", sub.name)?,
            }
            for &id in &sub.nodes {
                let node = &self.nodes[id.index()];
                let inputs: Vec<&str> = self
                    .input_edges(id)
                    .map(|e| self.name(e.source))
                    .collect();
                write!(f, "    {} = {}({})", node.name, node.op, inputs.join(", "))?;
                if node.produces_handle() {
                    write!(f, " handle")?;
                }
                if let Some(req) = &node.requested_device {
                    write!(f, " @\"{req}\"")?;
                }
                if let Some(dev) = &node.assigned_device {
                    write!(f, " => {dev}")?;
                }
                writeln!(f)?;
            }
            if !sub.returns.is_empty() {
                let rets: Vec<&str> = sub.returns.iter().map(|&r| self.name(r)).collect();
                writeln!(f, "    return {}", rets.join(", "))?;
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
