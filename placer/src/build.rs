// build.rs — Graph construction from a parsed graph description
//
// Walks the AST and issues graph API calls: nodes, edges, colocation
// directives, and frame lowering for `if`/`while` blocks. Branch bodies are
// built into their own subgraphs before the frame that owns them is lowered,
// so nested frames are re-parented by `Graph::lower_frame`.
//
// Scoping: every branch body is a fresh lexical environment holding only its
// parameters; outer values must be captured. `device` and `colocate_with`
// blocks do not open an environment and extend lexically into branch bodies.
// A frame's own `@"device"` applies to the frame's call-site node only.
//
// Preconditions: `program` is a well-formed AST from the parser.
// Postconditions: returns the graph, the `set` configuration, and all
//                 accumulated diagnostics. Statements with errors are
//                 skipped; building continues past them.
// Failure modes: undefined or duplicate names, malformed device strings,
//                branch arity mismatches and misplaced `return` produce
//                `Diagnostic` entries.
// Side effects: logs a warning per unknown operation kind.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::*;
use crate::config::PlacementConfig;
use crate::device::DeviceSpec;
use crate::diag::{codes, DiagCode, Diagnostic};
use crate::error::PlacementError;
use crate::graph::{FrameDef, Graph};
use crate::id::{GraphId, NodeId};
use crate::registry::OpRegistry;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BuildResult {
    pub graph: Graph,
    pub config: PlacementConfig,
    pub diagnostics: Vec<Diagnostic>,
}

/// Build a graph from a parsed description.
pub fn build_graph(program: &Program, registry: Arc<OpRegistry>) -> BuildResult {
    let config = PlacementConfig::from_program(program);
    let mut ctx = BuildCtx {
        graph: Graph::with_registry(registry),
        diagnostics: config.diagnostics,
        devices: Vec::new(),
        colocations: Vec::new(),
    };
    let mut env = Env::root();
    ctx.build_body(&mut env, &program.statements, true);
    BuildResult {
        graph: ctx.graph,
        config: config.config,
        diagnostics: ctx.diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

/// One lexical environment: the root graph or a branch body.
struct Env {
    graph: GraphId,
    /// Prepended to local names to form graph-unique node names.
    prefix: String,
    values: HashMap<String, (NodeId, Span)>,
    in_branch: bool,
    returns: Option<(Vec<NodeId>, Span)>,
}

impl Env {
    fn root() -> Self {
        Env {
            graph: GraphId::ROOT,
            prefix: String::new(),
            values: HashMap::new(),
            in_branch: false,
            returns: None,
        }
    }

    fn branch(graph: GraphId, prefix: String) -> Self {
        Env {
            graph,
            prefix,
            values: HashMap::new(),
            in_branch: true,
            returns: None,
        }
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

struct BuildCtx {
    graph: Graph,
    diagnostics: Vec<Diagnostic>,
    /// Effective device of each enclosing `device` block; `None` clears.
    devices: Vec<Option<DeviceSpec>>,
    /// Targets of enclosing `colocate_with` blocks.
    colocations: Vec<NodeId>,
}

impl BuildCtx {
    fn error(&mut self, span: Span, code: DiagCode, message: String) {
        self.diagnostics
            .push(Diagnostic::error(Some(span), message).with_code(code));
    }

    fn graph_error(&mut self, span: Span, err: PlacementError) {
        self.diagnostics
            .push(Diagnostic::error(Some(span), err.to_string()).with_code(err.code()));
    }

    fn scope_device(&self) -> Option<&DeviceSpec> {
        self.devices.last().and_then(Option::as_ref)
    }

    fn parse_device(&mut self, lit: &StringLit) -> Option<DeviceSpec> {
        match DeviceSpec::parse(&lit.value) {
            Ok(spec) => Some(spec),
            Err(e) => {
                self.error(lit.span, codes::E0004, e.to_string());
                None
            }
        }
    }

    /// Device request for a node: its own attribute refined over the
    /// enclosing `device` block.
    fn request(&mut self, attr: Option<&StringLit>) -> Option<DeviceSpec> {
        let own = attr.and_then(|lit| self.parse_device(lit));
        match (self.scope_device(), own) {
            (Some(scope), Some(own)) => Some(scope.overridden_by(&own)),
            (Some(scope), None) => Some(scope.clone()),
            (None, own) => own,
        }
    }

    fn lookup(&mut self, env: &Env, ident: &Ident) -> Option<NodeId> {
        if let Some(&(id, _)) = env.values.get(&ident.name) {
            return Some(id);
        }
        let mut diag = Diagnostic::error(
            Some(ident.span),
            format!("undefined value '{}'", ident.name),
        )
        .with_code(codes::E0002);
        if env.in_branch {
            diag = diag.with_hint("values from an enclosing graph must be captured");
        }
        self.diagnostics.push(diag);
        None
    }

    fn lookup_all(&mut self, env: &Env, idents: &[Ident]) -> Option<Vec<NodeId>> {
        let mut ids = Vec::with_capacity(idents.len());
        let mut ok = true;
        for ident in idents {
            match self.lookup(env, ident) {
                Some(id) => ids.push(id),
                None => ok = false,
            }
        }
        ok.then_some(ids)
    }

    /// Reports a duplicate and returns false if `name` is already bound.
    fn check_fresh(&mut self, env: &Env, name: &Ident) -> bool {
        if let Some(&(_, first)) = env.values.get(&name.name) {
            self.error(
                name.span,
                codes::E0003,
                format!(
                    "duplicate value '{}' (first defined at offset {})",
                    name.name, first.start
                ),
            );
            return false;
        }
        true
    }

    /// Span, enclosing `colocate_with` targets, binding.
    fn finish_node(&mut self, env: &mut Env, name: &Ident, node: NodeId) {
        if let Err(e) = self.graph.set_span(node, name.span) {
            self.graph_error(name.span, e);
        }
        for i in 0..self.colocations.len() {
            let target = self.colocations[i];
            if let Err(e) = self.graph.request_colocation(target, node) {
                self.graph_error(name.span, e);
            }
        }
        env.values.insert(name.name.clone(), (node, name.span));
    }

    // ── Statements ──────────────────────────────────────────────────────

    fn build_body(&mut self, env: &mut Env, statements: &[Statement], top_level: bool) {
        for stmt in statements {
            match &stmt.kind {
                StatementKind::Set(set) => {
                    if !top_level {
                        self.error(
                            stmt.span,
                            codes::E0006,
                            format!("'set {}' is only allowed at top level", set.name.name),
                        );
                    }
                }
                StatementKind::Node(node) => self.build_node(env, node),
                StatementKind::Frame(frame) => self.build_frame(env, frame),
                StatementKind::DeviceScope(scope) => {
                    let Some(spec) = self.parse_device(&scope.device) else {
                        continue;
                    };
                    let effective = if spec.is_empty() {
                        None
                    } else {
                        Some(match self.scope_device() {
                            Some(outer) => outer.overridden_by(&spec),
                            None => spec,
                        })
                    };
                    self.devices.push(effective);
                    self.build_body(env, &scope.body, false);
                    self.devices.pop();
                }
                StatementKind::ColocateScope(scope) => {
                    let Some(target) = self.lookup(env, &scope.target) else {
                        continue;
                    };
                    self.colocations.push(target);
                    self.build_body(env, &scope.body, false);
                    self.colocations.pop();
                }
                StatementKind::Colocate(colocate) => {
                    let Some(ids) = self.lookup_all(env, &colocate.nodes) else {
                        continue;
                    };
                    for &other in &ids[1..] {
                        if let Err(e) = self.graph.request_colocation(ids[0], other) {
                            self.graph_error(stmt.span, e);
                        }
                    }
                }
                StatementKind::Return(ret) => self.build_return(env, ret, stmt.span),
            }
        }
    }

    fn build_node(&mut self, env: &mut Env, stmt: &NodeStmt) {
        if !self.check_fresh(env, &stmt.name) {
            return;
        }
        let op = stmt.op.name.as_str();
        if self.graph.registry().lookup(op).is_none() {
            tracing::warn!(op, node = %stmt.name.name, "unknown operation kind");
            self.diagnostics.push(
                Diagnostic::warning(
                    Some(stmt.op.span),
                    format!("unknown operation '{op}', output treated as a tensor"),
                )
                .with_code(codes::W0100),
            );
        }
        let request = self.request(stmt.device.as_ref());
        let inputs: Vec<Option<NodeId>> =
            stmt.inputs.iter().map(|i| self.lookup(env, i)).collect();

        let node = match self
            .graph
            .add_named_node(env.graph, &env.qualify(&stmt.name.name), op, request)
        {
            Ok(node) => node,
            Err(e) => return self.graph_error(stmt.name.span, e),
        };
        for (ident, input) in stmt.inputs.iter().zip(inputs) {
            if let Some(source) = input {
                if let Err(e) = self.graph.add_edge(source, node) {
                    self.graph_error(ident.span, e);
                }
            }
        }
        self.finish_node(env, &stmt.name, node);
    }

    fn build_frame(&mut self, env: &mut Env, stmt: &FrameStmt) {
        if !self.check_fresh(env, &stmt.name) {
            return;
        }
        let inputs = self.lookup_all(env, &stmt.inputs);
        let captures = self.lookup_all(env, &stmt.captures);
        let request = self.request(stmt.device.as_ref());
        let frame_name = env.qualify(&stmt.name.name);

        let mut branch_names: HashMap<&str, Span> = HashMap::new();
        let mut branches = Vec::with_capacity(stmt.branches.len());
        let mut ok = inputs.is_some() && captures.is_some();
        for branch in &stmt.branches {
            if let Some(first) = branch_names.insert(&branch.name.name, branch.name.span) {
                self.error(
                    branch.name.span,
                    codes::E0003,
                    format!(
                        "duplicate branch '{}' (first defined at offset {})",
                        branch.name.name, first.start
                    ),
                );
                ok = false;
                continue;
            }
            if branch.params.len() != stmt.captures.len() {
                self.diagnostics.push(
                    Diagnostic::error(
                        Some(branch.span),
                        format!(
                            "branch '{}' of '{}' declares {} parameter(s) but {} value(s) are captured",
                            branch.name.name,
                            stmt.name.name,
                            branch.params.len(),
                            stmt.captures.len()
                        ),
                    )
                    .with_code(codes::E0007)
                    .with_related(Some(stmt.name.span), "frame defined here"),
                );
                ok = false;
                continue;
            }
            branches.push(self.build_branch(&frame_name, branch));
        }
        if stmt.branches.is_empty() {
            self.error(
                stmt.name.span,
                codes::E0007,
                format!("'{}' has no branches", stmt.name.name),
            );
            ok = false;
        }
        let (Some(inputs), Some(captures), true) = (inputs, captures, ok) else {
            return;
        };

        let lowered = self.graph.lower_frame(
            env.graph,
            FrameDef {
                kind: stmt.kind,
                name: &frame_name,
                inputs: &inputs,
                captures: &captures,
                branches: &branches,
                device: request,
            },
        );
        let node = match lowered.and_then(|frame| self.graph.frame(frame).map(|f| f.node)) {
            Ok(node) => node,
            Err(e) => return self.graph_error(stmt.name.span, e),
        };
        self.finish_node(env, &stmt.name, node);
    }

    /// Build one branch body into a fresh subgraph and return it, not yet
    /// lowered.
    fn build_branch(&mut self, frame_name: &str, branch: &Branch) -> GraphId {
        let sub_name = format!("{}/{}", frame_name, branch.name.name);
        let graph = self.graph.add_subgraph(&sub_name);
        let mut env = Env::branch(graph, format!("{sub_name}/"));
        for param in &branch.params {
            if !self.check_fresh(&env, param) {
                continue;
            }
            match self.graph.add_param(graph, &env.qualify(&param.name)) {
                Ok(node) => {
                    if let Err(e) = self.graph.set_span(node, param.span) {
                        self.graph_error(param.span, e);
                    }
                    env.values.insert(param.name.clone(), (node, param.span));
                }
                Err(e) => self.graph_error(param.span, e),
            }
        }

        self.build_body(&mut env, &branch.body, false);

        if let Some((values, span)) = env.returns.take() {
            if let Err(e) = self.graph.set_returns(graph, &values) {
                self.graph_error(span, e);
            }
        }
        graph
    }

    fn build_return(&mut self, env: &mut Env, stmt: &ReturnStmt, span: Span) {
        if !env.in_branch {
            self.error(span, codes::E0005, "'return' outside a branch".to_string());
            return;
        }
        if let Some((_, first)) = &env.returns {
            let first = *first;
            self.diagnostics.push(
                Diagnostic::error(Some(span), "branch already returned".to_string())
                    .with_code(codes::E0005)
                    .with_related(Some(first), "first return here"),
            );
            return;
        }
        if let Some(values) = self.lookup_all(env, &stmt.values) {
            env.returns = Some((values, span));
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
