// validate.rs — Placement validator and post-rewrite reconciliation
//
// `validate` checks a placed graph and reports every violation as data; it
// never fails and never mutates. `reconcile` is the re-entry point for
// optimizer rewrites: it re-derives colocation groups from the current
// structure, spreads a group's single device to members a rewrite left
// unplaced, then validates.
//
// Preconditions: `validate` needs nothing (an unplaced graph simply reports
//                violations). `reconcile` requires the graph was placed before
//                being rewritten.
// Postconditions: the result is a deterministic function of the graph;
//                 validating twice yields identical results.
// Failure modes: none (violations are data).
// Side effects: `reconcile` rewrites group fields and fills missing devices.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::colocation::UnionFind;
use crate::device::DeviceSpec;
use crate::diag::{codes, DiagCode, Diagnostic};
use crate::frames::propagate_frames;
use crate::graph::Graph;
use crate::handles::mark_handles;
use crate::id::{FrameId, NodeId};
use crate::resolve::colocation_groups;

// ── Violations ──────────────────────────────────────────────────────────────

/// A node named in a violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub node: NodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A node has no device although its group has one.
    Unplaced { node: NodeRef },
    /// No member of the group has a device.
    UnresolvedGroup { group: NodeRef, members: usize },
    /// Members of one group run on different devices.
    GroupSpansDevices {
        group: NodeRef,
        placements: Vec<(NodeRef, DeviceSpec)>,
    },
    /// A handle edge joins nodes on different devices.
    HandleCrossesDevices {
        producer: NodeRef,
        producer_device: DeviceSpec,
        consumer: NodeRef,
        consumer_device: DeviceSpec,
    },
    /// A constrained capture reaches a parameter on a different device.
    CaptureCrossesDevices {
        frame: FrameId,
        frame_name: String,
        branch: usize,
        capture: NodeRef,
        capture_device: DeviceSpec,
        param: NodeRef,
        param_device: DeviceSpec,
    },
    /// Two members of one group requested incompatible devices.
    ConflictingRequests {
        first: NodeRef,
        first_request: DeviceSpec,
        second: NodeRef,
        second_request: DeviceSpec,
        field: &'static str,
    },
    /// A node runs on a device its own request rules out.
    RequestNotHonored {
        node: NodeRef,
        requested: DeviceSpec,
        assigned: DeviceSpec,
    },
}

impl Violation {
    pub fn code(&self) -> DiagCode {
        match self {
            Violation::Unplaced { .. } => codes::E0300,
            Violation::UnresolvedGroup { .. } => codes::E0301,
            Violation::GroupSpansDevices { .. } => codes::E0302,
            Violation::HandleCrossesDevices { .. } => codes::E0303,
            Violation::CaptureCrossesDevices { .. } => codes::E0304,
            Violation::ConflictingRequests { .. } => codes::E0305,
            Violation::RequestNotHonored { .. } => codes::E0306,
        }
    }

    /// Every node the violation names.
    pub fn nodes(&self) -> Vec<NodeId> {
        match self {
            Violation::Unplaced { node } | Violation::RequestNotHonored { node, .. } => {
                vec![node.node]
            }
            Violation::UnresolvedGroup { group, .. } => vec![group.node],
            Violation::GroupSpansDevices { placements, .. } => {
                placements.iter().map(|(n, _)| n.node).collect()
            }
            Violation::HandleCrossesDevices {
                producer, consumer, ..
            } => vec![producer.node, consumer.node],
            Violation::CaptureCrossesDevices { capture, param, .. } => {
                vec![capture.node, param.node]
            }
            Violation::ConflictingRequests { first, second, .. } => {
                vec![first.node, second.node]
            }
        }
    }

    pub fn to_diagnostic(&self, graph: &Graph) -> Diagnostic {
        let span_of = |id: NodeId| graph.node(id).ok().and_then(|n| n.span);
        let nodes = self.nodes();
        let mut diag = Diagnostic::error(nodes.first().and_then(|&n| span_of(n)), self.to_string())
            .with_code(self.code());
        for &n in nodes.iter().skip(1) {
            diag = diag.with_related(span_of(n), format!("'{}' defined here", graph.name(n)));
        }
        match self {
            Violation::UnresolvedGroup { .. } => {
                diag.with_hint("request a device on one member or configure a default device")
            }
            Violation::ConflictingRequests { .. } => {
                diag.with_hint("colocated nodes must request compatible devices")
            }
            _ => diag,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Unplaced { node } => write!(f, "'{}' has no device", node.name),
            Violation::UnresolvedGroup { group, members } => write!(
                f,
                "colocation group '{}' ({} node(s)) has no device",
                group.name, members
            ),
            Violation::GroupSpansDevices { group, placements } => {
                write!(f, "colocation group '{}' spans devices:", group.name)?;
                for (i, (n, d)) in placements.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}'{}' on '{d}'", n.name)?;
                }
                Ok(())
            }
            Violation::HandleCrossesDevices {
                producer,
                producer_device,
                consumer,
                consumer_device,
            } => write!(
                f,
                "resource handle from '{}' on '{}' is consumed by '{}' on '{}'",
                producer.name, producer_device, consumer.name, consumer_device
            ),
            Violation::CaptureCrossesDevices {
                frame_name,
                branch,
                capture,
                capture_device,
                param,
                param_device,
                ..
            } => write!(
                f,
                "capture '{}' on '{}' reaches '{}' on '{}' in frame '{}' branch {}",
                capture.name, capture_device, param.name, param_device, frame_name, branch
            ),
            Violation::ConflictingRequests {
                first,
                first_request,
                second,
                second_request,
                field,
            } => write!(
                f,
                "colocated '{}' requests '{}' but '{}' requests '{}' (different {})",
                first.name, first_request, second.name, second_request, field
            ),
            Violation::RequestNotHonored {
                node,
                requested,
                assigned,
            } => write!(
                f,
                "'{}' requested '{}' but runs on '{}'",
                node.name, requested, assigned
            ),
        }
    }
}

/// Outcome of validation: success when no violations were found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn diagnostics(&self, graph: &Graph) -> Vec<Diagnostic> {
        self.violations.iter().map(|v| v.to_diagnostic(graph)).collect()
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for v in &self.violations {
            writeln!(f, "{v}")?;
        }
        Ok(())
    }
}

// ── Validation ──────────────────────────────────────────────────────────────

fn node_ref(graph: &Graph, node: NodeId) -> NodeRef {
    NodeRef {
        node,
        name: graph.name(node).to_string(),
    }
}

fn device_of(graph: &Graph, node: NodeId) -> Option<&DeviceSpec> {
    graph.node(node).ok().and_then(|n| n.assigned_device.as_ref())
}

/// Check a placed graph. Violations are ordered by check, then by id.
pub fn validate(graph: &Graph) -> ValidationResult {
    let mut violations = Vec::new();

    let mut groups: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for n in graph.nodes() {
        groups.entry(n.group.unwrap_or(n.id)).or_default().push(n.id);
    }

    check_groups(graph, &groups, &mut violations);
    check_requests(graph, &groups, &mut violations);
    check_handle_edges(graph, &mut violations);
    check_captures(graph, &groups, &mut violations);

    ValidationResult { violations }
}

fn check_groups(
    graph: &Graph,
    groups: &BTreeMap<NodeId, Vec<NodeId>>,
    out: &mut Vec<Violation>,
) {
    for (&rep, members) in groups {
        let mut placements: Vec<(NodeRef, DeviceSpec)> = Vec::new();
        let mut seen: BTreeSet<&DeviceSpec> = BTreeSet::new();
        for &m in members {
            if let Some(d) = device_of(graph, m) {
                if seen.insert(d) {
                    placements.push((node_ref(graph, m), d.clone()));
                }
            }
        }
        match placements.len() {
            0 => out.push(Violation::UnresolvedGroup {
                group: node_ref(graph, rep),
                members: members.len(),
            }),
            1 => {
                for &m in members {
                    if device_of(graph, m).is_none() {
                        out.push(Violation::Unplaced {
                            node: node_ref(graph, m),
                        });
                    }
                }
            }
            _ => out.push(Violation::GroupSpansDevices {
                group: node_ref(graph, rep),
                placements,
            }),
        }
    }
}

fn check_requests(
    graph: &Graph,
    groups: &BTreeMap<NodeId, Vec<NodeId>>,
    out: &mut Vec<Violation>,
) {
    for members in groups.values() {
        let requests: Vec<(NodeId, &DeviceSpec)> = members
            .iter()
            .filter_map(|&m| {
                graph
                    .node(m)
                    .ok()
                    .and_then(|n| n.requested_device.as_ref())
                    .map(|r| (m, r))
            })
            .collect();
        for (i, &(a, ra)) in requests.iter().enumerate() {
            for &(b, rb) in &requests[i + 1..] {
                if let Some(field) = ra.conflicting_field(rb) {
                    out.push(Violation::ConflictingRequests {
                        first: node_ref(graph, a),
                        first_request: ra.clone(),
                        second: node_ref(graph, b),
                        second_request: rb.clone(),
                        field,
                    });
                }
            }
        }
    }
    for n in graph.nodes() {
        if let (Some(req), Some(dev)) = (&n.requested_device, &n.assigned_device) {
            if !req.is_compatible(dev) {
                out.push(Violation::RequestNotHonored {
                    node: node_ref(graph, n.id),
                    requested: req.clone(),
                    assigned: dev.clone(),
                });
            }
        }
    }
}

fn check_handle_edges(graph: &Graph, out: &mut Vec<Violation>) {
    for e in graph.edges() {
        if !graph.is_colocating_edge(e) {
            continue;
        }
        if let (Some(pd), Some(cd)) = (device_of(graph, e.source), device_of(graph, e.target)) {
            if pd != cd {
                out.push(Violation::HandleCrossesDevices {
                    producer: node_ref(graph, e.source),
                    producer_device: pd.clone(),
                    consumer: node_ref(graph, e.target),
                    consumer_device: cd.clone(),
                });
            }
        }
    }
}

/// Walks frames outermost first with an explicit worklist, so nested
/// captures are checked at any depth.
fn check_captures(
    graph: &Graph,
    groups: &BTreeMap<NodeId, Vec<NodeId>>,
    out: &mut Vec<Violation>,
) {
    let group_size = |node: NodeId| -> usize {
        graph
            .node(node)
            .ok()
            .map(|n| groups.get(&n.group.unwrap_or(node)).map_or(1, Vec::len))
            .unwrap_or(1)
    };
    for frame_id in graph.frames_outermost_first() {
        let Ok(frame) = graph.frame(frame_id) else {
            continue;
        };
        for (i, &source) in frame.captures.iter().enumerate() {
            let is_handle = graph.node(source).is_ok_and(|n| n.produces_handle());
            if !is_handle && group_size(source) < 2 {
                continue;
            }
            let Some(source_device) = device_of(graph, source) else {
                continue;
            };
            for (b, &branch) in frame.branches.iter().enumerate() {
                let Some(&param) = graph.subgraph(branch).ok().and_then(|s| s.params.get(i)) else {
                    continue;
                };
                let Some(param_device) = device_of(graph, param) else {
                    continue;
                };
                if param_device != source_device {
                    out.push(Violation::CaptureCrossesDevices {
                        frame: frame_id,
                        frame_name: graph.name(frame.node).to_string(),
                        branch: b,
                        capture: node_ref(graph, source),
                        capture_device: source_device.clone(),
                        param: node_ref(graph, param),
                        param_device: param_device.clone(),
                    });
                }
            }
        }
    }
}

// ── Reconciliation ──────────────────────────────────────────────────────────

/// Re-derive groups after a rewrite and re-validate. A group whose placed
/// members agree on one device lends it to members without one; nothing
/// else is changed, so a rewrite that broke placement shows up as
/// violations.
pub fn reconcile(graph: &mut Graph) -> ValidationResult {
    let mut uf = UnionFind::new(graph.node_capacity());
    mark_handles(graph, &mut uf);
    propagate_frames(graph, &mut uf);

    for (rep, members) in colocation_groups(graph, &mut uf) {
        let devices: BTreeSet<DeviceSpec> = members
            .iter()
            .filter_map(|&m| device_of(graph, m).cloned())
            .collect();
        for &m in &members {
            graph.set_group(m, Some(rep));
        }
        if devices.len() == 1 {
            if let Some(device) = devices.into_iter().next() {
                for &m in &members {
                    if device_of(graph, m).is_none() {
                        let _ = graph.assign_device(m, Some(device.clone()));
                    }
                }
            }
        }
    }
    validate(graph)
}
