// resolve.rs — Colocation group device resolution
//
// Folds the explicit device requests of each group's members into one spec
// (partial specs refine each other), asks the default-device policy for any
// fields still missing, and writes group id and device into every member.
//
// Preconditions: `uf` holds every colocation union (handles, explicit
//                directives, frame captures).
// Postconditions: every live node has `group` set to its group's smallest
//                 member; every member of a successfully resolved group has
//                 the same concrete `assigned_device`.
// Failure modes: `PlacementConflict` per incompatible request,
//                `UnresolvedGroup` per group with no usable device. All are
//                accumulated; groups that fail keep `assigned_device = None`.
// Side effects: clears and rewrites placement fields in the graph.

use std::collections::BTreeMap;

use crate::colocation::UnionFind;
use crate::config::{DevicePolicy, GroupInfo};
use crate::device::DeviceSpec;
use crate::error::{Conflict, ConflictingRequest, PlacementError, PlacementErrors};
use crate::graph::Graph;
use crate::id::NodeId;

/// Counts reported by a successful resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    pub groups: usize,
    pub nontrivial_groups: usize,
    pub defaulted_groups: usize,
}

/// Groups over the live nodes of `graph`, keyed by smallest member.
pub fn colocation_groups(graph: &Graph, uf: &mut UnionFind) -> BTreeMap<NodeId, Vec<NodeId>> {
    uf.groups(graph.nodes().map(|n| n.id))
}

pub fn resolve(
    graph: &mut Graph,
    uf: &mut UnionFind,
    policy: &dyn DevicePolicy,
) -> Result<ResolveSummary, PlacementErrors> {
    graph.clear_placement();
    let groups = colocation_groups(graph, uf);
    let mut errors = Vec::new();
    let mut summary = ResolveSummary {
        groups: groups.len(),
        ..ResolveSummary::default()
    };

    for (rep, members) in &groups {
        if members.len() > 1 {
            summary.nontrivial_groups += 1;
        }
        for &m in members {
            graph.set_group(m, Some(*rep));
        }

        let (merged, conflicts) = fold_requests(graph, *rep, members);
        if !conflicts.is_empty() {
            errors.extend(conflicts.into_iter().map(PlacementError::PlacementConflict));
            continue;
        }

        let mut device = merged.clone().unwrap_or_default();
        if !device.is_concrete() {
            let info = GroupInfo {
                representative: *rep,
                name: graph.name(*rep),
                members,
                requested: merged.as_ref(),
            };
            if let Some(default) = policy.default_device(&info) {
                device = device.fill_from(&default);
                summary.defaulted_groups += 1;
            }
        }
        if !device.is_concrete() {
            errors.push(PlacementError::UnresolvedGroup {
                group: *rep,
                group_name: graph.name(*rep).to_string(),
                members: members.clone(),
            });
            continue;
        }

        tracing::trace!(group = %rep, device = %device, members = members.len(), "resolved group");
        for &m in members {
            // Members were taken from the live set above.
            let _ = graph.assign_device(m, Some(device.clone()));
        }
    }

    if errors.is_empty() {
        Ok(summary)
    } else {
        Err(PlacementErrors { errors })
    }
}

/// Merge the members' requests in id order. A request incompatible with the
/// running merge yields one conflict pairing it with the first earlier
/// request it disagrees with; it does not take part in the merge.
fn fold_requests(
    graph: &Graph,
    rep: NodeId,
    members: &[NodeId],
) -> (Option<DeviceSpec>, Vec<Conflict>) {
    let mut merged: Option<DeviceSpec> = None;
    let mut contributors: Vec<(NodeId, &DeviceSpec)> = Vec::new();
    let mut conflicts = Vec::new();

    for &m in members {
        let Some(req) = graph.node(m).ok().and_then(|n| n.requested_device.as_ref()) else {
            continue;
        };
        let next = match &merged {
            None => Some(req.clone()),
            Some(cur) => cur.merge(req),
        };
        match next {
            Some(spec) => {
                merged = Some(spec);
                contributors.push((m, req));
            }
            None => {
                let (other, other_req, field) = contributors
                    .iter()
                    .find_map(|&(c, creq)| creq.conflicting_field(req).map(|f| (c, creq, f)))
                    .or_else(|| {
                        // Incompatible only with the combination of earlier requests.
                        contributors.first().map(|&(c, creq)| {
                            let field = merged
                                .as_ref()
                                .and_then(|cur| cur.conflicting_field(req))
                                .unwrap_or("device");
                            (c, creq, field)
                        })
                    })
                    .unwrap_or((rep, req, "device"));
                let frame = graph.frame_context(m).or_else(|| graph.frame_context(other));
                conflicts.push(Conflict {
                    group: rep,
                    group_name: graph.name(rep).to_string(),
                    requests: vec![
                        ConflictingRequest {
                            node: other,
                            name: graph.name(other).to_string(),
                            device: other_req.clone(),
                        },
                        ConflictingRequest {
                            node: m,
                            name: graph.name(m).to_string(),
                            device: req.clone(),
                        },
                    ],
                    field,
                    frame,
                });
            }
        }
    }
    (merged, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultDevice, NoDefaultDevice};
    use crate::graph::{FrameDef, FrameKind};
    use crate::handles::mark_handles;
    use crate::id::GraphId;

    fn dev(s: &str) -> Option<DeviceSpec> {
        Some(DeviceSpec::parse(s).unwrap())
    }

    fn run(g: &mut Graph, policy: &dyn DevicePolicy) -> Result<ResolveSummary, PlacementErrors> {
        let mut uf = UnionFind::new(g.node_capacity());
        mark_handles(g, &mut uf);
        crate::frames::propagate_frames(g, &mut uf);
        resolve(g, &mut uf, policy)
    }

    #[test]
    fn partial_request_refined_by_qualified_one() {
        let mut g = Graph::new();
        let ds = g
            .add_named_node(GraphId::ROOT, "ds", "RangeDataset", dev("cpu:0"))
            .unwrap();
        let it = g
            .add_named_node(
                GraphId::ROOT,
                "it",
                "AnonymousIterator",
                dev("/job:worker/replica:0/task:0/device:CPU:0"),
            )
            .unwrap();
        g.add_edge(ds, it).unwrap();
        run(&mut g, &NoDefaultDevice).unwrap();
        let expected = dev("/job:worker/replica:0/task:0/device:CPU:0");
        assert_eq!(g.node(ds).unwrap().assigned_device, expected);
        assert_eq!(g.node(it).unwrap().assigned_device, expected);
        assert_eq!(g.node(it).unwrap().group, Some(ds));
    }

    #[test]
    fn incompatible_requests_conflict() {
        let mut g = Graph::new();
        let ds = g
            .add_named_node(GraphId::ROOT, "ds", "RangeDataset", dev("/gpu:0"))
            .unwrap();
        let it = g
            .add_named_node(GraphId::ROOT, "it", "AnonymousIterator", dev("/gpu:1"))
            .unwrap();
        g.add_edge(ds, it).unwrap();
        let errs = run(&mut g, &DefaultDevice(DeviceSpec::cpu(0))).unwrap_err();
        let conflict = errs.conflicts().next().unwrap();
        assert!(conflict.involves(ds) && conflict.involves(it));
        assert_eq!(conflict.field, "device index");
        assert_eq!(g.node(ds).unwrap().assigned_device, None);
    }

    #[test]
    fn group_without_request_uses_policy() {
        let mut g = Graph::new();
        let c = g.add_named_node(GraphId::ROOT, "c", "Const", None).unwrap();
        let summary = run(&mut g, &DefaultDevice(DeviceSpec::cpu(0))).unwrap();
        assert_eq!(summary.defaulted_groups, 1);
        assert_eq!(g.node(c).unwrap().assigned_device, Some(DeviceSpec::cpu(0)));
    }

    #[test]
    fn policy_only_fills_missing_fields() {
        let mut g = Graph::new();
        let c = g
            .add_named_node(GraphId::ROOT, "c", "Const", dev("/job:ps/task:1"))
            .unwrap();
        run(&mut g, &DefaultDevice(DeviceSpec::gpu(0).on_task("worker", 0, 0))).unwrap();
        assert_eq!(
            g.node(c).unwrap().assigned_device,
            dev("/job:ps/replica:0/task:1/device:GPU:0")
        );
    }

    #[test]
    fn unresolved_without_policy() {
        let mut g = Graph::new();
        let a = g.add_named_node(GraphId::ROOT, "a", "Const", None).unwrap();
        let b = g.add_named_node(GraphId::ROOT, "b", "Const", dev("/cpu:0")).unwrap();
        let errs = run(&mut g, &NoDefaultDevice).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(matches!(
            &errs.errors[0],
            PlacementError::UnresolvedGroup { group, .. } if *group == a
        ));
        // Resolvable groups are still placed.
        assert_eq!(g.node(b).unwrap().assigned_device, dev("/cpu:0"));
    }

    #[test]
    fn closure_policy_sees_group() {
        let mut g = Graph::new();
        let ds = g.add_named_node(GraphId::ROOT, "ds", "RangeDataset", None).unwrap();
        let it = g.add_named_node(GraphId::ROOT, "it", "AnonymousIterator", None).unwrap();
        g.add_edge(ds, it).unwrap();
        let policy = |info: &GroupInfo<'_>| {
            (info.members.len() > 1).then(|| DeviceSpec::gpu(0))
        };
        run(&mut g, &policy).unwrap();
        assert_eq!(g.node(it).unwrap().assigned_device, Some(DeviceSpec::gpu(0)));
    }

    #[test]
    fn all_conflicts_reported_in_one_pass() {
        let mut g = Graph::new();
        for i in 0..3 {
            let ds = g
                .add_named_node(GraphId::ROOT, &format!("ds{i}"), "RangeDataset", dev("/cpu:0"))
                .unwrap();
            let it = g
                .add_named_node(GraphId::ROOT, &format!("it{i}"), "AnonymousIterator", dev("/gpu:0"))
                .unwrap();
            g.add_edge(ds, it).unwrap();
        }
        let errs = run(&mut g, &NoDefaultDevice).unwrap_err();
        assert_eq!(errs.conflicts().count(), 3);
    }

    #[test]
    fn conflict_inside_branch_carries_frame_context() {
        let mut g = Graph::new();
        let ds = g
            .add_named_node(GraphId::ROOT, "ds", "RangeDataset", dev("/cpu:0"))
            .unwrap();
        let then_g = g.add_subgraph("out/then");
        let d = g.add_param(then_g, "out/then/d").unwrap();
        let m = g
            .add_named_node(then_g, "out/then/m", "MapDataset", dev("/gpu:0"))
            .unwrap();
        g.add_edge(d, m).unwrap();
        g.lower_frame(
            GraphId::ROOT,
            FrameDef {
                kind: FrameKind::Cond,
                name: "out",
                inputs: &[],
                captures: &[ds],
                branches: &[then_g],
                device: None,
            },
        )
        .unwrap();
        let errs = run(&mut g, &NoDefaultDevice).unwrap_err();
        let conflict = errs.conflicts().next().unwrap();
        assert!(conflict.involves(ds) && conflict.involves(m));
        let ctx = conflict.frame.as_ref().unwrap();
        assert_eq!((ctx.frame_name.as_str(), ctx.branch), ("out", 0));
        assert_eq!(conflict.field, "device type");
    }
}
