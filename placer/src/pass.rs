// pass.rs — Pass descriptor module: metadata, dependency resolution
//
// Declares the placement passes (graph construction is outside the runner),
// their dependency edges, and what each one leaves behind in the placement
// state. Used by the pipeline runner to compute the minimal pass subset for a
// terminal pass.

use std::collections::HashSet;

// ── Pass and artifact identifiers ──────────────────────────────────────────

/// Identifies each placement pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    MarkHandles,
    LowerFrames,
    Resolve,
    Validate,
    Rewrite,
    Reconcile,
}

/// What a pass writes into `PlacementState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    ValueKinds, // node output kinds, handle lineage
    Unions,     // UnionFind
    Groups,     // Node::group
    Devices,    // Node::assigned_device
    Validation, // ValidationResult
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a placement pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics and logs.
    pub name: &'static str,
    /// Passes whose outputs this pass consumes.
    pub inputs: &'static [PassId],
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Postconditions, documentation only.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::MarkHandles => PassDescriptor {
            name: "mark_handles",
            inputs: &[],
            outputs: &[ArtifactId::ValueKinds, ArtifactId::Unions],
            invalidation_key: "graph structure + registry",
            invariants: "every handle edge and explicit colocation unioned",
        },
        PassId::LowerFrames => PassDescriptor {
            name: "lower_frames",
            inputs: &[PassId::MarkHandles],
            outputs: &[ArtifactId::Unions],
            invalidation_key: "frames + unions",
            invariants: "constrained captures unioned with every branch parameter",
        },
        PassId::Resolve => PassDescriptor {
            name: "resolve",
            inputs: &[PassId::LowerFrames],
            outputs: &[ArtifactId::Groups, ArtifactId::Devices],
            invalidation_key: "unions + device requests + policy",
            invariants: "one concrete device per group, or an accumulated error",
        },
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[PassId::Resolve],
            outputs: &[ArtifactId::Validation],
            invalidation_key: "groups + devices",
            invariants: "violations reported as data",
        },
        PassId::Rewrite => PassDescriptor {
            name: "rewrite",
            inputs: &[PassId::Resolve],
            outputs: &[ArtifactId::Groups, ArtifactId::Devices],
            invalidation_key: "placed graph + rewrite list",
            invariants: "each rewrite followed by reconciliation",
        },
        PassId::Reconcile => PassDescriptor {
            name: "reconcile",
            inputs: &[PassId::Rewrite],
            outputs: &[ArtifactId::Groups, ArtifactId::Devices, ArtifactId::Validation],
            invalidation_key: "rewritten graph",
            invariants: "groups re-derived from current structure, then validated",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 6] = [
    PassId::MarkHandles,
    PassId::LowerFrames,
    PassId::Resolve,
    PassId::Validate,
    PassId::Rewrite,
    PassId::Reconcile,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
