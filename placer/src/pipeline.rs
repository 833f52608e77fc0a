// pipeline.rs — Placement state and pass orchestration
//
// Holds the graph being placed together with every pass artifact, and runs
// the minimal set of passes for a given terminal PassId.
//
// Preconditions: the graph is fully constructed (frames lowered).
// Postconditions: artifacts for all required passes are populated, or
//                 has_error is set.
// Failure modes: resolution errors, validation violations and failed
//                rewrites stop the run after the pass that produced them.
// Side effects: calls on_pass_complete after each pass; emits tracing events.

use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::colocation::UnionFind;
use crate::config::PlacementOptions;
use crate::diag::{has_errors, Diagnostic};
use crate::error::PlacementErrors;
use crate::frames::{propagate_frames, FrameSummary};
use crate::graph::Graph;
use crate::handles::{mark_handles, HandleSummary};
use crate::pass::{descriptor, required_passes, PassId};
use crate::registry::OpRegistry;
use crate::resolve::{resolve, ResolveSummary};
use crate::validate::{reconcile, validate, ValidationResult};

// ── Provenance ─────────────────────────────────────────────────────────────

/// Fingerprints for reproducible placement output.
///
/// `source_hash`: SHA-256 of the graph description text (empty for graphs
/// built through the API).
/// `registry_fingerprint`: SHA-256 of `OpRegistry::canonical_json()`.
/// `placement_fingerprint`: SHA-256 of every live node's name, operation,
/// group and device, in id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub registry_fingerprint: [u8; 32],
    pub placement_fingerprint: [u8; 32],
    pub placer_version: &'static str,
}

impl Provenance {
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    pub fn registry_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.registry_fingerprint)
    }

    pub fn placement_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.placement_fingerprint)
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance for a placed graph.
pub fn compute_provenance(source: &str, graph: &Graph) -> Provenance {
    Provenance {
        source_hash: sha256(source.as_bytes()),
        registry_fingerprint: registry_fingerprint(graph.registry()),
        placement_fingerprint: sha256(placement_listing(graph).as_bytes()),
        placer_version: env!("CARGO_PKG_VERSION"),
    }
}

fn registry_fingerprint(registry: &OpRegistry) -> [u8; 32] {
    sha256(registry.canonical_json().as_bytes())
}

/// One line per live node: `name op group device`, tab separated.
fn placement_listing(graph: &Graph) -> String {
    let mut listing = String::new();
    for n in graph.nodes() {
        let group = n.group.map_or("-", |g| graph.name(g));
        let device = n
            .assigned_device
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        listing.push_str(&format!("{}\t{}\t{}\t{}\n", n.name, n.op, group, device));
    }
    listing
}

// ── Placement state ────────────────────────────────────────────────────────

/// The graph being placed plus everything the passes produced so far.
pub struct PlacementState<'g> {
    pub graph: &'g mut Graph,
    pub uf: Option<UnionFind>,
    pub handles: Option<HandleSummary>,
    pub frames: Option<FrameSummary>,
    pub resolved: Option<ResolveSummary>,
    /// Set when resolution failed or a rewrite misused the graph API.
    pub errors: Option<PlacementErrors>,
    pub validation: Option<ValidationResult>,
    /// Nodes changed by optimizer rewrites.
    pub rewritten: usize,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl<'g> PlacementState<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        PlacementState {
            graph,
            uf: None,
            handles: None,
            frames: None,
            resolved: None,
            errors: None,
            validation: None,
            rewritten: 0,
            diagnostics: Vec::new(),
            has_error: false,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution stopped because a pass reported errors. The
/// diagnostics are in `PlacementState::diagnostics`.
#[derive(Debug, Error)]
#[error("pass '{}' reported errors", descriptor(*failing_pass).name)]
pub struct PipelineError {
    pub failing_pass: PassId,
}

/// Per-pass post-processing: callback, accumulate, log, error check.
fn finish_pass_core(
    all_diags: &mut Vec<Diagnostic>,
    has_error: &mut bool,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_errors(&diags);
    all_diags.extend(diags);
    tracing::debug!(
        pass = descriptor(pass_id).name,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "pass complete"
    );
    if is_err {
        *has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → log → error check.
pub fn run_pipeline(
    state: &mut PlacementState<'_>,
    terminal: PassId,
    options: &PlacementOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        let diags = run_pass(state, pass_id, options);
        let elapsed = t.elapsed();
        finish_pass_core(
            &mut state.diagnostics,
            &mut state.has_error,
            pass_id,
            diags,
            elapsed,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}

fn run_pass(
    state: &mut PlacementState<'_>,
    pass_id: PassId,
    options: &PlacementOptions,
) -> Vec<Diagnostic> {
    match pass_id {
        PassId::MarkHandles => {
            let mut uf = UnionFind::new(state.graph.node_capacity());
            let summary = mark_handles(state.graph, &mut uf);
            tracing::debug!(
                handle_nodes = summary.handle_nodes,
                handle_edges = summary.handle_edges,
                unions = summary.unions,
                "handles marked"
            );
            state.uf = Some(uf);
            state.handles = Some(summary);
            Vec::new()
        }
        PassId::LowerFrames => {
            let capacity = state.graph.node_capacity();
            let uf = state.uf.get_or_insert_with(|| UnionFind::new(capacity));
            let summary = propagate_frames(state.graph, uf);
            tracing::debug!(
                frames = summary.frames,
                sweeps = summary.sweeps,
                unions = summary.unions,
                "captures propagated"
            );
            state.frames = Some(summary);
            Vec::new()
        }
        PassId::Resolve => {
            let capacity = state.graph.node_capacity();
            let uf = state.uf.get_or_insert_with(|| UnionFind::new(capacity));
            match resolve(state.graph, uf, options.policy.as_ref()) {
                Ok(summary) => {
                    tracing::debug!(
                        groups = summary.groups,
                        nontrivial = summary.nontrivial_groups,
                        defaulted = summary.defaulted_groups,
                        "groups resolved"
                    );
                    state.resolved = Some(summary);
                    Vec::new()
                }
                Err(errors) => {
                    let diags = errors.diagnostics(state.graph);
                    state.errors = Some(errors);
                    diags
                }
            }
        }
        PassId::Validate => {
            let result = validate(state.graph);
            let diags = result.diagnostics(state.graph);
            state.validation = Some(result);
            diags
        }
        PassId::Rewrite => {
            for rewrite in &options.rewrites {
                let changed = match rewrite.rewrite(state.graph) {
                    Ok(changed) => changed,
                    Err(err) => {
                        let diag = Diagnostic::error(
                            None,
                            format!("rewrite '{}' failed: {err}", rewrite.name()),
                        )
                        .with_code(err.code());
                        state.errors = Some(err.into());
                        return vec![diag];
                    }
                };
                state.rewritten += changed;
                // Group ids in the union-find no longer match the graph.
                state.uf = None;
                let result = reconcile(state.graph);
                tracing::debug!(
                    rewrite = rewrite.name(),
                    changed,
                    violations = result.violations.len(),
                    "rewrite reconciled"
                );
                if !result.is_ok() {
                    let diags = result.diagnostics(state.graph);
                    state.validation = Some(result);
                    return diags;
                }
            }
            Vec::new()
        }
        PassId::Reconcile => {
            let result = reconcile(state.graph);
            let diags = result.diagnostics(state.graph);
            state.validation = Some(result);
            diags
        }
    }
}

/// Place a graph: handle marking, capture propagation, resolution and
/// validation; then, when optimizer rewrites are configured, each rewrite
/// followed by reconciliation.
///
/// Resolution errors are returned together. Validation violations are
/// data: a graph that resolved but fails validation yields `Ok` with a
/// non-empty `ValidationResult`.
pub fn place(
    graph: &mut Graph,
    options: &PlacementOptions,
) -> Result<ValidationResult, PlacementErrors> {
    let terminal = if options.rewrites.is_empty() {
        PassId::Validate
    } else {
        PassId::Reconcile
    };
    let mut state = PlacementState::new(graph);
    if let Err(err) = run_pipeline(&mut state, terminal, options, |_, _| {}) {
        tracing::debug!(%err, "placement stopped early");
    }
    match state.errors.take() {
        Some(errors) => Err(errors),
        None => Ok(state.validation.take().unwrap_or_default()),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;
    use crate::id::GraphId;
    use crate::rewrite::MergeDuplicates;

    fn pipeline_graph() -> Graph {
        let mut g = Graph::new();
        let ds = g.add_named_node(GraphId::ROOT, "ds", "RangeDataset", None).unwrap();
        let it = g
            .add_named_node(GraphId::ROOT, "it", "AnonymousIterator", Some(DeviceSpec::gpu(0)))
            .unwrap();
        let next = g.add_named_node(GraphId::ROOT, "next", "IteratorGetNext", None).unwrap();
        g.add_edge(ds, it).unwrap();
        g.add_edge(it, next).unwrap();
        g
    }

    #[test]
    fn place_clean_graph() {
        let mut g = pipeline_graph();
        let result = place(&mut g, &PlacementOptions::with_default_device(DeviceSpec::cpu(0)))
            .unwrap();
        assert!(result.is_ok(), "{result}");
        for n in g.nodes() {
            assert_eq!(n.assigned_device, Some(DeviceSpec::gpu(0)), "{}", n.name);
        }
    }

    #[test]
    fn resolution_errors_are_returned() {
        let mut g = pipeline_graph();
        g.add_named_node(GraphId::ROOT, "lonely", "Const", None).unwrap();
        let errs = place(&mut g, &PlacementOptions::default()).unwrap_err();
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn callback_sees_required_passes_in_order() {
        let mut g = pipeline_graph();
        let options = PlacementOptions::with_default_device(DeviceSpec::cpu(0));
        let mut state = PlacementState::new(&mut g);
        let mut seen = Vec::new();
        run_pipeline(&mut state, PassId::Validate, &options, |p, _| seen.push(p)).unwrap();
        assert_eq!(seen, required_passes(PassId::Validate));
        assert!(state.handles.unwrap().handle_edges >= 1);
        assert_eq!(state.resolved.unwrap().nontrivial_groups, 1);
        assert!(!state.has_error);
    }

    #[test]
    fn pipeline_stops_at_failing_pass() {
        let mut g = pipeline_graph();
        g.add_named_node(GraphId::ROOT, "lonely", "Const", None).unwrap();
        let mut state = PlacementState::new(&mut g);
        let mut seen = Vec::new();
        let err = run_pipeline(&mut state, PassId::Validate, &PlacementOptions::default(), |p, _| {
            seen.push(p)
        })
        .unwrap_err();
        assert_eq!(err.failing_pass, PassId::Resolve);
        assert_eq!(seen.last(), Some(&PassId::Resolve));
        assert!(state.has_error);
        assert!(!state.diagnostics.is_empty());
    }

    #[test]
    fn rewrites_are_reconciled() {
        let mut g = Graph::new();
        let ds = g.add_named_node(GraphId::ROOT, "ds", "RangeDataset", None).unwrap();
        let a = g.add_named_node(GraphId::ROOT, "a", "Identity", None).unwrap();
        let b = g.add_named_node(GraphId::ROOT, "b", "Identity", None).unwrap();
        let it = g.add_named_node(GraphId::ROOT, "it", "AnonymousIterator", None).unwrap();
        g.add_edge(ds, a).unwrap();
        g.add_edge(ds, b).unwrap();
        g.add_edge(b, it).unwrap();
        let options =
            PlacementOptions::with_default_device(DeviceSpec::cpu(0)).rewrite(MergeDuplicates);
        let result = place(&mut g, &options).unwrap();
        assert!(result.is_ok(), "{result}");
        assert!(g.node(b).is_err());
        assert_eq!(g.node(it).unwrap().group, Some(ds));
        assert_eq!(g.node(a).unwrap().group, Some(ds));
    }

    #[test]
    fn provenance_is_stable() {
        let options = PlacementOptions::with_default_device(DeviceSpec::cpu(0));
        let mut g1 = pipeline_graph();
        let mut g2 = pipeline_graph();
        place(&mut g1, &options).unwrap();
        place(&mut g2, &options).unwrap();
        let p1 = compute_provenance("", &g1);
        let p2 = compute_provenance("", &g2);
        assert_eq!(p1, p2);
        assert_eq!(p1.placement_fingerprint_hex().len(), 64);

        g2.assign_device(g2.find_node("next").unwrap(), Some(DeviceSpec::cpu(1)))
            .unwrap();
        assert_ne!(compute_provenance("", &g2).placement_fingerprint, p1.placement_fingerprint);
    }
}
