// End-to-end placement scenarios.
//
// Each test builds a graph from a .pgd description (or through the eager
// API), runs the full placement pipeline and checks where things landed.
// The nested-loop scenario also drives a tiny iterator runtime over the
// placed graph to check that consumers share one piece of state.

use std::collections::HashMap;
use std::sync::Arc;

use placer::build::build_graph;
use placer::config::PlacementOptions;
use placer::device::DeviceSpec;
use placer::eager::{EagerPlacer, EagerValue};
use placer::graph::{Graph, ValueKind};
use placer::id::NodeId;
use placer::pipeline::place;
use placer::registry::OpRegistry;
use placer::validate::{validate, Violation};

// ── Helpers ─────────────────────────────────────────────────────────────────

fn build(source: &str) -> (Graph, PlacementOptions) {
    let parsed = placer::parser::parse(source);
    assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
    let built = build_graph(
        &parsed.program.unwrap(),
        Arc::new(OpRegistry::with_builtins()),
    );
    assert!(
        !placer::diag::has_errors(&built.diagnostics),
        "build errors: {:#?}",
        built.diagnostics
    );
    let options = built.config.to_options();
    (built.graph, options)
}

fn id(g: &Graph, name: &str) -> NodeId {
    g.find_node(name)
        .unwrap_or_else(|| panic!("no node '{name}'"))
}

fn device(g: &Graph, name: &str) -> DeviceSpec {
    g.node(id(g, name))
        .unwrap()
        .assigned_device
        .clone()
        .unwrap_or_else(|| panic!("'{name}' was not placed"))
}

/// Iterator state lives on a device. A consumer placed on a different
/// device than the other consumers of the same handle would see its own
/// copy of the state, starting over from zero.
#[derive(Default)]
struct IteratorRuntime {
    cursors: HashMap<(NodeId, DeviceSpec), i64>,
}

impl IteratorRuntime {
    fn get_next(&mut self, g: &Graph, consumer: NodeId) -> i64 {
        let node = g.node(consumer).unwrap();
        let source = node.handle_source.expect("consumer of a handle");
        let device = node.assigned_device.clone().expect("placed consumer");
        let cursor = self.cursors.entry((source, device)).or_insert(0);
        let value = *cursor;
        *cursor += 1;
        value
    }
}

// ── Nested loops ────────────────────────────────────────────────────────────

fn nested_loops(iterator_device: &str) -> String {
    format!(
        r#"
set default_device = "/cpu:0"
ds = RangeDataset()
it = AnonymousIterator(ds){iterator_device}
outer = while() capture(it) {{
  branch body(a) {{
    x = IteratorGetNext(a)
    inner = while() capture(a) {{
      branch body(b) {{
        y = IteratorGetNext(b)
      }}
    }}
  }}
}}
"#
    )
}

#[test]
fn nested_loop_parameters_follow_the_iterator() {
    for request in ["", " @\"/gpu:0\"", " @\"/job:worker/task:1/device:CPU:0\""] {
        let (mut g, options) = build(&nested_loops(request));
        let validation = place(&mut g, &options).unwrap();
        assert!(validation.is_ok(), "{validation}");

        let expected = device(&g, "it");
        for name in ["ds", "outer", "outer/body/a", "outer/body/inner", "outer/body/inner/body/b"] {
            assert_eq!(device(&g, name), expected, "{name} with request '{request}'");
        }
        assert_eq!(device(&g, "outer/body/x"), expected);
        assert_eq!(device(&g, "outer/body/inner/body/y"), expected);
    }
}

#[test]
fn nested_loop_accumulation_sums_every_element_once() {
    for request in ["", " @\"/gpu:0\""] {
        let (mut g, options) = build(&nested_loops(request));
        place(&mut g, &options).unwrap();

        let outer_read = id(&g, "outer/body/x");
        let inner_read = id(&g, "outer/body/inner/body/y");
        let mut runtime = IteratorRuntime::default();
        let mut sum = 0;
        for _ in 0..5 {
            sum += runtime.get_next(&g, outer_read);
            sum += runtime.get_next(&g, inner_read);
        }
        assert_eq!(sum, 45, "request '{request}'");
        assert_eq!(runtime.cursors.len(), 1);
    }
}

// ── Conditionals ────────────────────────────────────────────────────────────

#[test]
fn cond_branches_in_device_scope_share_the_handle_device() {
    let src = r#"
set default_device = "/cpu:0"
ds = RangeDataset()
pred = Const()
device "/gpu:0" {
  out = if(pred) capture(ds) {
    branch then(d) {
      m = MapDataset(d)
      return m
    }
    branch else(d) {
      m = MapDataset(d)
      return m
    }
  }
}
it = AnonymousIterator(out)
"#;
    let (mut g, options) = build(src);
    let validation = place(&mut g, &options).expect("no conflicts");
    assert!(validation.is_ok(), "{validation}");

    for name in [
        "ds",
        "out",
        "out/then/d",
        "out/then/m",
        "out/else/d",
        "out/else/m",
        "it",
    ] {
        assert_eq!(device(&g, name), DeviceSpec::gpu(0), "{name}");
    }
    assert_eq!(device(&g, "pred"), DeviceSpec::cpu(0));
}

#[test]
fn cond_inside_colocation_scope_follows_the_target() {
    let src = r#"
set default_device = "/cpu:0"
ds = RangeDataset() @"/gpu:1"
t = Const()
colocate_with ds {
  out = if() capture(t) {
    branch then(x) {
      y = Add(x, x)
      return y
    }
  }
}
"#;
    let (mut g, options) = build(src);
    let validation = place(&mut g, &options).unwrap();
    assert!(validation.is_ok(), "{validation}");

    assert_eq!(device(&g, "out"), DeviceSpec::gpu(1));
    assert_eq!(device(&g, "out/then/y"), DeviceSpec::gpu(1));
    // Unconstrained tensor captures are free to be copied.
    assert_eq!(device(&g, "t"), DeviceSpec::cpu(0));
    assert_eq!(device(&g, "out/then/x"), DeviceSpec::cpu(0));
}

#[test]
fn conflict_inside_branch_reports_frame_context() {
    let src = r#"
ds = RangeDataset() @"/cpu:0"
out = if() capture(ds) {
  branch then(d) {
    m = MapDataset(d) @"/gpu:0"
    return m
  }
}
"#;
    let (mut g, options) = build(src);
    let errs = place(&mut g, &options).unwrap_err();
    let conflict = errs.conflicts().next().expect("one conflict");
    assert!(conflict.involves(id(&g, "ds")));
    assert!(conflict.involves(id(&g, "out/then/m")));
    let frame = conflict.frame.as_ref().expect("frame context");
    assert_eq!(frame.frame_name, "out");
    assert_eq!(frame.branch, 0);
}

// ── Explicit colocation with incompatible requests ──────────────────────────

#[test]
fn colocated_reader_with_second_device_is_reported() {
    let src = r#"
ds = RangeDataset() @"/cpu:0"
reader = Const() @"/gpu:0"
colocate ds, reader
"#;
    let (mut g, options) = build(src);
    let ds = id(&g, "ds");
    let reader = id(&g, "reader");

    let errs = place(&mut g, &options).unwrap_err();
    assert_eq!(errs.conflicts().count(), 1);
    assert!(errs.conflicts().all(|c| c.involves(ds) && c.involves(reader)));

    let result = validate(&g);
    assert!(!result.is_ok());
    let named: Vec<Vec<NodeId>> = result
        .violations
        .iter()
        .filter(|v| matches!(v, Violation::ConflictingRequests { .. }))
        .map(Violation::nodes)
        .collect();
    assert_eq!(named, vec![vec![ds, reader]]);
    // Running the validator again changes nothing.
    assert_eq!(validate(&g), result);
}

#[test]
fn partial_and_qualified_requests_agree() {
    let src = r#"
ds = RangeDataset() @"cpu:0"
it = AnonymousIterator(ds) @"/job:worker/replica:0/task:0/device:CPU:0"
"#;
    let (mut g, options) = build(src);
    place(&mut g, &options).unwrap();
    let expected = DeviceSpec::parse("/job:worker/replica:0/task:0/device:CPU:0").unwrap();
    assert_eq!(device(&g, "ds"), expected);
    assert_eq!(device(&g, "it"), expected);
}

// ── Eager mode ──────────────────────────────────────────────────────────────

#[test]
fn eager_prefetch_to_gpu_keeps_iterator_on_gpu() {
    let eager = EagerPlacer::new(PlacementOptions::with_default_device(DeviceSpec::cpu(0)));
    let gpu = DeviceSpec::gpu(0);

    let range = eager.place_op("RangeDataset", None, &[]).unwrap();
    assert_eq!(range, EagerValue::handle(DeviceSpec::cpu(0)));

    let ds = eager
        .place_op("PrefetchToDeviceDataset", Some(gpu.clone()), &[range.clone()])
        .unwrap();
    assert_eq!(ds, EagerValue::handle(gpu.clone()));
    // Without a request the prefetch stays wherever the default puts it.
    let local = eager.place_op("PrefetchToDeviceDataset", None, &[range]).unwrap();
    assert_eq!(local, EagerValue::handle(DeviceSpec::cpu(0)));

    let it = eager.place_op("AnonymousIterator", None, &[ds]).unwrap();
    assert_eq!(it, EagerValue::handle(gpu.clone()));

    let next = eager
        .place_op("IteratorGetNextAsOptional", None, &[it])
        .unwrap();
    assert_eq!(next.device, gpu);
    assert_eq!(next.kind, ValueKind::Handle);

    let value = eager.place_op("OptionalGetValue", None, &[next.clone()]).unwrap();
    let has_value = eager.place_op("OptionalHasValue", None, &[next]).unwrap();
    assert_eq!(value, EagerValue::tensor(gpu.clone()));
    assert_eq!(has_value, EagerValue::tensor(gpu));
}

#[test]
fn prefetch_to_device_splits_dataset_and_iterator() {
    let src = r#"
set default_device = "/cpu:0"
ds = RangeDataset()
pf = PrefetchToDeviceDataset(ds) @"/gpu:0"
it = AnonymousIterator(pf)
next = IteratorGetNext(it)
"#;
    let (mut g, options) = build(src);
    let validation = place(&mut g, &options).unwrap();
    assert!(validation.is_ok(), "{validation}");
    assert_eq!(device(&g, "ds"), DeviceSpec::cpu(0));
    for name in ["pf", "it", "next"] {
        assert_eq!(device(&g, name), DeviceSpec::gpu(0), "{name}");
    }
    assert_eq!(g.node(id(&g, "it")).unwrap().handle_source, Some(id(&g, "pf")));
    assert_eq!(g.node(id(&g, "pf")).unwrap().handle_source, None);
}

// ── Concurrency ─────────────────────────────────────────────────────────────

#[test]
fn independent_graphs_place_concurrently() {
    let options = PlacementOptions::with_default_device(DeviceSpec::cpu(0));
    let eager = EagerPlacer::new(options.clone());
    let source = nested_loops(" @\"/gpu:0\"");

    let listings: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    let (mut g, _) = build(&source);
                    place(&mut g, &options).unwrap();
                    let it = eager
                        .place_op("AnonymousIterator", None, &[EagerValue::handle(DeviceSpec::gpu(0))])
                        .unwrap();
                    assert_eq!(it.device, DeviceSpec::gpu(0));
                    g.to_string()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(listings.windows(2).all(|w| w[0] == w[1]));
}

// ── Optimizer rewrites ──────────────────────────────────────────────────────

#[test]
fn merged_duplicates_are_reconciled() {
    let src = r#"
set default_device = "/cpu:0"
set rewrites = "merge_duplicates"
c = Const()
a = Add(c, c)
b = Add(c, c) @"/gpu:0"
s = Add(a, b)
"#;
    let (mut g, options) = build(src);
    assert_eq!(options.rewrites.len(), 1);
    let before = g.live_node_count();

    let validation = place(&mut g, &options).unwrap();
    assert!(validation.is_ok(), "{validation}");
    assert_eq!(g.live_node_count(), before - 1);
    assert!(g.find_node("b").is_none());

    let a = id(&g, "a");
    let s = id(&g, "s");
    assert!(g.input_edges(s).all(|e| e.source == a));
    for n in g.nodes() {
        assert!(n.assigned_device.is_some(), "'{}' unplaced after rewrite", n.name);
    }
}

#[test]
fn merging_a_captured_handle_keeps_the_loop_bound_to_it() {
    let src = r#"
set default_device = "/cpu:0"
set rewrites = "merge_duplicates"
ds = RangeDataset() @"/cpu:0"
a = Identity(ds)
b = Identity(ds)
l = while() capture(b) {
  branch body(d) {
    x = IteratorGetNext(d)
  }
}
"#;
    let (mut g, options) = build(src);
    let validation = place(&mut g, &options).unwrap();
    assert!(validation.is_ok(), "{validation}");
    assert!(g.find_node("b").is_none());

    let a = id(&g, "a");
    let d = id(&g, "l/body/d");
    let frame = g.frames().first().unwrap();
    assert_eq!(frame.captures, vec![a]);
    let capture = g.capture_edge(d).expect("loop parameter lost its capture");
    assert_eq!(capture.source, a);
    assert!(capture.is_handle());
    assert!(g.node(d).unwrap().produces_handle());
    assert_eq!(g.node(d).unwrap().group, g.node(id(&g, "ds")).unwrap().group);

    // Moving the body off the handle's device must now be visible.
    for name in ["l/body/d", "l/body/x"] {
        g.assign_device(id(&g, name), Some(DeviceSpec::gpu(0))).unwrap();
    }
    let moved = validate(&g);
    assert!(moved
        .violations
        .iter()
        .any(|v| matches!(v, Violation::CaptureCrossesDevices { .. })));
}
