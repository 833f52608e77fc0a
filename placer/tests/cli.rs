// CLI tests: run the `placer` binary on the demos/*.pgd files.
//
// Checks exit codes, that repeated runs are byte-identical, and the shape of
// the JSON manifest.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn placer_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_placer"))
}

fn demos_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .join("demos")
}

fn demo(name: &str) -> String {
    demos_dir().join(name).to_str().unwrap().to_string()
}

fn run_placer(args: &[&str]) -> Output {
    Command::new(placer_binary())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run placer")
}

fn stdout_of(args: &[&str]) -> String {
    let output = run_placer(args);
    assert!(
        output.status.success(),
        "placer failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

// ── Exit codes ──────────────────────────────────────────────────────────────

#[test]
fn clean_demos_exit_zero() {
    for name in ["prefetch_cond.pgd", "nested_loops.pgd"] {
        let listing = stdout_of(&[&demo(name)]);
        assert!(listing.starts_with("graph ("), "{name}: {listing}");
        assert!(!listing.lines().skip(1).any(|l| l.contains(" = ") && !l.contains("=>")));
    }
}

#[test]
fn conflict_exits_one_and_names_both_nodes() {
    let output = run_placer(&[&demo("colocate_conflict.pgd")]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("E0200"), "{stderr}");
    assert!(stderr.contains("'ds'") && stderr.contains("'reader'"), "{stderr}");
}

#[test]
fn missing_file_exits_two() {
    let output = run_placer(&["/nonexistent/graph.pgd"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn bad_default_device_exits_two() {
    let output = run_placer(&[&demo("nested_loops.pgd"), "--default-device", "/cpu:0:1:2"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unknown_ops_warn_without_registry_file() {
    let output = run_placer(&[&demo("custom_ops.pgd")]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("W0100"), "{stderr}");
}

#[test]
fn custom_ops_load_from_json() {
    let ops = demo("custom_ops.json");
    let listing = stdout_of(&[&demo("custom_ops.pgd"), "--ops", &ops]);
    assert!(listing.contains("table = LookupTable() handle @\"/device:CPU:1\" => /device:CPU:1"));
    assert!(listing.contains("v = LookupFind(k1, k1) => /device:CPU:1"), "{listing}");
    assert!(!listing.contains("k2 ="));
}

#[test]
fn default_device_flag_overrides_setting() {
    let listing = stdout_of(&[&demo("prefetch_cond.pgd"), "--default-device", "/gpu:1"]);
    assert!(listing.contains("pred = Const() => /device:GPU:1"), "{listing}");
}

// ── Determinism ─────────────────────────────────────────────────────────────

#[test]
fn repeated_runs_are_identical() {
    for emit in ["placement", "json", "dot"] {
        for name in ["prefetch_cond.pgd", "nested_loops.pgd"] {
            let first = stdout_of(&[&demo(name), "--emit", emit]);
            let second = stdout_of(&[&demo(name), "--emit", emit]);
            assert_eq!(first, second, "{name} --emit {emit}");
        }
    }
}

// ── Manifest ────────────────────────────────────────────────────────────────

#[test]
fn json_manifest_lists_every_node() {
    let json = stdout_of(&[&demo("prefetch_cond.pgd"), "--emit", "json"]);
    let manifest: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(manifest["placement_fingerprint"].as_str().unwrap().len(), 64);
    assert_eq!(manifest["source_hash"].as_str().unwrap().len(), 64);
    assert!(manifest["violations"].as_array().unwrap().is_empty());

    let nodes = manifest["nodes"].as_array().unwrap();
    let find = |name: &str| {
        nodes
            .iter()
            .find(|n| n["name"] == name)
            .unwrap_or_else(|| panic!("no node '{name}' in manifest"))
    };
    assert_eq!(find("ds")["device"], "/device:GPU:0");
    assert_eq!(find("ds")["handle"], true);
    assert_eq!(find("out/then/m")["subgraph"], "out/then");
    assert_eq!(find("out/then/m")["group"], "ds");
    assert_eq!(find("pred")["device"], "/device:CPU:0");
    assert!(find("pred")["requested"].is_null());
}

#[test]
fn dot_output_has_clusters() {
    let dot = stdout_of(&[&demo("nested_loops.pgd"), "--emit", "dot"]);
    assert!(dot.starts_with("digraph placement {"));
    assert!(dot.contains("label=\"outer/body: while 'outer' branch 0\""));
}
