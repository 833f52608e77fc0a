use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use placer::build::build_graph;
use placer::device::DeviceSpec;
use placer::diag::{codes, has_errors, render, Diagnostic};
use placer::dot::emit_dot;
use placer::graph::Graph;
use placer::pass::PassId;
use placer::pipeline::{compute_provenance, run_pipeline, PlacementState};
use placer::registry::OpRegistry;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    Placement,
    Json,
    Dot,
}

#[derive(Parser, Debug)]
#[command(
    name = "placer",
    version,
    about = "Resolves device placement and colocation for .pgd dataflow graph descriptions"
)]
struct Cli {
    /// Input .pgd graph description
    source: PathBuf,

    /// Device for groups that request none (overrides `set default_device`)
    #[arg(long)]
    default_device: Option<String>,

    /// Operation metadata JSON file (repeatable)
    #[arg(long = "ops")]
    ops: Vec<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = EmitStage::Placement)]
    emit: EmitStage,

    /// Log passes and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();

    std::process::exit(run(&cli));
}

/// Returns the process exit code: 0 clean, 1 placement or description
/// errors, 2 I/O and usage errors.
fn run(cli: &Cli) -> i32 {
    // ── Load operation registry ──
    let mut registry = OpRegistry::with_builtins();
    for path in &cli.ops {
        match registry.load_json(path) {
            Ok(n) => tracing::info!(count = n, path = %path.display(), "loaded operation definitions"),
            Err(e) => {
                eprintln!("placer: error: {}", e);
                return 2;
            }
        }
    }
    tracing::debug!(ops = registry.len(), "registry ready");

    // ── Read and parse source ──
    let source = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("placer: error: {}: {}", cli.source.display(), e);
            return 2;
        }
    };
    let path = cli.source.display().to_string();

    let parse_result = placer::parser::parse(&source);
    if !parse_result.errors.is_empty() {
        for err in &parse_result.errors {
            let diag = Diagnostic::error(Some(*err.span()), err.to_string()).with_code(codes::E0001);
            eprintln!("{}", render(&diag, &source, &path));
        }
        return 1;
    }
    let Some(program) = parse_result.program else {
        eprintln!("placer: {}: parse failed with no output", path);
        return 1;
    };
    tracing::debug!(statements = program.statements.len(), "parsed");

    // ── Build graph ──
    let built = build_graph(&program, Arc::new(registry));
    for diag in &built.diagnostics {
        eprintln!("{}", render(diag, &source, &path));
    }
    if has_errors(&built.diagnostics) {
        return 1;
    }
    let mut config = built.config;
    if let Some(text) = &cli.default_device {
        match DeviceSpec::parse(text) {
            Ok(spec) => config.default_device = Some(spec),
            Err(e) => {
                eprintln!("placer: error: --default-device: {}", e);
                return 2;
            }
        }
    }
    let options = config.to_options();
    let mut graph = built.graph;

    // ── Place ──
    let terminal = if options.rewrites.is_empty() {
        PassId::Validate
    } else {
        PassId::Reconcile
    };
    let (failed, errors, violations) = {
        let mut state = PlacementState::new(&mut graph);
        let outcome = run_pipeline(&mut state, terminal, &options, |_, diags| {
            for diag in diags {
                eprintln!("{}", render(diag, &source, &path));
            }
        });
        let errors: Vec<String> = state
            .errors
            .take()
            .map(|e| e.errors.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        let violations: Vec<String> = state
            .validation
            .take()
            .map(|v| v.violations.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        (outcome.is_err(), errors, violations)
    };

    // ── Emit ──
    match cli.emit {
        EmitStage::Placement => print!("{}", graph),
        EmitStage::Dot => print!("{}", emit_dot(&graph)),
        EmitStage::Json => {
            let manifest = Manifest::new(&source, &graph, errors, violations);
            match serde_json::to_string_pretty(&manifest) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("placer: error: {}", e);
                    return 2;
                }
            }
        }
    }

    if failed {
        1
    } else {
        0
    }
}

// ── JSON manifest ──

#[derive(Serialize)]
struct Manifest<'a> {
    placer_version: &'static str,
    source_hash: String,
    registry_fingerprint: String,
    placement_fingerprint: String,
    nodes: Vec<NodeEntry<'a>>,
    errors: Vec<String>,
    violations: Vec<String>,
}

#[derive(Serialize)]
struct NodeEntry<'a> {
    name: &'a str,
    op: &'a str,
    subgraph: &'a str,
    handle: bool,
    group: Option<&'a str>,
    requested: Option<&'a DeviceSpec>,
    device: Option<&'a DeviceSpec>,
}

impl<'a> Manifest<'a> {
    fn new(source: &str, graph: &'a Graph, errors: Vec<String>, violations: Vec<String>) -> Self {
        let provenance = compute_provenance(source, graph);
        let nodes = graph
            .nodes()
            .map(|n| NodeEntry {
                name: &n.name,
                op: &n.op,
                subgraph: graph.subgraph(n.graph).map_or("", |s| s.name.as_str()),
                handle: n.produces_handle(),
                group: n.group.map(|g| graph.name(g)),
                requested: n.requested_device.as_ref(),
                device: n.assigned_device.as_ref(),
            })
            .collect();
        Manifest {
            placer_version: provenance.placer_version,
            source_hash: provenance.source_hash_hex(),
            registry_fingerprint: provenance.registry_fingerprint_hex(),
            placement_fingerprint: provenance.placement_fingerprint_hex(),
            nodes,
            errors,
            violations,
        }
    }
}
