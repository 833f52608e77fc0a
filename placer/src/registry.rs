// registry.rs — Operation-kind metadata
//
// Records, per operation kind, what kind of value its output is: a plain
// tensor, a stateful resource handle, whatever its i-th input is
// (`Identity`-style forwarding), or a fresh handle on the op's own device
// fed from a handle elsewhere (a device boundary such as prefetching). This is the static information the handle
// tracker uses to type edges; no runtime type inspection happens anywhere.
//
// Built-in definitions cover the dataset/iterator family and resource
// variables; further kinds load from JSON files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Data types ──────────────────────────────────────────────────────────────

/// What an operation's output value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Tensor,
    /// A resource handle (dataset variant, iterator, variable, ...).
    Handle,
    /// Same value kind as input `i`.
    Forward(usize),
    /// A new resource handle on the op's own device. Handle inputs are read
    /// across devices and do not colocate with the op.
    DeviceBoundary,
}

impl OutputKind {
    /// The op itself produces a handle, independent of its inputs.
    pub fn produces_handle(self) -> bool {
        matches!(self, OutputKind::Handle | OutputKind::DeviceBoundary)
    }
}

/// Metadata for one operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDef {
    pub name: String,
    pub output: OutputKind,
}

impl OpDef {
    pub fn new(name: &str, output: OutputKind) -> Self {
        OpDef {
            name: name.to_string(),
            output,
        }
    }
}

/// Errors that can occur during registry loading.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("duplicate op '{name}': first defined in {first}, redefined in {second}")]
    DuplicateOp {
        name: String,
        first: String,
        second: String,
    },
}

const BUILTIN: &str = "<builtin>";

/// Built-in operation kinds.
const BUILTIN_OPS: &[(&str, OutputKind)] = &[
    // datasets
    ("RangeDataset", OutputKind::Handle),
    ("TensorSliceDataset", OutputKind::Handle),
    ("MapDataset", OutputKind::Handle),
    ("ParallelMapDataset", OutputKind::Handle),
    ("FilterDataset", OutputKind::Handle),
    ("BatchDataset", OutputKind::Handle),
    ("PrefetchDataset", OutputKind::Handle),
    ("PrefetchToDeviceDataset", OutputKind::DeviceBoundary),
    ("OptionsDataset", OutputKind::Handle),
    // iterators
    ("AnonymousIterator", OutputKind::Handle),
    ("AnonymousIteratorV2", OutputKind::Handle),
    ("Iterator", OutputKind::Handle),
    ("OneShotIterator", OutputKind::Handle),
    ("MakeIterator", OutputKind::Tensor),
    ("IteratorGetNext", OutputKind::Tensor),
    ("IteratorGetNextAsOptional", OutputKind::Handle),
    ("OptionalGetValue", OutputKind::Tensor),
    ("OptionalHasValue", OutputKind::Tensor),
    ("DeleteIterator", OutputKind::Tensor),
    ("DatasetCardinality", OutputKind::Tensor),
    ("ReduceDataset", OutputKind::Tensor),
    // resource variables
    ("VarHandleOp", OutputKind::Handle),
    ("ReadVariableOp", OutputKind::Tensor),
    ("AssignVariableOp", OutputKind::Tensor),
    ("AssignAddVariableOp", OutputKind::Tensor),
    // forwarding
    ("Identity", OutputKind::Forward(0)),
    ("IdentityN", OutputKind::Forward(0)),
    ("StopGradient", OutputKind::Forward(0)),
    // tensors
    ("Const", OutputKind::Tensor),
    ("Placeholder", OutputKind::Tensor),
    ("Add", OutputKind::Tensor),
    ("AddV2", OutputKind::Tensor),
    ("Sub", OutputKind::Tensor),
    ("Mul", OutputKind::Tensor),
    ("Sum", OutputKind::Tensor),
    ("Equal", OutputKind::Tensor),
    ("Less", OutputKind::Tensor),
    ("Range", OutputKind::Tensor),
    ("DevicePlacementOp", OutputKind::Tensor),
];

// ── Registry ────────────────────────────────────────────────────────────────

/// Operation metadata registry.
#[derive(Debug, Clone)]
pub struct OpRegistry {
    ops: HashMap<String, (OpDef, String)>,
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl OpRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        OpRegistry {
            ops: HashMap::new(),
        }
    }

    /// A registry holding the built-in operation kinds.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for (name, output) in BUILTIN_OPS {
            reg.ops
                .insert(name.to_string(), (OpDef::new(name, *output), BUILTIN.to_string()));
        }
        reg
    }

    /// Register a single definition.
    pub fn register(&mut self, def: OpDef, origin: &str) -> Result<(), RegistryError> {
        if let Some((_, first)) = self.ops.get(&def.name) {
            return Err(RegistryError::DuplicateOp {
                name: def.name.clone(),
                first: first.clone(),
                second: origin.to_string(),
            });
        }
        self.ops.insert(def.name.clone(), (def, origin.to_string()));
        Ok(())
    }

    /// Load definitions from a JSON array of `OpDef`. Returns the number of
    /// definitions added.
    pub fn load_json(&mut self, path: &Path) -> Result<usize, RegistryError> {
        let source = std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.load_json_str(&source, path)
    }

    pub fn load_json_str(&mut self, source: &str, origin: &Path) -> Result<usize, RegistryError> {
        let defs: Vec<OpDef> =
            serde_json::from_str(source).map_err(|e| RegistryError::Json {
                path: origin.to_path_buf(),
                source: e,
            })?;
        let count = defs.len();
        let origin = origin.display().to_string();
        for def in defs {
            self.register(def, &origin)?;
        }
        Ok(count)
    }

    pub fn lookup(&self, name: &str) -> Option<&OpDef> {
        self.ops.get(name).map(|(def, _)| def)
    }

    pub fn output_kind(&self, name: &str) -> Option<OutputKind> {
        self.lookup(name).map(|def| def.output)
    }

    /// Handle inputs of `name` cross a device boundary instead of pinning it.
    pub fn is_device_boundary(&self, name: &str) -> bool {
        self.output_kind(name) == Some(OutputKind::DeviceBoundary)
    }

    pub fn ops(&self) -> impl Iterator<Item = &OpDef> {
        self.ops.values().map(|(def, _)| def)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Compact JSON of every definition sorted by name. Stable across runs
    /// and insertion orders; used as fingerprint input.
    pub fn canonical_json(&self) -> String {
        let mut defs: Vec<&OpDef> = self.ops().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        serde_json::to_string(&defs).unwrap_or_default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
