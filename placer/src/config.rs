// config.rs — Placement configuration and default-device policy
//
// The default device is configuration, not process state: a `DevicePolicy`
// is chosen once, wrapped in `PlacementOptions`, and passed to every
// placement run. Options are immutable after construction and cheap to share
// between threads.
//
// `PlacementConfig` is the textual form: `set` directives of a graph
// description, overridable from the command line.

use std::fmt;
use std::sync::Arc;

use crate::ast::{Program, SetStmt, StatementKind};
use crate::device::DeviceSpec;
use crate::diag::{codes, Diagnostic};
use crate::id::NodeId;
use crate::rewrite::{rewrite_by_name, GraphRewrite, REWRITE_NAMES};

// ── Policy ──────────────────────────────────────────────────────────────────

/// What the policy gets to see about a group it is asked to place.
#[derive(Debug, Clone, Copy)]
pub struct GroupInfo<'a> {
    /// Smallest member id.
    pub representative: NodeId,
    pub name: &'a str,
    pub members: &'a [NodeId],
    /// Merged member requests, if any member made one.
    pub requested: Option<&'a DeviceSpec>,
}

/// Supplies devices for groups that did not fully name one. The returned
/// spec only fills fields the group left unspecified.
pub trait DevicePolicy: Send + Sync {
    fn default_device(&self, group: &GroupInfo<'_>) -> Option<DeviceSpec>;
}

/// Never supplies a device; groups without a concrete request are
/// unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDefaultDevice;

impl DevicePolicy for NoDefaultDevice {
    fn default_device(&self, _group: &GroupInfo<'_>) -> Option<DeviceSpec> {
        None
    }
}

/// The same device for every group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultDevice(pub DeviceSpec);

impl DevicePolicy for DefaultDevice {
    fn default_device(&self, _group: &GroupInfo<'_>) -> Option<DeviceSpec> {
        Some(self.0.clone())
    }
}

impl<F> DevicePolicy for F
where
    F: Fn(&GroupInfo<'_>) -> Option<DeviceSpec> + Send + Sync,
{
    fn default_device(&self, group: &GroupInfo<'_>) -> Option<DeviceSpec> {
        self(group)
    }
}

// ── Options ─────────────────────────────────────────────────────────────────

/// Everything a placement run reads besides the graph.
#[derive(Clone)]
pub struct PlacementOptions {
    pub policy: Arc<dyn DevicePolicy>,
    /// Optimizer rewrites applied after placement, each followed by
    /// reconciliation.
    pub rewrites: Vec<Arc<dyn GraphRewrite>>,
}

impl Default for PlacementOptions {
    fn default() -> Self {
        PlacementOptions {
            policy: Arc::new(NoDefaultDevice),
            rewrites: Vec::new(),
        }
    }
}

impl fmt::Debug for PlacementOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.rewrites.iter().map(|r| r.name()).collect();
        f.debug_struct("PlacementOptions")
            .field("policy", &"<dyn DevicePolicy>")
            .field("rewrites", &names)
            .finish()
    }
}

impl PlacementOptions {
    pub fn with_default_device(device: DeviceSpec) -> Self {
        Self::with_policy(DefaultDevice(device))
    }

    pub fn with_policy(policy: impl DevicePolicy + 'static) -> Self {
        PlacementOptions {
            policy: Arc::new(policy),
            rewrites: Vec::new(),
        }
    }

    pub fn rewrite(mut self, rewrite: impl GraphRewrite + 'static) -> Self {
        self.rewrites.push(Arc::new(rewrite));
        self
    }
}

// ── Textual configuration ───────────────────────────────────────────────────

/// Settings read from `set` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementConfig {
    pub default_device: Option<DeviceSpec>,
    /// Names of optimizer rewrites, in application order.
    pub rewrites: Vec<String>,
}

/// Result of reading configuration from a program.
#[derive(Debug)]
pub struct ConfigResult {
    pub config: PlacementConfig,
    pub diagnostics: Vec<Diagnostic>,
}

impl PlacementConfig {
    /// Read every top-level `set` directive. Unknown keys and malformed
    /// values are reported; the last directive for a key wins.
    pub fn from_program(program: &Program) -> ConfigResult {
        let mut config = PlacementConfig::default();
        let mut diagnostics = Vec::new();
        for stmt in &program.statements {
            let StatementKind::Set(set) = &stmt.kind else {
                continue;
            };
            if let Err(d) = config.apply(set) {
                diagnostics.push(d);
            }
        }
        ConfigResult {
            config,
            diagnostics,
        }
    }

    fn apply(&mut self, set: &SetStmt) -> Result<(), Diagnostic> {
        match set.name.name.as_str() {
            "default_device" => {
                let spec = DeviceSpec::parse(&set.value.value).map_err(|e| {
                    Diagnostic::error(Some(set.value.span), e.to_string()).with_code(codes::E0004)
                })?;
                self.default_device = Some(spec);
                Ok(())
            }
            "rewrites" => {
                let names: Vec<String> = set
                    .value
                    .value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if let Some(bad) = names.iter().find(|n| rewrite_by_name(n).is_none()) {
                    return Err(Diagnostic::error(
                        Some(set.value.span),
                        format!("unknown rewrite '{bad}'"),
                    )
                    .with_code(codes::E0006)
                    .with_hint(format!("known rewrites: {}", REWRITE_NAMES.join(", "))));
                }
                self.rewrites = names;
                Ok(())
            }
            other => Err(Diagnostic::error(
                Some(set.name.span),
                format!("unknown setting '{other}'"),
            )
            .with_code(codes::E0006)
            .with_hint("known settings: default_device, rewrites")),
        }
    }

    /// Build run options. Names were validated when the config was read;
    /// unknown ones are skipped here.
    pub fn to_options(&self) -> PlacementOptions {
        let mut options = match &self.default_device {
            Some(device) => PlacementOptions::with_default_device(device.clone()),
            None => PlacementOptions::default(),
        };
        options.rewrites = self
            .rewrites
            .iter()
            .filter_map(|name| rewrite_by_name(name))
            .collect();
        options
    }
}
