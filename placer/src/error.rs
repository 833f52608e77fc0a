// error.rs — Typed placement errors
//
// Structural misuse of the graph API fails immediately with
// `InvalidReference`. Placement-level failures (`PlacementConflict`,
// `UnresolvedGroup`) are accumulated by the resolver and returned together
// as `PlacementErrors` so one run yields the complete report.

use std::fmt;

use thiserror::Error;

use crate::device::DeviceSpec;
use crate::diag::Diagnostic;
use crate::graph::Graph;
use crate::id::{FrameId, NodeId};

/// Result alias for structural graph operations.
pub type Result<T> = std::result::Result<T, PlacementError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    /// A graph API call referred to a missing or unusable node, edge,
    /// subgraph or frame.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Colocated nodes requested incompatible devices.
    #[error("{0}")]
    PlacementConflict(Conflict),

    /// A group named no device and the policy supplied none.
    #[error(
        "colocation group '{group_name}' ({} node(s)) has no requested device and no default device was configured",
        members.len()
    )]
    UnresolvedGroup {
        group: NodeId,
        group_name: String,
        members: Vec<NodeId>,
    },
}

impl PlacementError {
    pub fn invalid(message: impl Into<String>) -> Self {
        PlacementError::InvalidReference(message.into())
    }

    /// Stable diagnostic code for this error kind.
    pub fn code(&self) -> crate::diag::DiagCode {
        use crate::diag::codes;
        match self {
            PlacementError::InvalidReference(_) => codes::E0100,
            PlacementError::PlacementConflict(_) => codes::E0200,
            PlacementError::UnresolvedGroup { .. } => codes::E0201,
        }
    }
}

/// One node's side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingRequest {
    pub node: NodeId,
    pub name: String,
    pub device: DeviceSpec,
}

/// The frame and branch a conflicting node was lowered into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameContext {
    pub frame: FrameId,
    pub frame_name: String,
    pub branch: usize,
}

/// Two or more members of one colocation group requested devices that
/// cannot name the same physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Group representative (smallest member id).
    pub group: NodeId,
    pub group_name: String,
    pub requests: Vec<ConflictingRequest>,
    pub field: &'static str,
    pub frame: Option<FrameContext>,
}

impl Conflict {
    pub fn involves(&self, node: NodeId) -> bool {
        self.requests.iter().any(|r| r.node == node)
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "placement conflict in colocation group '{}': ",
            self.group_name
        )?;
        for (i, req) in self.requests.iter().enumerate() {
            if i > 0 {
                write!(f, " vs ")?;
            }
            write!(f, "'{}' requests '{}'", req.name, req.device)?;
        }
        write!(f, " (different {})", self.field)?;
        if let Some(ctx) = &self.frame {
            write!(f, " in frame '{}' branch {}", ctx.frame_name, ctx.branch)?;
        }
        Ok(())
    }
}

/// Every placement-level error produced by one resolution run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct PlacementErrors {
    pub errors: Vec<PlacementError>,
}

impl PlacementErrors {
    pub fn conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.errors.iter().filter_map(|e| match e {
            PlacementError::PlacementConflict(c) => Some(c),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl PlacementErrors {
    /// Convert every error into a diagnostic, using node spans when the
    /// graph was built from source text.
    pub fn diagnostics(&self, graph: &Graph) -> Vec<Diagnostic> {
        let span_of = |id: NodeId| graph.node(id).ok().and_then(|n| n.span);
        self.errors
            .iter()
            .map(|err| match err {
                PlacementError::InvalidReference(_) => {
                    Diagnostic::error(None, err.to_string()).with_code(err.code())
                }
                PlacementError::PlacementConflict(conflict) => {
                    let primary = conflict.requests.last().map(|r| r.node);
                    let mut diag = Diagnostic::error(primary.and_then(span_of), err.to_string())
                        .with_code(err.code())
                        .with_hint("remove one of the device requests or the colocation between them");
                    for req in &conflict.requests[..conflict.requests.len().saturating_sub(1)] {
                        diag = diag.with_related(
                            span_of(req.node),
                            format!("'{}' requests '{}' here", req.name, req.device),
                        );
                    }
                    diag
                }
                PlacementError::UnresolvedGroup { group, .. } => {
                    Diagnostic::error(span_of(*group), err.to_string())
                        .with_code(err.code())
                        .with_hint("request a device on one member or set default_device")
                }
            })
            .collect()
    }
}

impl From<PlacementError> for PlacementErrors {
    fn from(err: PlacementError) -> Self {
        PlacementErrors { errors: vec![err] }
    }
}

impl fmt::Display for PlacementErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
