// eager.rs — One-op placement for immediate execution
//
// In eager mode every operation is placed as soon as it is issued, knowing
// only where its already-materialized inputs live. The op is placed by
// building a one-op graph whose inputs are pinned placeholders and running
// the ordinary placement pipeline, so eager and graph placement cannot
// disagree.
//
// Preconditions: input devices are concrete.
// Postconditions: the returned value carries a concrete device; handle
//                 inputs share it unless the op is a device boundary.
// Failure modes: `PlacementConflict` when a handle input lives on a device
//                the op's request rules out (device-boundary ops excepted); `UnresolvedGroup` when nothing
//                names a device and no default is configured.
// Side effects: none.

use std::sync::Arc;

use crate::config::PlacementOptions;
use crate::device::DeviceSpec;
use crate::error::{PlacementError, PlacementErrors};
use crate::graph::{Graph, ValueKind};
use crate::id::GraphId;
use crate::pipeline::place;
use crate::registry::OpRegistry;

/// A materialized value: where it lives and whether it is a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EagerValue {
    pub device: DeviceSpec,
    pub kind: ValueKind,
}

impl EagerValue {
    pub fn tensor(device: DeviceSpec) -> Self {
        EagerValue {
            device,
            kind: ValueKind::Tensor,
        }
    }

    pub fn handle(device: DeviceSpec) -> Self {
        EagerValue {
            device,
            kind: ValueKind::Handle,
        }
    }
}

/// Places single operations. Cheap to clone and safe to share between
/// threads; each call works on its own graph.
#[derive(Debug, Clone)]
pub struct EagerPlacer {
    options: PlacementOptions,
    registry: Arc<OpRegistry>,
}

impl EagerPlacer {
    pub fn new(options: PlacementOptions) -> Self {
        Self::with_registry(options, Arc::new(OpRegistry::with_builtins()))
    }

    pub fn with_registry(options: PlacementOptions, registry: Arc<OpRegistry>) -> Self {
        EagerPlacer { options, registry }
    }

    /// Place `op` given its inputs. Tensor inputs do not constrain the op:
    /// the runtime may copy them. Handle inputs pin it, except for
    /// device-boundary ops, which read their input handle remotely.
    pub fn place_op(
        &self,
        op: &str,
        requested: Option<DeviceSpec>,
        inputs: &[EagerValue],
    ) -> Result<EagerValue, PlacementErrors> {
        let mut graph = Graph::with_registry(Arc::clone(&self.registry));
        let node = graph.add_named_node(GraphId::ROOT, op, op, requested)?;
        for (i, input) in inputs.iter().enumerate() {
            let placeholder = graph.add_named_node(
                GraphId::ROOT,
                &format!("input_{i}"),
                "Placeholder",
                Some(input.device.clone()),
            )?;
            graph.add_typed_edge(placeholder, node, input.kind)?;
        }

        let validation = place(&mut graph, &self.options)?;
        if !validation.is_ok() {
            tracing::warn!(op, violations = %validation, "eager placement reported violations");
        }

        let n = graph.node(node)?;
        let device = n
            .assigned_device
            .clone()
            .ok_or_else(|| PlacementError::UnresolvedGroup {
                group: n.group.unwrap_or(node),
                group_name: n.name.clone(),
                members: vec![node],
            })?;
        tracing::trace!(op, device = %device, "eager op placed");
        Ok(EagerValue {
            device,
            kind: n.output,
        })
    }
}
