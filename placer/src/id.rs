// id.rs — Arena indices for the placement graph
//
// Nodes, edges, subgraphs and frames live in flat arenas owned by `Graph`
// and are referred to by these integer handles. Indices are allocated in
// construction order and never reused, so they are stable for the life of
// a graph (removed nodes keep their slot as a tombstone).

use std::fmt;

/// Index of a node in `Graph::nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Index of an edge in `Graph::edges`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

/// Index of a subgraph (root graph or branch/body function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub u32);

/// Index of a lowered control-flow frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl GraphId {
    /// The root graph every `Graph` is created with.
    pub const ROOT: GraphId = GraphId(0);
}

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl EdgeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl GraphId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl FrameId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Allocator for arena indices. Produces monotonically increasing ids in
/// allocation order, which keeps every derived ordering deterministic.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_node: u32,
    next_edge: u32,
    next_graph: u32,
    next_frame: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn alloc_edge(&mut self) -> EdgeId {
        let id = EdgeId(self.next_edge);
        self.next_edge += 1;
        id
    }

    pub fn alloc_graph(&mut self) -> GraphId {
        let id = GraphId(self.next_graph);
        self.next_graph += 1;
        id
    }

    pub fn alloc_frame(&mut self) -> FrameId {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_allocate_in_order() {
        let mut alloc = IdAllocator::new();
        assert_eq!(alloc.alloc_node(), NodeId(0));
        assert_eq!(alloc.alloc_node(), NodeId(1));
        assert_eq!(alloc.alloc_edge(), EdgeId(0));
        assert_eq!(alloc.alloc_graph(), GraphId::ROOT);
        assert_eq!(alloc.alloc_graph(), GraphId(1));
        assert_eq!(alloc.alloc_frame(), FrameId(0));
    }

    #[test]
    fn display_prefixes() {
        assert_eq!(NodeId(3).to_string(), "n3");
        assert_eq!(FrameId(1).to_string(), "f1");
        assert_eq!(GraphId(2).to_string(), "g2");
    }
}
