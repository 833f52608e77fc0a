// colocation.rs — Union-find over node ids
//
// Disjoint-set structure with path compression and union by rank. Groups are
// identified externally by their smallest member id so that the result does
// not depend on the order unions were performed in.

use std::collections::BTreeMap;

use crate::id::NodeId;

#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<u32>,
    rank: Vec<u8>,
    size: Vec<u32>,
}

impl UnionFind {
    /// `n` singleton sets, one per node id below `n`.
    pub fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n as u32).collect(),
            rank: vec![0; n],
            size: vec![1; n],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Internal root of `x`'s set. Iterative, compresses the path.
    pub fn find(&mut self, x: NodeId) -> NodeId {
        let mut root = x.0;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = x.0;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        NodeId(root)
    }

    /// Merge the sets of `a` and `b`. Returns true if they were distinct.
    pub fn union(&mut self, a: NodeId, b: NodeId) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (ra, rb) = (ra.0 as usize, rb.0 as usize);
        let (big, small) = if self.rank[ra] >= self.rank[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big as u32;
        self.size[big] += self.size[small];
        if self.rank[big] == self.rank[small] {
            self.rank[big] += 1;
        }
        true
    }

    pub fn same(&mut self, a: NodeId, b: NodeId) -> bool {
        self.find(a) == self.find(b)
    }

    /// Number of members in `x`'s set.
    pub fn size(&mut self, x: NodeId) -> usize {
        let root = self.find(x);
        self.size[root.index()] as usize
    }

    /// Sets over `members`, keyed by their smallest member. Member lists are
    /// sorted.
    pub fn groups(&mut self, members: impl IntoIterator<Item = NodeId>) -> BTreeMap<NodeId, Vec<NodeId>> {
        let mut by_root: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for m in members {
            let root = self.find(m);
            by_root.entry(root).or_default().push(m);
        }
        by_root
            .into_values()
            .map(|mut v| {
                v.sort();
                (v[0], v)
            })
            .collect()
    }
}
