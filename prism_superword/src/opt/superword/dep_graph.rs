//! Memory dependence graph.
//!
//! One [`DepNode`] per memory operation in the block, plus `Root` and `Tail`
//! sentinels. An edge `a -> b` means `b` must not move above `a`. Nodes and
//! edges live in arenas; adjacency is kept as small id lists.
//!
//! [`DepPreds`] and [`DepSuccs`] merge these edges with ordinary data edges,
//! so callers can walk "everything `n` depends on" without caring whether
//! `n` touches memory.

use super::block::Block;
use super::sw_pointer::{PointerCmp, SwPointer};
use crate::ir::arena::{Arena, Id};
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use log::trace;
use smallvec::SmallVec;

pub type DepNodeId = Id<DepNode>;
pub type DepEdgeId = Id<DepEdge>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepNodeKind {
    Root,
    Tail,
    Mem(NodeId),
}

#[derive(Debug, Clone)]
pub struct DepNode {
    pub kind: DepNodeKind,
    in_edges: SmallVec<[DepEdgeId; 4]>,
    out_edges: SmallVec<[DepEdgeId; 4]>,
}

#[derive(Debug, Clone, Copy)]
pub struct DepEdge {
    pub pred: DepNodeId,
    pub succ: DepNodeId,
}

// =============================================================================
// Dependence Graph
// =============================================================================

#[derive(Debug, Clone)]
pub struct DepGraph {
    nodes: Arena<DepNode>,
    edges: Arena<DepEdge>,
    root: DepNodeId,
    tail: DepNodeId,
    /// Block position to dependence node.
    map: Vec<Option<DepNodeId>>,
}

impl DepGraph {
    pub fn new(block_len: usize) -> Self {
        let mut nodes = Arena::new();
        let root = nodes.alloc(DepNode::new(DepNodeKind::Root));
        let tail = nodes.alloc(DepNode::new(DepNodeKind::Tail));
        DepGraph {
            nodes,
            edges: Arena::new(),
            root,
            tail,
            map: vec![None; block_len],
        }
    }

    /// Build edges between every possibly-aliasing pair of each slice.
    ///
    /// `pointers` is indexed by block position.
    pub fn build(graph: &Graph, block: &Block, pointers: &[Option<SwPointer>]) -> Self {
        let mut dg = DepGraph::new(block.len());
        for slice in block.slices() {
            for &n in &slice.ops {
                if let Some(idx) = block.idx(n) {
                    dg.make_node(n, idx);
                }
            }
        }

        for slice in block.slices() {
            for (j, &later) in slice.ops.iter().enumerate() {
                let later_dn = dg.dep_of(block, later);
                let later_ptr = block.idx(later).and_then(|i| pointers[i]);
                let mut has_pred = false;
                for &earlier in &slice.ops[..j] {
                    if !graph.node(earlier).is_store() && !graph.node(later).is_store() {
                        continue;
                    }
                    let earlier_ptr = block.idx(earlier).and_then(|i| pointers[i]);
                    let relation = match (earlier_ptr, later_ptr) {
                        (Some(p), Some(q)) => p.cmp(&q),
                        _ => PointerCmp::NotComparable,
                    };
                    if relation.is_disjoint() {
                        continue;
                    }
                    if let (Some(e), Some(l)) = (dg.dep_of(block, earlier), later_dn) {
                        dg.make_edge(e, l);
                        has_pred = true;
                        trace!("dep {:?} -> {:?} ({:?})", earlier, later, relation);
                    }
                }
                if let (false, Some(l)) = (has_pred, later_dn) {
                    let root = dg.root;
                    dg.make_edge(root, l);
                }
            }
        }

        let mem: Vec<DepNodeId> = dg
            .map
            .iter()
            .flatten()
            .copied()
            .filter(|&d| dg.nodes[d].out_edges.is_empty())
            .collect();
        let tail = dg.tail;
        for d in mem {
            dg.make_edge(d, tail);
        }
        dg
    }

    pub fn make_node(&mut self, n: NodeId, idx: usize) -> DepNodeId {
        let id = self.nodes.alloc(DepNode::new(DepNodeKind::Mem(n)));
        if idx >= self.map.len() {
            self.map.resize(idx + 1, None);
        }
        self.map[idx] = Some(id);
        id
    }

    pub fn make_edge(&mut self, pred: DepNodeId, succ: DepNodeId) -> DepEdgeId {
        let e = self.edges.alloc(DepEdge { pred, succ });
        self.nodes[pred].out_edges.push(e);
        self.nodes[succ].in_edges.push(e);
        e
    }

    #[inline]
    pub fn root(&self) -> DepNodeId {
        self.root
    }

    #[inline]
    pub fn tail(&self) -> DepNodeId {
        self.tail
    }

    /// Dependence node at block position `idx`.
    #[inline]
    pub fn dep(&self, idx: usize) -> Option<DepNodeId> {
        self.map.get(idx).copied().flatten()
    }

    fn dep_of(&self, block: &Block, n: NodeId) -> Option<DepNodeId> {
        block.idx(n).and_then(|i| self.dep(i))
    }

    #[inline]
    pub fn kind(&self, d: DepNodeId) -> DepNodeKind {
        self.nodes[d].kind
    }

    pub fn preds(&self, d: DepNodeId) -> impl Iterator<Item = DepNodeId> + '_ {
        self.nodes[d].in_edges.iter().map(|&e| self.edges[e].pred)
    }

    pub fn succs(&self, d: DepNodeId) -> impl Iterator<Item = DepNodeId> + '_ {
        self.nodes[d].out_edges.iter().map(|&e| self.edges[e].succ)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Real memory operations among `ids`, sentinels dropped.
    fn mem_nodes(&self, ids: impl Iterator<Item = DepNodeId>) -> SmallVec<[NodeId; 8]> {
        ids.filter_map(|d| match self.nodes[d].kind {
            DepNodeKind::Mem(n) => Some(n),
            _ => None,
        })
        .collect()
    }
}

impl DepNode {
    fn new(kind: DepNodeKind) -> Self {
        DepNode {
            kind,
            in_edges: SmallVec::new(),
            out_edges: SmallVec::new(),
        }
    }
}

// =============================================================================
// Unified Neighbor Iteration
// =============================================================================

/// Everything `n` depends on: memory predecessors from the dependence graph
/// plus address and value inputs for memory ops, or all data inputs
/// otherwise. Nodes outside the block are included; callers filter.
pub struct DepPreds {
    items: SmallVec<[NodeId; 8]>,
    pos: usize,
}

impl DepPreds {
    pub fn new(graph: &Graph, block: &Block, dg: &DepGraph, n: NodeId) -> Self {
        let node = graph.node(n);
        let mut items = SmallVec::new();
        if node.is_mem() {
            if let Some(d) = dg.dep_of(block, n) {
                items.extend(dg.mem_nodes(dg.preds(d)));
            }
        }
        items.extend(node.inputs[node.first_data_input().min(node.req())..].iter().copied());
        DepPreds { items, pos: 0 }
    }
}

impl Iterator for DepPreds {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let item = self.items.get(self.pos).copied();
        self.pos += 1;
        item
    }
}

/// Everything that depends on `n`: memory successors plus data uses.
pub struct DepSuccs {
    items: SmallVec<[NodeId; 8]>,
    pos: usize,
}

impl DepSuccs {
    pub fn new(graph: &Graph, block: &Block, dg: &DepGraph, n: NodeId) -> Self {
        let mut items: SmallVec<[NodeId; 8]> = SmallVec::new();
        if graph.node(n).is_mem() {
            if let Some(d) = dg.dep_of(block, n) {
                items.extend(dg.mem_nodes(dg.succs(d)));
            }
        }
        for u in graph.distinct_uses(n) {
            if !items.contains(&u) {
                items.push(u);
            }
        }
        DepSuccs { items, pos: 0 }
    }
}

impl Iterator for DepSuccs {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let item = self.items.get(self.pos).copied();
        self.pos += 1;
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::LoopBuilder;
    use crate::ir::types::BasicType;

    fn build(b: LoopBuilder) -> (Graph, Block, DepGraph) {
        let (g, lp) = b.finish();
        let block = Block::build(&g, &lp, 1000).expect("block");
        let pointers: Vec<Option<SwPointer>> = block
            .nodes()
            .iter()
            .map(|&n| {
                g.node(n).is_mem().then(|| SwPointer::new(&g, &lp, n)).filter(|p| p.valid())
            })
            .collect();
        let dg = DepGraph::build(&g, &block, &pointers);
        (g, block, dg)
    }

    #[test]
    fn test_disjoint_refs_have_no_edge() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let x = b.load(a, 0);
        let s = b.store(a, 1, x);
        let (g, block, dg) = build(b);
        let preds: Vec<_> = DepPreds::new(&g, &block, &dg, s).collect();
        assert!(preds.contains(&x));
        let dx = dg.dep(block.idx(x).expect("load")).expect("dep node");
        assert_eq!(dg.succs(dx).collect::<Vec<_>>(), vec![dg.tail()]);
        let ds = dg.dep(block.idx(s).expect("store")).expect("dep node");
        assert_eq!(dg.preds(ds).collect::<Vec<_>>(), vec![dg.root()]);
    }

    #[test]
    fn test_overlapping_refs_are_ordered() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let x = b.load(a, 0);
        let c = b.invariant(BasicType::Int);
        let s = b.store(a, 0, c);
        let (g, block, dg) = build(b);
        let dx = dg.dep(block.idx(x).expect("load")).expect("dep node");
        let ds = dg.dep(block.idx(s).expect("store")).expect("dep node");
        assert_eq!(dg.succs(dx).collect::<Vec<_>>(), vec![ds]);
        assert_eq!(dg.succs(ds).collect::<Vec<_>>(), vec![dg.tail()]);
        let preds: Vec<_> = DepPreds::new(&g, &block, &dg, s).collect();
        assert!(preds.contains(&x));
        let succs: Vec<_> = DepSuccs::new(&g, &block, &dg, x).collect();
        assert!(succs.contains(&s));
    }

    #[test]
    fn test_unknown_address_is_conservative() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let idx_arr = b.distinct_array(BasicType::Int);
        let idx = b.load(idx_arr, 0);
        let c = b.invariant(BasicType::Int);
        let s0 = b.store_at(a, idx, c);
        let s1 = b.store(a, 1, c);
        let (_g, block, dg) = build(b);
        let d0 = dg.dep(block.idx(s0).expect("store")).expect("dep node");
        let d1 = dg.dep(block.idx(s1).expect("store")).expect("dep node");
        assert!(dg.succs(d0).any(|d| d == d1));
    }

    #[test]
    fn test_loads_never_depend_on_loads() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let x = b.load(a, 0);
        let y = b.load(a, 0);
        let (_g, block, dg) = build(b);
        for n in [x, y] {
            let d = dg.dep(block.idx(n).expect("load")).expect("dep node");
            assert_eq!(dg.preds(d).collect::<Vec<_>>(), vec![dg.root()]);
            assert_eq!(dg.succs(d).collect::<Vec<_>>(), vec![dg.tail()]);
        }
    }
}
