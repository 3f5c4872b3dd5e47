//! The loop body as one straight-line block.
//!
//! Nodes are ordered so that every node follows its in-block inputs (phi
//! backedges excepted) and every load precedes the store that overwrites
//! the memory state it reads. Memory operations are grouped into slices,
//! one per memory phi on the loop head.

use super::error::SlpError;
use crate::ir::arena::{BitSet, SecondaryMap};
use crate::ir::graph::Graph;
use crate::ir::loops::CountedLoop;
use crate::ir::node::{Node, NodeFlags, NodeId};
use crate::ir::operators::{Operator, VectorKind, VectorOp};
use log::trace;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Memory operations of one alias class, in block order.
#[derive(Debug, Clone)]
pub struct MemSlice {
    pub phi: NodeId,
    pub ops: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    nodes: Vec<NodeId>,
    bb_idx: SecondaryMap<Node, Option<u32>>,
    slices: Vec<MemSlice>,
    address_only: BitSet,
}

impl Block {
    /// Collect and order the body of `lp`.
    ///
    /// Fails before touching the graph if the body holds control flow other
    /// than the loop head and backedge test.
    pub fn build(graph: &Graph, lp: &CountedLoop, max_nodes: usize) -> Result<Block, SlpError> {
        let mut candidates = BitSet::with_capacity(graph.len());
        let mut roots = Vec::new();
        for n in lp.body() {
            let node = graph.node(n);
            if node.is_dead() {
                continue;
            }
            if node.op.is_control() {
                if n != lp.head && n != lp.loop_end {
                    return Err(SlpError::UnsupportedControl { node: n });
                }
                continue;
            }
            if node.flags.contains(NodeFlags::PINNED) {
                continue;
            }
            if !node.is_mem() && !node.is_phi() && graph.use_count(n) == 0 {
                continue;
            }
            candidates.insert(n.as_usize());
            roots.push(n);
        }
        if roots.len() > max_nodes {
            return Err(SlpError::BlockTooLarge {
                nodes: roots.len(),
                limit: max_nodes,
            });
        }

        let readers = readers_before_stores(graph, &roots, &candidates);

        // Iterative postorder over inputs: defs land before their uses, and
        // loads of a memory state land before the store that replaces it.
        let mut visited = BitSet::with_capacity(graph.len());
        let mut nodes = Vec::with_capacity(roots.len());
        let mut stack: Vec<(NodeId, usize)> = Vec::new();
        for root in roots {
            if !visited.insert(root.as_usize()) {
                continue;
            }
            stack.push((root, 0));
            while let Some(top) = stack.last_mut() {
                let (n, next) = *top;
                let node = graph.node(n);
                let extra = readers.get(&n).map_or(&[][..], |r| &r[..]);
                if node.is_phi() || next >= node.req() + extra.len() {
                    stack.pop();
                    nodes.push(n);
                    continue;
                }
                top.1 += 1;
                let input = if next < node.req() {
                    node.inputs[next]
                } else {
                    extra[next - node.req()]
                };
                if candidates.contains(input.as_usize()) && visited.insert(input.as_usize()) {
                    stack.push((input, 0));
                }
            }
        }

        let mut bb_idx = SecondaryMap::with_len(graph.len());
        for (i, &n) in nodes.iter().enumerate() {
            bb_idx[n] = Some(i as u32);
        }

        // A load whose address needs the store's result cannot also read
        // the state before it.
        for (&st, loads) in &readers {
            for &ld in loads {
                if bb_idx[ld] > bb_idx[st] {
                    trace!("block: {:?} reads the state {:?} overwrites", ld, st);
                    return Err(SlpError::ScheduleConflict { node: ld });
                }
            }
        }

        let mut block = Block {
            nodes,
            bb_idx,
            slices: Vec::new(),
            address_only: BitSet::with_capacity(graph.len()),
        };
        block.compute_slices(graph, lp);
        block.compute_address_only(graph);
        trace!(
            "block: {} nodes, {} memory slices",
            block.nodes.len(),
            block.slices.len()
        );
        Ok(block)
    }

    fn compute_slices(&mut self, graph: &Graph, lp: &CountedLoop) {
        for phi in lp.memory_phis(graph) {
            let ops: Vec<NodeId> = self
                .nodes
                .iter()
                .copied()
                .filter(|&n| graph.node(n).is_mem() && slice_phi(graph, n) == Some(phi))
                .collect();
            self.slices.push(MemSlice { phi, ops });
        }
    }

    /// Mark nodes whose only purpose is computing addresses.
    fn compute_address_only(&mut self, graph: &Graph) {
        for &n in self.nodes.iter().rev() {
            let node = graph.node(n);
            if node.op == Operator::AddP {
                self.address_only.insert(n.as_usize());
                continue;
            }
            if node.is_mem() || node.is_phi() {
                continue;
            }
            let uses = graph.uses(n);
            if !uses.is_empty() && uses.iter().all(|u| self.address_only.contains(u.as_usize())) {
                self.address_only.insert(n.as_usize());
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    #[inline]
    pub fn at(&self, idx: usize) -> NodeId {
        self.nodes[idx]
    }

    /// Block position of `n`.
    #[inline]
    pub fn idx(&self, n: NodeId) -> Option<usize> {
        self.bb_idx.get(n).copied().flatten().map(|i| i as usize)
    }

    #[inline]
    pub fn in_bb(&self, n: NodeId) -> bool {
        self.idx(n).is_some()
    }

    pub fn slices(&self) -> &[MemSlice] {
        &self.slices
    }

    /// Memory operations of every slice, in block order.
    pub fn mem_ops(&self) -> Vec<NodeId> {
        let mut ops: Vec<NodeId> = self.slices.iter().flat_map(|s| s.ops.iter().copied()).collect();
        ops.sort_by_key(|&n| self.idx(n));
        ops
    }

    /// Slice holding memory operation `n`.
    pub fn slice_of(&self, n: NodeId) -> Option<usize> {
        self.slices.iter().position(|s| s.ops.contains(&n))
    }

    #[inline]
    pub fn is_address_only(&self, n: NodeId) -> bool {
        self.address_only.contains(n.as_usize())
    }
}

/// For each store among `roots`, the loads that read the same memory state.
fn readers_before_stores(
    graph: &Graph,
    roots: &[NodeId],
    candidates: &BitSet,
) -> FxHashMap<NodeId, SmallVec<[NodeId; 4]>> {
    let mut readers = FxHashMap::default();
    for &st in roots {
        if !graph.node(st).is_store() {
            continue;
        }
        let Some(state) = graph.node(st).memory_input() else {
            continue;
        };
        let loads: SmallVec<[NodeId; 4]> = graph
            .uses(state)
            .iter()
            .copied()
            .filter(|&u| {
                candidates.contains(u.as_usize())
                    && graph.node(u).is_load()
                    && graph.node(u).memory_input() == Some(state)
            })
            .collect();
        if !loads.is_empty() {
            readers.insert(st, loads);
        }
    }
    readers
}

/// Memory phi reached by walking the store chain above `n`.
pub fn slice_phi(graph: &Graph, n: NodeId) -> Option<NodeId> {
    let mut cur = graph.node(n).memory_input()?;
    for _ in 0..graph.len() {
        let node = graph.node(cur);
        match node.op {
            Operator::Phi => return Some(cur),
            Operator::Memory(_) if node.is_store() => cur = node.input(0)?,
            Operator::Vector(VectorOp {
                kind: VectorKind::Store,
                ..
            }) => cur = node.input(0)?,
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::LoopBuilder;
    use crate::ir::operators::{BinaryOp, ControlOp, MemoryOp};
    use crate::ir::types::BasicType;

    #[test]
    fn test_block_orders_defs_first() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let x = b.load(a, 0);
        let y = b.binary(BinaryOp::Add, x, x);
        let s = b.store(a, 0, y);
        let (g, lp) = b.finish();
        let block = Block::build(&g, &lp, 1000).expect("block");
        let pos = |n| block.idx(n).expect("in block");
        assert!(pos(x) < pos(y));
        assert!(pos(y) < pos(s));
        let adr = g.node(x).address_input().expect("address");
        assert!(pos(adr) < pos(x));
        assert!(block.is_address_only(adr));
        assert!(!block.is_address_only(y));
        assert!(!block.in_bb(a));
        assert!(!block.in_bb(lp.head));
    }

    #[test]
    fn test_block_slices() {
        let mut b = LoopBuilder::new(2);
        let ints = b.array(BasicType::Int);
        let longs = b.array(BasicType::Long);
        let x = b.load(ints, 0);
        let y = b.load(longs, 0);
        let s = b.store(ints, 1, x);
        let (g, lp) = b.finish();
        let block = Block::build(&g, &lp, 1000).expect("block");
        assert_eq!(block.slices().len(), 2);
        assert_eq!(block.slice_of(x), block.slice_of(s));
        assert_ne!(block.slice_of(x), block.slice_of(y));
        assert_eq!(block.mem_ops().len(), 3);
    }

    #[test]
    fn test_load_precedes_overwriting_store() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let c = b.invariant(BasicType::Int);
        let st = b.store(a, 0, c);
        let (mut g, mut lp) = b.finish();
        let phi = lp.memory_phis(&g)[0];
        let adr = g.node(st).address_input().expect("address");
        let ld = g.add_node(Operator::Memory(MemoryOp::Load(BasicType::Int)), &[phi, adr]);
        lp.add_to_body(ld);
        g.add_node(Operator::Control(ControlOp::Return), &[ld]);

        let block = Block::build(&g, &lp, 1000).expect("block");
        assert!(block.idx(ld) < block.idx(st));
        assert_eq!(block.slices()[0].ops, vec![ld, st]);
    }

    #[test]
    fn test_nested_control_rejected() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let x = b.load(a, 0);
        b.store(a, 1, x);
        let (mut g, mut lp) = b.finish();
        let branch = g.add_node(Operator::Control(ControlOp::If), &[lp.head]);
        lp.add_to_body(branch);
        assert_eq!(
            Block::build(&g, &lp, 1000).unwrap_err(),
            SlpError::UnsupportedControl { node: branch }
        );
    }

    #[test]
    fn test_block_size_limit() {
        let mut b = LoopBuilder::new(4);
        let a = b.array(BasicType::Int);
        for k in 0..4 {
            let x = b.load(a, k);
            b.store(a, k, x);
        }
        let (g, lp) = b.finish();
        let err = Block::build(&g, &lp, 8).unwrap_err();
        assert!(matches!(err, SlpError::BlockTooLarge { limit: 8, .. }));
    }

    #[test]
    fn test_unused_and_pinned_nodes_skipped() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let x = b.load(a, 0);
        let dead = b.binary(BinaryOp::Mul, x, x);
        let pinned = b.binary(BinaryOp::Add, x, x);
        b.store(a, 0, pinned);
        let (mut g, lp) = b.finish();
        g.set_flag(pinned, NodeFlags::PINNED, true);
        let block = Block::build(&g, &lp, 1000).expect("block");
        assert!(!block.in_bb(dead));
        assert!(!block.in_bb(pinned));
        assert!(block.in_bb(x));
    }
}
