//! Reduction cycle detection.
//!
//! A reduction is a loop phi whose backedge value is produced by a chain of
//! one associative operator, each link feeding only the next:
//!
//! ```text
//! acc = Phi(head, init, s3)
//! s0 = acc + x0
//! s1 = s0 + x1
//! s2 = s1 + x2
//! s3 = s2 + x3     // backedge; may also be read after the loop
//! ```
//!
//! The chain is found with a bounded breadth-first search forward from the
//! phi, so long or branching use webs cannot exhaust the stack.

use crate::ir::arena::BitSet;
use crate::ir::graph::Graph;
use crate::ir::loops::CountedLoop;
use crate::ir::node::NodeId;
use crate::ir::operators::{BinaryOp, Operator};
use crate::ir::types::{BasicType, ValueType};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// One verified accumulation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionChain {
    pub phi: NodeId,
    /// Chain head first, backedge value last.
    pub nodes: Vec<NodeId>,
    pub op: BinaryOp,
    pub bt: BasicType,
}

impl ReductionChain {
    #[inline]
    pub fn tail(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    /// Chain element feeding `n`, or the phi for the head.
    pub fn chain_input(&self, n: NodeId) -> Option<NodeId> {
        let pos = self.nodes.iter().position(|&c| c == n)?;
        Some(if pos == 0 { self.phi } else { self.nodes[pos - 1] })
    }
}

/// Every reduction of one loop.
#[derive(Debug, Clone, Default)]
pub struct Reductions {
    marked: BitSet,
    chains: Vec<ReductionChain>,
}

impl Reductions {
    /// Find every reduction among the loop phis of `lp`.
    pub fn mark(graph: &Graph, lp: &CountedLoop, chain_limit: usize) -> Self {
        let mut out = Reductions::default();
        for phi in lp.phis(graph) {
            if phi == lp.iv || graph.node(phi).ty.basic_type().is_none() {
                continue;
            }
            if let Some(chain) = find_reduction(graph, lp, phi, chain_limit) {
                for &n in &chain.nodes {
                    out.marked.insert(n.as_usize());
                }
                out.chains.push(chain);
            }
        }
        out
    }

    #[inline]
    pub fn is_marked(&self, n: NodeId) -> bool {
        self.marked.contains(n.as_usize())
    }

    pub fn chains(&self) -> &[ReductionChain] {
        &self.chains
    }

    pub fn chain_of(&self, n: NodeId) -> Option<&ReductionChain> {
        if !self.is_marked(n) {
            return None;
        }
        self.chains.iter().find(|c| c.nodes.contains(&n))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

fn find_reduction(
    graph: &Graph,
    lp: &CountedLoop,
    phi: NodeId,
    chain_limit: usize,
) -> Option<ReductionChain> {
    let tail = graph.input(phi, 2)?;
    let Operator::Binary(op, bt) = graph.op(tail) else {
        return None;
    };
    if !op.reassociates_for(bt) || !lp.contains(tail) {
        return None;
    }
    // The phi feeds the chain head and nothing else.
    if graph.use_count(phi) != 1 {
        return None;
    }
    let same_op = |n: NodeId| graph.op(n) == Operator::Binary(op, bt) && lp.contains(n);
    let nodes = find_in_path(graph, phi, tail, chain_limit, same_op)?;

    let (last, links) = nodes.split_last()?;
    for &n in links {
        if graph.use_count(n) != 1 {
            return None;
        }
    }
    if graph
        .uses(*last)
        .iter()
        .any(|&u| u != phi && lp.contains(u))
    {
        return None;
    }
    Some(ReductionChain {
        phi,
        nodes,
        op,
        bt,
    })
}

/// Shortest use path from `from` to `to` through nodes accepted by
/// `follow`, at most `limit` steps long. The result excludes `from`.
pub fn find_in_path(
    graph: &Graph,
    from: NodeId,
    to: NodeId,
    limit: usize,
    follow: impl Fn(NodeId) -> bool,
) -> Option<Vec<NodeId>> {
    let mut visited = BitSet::with_capacity(graph.len());
    let mut parent: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    let mut queue = VecDeque::new();
    visited.insert(from.as_usize());
    queue.push_back((from, 0usize));

    while let Some((n, depth)) = queue.pop_front() {
        if depth >= limit {
            continue;
        }
        for &u in graph.uses(n) {
            if !follow(u) || !visited.insert(u.as_usize()) {
                continue;
            }
            parent.insert(u, n);
            if u == to {
                let mut path = vec![to];
                let mut cur = to;
                while let Some(&p) = parent.get(&cur) {
                    if p == from {
                        break;
                    }
                    path.push(p);
                    cur = p;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back((u, depth + 1));
        }
    }
    None
}

/// Scalar constant that leaves `op` unchanged.
pub fn identity_for(op: BinaryOp, bt: BasicType) -> Option<(Operator, ValueType)> {
    let ty = ValueType::Scalar(bt);
    let int = |v: i64| Some((Operator::ConstInt(v), ty));
    let float = |v: f64| Some((Operator::ConstFloat(v.to_bits()), ty));
    match (op, bt.is_floating()) {
        (BinaryOp::Add | BinaryOp::Or | BinaryOp::Xor, false) => int(0),
        (BinaryOp::Mul, false) => int(1),
        (BinaryOp::And, false) => int(-1),
        (BinaryOp::Min, false) => int(if bt == BasicType::Long {
            i64::MAX
        } else {
            i64::from(i32::MAX)
        }),
        (BinaryOp::Max, false) => int(if bt == BasicType::Long {
            i64::MIN
        } else {
            i64::from(i32::MIN)
        }),
        (BinaryOp::Min, true) => float(f64::INFINITY),
        (BinaryOp::Max, true) => float(f64::NEG_INFINITY),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::LoopBuilder;

    fn sum_loop(op: BinaryOp, elem: BasicType, lanes: i64) -> (Graph, CountedLoop, NodeId, Vec<NodeId>) {
        let mut b = LoopBuilder::new(lanes as u32);
        let a = b.array(elem);
        let init = b.invariant(elem.promoted());
        let acc = b.accumulator(init);
        let mut cur = acc;
        let mut chain = Vec::new();
        for k in 0..lanes {
            let x = b.load(a, k);
            cur = b.binary(op, cur, x);
            chain.push(cur);
        }
        b.close_accumulator(acc, cur);
        b.exit_use(cur);
        let (g, lp) = b.finish();
        (g, lp, acc, chain)
    }

    #[test]
    fn test_sum_reduction_found() {
        let (g, lp, acc, chain) = sum_loop(BinaryOp::Add, BasicType::Int, 4);
        let reds = Reductions::mark(&g, &lp, 16);
        assert_eq!(reds.len(), 1);
        let found = &reds.chains()[0];
        assert_eq!(found.phi, acc);
        assert_eq!(found.nodes, chain);
        assert_eq!(found.chain_input(chain[0]), Some(acc));
        assert_eq!(found.chain_input(chain[2]), Some(chain[1]));
        assert!(chain.iter().all(|&n| reds.is_marked(n)));
        assert!(!reds.is_marked(acc));
    }

    #[test]
    fn test_chain_limit_bounds_search() {
        let (g, lp, _, _) = sum_loop(BinaryOp::Add, BasicType::Int, 8);
        assert!(Reductions::mark(&g, &lp, 4).is_empty());
        assert_eq!(Reductions::mark(&g, &lp, 8).len(), 1);
    }

    #[test]
    fn test_float_add_not_reassociated() {
        let (g, lp, _, _) = sum_loop(BinaryOp::Add, BasicType::Float, 4);
        assert!(Reductions::mark(&g, &lp, 16).is_empty());
        let (g, lp, _, _) = sum_loop(BinaryOp::Max, BasicType::Double, 4);
        assert_eq!(Reductions::mark(&g, &lp, 16).len(), 1);
    }

    #[test]
    fn test_escaping_link_rejected() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let init = b.invariant(BasicType::Int);
        let acc = b.accumulator(init);
        let x0 = b.load(a, 0);
        let s0 = b.binary(BinaryOp::Add, acc, x0);
        let x1 = b.load(a, 1);
        let s1 = b.binary(BinaryOp::Add, s0, x1);
        b.store(a, 0, s0);
        b.close_accumulator(acc, s1);
        let (g, lp) = b.finish();
        let reds = Reductions::mark(&g, &lp, 16);
        assert!(reds.is_empty());
        assert!(!reds.is_marked(s0));
        assert!(reds.chain_of(s1).is_none());
    }

    #[test]
    fn test_identities() {
        assert_eq!(
            identity_for(BinaryOp::Mul, BasicType::Int),
            Some((Operator::ConstInt(1), ValueType::INT))
        );
        assert_eq!(
            identity_for(BinaryOp::Min, BasicType::Int).map(|(op, _)| op),
            Some(Operator::ConstInt(i64::from(i32::MAX)))
        );
        assert!(identity_for(BinaryOp::Sub, BasicType::Int).is_none());
        assert!(identity_for(BinaryOp::Add, BasicType::Double).is_none());
    }
}
