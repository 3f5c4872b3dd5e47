//! Scheduling packs as units.
//!
//! Every pack becomes one scheduling unit and every other block node its
//! own unit. A topological order over units exists exactly when each pack
//! can execute as one instruction; a cycle means two packs wait on each
//! other and the loop must stay scalar.
//!
//! Once an order exists, each memory slice is rethreaded through its
//! operations in that order, so a vector store's lanes sit back to back
//! in the memory chain.

use super::dep_graph::DepPreds;
use super::error::SlpError;
use super::pack::PackId;
use super::superword::SlpContext;
use crate::ir::arena::BitSet;
use crate::ir::node::NodeId;
use log::{trace, warn};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One scheduling unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Unit {
    Pack(PackId),
    Single(NodeId),
}

impl SlpContext<'_> {
    /// Topological order of units, ties broken by block position.
    pub(super) fn schedule(&self) -> Result<Vec<Unit>, SlpError> {
        let n = self.block.len();
        let mut units: Vec<Unit> = Vec::with_capacity(n);
        let mut keys: Vec<usize> = Vec::with_capacity(n);
        let mut unit_of: Vec<Option<usize>> = vec![None; n];

        for (id, pack) in self.packset.iter() {
            let u = units.len();
            let mut key = usize::MAX;
            for m in pack.members() {
                if let Some(i) = self.block.idx(m) {
                    unit_of[i] = Some(u);
                    key = key.min(i);
                }
            }
            units.push(Unit::Pack(id));
            keys.push(key);
        }
        for (i, slot) in unit_of.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(units.len());
                units.push(Unit::Single(self.block.at(i)));
                keys.push(i);
            }
        }

        let mut succs: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); units.len()];
        let mut in_degree = vec![0usize; units.len()];
        let mut edges: FxHashSet<(usize, usize)> = FxHashSet::default();
        for i in 0..n {
            let node = self.block.at(i);
            if self.graph.node(node).is_phi() {
                continue;
            }
            let Some(to) = unit_of[i] else { continue };
            for pred in DepPreds::new(self.graph, &self.block, &self.dg, node) {
                let Some(from) = self.block.idx(pred).and_then(|p| unit_of[p]) else {
                    continue;
                };
                if from != to && edges.insert((from, to)) {
                    succs[from].push(to);
                    in_degree[to] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(u, _)| Reverse((keys[u], u)))
            .collect();
        let mut order = Vec::with_capacity(units.len());
        while let Some(Reverse((_, u))) = ready.pop() {
            order.push(units[u]);
            for &s in &succs[u] {
                in_degree[s] -= 1;
                if in_degree[s] == 0 {
                    ready.push(Reverse((keys[s], s)));
                }
            }
        }

        if order.len() != units.len() {
            let stuck = (0..units.len())
                .find(|&u| in_degree[u] > 0)
                .map(|u| self.unit_head(units[u]))
                .unwrap_or(self.lp.head);
            warn!("superword: dependence cycle through {:?}", stuck);
            return Err(SlpError::ScheduleConflict { node: stuck });
        }
        Ok(order)
    }

    /// First node of a unit.
    pub(super) fn unit_head(&self, unit: Unit) -> NodeId {
        match unit {
            Unit::Pack(id) => self.packset.get(id).first(),
            Unit::Single(n) => n,
        }
    }

    /// Memory operations of a unit, lane order for packs.
    fn unit_mem_ops(&self, unit: Unit) -> SmallVec<[NodeId; 8]> {
        let nodes: SmallVec<[NodeId; 8]> = match unit {
            Unit::Pack(id) => SmallVec::from_slice(self.packset.get(id).lanes()),
            Unit::Single(n) => SmallVec::from_slice(&[n]),
        };
        nodes
            .into_iter()
            .filter(|&m| self.graph.node(m).is_mem())
            .collect()
    }

    /// Rethread every memory slice in schedule order.
    pub(super) fn reorder_memops(&mut self, order: &[Unit]) {
        for s in 0..self.block.slices().len() {
            let phi = self.block.slices()[s].phi;
            let mut in_slice = BitSet::with_capacity(self.graph.len());
            for &m in &self.block.slices()[s].ops {
                in_slice.insert(m.as_usize());
            }

            let mut current = phi;
            for &unit in order {
                for m in self.unit_mem_ops(unit) {
                    if !in_slice.contains(m.as_usize()) {
                        continue;
                    }
                    self.graph.replace_input(m, 0, current);
                    if self.graph.node(m).is_store() {
                        current = m;
                    }
                }
            }
            self.graph.replace_input(phi, 2, current);
            trace!("slice {:?} rethreaded, backedge {:?}", phi, current);
        }
    }
}
