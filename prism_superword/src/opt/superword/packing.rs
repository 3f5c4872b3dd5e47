//! Pack discovery.
//!
//! Three steps build the pack set:
//!
//! 1. **Seeding**: adjacent memory references aligned against one anchor
//!    per round become pairs.
//! 2. **Extension**: pairs grow along use-def and def-use edges while the
//!    estimated savings stay non-negative.
//! 3. **Combination**: pairs that chain (`(a, b)`, `(b, c)`) merge into
//!    packs, which are then cut to the target's register width.

use super::cmove::CMoveKit;
use super::error::SlpError;
use super::node_info::Alignment;
use super::pack::{OrderedPair, Pack, PackId};
use super::superword::SlpContext;
use super::trace::TraceFlags;
use crate::ir::loops::PreLoopAdjustment;
use crate::ir::node::NodeId;
use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::cmp::Ordering;

/// Nodes whose two operands get swapped to line up a candidate pair.
pub(super) type Commutes = SmallVec<[NodeId; 2]>;

/// Savings credited for an operand pair that is already adjacent in memory.
const ADJACENT_PROFIT: i32 = 2;
/// Cost of packing two scalars into a vector.
const PACK_COST: i32 = 2;
/// Cost of extracting a lane.
const UNPACK_COST: i32 = 1;

impl SlpContext<'_> {
    // =========================================================================
    // Seeding
    // =========================================================================

    /// Seed the pack set with adjacent, alignment-compatible memory pairs.
    pub(super) fn find_adjacent_refs(&mut self) -> Result<(), SlpError> {
        let mut memops: Vec<NodeId> = self
            .block
            .mem_ops()
            .into_iter()
            .filter(|&n| self.ptr(n).is_some())
            .collect();
        let mut seen: FxHashSet<OrderedPair> = FxHashSet::default();
        let mut widest: Option<PreLoopAdjustment> = None;

        while !memops.is_empty() {
            let Some(mem_ref) = self.find_align_to_ref(&memops) else {
                break;
            };
            let iv_adjustment = self.get_iv_adjustment(mem_ref);
            if self.tracing(TraceFlags::ADJACENT) {
                trace!(
                    "alignment anchor {:?}, iv adjustment {}",
                    mem_ref,
                    iv_adjustment
                );
            }

            let vw = self.vector_width_in_bytes(mem_ref);
            if widest.map_or(true, |w| vw > w.vector_width) {
                widest = self.pre_loop_adjustment_for(mem_ref, iv_adjustment);
            }

            let class: Vec<NodeId> = memops
                .iter()
                .copied()
                .filter(|&s| s == mem_ref || self.same_class(s, mem_ref))
                .collect();
            for &s in &class {
                let align = self.memory_alignment(s, iv_adjustment);
                self.set_alignment(s, align);
            }

            for &s1 in &memops {
                if self.alignment(s1).is_top() {
                    continue;
                }
                for &s2 in &memops {
                    if s1 == s2 || self.alignment(s2).is_top() {
                        continue;
                    }
                    let align = self.alignment(s1);
                    if self.are_adjacent_refs(s1, s2)
                        && self.stmts_can_pack(s1, s2, align)
                        && seen.insert(OrderedPair::new(s1, s2))
                    {
                        if self.tracing(TraceFlags::ADJACENT) {
                            trace!("  seed ({:?}, {:?}) at {}", s1, s2, align);
                        }
                        self.packset.push(Pack::pair(s1, s2));
                    }
                }
            }

            memops.retain(|&s| self.alignment(s).is_top());
        }

        if self.packset.is_empty() {
            return Err(SlpError::NoPacks);
        }
        self.pre_loop = widest;
        Ok(())
    }

    /// Same operation on the same array, so one alignment covers both.
    fn same_class(&self, s1: NodeId, s2: NodeId) -> bool {
        if self.graph.op(s1) != self.graph.op(s2) {
            return false;
        }
        match (self.ptr(s1), self.ptr(s2)) {
            (Some(p1), Some(p2)) => p1.comparable(p2),
            _ => false,
        }
    }

    /// Pick the reference the other memory ops align against, or `None`
    /// when no reference has a partner.
    ///
    /// Stores win over loads, then the most comparable partners, the widest
    /// vector, the smallest element, the smallest offset and the lowest id.
    pub(super) fn find_align_to_ref(&self, memops: &[NodeId]) -> Option<NodeId> {
        let key = |s: NodeId| {
            let partners = memops
                .iter()
                .filter(|&&t| t != s && self.same_class(s, t))
                .count();
            let offset = self.ptr(s).map_or(i32::MAX, |p| p.offset_in_bytes());
            (
                self.graph.node(s).is_store(),
                partners,
                self.vector_width_in_bytes(s),
                -self.data_size(s),
                -offset,
                std::cmp::Reverse(s),
            )
        };
        let best = memops.iter().copied().max_by(|&a, &b| key(a).cmp(&key(b)))?;
        let partners = key(best).1;
        (partners > 0).then_some(best)
    }

    /// Pre-loop iterations, in elements, that align `mem_ref` to its
    /// vector width.
    pub(super) fn get_iv_adjustment(&self, mem_ref: NodeId) -> i32 {
        let Some(p) = self.ptr(mem_ref) else {
            return 0;
        };
        let scale = p.scale_in_bytes();
        let elem = p.memory_size();
        let vw = self.vector_width_in_bytes(mem_ref);
        if scale == 0 || vw == 0 || elem == 0 {
            return 0;
        }
        let stride_sign = if scale * self.lp.stride > 0 { 1 } else { -1 };
        (stride_sign * vw - p.offset_in_bytes() % vw) / elem
    }

    /// Byte offset of `s` within its vector once the pre-loop has run
    /// `iv_adjustment` iterations.
    pub(super) fn memory_alignment(&self, s: NodeId, iv_adjustment: i32) -> Alignment {
        let Some(p) = self.ptr(s) else {
            return Alignment::Bottom;
        };
        let vw = self.vector_width_in_bytes(s);
        let elem = p.memory_size();
        if vw < 2 || elem == 0 {
            return Alignment::Bottom;
        }
        let offset = p.offset_in_bytes() + iv_adjustment * elem;
        let off_mod = offset.rem_euclid(vw);
        if off_mod % elem != 0 {
            return Alignment::Bottom;
        }
        Alignment::Offset(off_mod)
    }

    fn pre_loop_adjustment_for(&self, anchor: NodeId, iv_adjustment: i32) -> Option<PreLoopAdjustment> {
        let p = self.ptr(anchor)?;
        Some(PreLoopAdjustment {
            anchor,
            offset: p.offset_in_bytes(),
            scale: p.scale_in_bytes(),
            pre_stride: self.lp.scalar_stride(),
            vector_width: self.vector_width_in_bytes(anchor),
            iv_adjustment,
            has_invariant: p.invar().is_some(),
        })
    }

    // =========================================================================
    // Extension
    // =========================================================================

    /// Grow the seed pairs until no pack adds a new pair.
    pub(super) fn extend_packlist(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            let mut i = 0;
            while i < self.packset.len() {
                changed |= self.follow_use_defs(PackId::new(i as u32));
                i += 1;
            }
            let mut i = 0;
            while i < self.packset.len() {
                changed |= self.follow_def_uses(PackId::new(i as u32));
                i += 1;
            }
        }
    }

    /// Input positions that become vector operands.
    pub(super) fn vector_operand_range(&self, n: NodeId) -> std::ops::Range<usize> {
        let node = self.graph.node(n);
        if node.is_load() {
            0..0
        } else if node.is_store() {
            2..3
        } else {
            let start = node.first_data_input().min(node.req());
            start..node.req()
        }
    }

    /// Pair the operands of pack `p`.
    fn follow_use_defs(&mut self, p: PackId) -> bool {
        let pack = self.packset.get(p);
        let (s1, s2) = (pack.at(0), pack.at(1));
        if self.graph.node(s1).is_load() {
            return false;
        }
        let align = self.alignment(s1);
        let mut changed = false;
        for j in self.vector_operand_range(s1) {
            let (Some(t1), Some(t2)) = (self.graph.input(s1, j), self.graph.input(s2, j)) else {
                continue;
            };
            if !self.in_bb(t1) || !self.in_bb(t2) {
                continue;
            }
            let align = self.adjust_alignment_for_type_conversion(s1, t1, align);
            if self.stmts_can_pack(t1, t2, align) && self.est_savings(t1, t2) >= 0 {
                self.packset.push(Pack::pair(t1, t2));
                self.set_alignment_pair(t1, t2, align);
                changed = true;
            }
        }
        changed
    }

    /// Pair the most profitable users of pack `p`.
    fn follow_def_uses(&mut self, p: PackId) -> bool {
        let pack = self.packset.get(p);
        let (s1, s2) = (pack.at(0), pack.at(1));
        if self.graph.node(s1).is_store() {
            return false;
        }
        let align = self.alignment(s1);
        let mut savings = -1;
        let mut best: Option<(NodeId, NodeId, Commutes)> = None;
        let uses1 = self.graph.distinct_uses(s1);
        let uses2 = self.graph.distinct_uses(s2);
        for &t1 in &uses1 {
            if !self.in_bb(t1) || t1 == self.lp.incr {
                continue;
            }
            for &t2 in &uses2 {
                if !self.in_bb(t2) || t2 == t1 {
                    continue;
                }
                let Some(swaps) = self.opnd_positions_match(s1, t1, s2, t2) else {
                    continue;
                };
                // Judge the pair as it would look commuted, then put it back.
                for &n in &swaps {
                    self.graph.swap_inputs(n, 0, 1);
                }
                let my_savings = self
                    .stmts_can_pack(t1, t2, align)
                    .then(|| self.est_savings(t1, t2));
                for &n in &swaps {
                    self.graph.swap_inputs(n, 0, 1);
                }
                if let Some(my_savings) = my_savings.filter(|&v| v > savings) {
                    savings = my_savings;
                    best = Some((t1, t2, swaps));
                }
            }
        }
        match best {
            Some((u1, u2, swaps)) if savings >= 0 => {
                for n in swaps {
                    self.order_def_uses(n);
                }
                self.packset.push(Pack::pair(u1, u2));
                self.set_alignment_pair(u1, u2, align);
                true
            }
            _ => false,
        }
    }

    /// `d1` feeds `u1` in the same operand positions as `d2` feeds `u2`,
    /// possibly after commuting. Returns the nodes whose two operands must
    /// be swapped to line the pair up; the graph is left untouched.
    pub(super) fn opnd_positions_match(
        &self,
        d1: NodeId,
        u1: NodeId,
        d2: NodeId,
        u2: NodeId,
    ) -> Option<Commutes> {
        if self.reductions.is_marked(u1) && self.reductions.is_marked(u2) {
            return Some(
                [u1, u2]
                    .into_iter()
                    .filter(|&n| self.chain_operand_second(n))
                    .collect(),
            );
        }
        let positions = |d: NodeId, u: NodeId| -> SmallVec<[usize; 4]> {
            self.graph
                .node(u)
                .inputs
                .iter()
                .enumerate()
                .filter(|&(_, &i)| i == d)
                .map(|(pos, _)| pos)
                .collect()
        };
        let p1 = positions(d1, u1);
        let p2 = positions(d2, u2);
        if p1.is_empty() || p2.is_empty() {
            return None;
        }
        if p1 == p2 {
            return Some(Commutes::new());
        }
        let commutes = self.graph.op(u2).is_commutative()
            && p1.len() == 1
            && p2.len() == 1
            && p1[0] + p2[0] == 1;
        commutes.then(|| Commutes::from_slice(&[u2]))
    }

    /// Swap the operands of commutative `n`, remembering the swap.
    pub(super) fn order_def_uses(&mut self, n: NodeId) {
        self.graph.swap_inputs(n, 0, 1);
        self.swap_log.push((n, 0, 1));
        trace!("commuted operands of {:?}", n);
    }

    /// Reduction node `n` carries its chain operand in position 1 and can
    /// move it to position 0.
    fn chain_operand_second(&self, n: NodeId) -> bool {
        let chain_input = self
            .reductions
            .chain_of(n)
            .and_then(|chain| chain.chain_input(n));
        chain_input.is_some()
            && self.graph.input(n, 1) == chain_input
            && self.graph.op(n).is_commutative()
    }

    /// Estimated savings of packing `s1` with `s2`.
    ///
    /// Operands already adjacent or already packed together are credits;
    /// operands that would need a pack built for them are debits. The use
    /// side credits users already paired lane for lane.
    pub(super) fn est_savings(&self, s1: NodeId, s2: NodeId) -> i32 {
        // Two scalar ops become one vector op.
        let mut save_in = 2 - 1;
        for i in self.vector_operand_range(s1) {
            let (x1, x2) = (self.graph.input(s1, i), self.graph.input(s2, i));
            let (Some(x1), Some(x2)) = (x1, x2) else {
                continue;
            };
            if x1 == x2 {
                continue;
            }
            if self.are_adjacent_refs(x1, x2) {
                save_in += ADJACENT_PROFIT;
            } else if !self.packset.contains_span(x1, x2) {
                save_in -= PACK_COST;
            } else {
                save_in += 2 * UNPACK_COST;
            }
        }

        let mut save_use = 0;
        let mut ct = 0;
        let s2_uses = self.graph.distinct_uses(s2);
        for s1_use in self.graph.distinct_uses(s1) {
            for (_, p) in self.packset.iter() {
                if p.first() != s1_use {
                    continue;
                }
                for &s2_use in &s2_uses {
                    if p.last() == s2_use {
                        ct += 1;
                        if self.are_adjacent_refs(s1_use, s2_use) {
                            save_use += ADJACENT_PROFIT;
                        }
                    }
                }
            }
        }
        if ct < self.graph.use_count(s1) {
            save_use += UNPACK_COST;
        }
        if ct < self.graph.use_count(s2) {
            save_use += UNPACK_COST;
        }
        save_in.max(save_use)
    }

    // =========================================================================
    // Combination
    // =========================================================================

    /// Merge chaining pairs, cut packs to register width, and index the
    /// result by node.
    pub(super) fn combine_packs(&mut self) -> Result<(), SlpError> {
        self.packset.combine();

        let mut kept = Vec::with_capacity(self.packset.len());
        for pack in self.packset.take_all() {
            let Some(bt) = self.velt_type(pack.first()) else {
                continue;
            };
            if !pack.len().is_power_of_two() {
                trace!("dropping {}-lane pack {:?}", pack.len(), pack);
                continue;
            }
            let max = self.target.max_vector_size(bt);
            if pack.len() <= max {
                kept.push(pack);
            } else if self.reductions.is_marked(pack.first()) {
                trace!("dropping reduction pack wider than {} lanes", max);
            } else {
                kept.extend(pack.split(max));
            }
        }
        kept.sort_by(|a, b| self.block_order(a.first(), b.first()));
        self.packset.replace_all(kept);

        if self.packset.is_empty() {
            return Err(SlpError::NoPacks);
        }
        self.construct_my_pack_map()?;

        for (_, pack) in self.packset.iter() {
            let size = self.data_size(pack.first());
            self.size_stats.record(size);
        }
        Ok(())
    }

    fn block_order(&self, a: NodeId, b: NodeId) -> Ordering {
        self.block.idx(a).cmp(&self.block.idx(b))
    }

    /// Point every member's `my_pack` at its pack.
    pub(super) fn construct_my_pack_map(&mut self) -> Result<(), SlpError> {
        self.packset
            .verify_injective()
            .map_err(|node| SlpError::ScheduleConflict { node })?;
        self.info.clear_packs();
        let mut owners: Vec<(usize, PackId)> = Vec::new();
        for (id, pack) in self.packset.iter() {
            owners.extend(pack.members().filter_map(|n| self.block.idx(n)).map(|i| (i, id)));
        }
        for (i, id) in owners {
            self.info.get_mut(i).my_pack = Some(id);
        }
        Ok(())
    }

    /// Fold compare and bool packs into the select packs reading them.
    pub(super) fn merge_cmove_packs(&mut self) -> Result<usize, SlpError> {
        let owners: FxHashMap<NodeId, PackId> = self
            .packset
            .iter()
            .flat_map(|(id, pack)| pack.members().map(move |n| (n, id)))
            .collect();
        let fused =
            CMoveKit::merge_packs(self.graph, &mut self.packset, |n| owners.get(&n).copied());
        if fused > 0 {
            self.construct_my_pack_map()?;
        }
        Ok(fused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::LoopBuilder;
    use crate::ir::graph::Graph;
    use crate::ir::loops::CountedLoop;
    use crate::ir::operators::BinaryOp;
    use crate::ir::types::BasicType;
    use crate::opt::superword::target::{CostModel, SimdLevel, SimdTarget};
    use crate::opt::superword::SuperWordConfig;

    /// `a[i + k] = a[i + k] + a[i + k]` unrolled four times.
    fn in_place_add() -> (Graph, CountedLoop, Vec<NodeId>, Vec<NodeId>) {
        let mut b = LoopBuilder::new(4);
        let a = b.array(BasicType::Int);
        let (mut loads, mut stores) = (Vec::new(), Vec::new());
        for k in 0..4 {
            let x = b.load(a, k);
            let y = b.binary(BinaryOp::Add, x, x);
            loads.push(x);
            stores.push(b.store(a, k, y));
        }
        let (g, lp) = b.finish();
        (g, lp, loads, stores)
    }

    #[test]
    fn test_alignment_anchor_prefers_stores() {
        let (mut g, mut lp, loads, stores) = in_place_add();
        let config = SuperWordConfig::default();
        let target = SimdTarget::new(SimdLevel::Avx2);
        let cost = CostModel::default();
        let cx = SlpContext::new(&mut g, &mut lp, &config, &target, &cost).expect("context");
        let all: Vec<NodeId> = loads.iter().chain(stores.iter()).copied().collect();
        assert_eq!(cx.find_align_to_ref(&all), Some(stores[0]));
        assert_eq!(cx.find_align_to_ref(&loads), Some(loads[0]));
        assert_eq!(cx.find_align_to_ref(&loads[..1]), None);
    }

    #[test]
    fn test_iv_adjustment_and_alignment() {
        let (mut g, mut lp, loads, _) = in_place_add();
        let config = SuperWordConfig::default();
        let target = SimdTarget::new(SimdLevel::Avx2);
        let cost = CostModel::default();
        let cx = SlpContext::new(&mut g, &mut lp, &config, &target, &cost).expect("context");
        // Four int lanes: 16-byte vectors, elements at 16 + 4k.
        assert_eq!(cx.vector_width_in_bytes(loads[0]), 16);
        let adj = cx.get_iv_adjustment(loads[0]);
        assert_eq!(adj, 4);
        let aligns: Vec<Alignment> = loads.iter().map(|&l| cx.memory_alignment(l, adj)).collect();
        assert_eq!(
            aligns,
            vec![
                Alignment::Offset(0),
                Alignment::Offset(4),
                Alignment::Offset(8),
                Alignment::Offset(12)
            ]
        );
    }

    #[test]
    fn test_find_adjacent_refs_seeds_pairs() {
        let (mut g, mut lp, loads, stores) = in_place_add();
        let config = SuperWordConfig::default();
        let target = SimdTarget::new(SimdLevel::Avx2);
        let cost = CostModel::default();
        let mut cx = SlpContext::new(&mut g, &mut lp, &config, &target, &cost).expect("context");
        cx.find_adjacent_refs().expect("pairs");
        // Three store pairs and three load pairs.
        assert_eq!(cx.packset.len(), 6);
        assert!(cx.packset.exists_at(stores[0], 0));
        assert!(cx.packset.exists_at(loads[3], 1));
        assert!(!cx.packset.exists_at(loads[3], 0));
        let adj = cx.pre_loop.expect("anchor recorded");
        assert_eq!(adj.anchor, stores[0]);
        assert_eq!(adj.vector_width, 16);
    }

    #[test]
    fn test_extend_and_combine() {
        let (mut g, mut lp, loads, stores) = in_place_add();
        let adds: Vec<NodeId> = stores.iter().map(|&s| g.input(s, 2).expect("value")).collect();
        let config = SuperWordConfig::default();
        let target = SimdTarget::new(SimdLevel::Avx2);
        let cost = CostModel::default();
        let mut cx = SlpContext::new(&mut g, &mut lp, &config, &target, &cost).expect("context");
        cx.find_adjacent_refs().expect("pairs");
        cx.extend_packlist();
        assert!(cx.packset.exists_at(adds[0], 0));
        cx.combine_packs().expect("combined");
        assert_eq!(cx.packset.len(), 3);
        let lanes: Vec<&[NodeId]> = cx.packset.packs().iter().map(|p| p.lanes()).collect();
        assert!(lanes.contains(&loads.as_slice()));
        assert!(lanes.contains(&adds.as_slice()));
        assert!(lanes.contains(&stores.as_slice()));
        assert_eq!(cx.size_stats.unique_size(), 4);
        for &n in loads.iter().chain(&adds).chain(&stores) {
            assert!(cx.my_pack(n).is_some());
        }
    }

    #[test]
    fn test_opnd_positions_commute() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let c = b.invariant(BasicType::Int);
        let x0 = b.load(a, 0);
        let x1 = b.load(a, 1);
        let y0 = b.binary(BinaryOp::Add, x0, c);
        let y1 = b.binary(BinaryOp::Add, c, x1);
        let z0 = b.binary(BinaryOp::Sub, x0, c);
        let z1 = b.binary(BinaryOp::Sub, c, x1);
        b.store(a, 4, y0);
        b.store(a, 5, y1);
        b.store(a, 8, z0);
        b.store(a, 9, z1);
        let (mut g, mut lp) = b.finish();
        let config = SuperWordConfig::default();
        let target = SimdTarget::new(SimdLevel::Avx2);
        let cost = CostModel::default();
        let cx = SlpContext::new(&mut g, &mut lp, &config, &target, &cost).expect("context");
        assert_eq!(cx.opnd_positions_match(x0, y0, x1, y1).as_deref(), Some(&[y1][..]));
        assert_eq!(cx.opnd_positions_match(x0, y0, x0, y0).as_deref(), Some(&[][..]));
        assert_eq!(cx.opnd_positions_match(x0, z0, x1, z1), None);
        // Matching alone never rewrites the graph.
        assert_eq!(cx.graph.input(y1, 0), Some(c));
        assert!(cx.swap_log.is_empty());
    }

    #[test]
    fn test_rejected_candidates_leave_operands_alone() {
        // y1 commutes to line up with y0 but reads y0, so the two can
        // never share a pack.
        let mut b = LoopBuilder::new(2);
        let a = b.distinct_array(BasicType::Int);
        let out = b.distinct_array(BasicType::Int);
        let c = b.invariant(BasicType::Int);
        let x0 = b.load(a, 0);
        let x1 = b.load(a, 1);
        let y0 = b.binary(BinaryOp::Mul, x0, c);
        let y1 = b.binary(BinaryOp::Mul, y0, x1);
        b.store(out, 0, y1);
        let (mut g, mut lp) = b.finish();
        let config = SuperWordConfig::default();
        let target = SimdTarget::new(SimdLevel::Avx2);
        let cost = CostModel::default();
        let mut cx = SlpContext::new(&mut g, &mut lp, &config, &target, &cost).expect("context");
        cx.packset.push(Pack::pair(x0, x1));
        cx.set_alignment_pair(x0, x1, Alignment::Offset(0));

        assert!(cx.opnd_positions_match(x0, y0, x1, y1).is_some());
        assert!(!cx.follow_def_uses(PackId::new(0)));
        assert_eq!(cx.graph.input(y1, 0), Some(y0));
        assert!(cx.swap_log.is_empty());
    }

    #[test]
    fn test_est_savings_prefers_adjacent_operands() {
        let (mut g, mut lp, _, stores) = in_place_add();
        let adds: Vec<NodeId> = stores.iter().map(|&s| g.input(s, 2).expect("value")).collect();
        let config = SuperWordConfig::default();
        let target = SimdTarget::new(SimdLevel::Avx2);
        let cost = CostModel::default();
        let cx = SlpContext::new(&mut g, &mut lp, &config, &target, &cost).expect("context");
        // Both operands adjacent: 1 + 2 + 2.
        assert_eq!(cx.est_savings(adds[0], adds[1]), 5);
    }
}
