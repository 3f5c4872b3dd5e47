//! Implementation and profitability filtering.
//!
//! A pack survives only if the target has every vector instruction it
//! needs, each operand arrives as a matching vector or a broadcast scalar,
//! each in-loop user consumes it as a vector, and the vector form is
//! estimated cheaper than the scalars it replaces. Removing a pack can
//! break a neighbour's operands, so profitability runs to a fixpoint.

use super::error::SlpError;
use super::pack::{Pack, PackId};
use super::superword::SlpContext;
use crate::ir::node::NodeId;
use crate::ir::operators::{BinaryOp, MemoryOp, Operator, VectorKind};
use crate::ir::types::VectorType;
use log::{debug, trace};
use smallvec::SmallVec;

/// Where a vector operand comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum VectorInput {
    /// Lane-for-lane the output of another pack.
    Pack(PackId),
    /// One scalar for every lane.
    Scalar(NodeId),
}

/// Which lanes of a pack an operand slot reads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LaneSet {
    Main,
    /// Compare lanes of a fused select.
    Compares,
}

pub(super) type OperandSlots = SmallVec<[(LaneSet, usize); 4]>;

impl SlpContext<'_> {
    // =========================================================================
    // Pack Shape
    // =========================================================================

    /// The pack is an entire reduction chain, head first.
    pub(super) fn is_reduction_pack(&self, pack: &Pack) -> bool {
        self.reductions
            .chain_of(pack.first())
            .is_some_and(|chain| chain.nodes.as_slice() == pack.lanes())
    }

    pub(super) fn pack_vector_type(&self, pack: &Pack) -> Option<VectorType> {
        let bt = self.velt_type(pack.first())?;
        let lanes = u8::try_from(pack.len()).ok()?;
        Some(VectorType::new(bt, lanes))
    }

    /// Vector instructions the pack lowers to; empty if there is no form.
    pub(super) fn vector_kinds(&self, pack: &Pack) -> SmallVec<[VectorKind; 2]> {
        let mut kinds = SmallVec::new();
        let first = pack.first();
        match self.graph.op(first) {
            Operator::Memory(MemoryOp::Load(_)) => kinds.push(VectorKind::Load),
            Operator::Memory(MemoryOp::Store(_)) => kinds.push(VectorKind::Store),
            Operator::Binary(op, _) => {
                if !self.reductions.is_marked(first) {
                    kinds.push(VectorKind::Binary(op));
                } else if self.is_reduction_pack(pack) {
                    kinds.push(VectorKind::Binary(op));
                    kinds.push(VectorKind::Reduce(op));
                }
            }
            Operator::Unary(op, _) => kinds.push(VectorKind::Unary(op)),
            Operator::Convert { from, .. } => kinds.push(VectorKind::Convert { from }),
            Operator::CMove(_) => {
                if let Some(fused) = pack.fused() {
                    if self.target.cmove_needs_mask() {
                        kinds.push(VectorKind::Cmp(fused.cond));
                        kinds.push(VectorKind::Blend);
                    } else {
                        kinds.push(VectorKind::CMove(fused.cond));
                    }
                }
            }
            _ => {}
        }
        kinds
    }

    pub(super) fn implemented(&self, pack: &Pack) -> bool {
        let Some(bt) = self.velt_type(pack.first()) else {
            return false;
        };
        let kinds = self.vector_kinds(pack);
        !kinds.is_empty()
            && kinds
                .iter()
                .all(|&k| self.target.implemented(k, pack.len(), bt))
    }

    /// Operand positions read as vectors.
    pub(super) fn operand_slots(&self, pack: &Pack) -> OperandSlots {
        let mut slots = OperandSlots::new();
        match self.graph.op(pack.first()) {
            Operator::Memory(MemoryOp::Store(_)) => slots.push((LaneSet::Main, 2)),
            Operator::Binary(..) if self.is_reduction_pack(pack) => slots.push((LaneSet::Main, 1)),
            Operator::Binary(..) => {
                slots.push((LaneSet::Main, 0));
                slots.push((LaneSet::Main, 1));
            }
            Operator::Unary(..) | Operator::Convert { .. } => slots.push((LaneSet::Main, 0)),
            Operator::CMove(_) if pack.fused().is_some() => {
                slots.push((LaneSet::Main, 1));
                slots.push((LaneSet::Main, 2));
                slots.push((LaneSet::Compares, 0));
                slots.push((LaneSet::Compares, 1));
            }
            _ => {}
        }
        slots
    }

    pub(super) fn lanes_of<'p>(pack: &'p Pack, set: LaneSet) -> &'p [NodeId] {
        match (set, pack.fused()) {
            (LaneSet::Compares, Some(fused)) => fused.cmps.as_slice(),
            _ => pack.lanes(),
        }
    }

    /// Shift whose count stays scalar.
    pub(super) fn is_shift_count(&self, n: NodeId, i: usize) -> bool {
        i == 1
            && matches!(
                self.graph.op(n),
                Operator::Binary(BinaryOp::Shl | BinaryOp::Sra | BinaryOp::Srl, _)
            )
    }

    /// Source of operand `i` across `lanes`.
    pub(super) fn vector_input(&self, lanes: &[NodeId], i: usize) -> Option<VectorInput> {
        let first = self.graph.input(lanes[0], i)?;
        if lanes.iter().all(|&l| self.graph.input(l, i) == Some(first)) {
            // A packed value has no scalar left to broadcast.
            if self.my_pack(first).is_some() {
                return None;
            }
            return Some(VectorInput::Scalar(first));
        }
        let q = self.my_pack(first)?;
        let def = self.packset.get(q);
        if def.len() != lanes.len() {
            return None;
        }
        let identical = lanes
            .iter()
            .zip(def.lanes())
            .all(|(&l, &d)| self.graph.input(l, i) == Some(d));
        identical.then_some(VectorInput::Pack(q))
    }

    /// Operand `i` of `lanes` can be read as one vector.
    pub(super) fn is_vector_use(&self, lanes: &[NodeId], i: usize) -> bool {
        let u = lanes[0];
        match self.vector_input(lanes, i) {
            None => false,
            Some(VectorInput::Scalar(_)) => true,
            Some(VectorInput::Pack(q)) => {
                if self.is_shift_count(u, i) {
                    return false;
                }
                let def = self.packset.get(q);
                let converts = matches!(self.graph.op(u), Operator::Convert { .. });
                if !converts && self.data_size(u) != self.data_size(def.first()) {
                    return false;
                }
                lanes.iter().zip(def.lanes()).all(|(&ul, &dl)| {
                    let (ua, da) = (self.alignment(ul), self.alignment(dl));
                    ua.is_top()
                        || da.is_top()
                        || da == self.adjust_alignment_for_type_conversion(ul, dl, ua)
                })
            }
        }
    }

    // =========================================================================
    // Filtering
    // =========================================================================

    /// Drop unimplemented packs, then unprofitable packs until stable.
    pub(super) fn filter_packs(&mut self) -> Result<(), SlpError> {
        let keep: Vec<bool> = self
            .packset
            .packs()
            .iter()
            .map(|p| self.implemented(p))
            .collect();
        let dropped = self.retain_packs(&keep)?;
        if dropped > 0 {
            trace!("filter: {} unimplemented packs", dropped);
        }

        loop {
            let keep: Vec<bool> = (0..self.packset.len())
                .map(|i| self.profitable(PackId::new(i as u32)))
                .collect();
            if self.retain_packs(&keep)? == 0 {
                break;
            }
        }

        let reductions = self
            .packset
            .packs()
            .iter()
            .filter(|p| self.is_reduction_pack(p))
            .count();
        if self.packset.is_empty() || reductions == self.packset.len() {
            debug!("filter: no profitable packs remain");
            return Err(SlpError::NoProfitablePacks);
        }
        Ok(())
    }

    fn retain_packs(&mut self, keep: &[bool]) -> Result<usize, SlpError> {
        let before = self.packset.len();
        let mut flags = keep.iter().copied();
        self.packset.retain(|_| flags.next().unwrap_or(false));
        let dropped = before - self.packset.len();
        if dropped > 0 {
            self.construct_my_pack_map()?;
        }
        Ok(dropped)
    }

    /// Operands, users and cost all favour the vector form.
    pub(super) fn profitable(&self, id: PackId) -> bool {
        let pack = self.packset.get(id);

        for (set, i) in self.operand_slots(pack) {
            if !self.is_vector_use(Self::lanes_of(pack, set), i) {
                trace!("unprofitable {:?}: operand {} is not a vector", pack, i);
                return false;
            }
        }

        let Some(extracts) = self.lane_extracts(pack) else {
            trace!("unprofitable {:?}: scalar use inside the loop", pack);
            return false;
        };

        let savings = self.pack_savings(pack, extracts);
        if savings < 0.0 {
            trace!("unprofitable {:?}: savings {:.2}", pack, savings);
            return false;
        }
        true
    }

    /// Lanes read after the loop, or `None` if some in-loop user would
    /// still need the scalar.
    fn lane_extracts(&self, pack: &Pack) -> Option<usize> {
        if self.graph.node(pack.first()).is_store() {
            return Some(0);
        }
        let reduction = self
            .reductions
            .chain_of(pack.first())
            .filter(|chain| chain.nodes.as_slice() == pack.lanes());
        let mut extracts = 0;
        for (k, &n) in pack.lanes().iter().enumerate() {
            let last = k + 1 == pack.len();
            let mut escapes = false;
            for u in self.graph.distinct_uses(n) {
                if pack.members().any(|m| m == u) {
                    continue;
                }
                if let Some(chain) = reduction {
                    if last && u == chain.phi {
                        continue;
                    }
                }
                if !self.lp.contains(u) {
                    escapes = true;
                    continue;
                }
                if !self.in_bb(u) || !self.is_vector_user(u, n) {
                    return None;
                }
            }
            if escapes && reduction.is_none() {
                extracts += 1;
            }
        }
        Some(extracts)
    }

    /// `u` reads `n` through a vector operand of `u`'s pack.
    fn is_vector_user(&self, u: NodeId, n: NodeId) -> bool {
        let Some(up) = self.my_pack(u) else {
            return false;
        };
        let user = self.packset.get(up);
        self.operand_slots(user).into_iter().any(|(set, i)| {
            let lanes = Self::lanes_of(user, set);
            lanes.contains(&u) && self.graph.input(u, i) == Some(n) && self.is_vector_use(lanes, i)
        })
    }

    /// Scalar cost minus vector cost, glue included.
    fn pack_savings(&self, pack: &Pack, extracts: usize) -> f32 {
        let lanes = pack.len();
        let scalar: f32 = pack
            .members()
            .map(|m| self.cost.scalar_cost(&self.graph.op(m)))
            .sum();
        let mut vector: f32 = self
            .vector_kinds(pack)
            .into_iter()
            .filter(|k| !matches!(k, VectorKind::Reduce(_)))
            .map(|k| self.cost.vector_cost(k, lanes))
            .sum();
        for (set, i) in self.operand_slots(pack) {
            let set_lanes = Self::lanes_of(pack, set);
            if let Some(VectorInput::Scalar(s)) = self.vector_input(set_lanes, i) {
                if !self.is_shift_count(set_lanes[0], i) && !self.lp.is_invariant(s) {
                    vector += self.cost.replicate_cost();
                }
            }
        }
        vector += extracts as f32 * self.cost.extract_cost();
        scalar - vector
    }
}
