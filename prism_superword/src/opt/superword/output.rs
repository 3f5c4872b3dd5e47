//! Vector emission.
//!
//! Emission is planned in full before the graph is touched: every pack's
//! vector type, instructions and operand sources are resolved in schedule
//! order, so a pack only ever reads vectors emitted before it. Only then
//! are the memory slices rethreaded and the vector nodes built.
//!
//! ```text
//! scalar                         vector
//! x0..x3 = Load(mem, adr_k)      vx = VectorLoad(mem, adr_0)
//! y0..y3 = x_k + c               vy = VectorAdd(vx, Replicate(c))
//! Store(adr_k, y_k)              VectorStore(mem, adr_0, vy)
//! ```
//!
//! A reduction pack becomes a vector accumulator phi seeded with the
//! operator's identity, plus one horizontal reduce after the loop that
//! folds in the scalar initial value.

use super::error::SlpError;
use super::filter::{LaneSet, VectorInput};
use super::pack::{Lanes, Pack, PackId};
use super::reduction::identity_for;
use super::schedule::Unit;
use super::superword::{SlpContext, SlpOutcome};
use super::trace::TraceFlags;
use crate::ir::loops::LoopFlags;
use crate::ir::node::{NodeFlags, NodeId};
use crate::ir::operators::{Operator, VectorKind, VectorOp};
use crate::ir::types::{ValueType, VectorType};
use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// One pack, resolved for emission.
#[derive(Debug, Clone)]
struct PackPlan {
    id: PackId,
    vt: VectorType,
    kinds: SmallVec<[VectorKind; 2]>,
    operands: SmallVec<[(LaneSet, usize, VectorInput); 4]>,
    reduction: bool,
}

/// Nodes built so far.
#[derive(Debug, Default)]
struct Emitted {
    vectors: FxHashMap<PackId, NodeId>,
    replicates: FxHashMap<(NodeId, VectorType), NodeId>,
    created: Vec<NodeId>,
}

impl SlpContext<'_> {
    // =========================================================================
    // Planning
    // =========================================================================

    fn plan_output(&self, order: &[Unit]) -> Result<Vec<PackPlan>, SlpError> {
        let mut planned: FxHashSet<PackId> = FxHashSet::default();
        let mut plans = Vec::with_capacity(self.packset.len());
        for &unit in order {
            let Unit::Pack(id) = unit else { continue };
            let pack = self.packset.get(id);
            let head = pack.first();
            let unimplemented = SlpError::Unimplemented { node: head };

            let vt = self.pack_vector_type(pack).ok_or(unimplemented.clone())?;
            let kinds = self.vector_kinds(pack);
            if !self.implemented(pack) {
                return Err(unimplemented);
            }
            let reduction = self.is_reduction_pack(pack);
            if reduction {
                let chain = self.reductions.chain_of(head).ok_or(unimplemented.clone())?;
                identity_for(chain.op, chain.bt).ok_or(unimplemented.clone())?;
            }

            let mut operands = SmallVec::new();
            for (set, i) in self.operand_slots(pack) {
                let input = self
                    .vector_input(Self::lanes_of(pack, set), i)
                    .ok_or(SlpError::ScheduleConflict { node: head })?;
                if let VectorInput::Pack(q) = input {
                    if !planned.contains(&q) {
                        return Err(SlpError::ScheduleConflict { node: head });
                    }
                }
                operands.push((set, i, input));
            }

            planned.insert(id);
            plans.push(PackPlan {
                id,
                vt,
                kinds,
                operands,
                reduction,
            });
        }
        Ok(plans)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Replace every pack with its vector form.
    pub(super) fn output(&mut self, order: &[Unit]) -> Result<SlpOutcome, SlpError> {
        let plans = self.plan_output(order)?;
        self.reorder_memops(order);

        let mut emitted = Emitted::default();
        let mut outcome = SlpOutcome::default();
        for plan in &plans {
            let pack = self.packset.get(plan.id).clone();
            let v = self.emit_pack(&pack, plan, &mut emitted)?;
            emitted.vectors.insert(plan.id, v);
            if !plan.reduction && !self.graph.node(pack.first()).is_store() {
                self.extract_escaping_lanes(&pack, v, plan.vt, &mut emitted);
            }
            outcome.packs.push(Lanes::from_slice(pack.lanes()));
            if plan.reduction {
                outcome.reductions += 1;
            }
        }

        for plan in &plans {
            let members: Vec<NodeId> = self.packset.get(plan.id).members().collect();
            for m in members {
                self.graph.kill(m);
                self.lp.remove_from_body(m);
                outcome.scalars_removed += 1;
            }
        }
        debug_assert!(self.graph.verify().is_ok(), "{:?}", self.graph.verify());

        self.align_initial_loop_index();
        self.lp.flags.insert(LoopFlags::VECTORIZED);

        outcome.vector_nodes = emitted.created.len();
        outcome.element_sizes = self.size_stats;
        outcome.pre_loop_adjustment = self.lp.pre_loop_adjustment;
        Ok(outcome)
    }

    /// Hand the alignment anchor to the pre-loop.
    fn align_initial_loop_index(&mut self) {
        if self.config.align_vector {
            self.lp.pre_loop_adjustment = self.pre_loop;
        }
    }

    fn vector_node(&mut self, kind: VectorKind, vt: VectorType, inputs: &[NodeId], emitted: &mut Emitted) -> NodeId {
        let v = self
            .graph
            .add_node(Operator::Vector(VectorOp::new(kind, vt)), inputs);
        self.graph.set_flag(v, NodeFlags::VECTORIZED, true);
        emitted.created.push(v);
        if self.tracing(TraceFlags::NEW_VECTORS) {
            trace!("new vector {:?}: {:?}", v, self.graph.node(v));
        }
        v
    }

    /// Vector node in the loop body.
    fn body_vector(&mut self, kind: VectorKind, vt: VectorType, inputs: &[NodeId], emitted: &mut Emitted) -> NodeId {
        let v = self.vector_node(kind, vt, inputs, emitted);
        self.lp.add_to_body(v);
        v
    }

    /// Broadcast of `s`, shared across packs and hoisted when invariant.
    fn replicate(&mut self, s: NodeId, vt: VectorType, emitted: &mut Emitted) -> NodeId {
        if let Some(&r) = emitted.replicates.get(&(s, vt)) {
            return r;
        }
        let r = if self.lp.is_invariant(s) {
            let r = self.vector_node(VectorKind::Replicate, vt, &[s], emitted);
            self.graph.set_flag(r, NodeFlags::LOOP_INVARIANT, true);
            r
        } else {
            self.body_vector(VectorKind::Replicate, vt, &[s], emitted)
        };
        emitted.replicates.insert((s, vt), r);
        r
    }

    /// Vector for the `idx`-th planned operand.
    fn operand(&mut self, pack: &Pack, plan: &PackPlan, idx: usize, emitted: &mut Emitted) -> Result<NodeId, SlpError> {
        let head = pack.first();
        let &(set, i, input) = plan
            .operands
            .get(idx)
            .ok_or(SlpError::Unimplemented { node: head })?;
        match input {
            VectorInput::Pack(q) => emitted
                .vectors
                .get(&q)
                .copied()
                .ok_or(SlpError::ScheduleConflict { node: head }),
            VectorInput::Scalar(s) => {
                let lanes = Self::lanes_of(pack, set);
                if self.is_shift_count(lanes[0], i) {
                    return Ok(s);
                }
                let elem = match self.graph.op(lanes[0]) {
                    Operator::Convert { from, .. } => from,
                    _ => self.velt_type(lanes[0]).unwrap_or(plan.vt.elem),
                };
                Ok(self.replicate(s, VectorType::new(elem, plan.vt.lanes), emitted))
            }
        }
    }

    fn emit_pack(&mut self, pack: &Pack, plan: &PackPlan, emitted: &mut Emitted) -> Result<NodeId, SlpError> {
        let head = pack.first();
        let missing = SlpError::Unimplemented { node: head };
        let vt = plan.vt;
        let kind = *plan.kinds.first().ok_or(missing.clone())?;
        let v = match kind {
            VectorKind::Load => {
                let mem = self.graph.input(head, 0).ok_or(missing.clone())?;
                let adr = self.graph.input(head, 1).ok_or(missing)?;
                self.body_vector(kind, vt, &[mem, adr], emitted)
            }
            VectorKind::Store => {
                let mem = self.graph.input(head, 0).ok_or(missing.clone())?;
                let adr = self.graph.input(head, 1).ok_or(missing)?;
                let val = self.operand(pack, plan, 0, emitted)?;
                let v = self.body_vector(kind, vt, &[mem, adr, val], emitted);
                self.graph.replace_all_uses(pack.last(), v);
                v
            }
            VectorKind::Binary(_) if plan.reduction => self.emit_reduction(pack, plan, emitted)?,
            VectorKind::Binary(_) => {
                let a = self.operand(pack, plan, 0, emitted)?;
                let b = self.operand(pack, plan, 1, emitted)?;
                self.body_vector(kind, vt, &[a, b], emitted)
            }
            VectorKind::Unary(_) | VectorKind::Convert { .. } => {
                let a = self.operand(pack, plan, 0, emitted)?;
                self.body_vector(kind, vt, &[a], emitted)
            }
            VectorKind::CMove(_) | VectorKind::Cmp(_) => {
                let if_false = self.operand(pack, plan, 0, emitted)?;
                let if_true = self.operand(pack, plan, 1, emitted)?;
                let a = self.operand(pack, plan, 2, emitted)?;
                let b = self.operand(pack, plan, 3, emitted)?;
                if let VectorKind::CMove(_) = kind {
                    self.body_vector(kind, vt, &[a, b, if_false, if_true], emitted)
                } else {
                    let mask = self.body_vector(kind, vt, &[a, b], emitted);
                    self.body_vector(VectorKind::Blend, vt, &[if_false, if_true, mask], emitted)
                }
            }
            _ => return Err(missing),
        };
        Ok(v)
    }

    /// Vector accumulator for a whole reduction chain.
    fn emit_reduction(&mut self, pack: &Pack, plan: &PackPlan, emitted: &mut Emitted) -> Result<NodeId, SlpError> {
        let head = pack.first();
        let missing = SlpError::Unimplemented { node: head };
        let chain = self.reductions.chain_of(head).cloned().ok_or(missing.clone())?;
        let (identity_op, identity_ty) = identity_for(chain.op, chain.bt).ok_or(missing.clone())?;
        let vt = plan.vt;

        let identity = self.graph.add_node_with_type(identity_op, &[], identity_ty);
        self.graph.set_flag(identity, NodeFlags::LOOP_INVARIANT, true);
        let seed = self.replicate(identity, vt, emitted);

        let vphi = self.graph.add_node_with_type(
            Operator::Phi,
            &[self.lp.head, seed, seed],
            ValueType::Vector(vt),
        );
        self.graph.set_flag(vphi, NodeFlags::VECTORIZED, true);
        self.lp.add_to_body(vphi);
        emitted.created.push(vphi);

        let operand = self.operand(pack, plan, 0, emitted)?;
        let vop = self.body_vector(VectorKind::Binary(chain.op), vt, &[vphi, operand], emitted);
        self.graph.replace_input(vphi, 2, vop);

        let init = self.graph.input(chain.phi, 1).ok_or(missing)?;
        let reduce = self.vector_node(VectorKind::Reduce(chain.op), vt, &[init, vop], emitted);

        self.graph.kill(chain.phi);
        self.lp.remove_from_body(chain.phi);
        self.graph.replace_all_uses(chain.tail(), reduce);
        trace!(
            "reduction {:?}: vector phi {:?}, epilogue {:?}",
            chain.phi,
            vphi,
            reduce
        );
        Ok(vop)
    }

    /// Lanes read after the loop get one extract each.
    fn extract_escaping_lanes(&mut self, pack: &Pack, v: NodeId, vt: VectorType, emitted: &mut Emitted) {
        for (k, &lane) in pack.lanes().iter().enumerate() {
            let outside: Vec<NodeId> = self
                .graph
                .distinct_uses(lane)
                .into_iter()
                .filter(|&u| !self.lp.contains(u) && !pack.members().any(|m| m == u))
                .collect();
            if outside.is_empty() {
                continue;
            }
            let Ok(lane_idx) = u8::try_from(k) else { continue };
            let ext = self.vector_node(VectorKind::Extract { lane: lane_idx }, vt, &[v], emitted);
            for u in outside {
                for slot in 0..self.graph.node(u).req() {
                    if self.graph.input(u, slot) == Some(lane) {
                        self.graph.replace_input(u, slot, ext);
                    }
                }
            }
        }
    }
}
