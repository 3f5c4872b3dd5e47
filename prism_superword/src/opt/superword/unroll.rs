//! Unroll factor suggestion.
//!
//! Before the loop optimizer unrolls a loop it asks how far unrolling is
//! worth it: the body can use at most as many lanes as its narrowest
//! supported vector. The answer is a hint only; nothing in the graph
//! changes.

use super::block::Block;
use super::superword::SuperWord;
use super::trace::TraceFlags;
use crate::ir::graph::Graph;
use crate::ir::loops::{CountedLoop, LoopFlags, UnrollHint};
use crate::ir::node::NodeId;
use crate::ir::operators::{MemoryOp, Operator, VectorKind};
use crate::ir::types::BasicType;
use log::{debug, trace};
use smallvec::SmallVec;

const NOT_CAPABLE: UnrollHint = UnrollHint {
    slp_capable: false,
    factor: 1,
};

impl SuperWord<'_> {
    /// Suggest an unroll factor for `lp` and record it on the loop.
    pub fn unrolling_analysis(&self, graph: &Graph, lp: &mut CountedLoop) -> UnrollHint {
        let hint = self.compute_unroll_hint(graph, lp);
        lp.flags.insert(LoopFlags::WAS_SLP);
        lp.flags.set(LoopFlags::PASSED_SLP, hint.slp_capable);
        lp.slp_unroll_hint = Some(hint);
        debug!(
            "superword: unroll hint for {:?}: capable {}, factor {}",
            lp.head, hint.slp_capable, hint.factor
        );
        hint
    }

    fn compute_unroll_hint(&self, graph: &Graph, lp: &CountedLoop) -> UnrollHint {
        if !lp.is_well_formed(graph) || lp.flags.contains(LoopFlags::VECTORIZED) {
            return NOT_CAPABLE;
        }
        let Ok(block) = Block::build(graph, lp, self.config().max_block_nodes) else {
            return NOT_CAPABLE;
        };
        let tracing = self.config().trace.contains(TraceFlags::UNROLL);

        for phi in lp.memory_phis(graph) {
            let Some(tail) = graph.input(phi, 2) else {
                return NOT_CAPABLE;
            };
            let stores_tail = tail == phi
                || match graph.op(tail) {
                    Operator::Memory(MemoryOp::Store(_)) => true,
                    Operator::Vector(v) => v.kind == VectorKind::Store,
                    _ => false,
                };
            if !stores_tail {
                if tracing {
                    trace!("unroll: memory phi {:?} ends in {:?}", phi, tail);
                }
                return NOT_CAPABLE;
            }
        }

        let mut factor: Option<usize> = None;
        for &n in block.nodes() {
            if n == lp.iv || n == lp.incr || block.is_address_only(n) {
                continue;
            }
            let Some((kinds, lanes, bt)) = self.unroll_requirements(graph, n) else {
                continue;
            };
            let supported = lanes >= 2
                && kinds
                    .iter()
                    .all(|&kind| self.target().implemented(kind, lanes, bt));
            if !supported {
                if tracing {
                    trace!("unroll: {:?} has no {}-lane vector form", n, lanes);
                }
                return NOT_CAPABLE;
            }
            factor = Some(factor.map_or(lanes, |f| f.min(lanes)));
        }

        match factor {
            Some(lanes) => UnrollHint {
                slp_capable: true,
                factor: (lanes as u32).min(self.config().max_unroll),
            },
            None => NOT_CAPABLE,
        }
    }

    /// Vector instructions, widest lane count and lane type `n` needs;
    /// `None` for nodes that never become vectors on their own.
    fn unroll_requirements(
        &self,
        graph: &Graph,
        n: NodeId,
    ) -> Option<(SmallVec<[VectorKind; 2]>, usize, BasicType)> {
        let target = self.target();
        let mut kinds = SmallVec::new();
        let bt = match graph.op(n) {
            Operator::Memory(MemoryOp::Load(bt)) => {
                kinds.push(VectorKind::Load);
                bt
            }
            Operator::Memory(MemoryOp::Store(bt)) => {
                kinds.push(VectorKind::Store);
                bt
            }
            Operator::Binary(op, bt) => {
                kinds.push(VectorKind::Binary(op));
                bt
            }
            Operator::Unary(op, bt) => {
                kinds.push(VectorKind::Unary(op));
                bt
            }
            Operator::Convert { from, to } => {
                let lanes = target.max_vector_size(from).min(target.max_vector_size(to));
                kinds.push(VectorKind::Convert { from });
                return Some((kinds, lanes, to));
            }
            Operator::CMove(bt) => {
                let cond = match graph.input(n, 0).map(|b| graph.op(b)) {
                    Some(Operator::Bool(cond)) => cond,
                    _ => return Some((kinds, 0, bt)),
                };
                if target.cmove_needs_mask() {
                    kinds.push(VectorKind::Cmp(cond));
                    kinds.push(VectorKind::Blend);
                } else {
                    kinds.push(VectorKind::CMove(cond));
                }
                bt
            }
            _ => return None,
        };
        Some((kinds, target.max_vector_size(bt), bt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::LoopBuilder;
    use crate::ir::operators::{BinaryOp, UnaryOp};
    use crate::opt::superword::target::{CostModel, SimdLevel, SimdTarget};
    use crate::opt::superword::SuperWordConfig;

    fn analyze(level: SimdLevel, config: SuperWordConfig, graph: &Graph, lp: &mut CountedLoop) -> UnrollHint {
        let target = SimdTarget::new(level);
        let sw = SuperWord::new(config, &target, CostModel::new(level));
        sw.unrolling_analysis(graph, lp)
    }

    #[test]
    fn test_int_add_unrolls_to_register_width() {
        let mut b = LoopBuilder::new(1);
        let a = b.distinct_array(BasicType::Int);
        let c = b.invariant(BasicType::Int);
        let x = b.load(a, 0);
        let y = b.binary(BinaryOp::Add, x, c);
        b.store(a, 0, y);
        let (g, mut lp) = b.finish();

        let hint = analyze(SimdLevel::Avx2, SuperWordConfig::avx2(), &g, &mut lp);
        assert!(hint.slp_capable);
        assert_eq!(hint.factor, 8);
        assert_eq!(lp.slp_unroll_hint, Some(hint));
        assert!(lp.flags.contains(LoopFlags::WAS_SLP | LoopFlags::PASSED_SLP));

        let sse = analyze(SimdLevel::Sse42, SuperWordConfig::sse42(), &g, &mut lp);
        assert_eq!(sse.factor, 4);
    }

    #[test]
    fn test_conversion_limits_factor() {
        let mut b = LoopBuilder::new(1);
        let src = b.distinct_array(BasicType::Long);
        let dst = b.distinct_array(BasicType::Int);
        let x = b.load(src, 0);
        let y = b.convert(x, BasicType::Int);
        b.store(dst, 0, y);
        let (g, mut lp) = b.finish();

        let hint = analyze(SimdLevel::Avx2, SuperWordConfig::avx2(), &g, &mut lp);
        assert!(hint.slp_capable);
        assert_eq!(hint.factor, 4);
    }

    #[test]
    fn test_factor_clamped_to_max_unroll() {
        let mut b = LoopBuilder::new(1);
        let a = b.distinct_array(BasicType::Byte);
        let x = b.load(a, 0);
        b.store(a, 1, x);
        let (g, mut lp) = b.finish();

        let config = SuperWordConfig {
            max_unroll: 16,
            ..SuperWordConfig::avx512()
        };
        let hint = analyze(SimdLevel::Avx512, config, &g, &mut lp);
        assert!(hint.slp_capable);
        assert_eq!(hint.factor, 16);
    }

    #[test]
    fn test_unsupported_op_not_capable() {
        let mut b = LoopBuilder::new(1);
        let a = b.distinct_array(BasicType::Long);
        let x = b.load(a, 0);
        let y = b.binary(BinaryOp::Mul, x, x);
        b.store(a, 0, y);
        let (g, mut lp) = b.finish();

        let hint = analyze(SimdLevel::Avx2, SuperWordConfig::avx2(), &g, &mut lp);
        assert!(!hint.slp_capable);
        assert!(lp.flags.contains(LoopFlags::WAS_SLP));
        assert!(!lp.flags.contains(LoopFlags::PASSED_SLP));

        let wide = analyze(SimdLevel::Avx512, SuperWordConfig::avx512(), &g, &mut lp);
        assert!(wide.slp_capable);
        assert_eq!(wide.factor, 8);
    }

    #[test]
    fn test_popcount_needs_avx512() {
        let mut b = LoopBuilder::new(1);
        b.set_trip_count(1024);
        let src = b.distinct_array(BasicType::Int);
        let dst = b.distinct_array(BasicType::Int);
        let x = b.load(src, 0);
        let y = b.unary(UnaryOp::PopCount, x);
        b.store(dst, 0, y);
        let (g, mut lp) = b.finish();
        assert_eq!(lp.trip_count, Some(1024));

        let hint = analyze(SimdLevel::Avx2, SuperWordConfig::avx2(), &g, &mut lp);
        assert!(!hint.slp_capable);
        assert_eq!(hint.factor, 1);

        let wide = analyze(SimdLevel::Avx512, SuperWordConfig::avx512(), &g, &mut lp);
        assert!(wide.slp_capable);
        assert_eq!(wide.factor, 16);
    }

    #[test]
    fn test_same_width_conversion_keeps_factor() {
        let mut b = LoopBuilder::new(1);
        let src = b.distinct_array(BasicType::Int);
        let dst = b.distinct_array(BasicType::Float);
        let x = b.load(src, 0);
        let y = b.convert(x, BasicType::Float);
        b.store(dst, 0, y);
        let (g, mut lp) = b.finish();

        let hint = analyze(SimdLevel::Avx2, SuperWordConfig::avx2(), &g, &mut lp);
        assert!(hint.slp_capable);
        assert_eq!(hint.factor, 8);
    }
}
