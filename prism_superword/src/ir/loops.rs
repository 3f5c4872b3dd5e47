//! Counted-loop descriptors.
//!
//! Loop discovery lives in the host's loop tree; the vectorizer only needs a
//! summary of one innermost counted loop: its head and backedge test, the
//! induction variable, the stride of the (already unrolled) body, and which
//! nodes belong to the body. Results the vectorizer feeds back to the loop
//! optimizer are recorded here as well.

use super::arena::BitSet;
use super::graph::Graph;
use super::node::NodeId;
use super::operators::{ControlOp, Operator};

bitflags::bitflags! {
    /// Loop optimizer status bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct LoopFlags: u8 {
        /// The main loop of a pre/main/post split.
        const MAIN_LOOP = 0b0000_0001;
        /// Reduction cycles were found in the body.
        const HAS_REDUCTIONS = 0b0000_0010;
        /// Unroll analysis ran on this loop.
        const WAS_SLP = 0b0000_0100;
        /// Unroll analysis judged the body vectorizable.
        const PASSED_SLP = 0b0000_1000;
        /// The body was rewritten with vector operations.
        const VECTORIZED = 0b0001_0000;
    }
}

/// Pre-loop limit adjustment that brings the alignment anchor to lane 0.
///
/// The main loop starts at a runtime address; the pre-loop must run enough
/// scalar iterations that `base + offset + scale * iv` is a multiple of
/// `vector_width` on entry to the main loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreLoopAdjustment {
    /// Memory reference the alignment is computed for.
    pub anchor: NodeId,
    /// Constant byte offset of the anchor.
    pub offset: i32,
    /// Bytes the anchor advances per unit of `iv`.
    pub scale: i32,
    /// Signed stride of one scalar (pre-loop) iteration.
    pub pre_stride: i32,
    /// Vector width in bytes the anchor must be aligned to.
    pub vector_width: i32,
    /// Iterations the compile-time part of the address needs.
    pub iv_adjustment: i32,
    /// The address has a loop-invariant term, so the count is only known
    /// once that term is.
    pub has_invariant: bool,
}

impl PreLoopAdjustment {
    /// Scalar pre-loop iterations needed for an array at `base` when the
    /// loop starts at `init`, or `None` if no count aligns the reference.
    pub fn pre_iterations(&self, base: u64, init: i64) -> Option<u64> {
        let vw = i128::from(self.vector_width);
        let step = i128::from(self.scale) * i128::from(self.pre_stride);
        if vw <= 0 || step == 0 {
            return None;
        }
        let start = i128::from(base) + i128::from(self.offset) + i128::from(self.scale) * i128::from(init);
        let misalign = start.rem_euclid(vw);
        let needed = if step > 0 {
            (vw - misalign).rem_euclid(vw)
        } else {
            misalign
        };
        let step = step.abs();
        if needed % step != 0 {
            return None;
        }
        u64::try_from(needed / step).ok()
    }
}

/// Unroll factor suggestion produced by SLP analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnrollHint {
    /// Every body operation has a vector form.
    pub slp_capable: bool,
    /// Largest lane count every vectorizable operation in the body supports.
    pub factor: u32,
}

/// Summary of one counted loop.
#[derive(Clone, Debug)]
pub struct CountedLoop {
    /// `CountedLoop` control node.
    pub head: NodeId,
    /// `CountedLoopEnd` control node.
    pub loop_end: NodeId,
    /// Induction variable phi.
    pub iv: NodeId,
    /// `iv + stride` feeding the phi's backedge.
    pub incr: NodeId,
    pub init: NodeId,
    pub limit: NodeId,
    /// Stride of one trip through the body (after unrolling).
    pub stride: i32,
    /// Original iterations folded into one body trip.
    pub unroll_count: u32,
    /// Original trip count when known at compile time.
    pub trip_count: Option<u64>,
    pub flags: LoopFlags,
    pub pre_loop_adjustment: Option<PreLoopAdjustment>,
    pub slp_unroll_hint: Option<UnrollHint>,
    body: BitSet,
}

impl CountedLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        head: NodeId,
        loop_end: NodeId,
        iv: NodeId,
        incr: NodeId,
        init: NodeId,
        limit: NodeId,
        stride: i32,
        unroll_count: u32,
    ) -> Self {
        let mut lp = CountedLoop {
            head,
            loop_end,
            iv,
            incr,
            init,
            limit,
            stride,
            unroll_count,
            trip_count: None,
            flags: LoopFlags::MAIN_LOOP,
            pre_loop_adjustment: None,
            slp_unroll_hint: None,
            body: BitSet::new(),
        };
        for n in [head, loop_end, iv, incr] {
            lp.add_to_body(n);
        }
        lp
    }

    #[inline]
    pub fn contains(&self, n: NodeId) -> bool {
        self.body.contains(n.as_usize())
    }

    #[inline]
    pub fn add_to_body(&mut self, n: NodeId) {
        self.body.insert(n.as_usize());
    }

    #[inline]
    pub fn remove_from_body(&mut self, n: NodeId) {
        self.body.remove(n.as_usize());
    }

    /// Body members in id order.
    pub fn body(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.body.iter().map(|i| NodeId::new(i as u32))
    }

    /// Computed outside the loop.
    #[inline]
    pub fn is_invariant(&self, n: NodeId) -> bool {
        !self.contains(n)
    }

    /// Stride of one scalar iteration of the original loop.
    #[inline]
    pub fn scalar_stride(&self) -> i32 {
        self.stride / self.unroll_count.max(1) as i32
    }

    /// Phis hanging off the loop head, in id order.
    pub fn phis(&self, graph: &Graph) -> Vec<NodeId> {
        let mut phis: Vec<NodeId> = graph
            .distinct_uses(self.head)
            .into_iter()
            .filter(|&u| graph.node(u).is_phi() && !graph.node(u).is_dead())
            .collect();
        phis.sort();
        phis
    }

    /// Memory-state phis, one per alias slice.
    pub fn memory_phis(&self, graph: &Graph) -> Vec<NodeId> {
        self.phis(graph)
            .into_iter()
            .filter(|&p| graph.node(p).ty.is_memory())
            .collect()
    }

    /// Sanity check that the descriptor matches the graph.
    pub fn is_well_formed(&self, graph: &Graph) -> bool {
        graph.op(self.head) == Operator::Control(ControlOp::CountedLoop)
            && graph.op(self.loop_end) == Operator::Control(ControlOp::CountedLoopEnd)
            && graph.node(self.iv).is_phi()
            && graph.input(self.iv, 0) == Some(self.head)
            && self.stride != 0
    }
}
