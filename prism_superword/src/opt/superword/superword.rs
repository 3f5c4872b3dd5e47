//! The SuperWord driver.
//!
//! [`SuperWord`] owns the configuration, the target oracle and the cost
//! model. Each call to [`SuperWord::transform_loop`] builds a fresh
//! [`SlpContext`] holding every per-loop table; the phases in `packing`,
//! `filter`, `schedule` and `output` are `impl` blocks on that context.
//! When the call returns the context is dropped in one piece.

use super::block::Block;
use super::dep_graph::{DepGraph, DepPreds};
use super::error::SlpError;
use super::node_info::{Alignment, NodeInfoTable};
use super::pack::{Lanes, PackId, PackSet, VectorElementSizeStats};
use super::reduction::Reductions;
use super::sw_pointer::SwPointer;
use super::target::{CostModel, VectorTarget};
use super::trace::{TraceFlags, Tracer};
use super::SuperWordConfig;
use crate::ir::arena::BitSet;
use crate::ir::graph::Graph;
use crate::ir::loops::{CountedLoop, LoopFlags, PreLoopAdjustment};
use crate::ir::node::NodeId;
use crate::ir::operators::{BinaryOp, MemoryOp, Operator, UnaryOp};
use crate::ir::types::BasicType;
use log::{debug, trace, warn};

// =============================================================================
// Outcome
// =============================================================================

/// What a successful run changed.
#[derive(Debug, Clone, Default)]
pub struct SlpOutcome {
    /// Lanes of every emitted pack, in schedule order.
    pub packs: Vec<Lanes>,
    /// Vector nodes added to the graph, glue included.
    pub vector_nodes: usize,
    /// Scalar nodes replaced.
    pub scalars_removed: usize,
    /// Reduction packs emitted with a horizontal epilogue.
    pub reductions: usize,
    /// Select packs that absorbed their compare.
    pub fused_cmoves: usize,
    pub element_sizes: VectorElementSizeStats,
    pub pre_loop_adjustment: Option<PreLoopAdjustment>,
}

// =============================================================================
// Driver
// =============================================================================

pub struct SuperWord<'t> {
    config: SuperWordConfig,
    target: &'t dyn VectorTarget,
    cost: CostModel,
    last_sizes: VectorElementSizeStats,
}

impl<'t> SuperWord<'t> {
    pub fn new(config: SuperWordConfig, target: &'t dyn VectorTarget, cost: CostModel) -> Self {
        SuperWord {
            config,
            target,
            cost,
            last_sizes: VectorElementSizeStats::default(),
        }
    }

    pub fn config(&self) -> &SuperWordConfig {
        &self.config
    }

    pub fn target(&self) -> &dyn VectorTarget {
        self.target
    }

    /// Element sizes of the packs that survived combination in the last
    /// run, whether or not it succeeded.
    pub fn element_size_stats(&self) -> VectorElementSizeStats {
        self.last_sizes
    }

    /// Vectorize the body of `lp`.
    ///
    /// On `Err` the graph is exactly as it was on entry.
    pub fn transform_loop(
        &mut self,
        graph: &mut Graph,
        lp: &mut CountedLoop,
    ) -> Result<SlpOutcome, SlpError> {
        if !lp.is_well_formed(graph) {
            return Err(SlpError::NotCountedLoop);
        }
        let head = lp.head;
        debug!(
            "superword: loop {:?}, stride {}, unroll {}",
            head, lp.stride, lp.unroll_count
        );
        self.last_sizes = VectorElementSizeStats::default();

        let mut cx = SlpContext::new(graph, lp, &self.config, self.target, &self.cost)?;
        let result = cx.run();
        self.last_sizes = cx.size_stats;

        match &result {
            Ok(outcome) => debug!(
                "superword: loop {:?} vectorized, {} packs, {} vector nodes",
                head,
                outcome.packs.len(),
                outcome.vector_nodes
            ),
            Err(err) => debug!("superword: loop {:?} left scalar: {}", head, err),
        }
        result
    }
}

// =============================================================================
// Per-Loop State
// =============================================================================

/// Everything one run knows about one loop.
pub(super) struct SlpContext<'a> {
    pub(super) graph: &'a mut Graph,
    pub(super) lp: &'a mut CountedLoop,
    pub(super) config: &'a SuperWordConfig,
    pub(super) target: &'a dyn VectorTarget,
    pub(super) cost: &'a CostModel,

    pub(super) block: Block,
    pub(super) info: NodeInfoTable,
    pub(super) dg: DepGraph,
    /// Address decomposition per block position, memory ops only.
    pub(super) pointers: Vec<Option<SwPointer>>,
    pub(super) packset: PackSet,
    pub(super) reductions: Reductions,
    /// Commutative operand swaps made while extending packs.
    pub(super) swap_log: Vec<(NodeId, usize, usize)>,
    pub(super) size_stats: VectorElementSizeStats,
    /// Anchor that decides the pre-loop alignment.
    pub(super) pre_loop: Option<PreLoopAdjustment>,
}

impl<'a> SlpContext<'a> {
    /// Run the analyses that never touch the graph.
    pub(super) fn new(
        graph: &'a mut Graph,
        lp: &'a mut CountedLoop,
        config: &'a SuperWordConfig,
        target: &'a dyn VectorTarget,
        cost: &'a CostModel,
    ) -> Result<Self, SlpError> {
        let block = Block::build(graph, lp, config.max_block_nodes)?;
        if block.mem_ops().is_empty() {
            return Err(SlpError::NoMemoryOps);
        }

        let g: &Graph = graph;
        let mut tracer = Tracer::new(config.trace.contains(TraceFlags::POINTER));
        let pointers: Vec<Option<SwPointer>> = block
            .nodes()
            .iter()
            .map(|&n| {
                g.node(n)
                    .is_mem()
                    .then(|| SwPointer::with_tracer(g, lp, n, &mut tracer))
            })
            .collect();
        let dg = DepGraph::build(g, &block, &pointers);

        let reductions = if config.enable_reductions {
            Reductions::mark(g, lp, config.reduction_chain_limit)
        } else {
            Reductions::default()
        };
        if !reductions.is_empty() {
            lp.flags.insert(LoopFlags::HAS_REDUCTIONS);
        }
        if config.trace.contains(TraceFlags::REDUCTIONS) {
            for chain in reductions.chains() {
                trace!(
                    "reduction {:?}: {} x {} over {:?}",
                    chain.phi,
                    chain.op.name(),
                    chain.nodes.len(),
                    chain.nodes
                );
            }
        }

        let info = NodeInfoTable::new(block.len());
        let mut cx = SlpContext {
            graph,
            lp,
            config,
            target,
            cost,
            block,
            info,
            dg,
            pointers,
            packset: PackSet::new(),
            reductions,
            swap_log: Vec::new(),
            size_stats: VectorElementSizeStats::default(),
            pre_loop: None,
        };
        cx.compute_vector_element_type();
        cx.compute_max_depth();
        if cx.tracing(TraceFlags::DEPENDENCE) {
            trace!(
                "dependence graph: {} edges over {} nodes",
                cx.dg.edge_count(),
                cx.block.len()
            );
        }
        Ok(cx)
    }

    /// The full pipeline; every failure leaves the graph as it was.
    pub(super) fn run(&mut self) -> Result<SlpOutcome, SlpError> {
        let result = self.run_phases();
        if result.is_err() {
            self.undo_swaps();
        }
        if self.tracing(TraceFlags::PHASES) {
            match &result {
                Ok(outcome) => trace!("verdict: {} packs emitted", outcome.packs.len()),
                Err(err) => trace!("verdict: scalar ({})", err),
            }
        }
        result
    }

    fn run_phases(&mut self) -> Result<SlpOutcome, SlpError> {
        self.find_adjacent_refs()?;
        self.trace_phase("find_adjacent_refs");

        self.extend_packlist();
        self.trace_phase("extend_packlist");

        self.combine_packs()?;
        self.trace_phase("combine_packs");

        let fused = if self.config.enable_cmove {
            let fused = self.merge_cmove_packs()?;
            self.trace_phase("merge_cmove_packs");
            fused
        } else {
            0
        };

        self.filter_packs()?;
        self.trace_phase("filter_packs");

        let snapshot = self
            .config
            .reserve_copy
            .then(|| (self.graph.clone(), self.lp.clone()));
        let result = self.schedule().and_then(|order| self.output(&order));
        match result {
            Ok(mut outcome) => {
                outcome.fused_cmoves = fused;
                Ok(outcome)
            }
            Err(err) => {
                if let Some((graph, lp)) = snapshot {
                    *self.graph = graph;
                    *self.lp = lp;
                    warn!("superword: rolled back loop {:?}: {}", self.lp.head, err);
                }
                Err(err)
            }
        }
    }

    fn undo_swaps(&mut self) {
        while let Some((n, a, b)) = self.swap_log.pop() {
            self.graph.swap_inputs(n, a, b);
        }
    }

    // =========================================================================
    // Table Access
    // =========================================================================

    #[inline]
    pub(super) fn tracing(&self, flag: TraceFlags) -> bool {
        self.config.trace.contains(flag)
    }

    #[inline]
    pub(super) fn in_bb(&self, n: NodeId) -> bool {
        self.block.in_bb(n)
    }

    /// Valid address decomposition of memory op `n`.
    pub(super) fn ptr(&self, n: NodeId) -> Option<&SwPointer> {
        let idx = self.block.idx(n)?;
        self.pointers[idx].as_ref().filter(|p| p.valid())
    }

    pub(super) fn alignment(&self, n: NodeId) -> Alignment {
        self.block
            .idx(n)
            .map_or(Alignment::Bottom, |i| self.info.get(i).alignment)
    }

    pub(super) fn set_alignment(&mut self, n: NodeId, align: Alignment) {
        if let Some(i) = self.block.idx(n) {
            self.info.get_mut(i).alignment = align;
        }
    }

    /// `s1` at `align`, `s2` one element further.
    pub(super) fn set_alignment_pair(&mut self, s1: NodeId, s2: NodeId, align: Alignment) {
        let size = self.data_size(s1);
        self.set_alignment(s1, align);
        self.set_alignment(s2, align.plus(size));
    }

    pub(super) fn depth(&self, n: NodeId) -> u32 {
        self.block.idx(n).map_or(0, |i| self.info.get(i).depth)
    }

    pub(super) fn velt_type(&self, n: NodeId) -> Option<BasicType> {
        self.block.idx(n).and_then(|i| self.info.get(i).velt_type)
    }

    /// Lane size in bytes.
    pub(super) fn data_size(&self, n: NodeId) -> i32 {
        self.velt_type(n).map_or(0, BasicType::size_in_bytes)
    }

    pub(super) fn my_pack(&self, n: NodeId) -> Option<PackId> {
        self.block.idx(n).and_then(|i| self.info.get(i).my_pack)
    }

    /// Lanes a vector of `n`'s element type gets in this loop.
    pub(super) fn vector_width(&self, n: NodeId) -> usize {
        let Some(bt) = self.velt_type(n) else {
            return 0;
        };
        let stride = self.lp.stride.unsigned_abs() as usize;
        stride.min(self.target.max_vector_size(bt))
    }

    pub(super) fn vector_width_in_bytes(&self, n: NodeId) -> i32 {
        self.vector_width(n) as i32 * self.data_size(n)
    }

    // =========================================================================
    // Element Types
    // =========================================================================

    /// Lane type of every block node; subword arithmetic feeding only
    /// subword stores is narrowed to the stored type.
    fn compute_vector_element_type(&mut self) {
        for i in 0..self.block.len() {
            let n = self.block.at(i);
            let velt = match self.graph.op(n) {
                Operator::Memory(m) => Some(m.elem()),
                Operator::Binary(_, bt)
                | Operator::Unary(_, bt)
                | Operator::Cmp(bt)
                | Operator::CMove(bt) => Some(bt),
                Operator::Convert { to, .. } => Some(to),
                Operator::Bool(_) => self
                    .graph
                    .input(n, 0)
                    .and_then(|c| self.velt_type(c)),
                Operator::Phi => self.graph.node(n).ty.basic_type(),
                _ => None,
            };
            self.info.get_mut(i).velt_type = velt;
        }

        for i in (0..self.block.len()).rev() {
            let n = self.block.at(i);
            if !Self::narrowable(self.graph.op(n)) {
                continue;
            }
            if let Some(narrow) = self.narrowed_type(n) {
                self.info.get_mut(i).velt_type = Some(narrow);
            }
        }
    }

    /// Integer ops whose low bits do not depend on the high bits of their
    /// operands.
    fn narrowable(op: Operator) -> bool {
        match op {
            Operator::Binary(b, BasicType::Int) => matches!(
                b,
                BinaryOp::Add
                    | BinaryOp::Sub
                    | BinaryOp::Mul
                    | BinaryOp::And
                    | BinaryOp::Or
                    | BinaryOp::Xor
                    | BinaryOp::Shl
            ),
            Operator::Unary(u, BasicType::Int) => matches!(u, UnaryOp::Neg | UnaryOp::Not),
            _ => false,
        }
    }

    fn narrowed_type(&self, n: NodeId) -> Option<BasicType> {
        let uses = self.graph.distinct_uses(n);
        let mut narrow: Option<BasicType> = None;
        for u in uses {
            if !self.in_bb(u) {
                return None;
            }
            let t = match self.graph.op(u) {
                Operator::Memory(MemoryOp::Store(bt)) if self.graph.input(u, 2) == Some(n) => bt,
                op if Self::narrowable(op) => self.velt_type(u)?,
                _ => return None,
            };
            if !t.is_subword() || narrow.is_some_and(|prev| prev != t) {
                return None;
            }
            narrow = Some(t);
        }
        narrow
    }

    // =========================================================================
    // Depth and Independence
    // =========================================================================

    /// Longest in-block dependence path from a phi, to fixpoint.
    fn compute_max_depth(&mut self) {
        for _ in 0..=self.block.len() {
            let mut changed = false;
            for i in 0..self.block.len() {
                let n = self.block.at(i);
                if self.graph.node(n).is_phi() {
                    continue;
                }
                let d_in = DepPreds::new(self.graph, &self.block, &self.dg, n)
                    .filter(|&p| self.in_bb(p))
                    .map(|p| self.depth(p))
                    .max()
                    .unwrap_or(0);
                if self.info.get(i).depth != d_in + 1 {
                    self.info.get_mut(i).depth = d_in + 1;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// No dependence path between `s1` and `s2` in either direction.
    pub(super) fn independent(&self, s1: NodeId, s2: NodeId) -> bool {
        let (d1, d2) = (self.depth(s1), self.depth(s2));
        if d1 == d2 {
            return s1 != s2;
        }
        let (deep, shallow) = if d1 > d2 { (s1, s2) } else { (s2, s1) };
        let min_d = self.depth(shallow);

        let mut visited = BitSet::with_capacity(self.graph.len());
        let mut stack = vec![deep];
        while let Some(n) = stack.pop() {
            for pred in DepPreds::new(self.graph, &self.block, &self.dg, n) {
                if !self.in_bb(pred) || self.depth(pred) < min_d {
                    continue;
                }
                if pred == shallow {
                    return false;
                }
                if !self.graph.node(pred).is_phi() && visited.insert(pred.as_usize()) {
                    stack.push(pred);
                }
            }
        }
        true
    }

    // =========================================================================
    // Pairing Predicates
    // =========================================================================

    /// Same operation on the same lane type, and not loop bookkeeping.
    pub(super) fn isomorphic(&self, s1: NodeId, s2: NodeId) -> bool {
        let (n1, n2) = (self.graph.node(s1), self.graph.node(s2));
        if n1.op != n2.op || n1.req() != n2.req() || n1.is_phi() || n1.op.is_vector() {
            return false;
        }
        if [s1, s2].iter().any(|&s| {
            s == self.lp.iv || s == self.lp.incr || self.block.is_address_only(s)
        }) {
            return false;
        }
        self.velt_type(s1).is_some() && self.velt_type(s1) == self.velt_type(s2)
    }

    /// Operands agree on being constant and on being loop invariant.
    pub(super) fn have_similar_inputs(&self, s1: NodeId, s2: NodeId) -> bool {
        let (n1, n2) = (self.graph.node(s1), self.graph.node(s2));
        if n1.is_mem() {
            return true;
        }
        n1.inputs.iter().zip(n2.inputs.iter()).all(|(&a, &b)| {
            self.graph.op(a).is_constant() == self.graph.op(b).is_constant()
                && self.lp.is_invariant(a) == self.lp.is_invariant(b)
        })
    }

    /// `s2` continues the reduction chain through `s1`.
    pub(super) fn reduction(&self, s1: NodeId, s2: NodeId) -> bool {
        self.reductions.is_marked(s1)
            && self.reductions.is_marked(s2)
            && self.depth(s2) > self.depth(s1)
            && self.graph.node(s2).inputs.contains(&s1)
    }

    /// Adjacent references to the same slice, `s2` right after `s1`.
    pub(super) fn are_adjacent_refs(&self, s1: NodeId, s2: NodeId) -> bool {
        if !self.graph.node(s1).is_mem() || !self.graph.node(s2).is_mem() {
            return false;
        }
        if self.block.slice_of(s1).is_none() || self.block.slice_of(s1) != self.block.slice_of(s2) {
            return false;
        }
        match (self.ptr(s1), self.ptr(s2)) {
            (Some(p1), Some(p2)) => p1.is_adjacent_to(p2),
            _ => false,
        }
    }

    /// `s1` and `s2` may form a pair at alignment `align`.
    pub(super) fn stmts_can_pack(&self, s1: NodeId, s2: NodeId, align: Alignment) -> bool {
        if s1 == s2 || !self.in_bb(s1) || !self.in_bb(s2) || align.is_bottom() {
            return false;
        }
        let Some(bt) = self.velt_type(s1) else {
            return false;
        };
        if self.target.max_vector_size(bt) < 2 {
            return false;
        }
        if !self.isomorphic(s1, s2) {
            return false;
        }
        let independent = self.independent(s1, s2) && self.have_similar_inputs(s1, s2);
        if !independent && !self.reduction(s1, s2) {
            return false;
        }
        if self.packset.exists_at(s1, 0) || self.packset.exists_at(s2, 1) {
            return false;
        }
        if self.graph.node(s1).is_mem() && !self.are_adjacent_refs(s1, s2) {
            return false;
        }
        let (a1, a2) = (self.alignment(s1), self.alignment(s2));
        (a1.is_top() || a1 == align) && (a2.is_top() || a2 == align.plus(self.data_size(s1)))
    }

    /// Alignment of `t` given that its user `s` sits at `align`.
    ///
    /// A conversion changes the lane size, so byte offsets scale with it.
    pub(super) fn adjust_alignment_for_type_conversion(
        &self,
        s: NodeId,
        t: NodeId,
        align: Alignment,
    ) -> Alignment {
        let (ss, ts) = (self.data_size(s), self.data_size(t));
        match align {
            Alignment::Offset(off)
                if matches!(self.graph.op(s), Operator::Convert { .. }) && ss > 0 && ss != ts =>
            {
                Alignment::Offset(off / ss * ts)
            }
            other => other,
        }
    }

    // =========================================================================
    // Tracing
    // =========================================================================

    pub(super) fn trace_phase(&self, phase: &str) {
        if self.tracing(TraceFlags::PHASES) {
            trace!("phase {} done: {} packs", phase, self.packset.len());
        }
        if !self.tracing(TraceFlags::PACKSET) {
            return;
        }
        trace!("packset after {} ({} packs):", phase, self.packset.len());
        for (id, pack) in self.packset.iter() {
            let align = self.alignment(pack.first());
            trace!("  {:?}: {:?} align {}", id, pack, align);
        }
    }
}
