//! Address decomposition for memory references.
//!
//! A [`SwPointer`] describes the address of one load or store as
//!
//! ```text
//! base + scale * iv + invar + offset
//! ```
//!
//! where `iv` is the loop's induction variable, `scale` and `offset` are
//! byte constants and `invar` is an optional loop-invariant term. Two
//! pointers with the same base, scale and invariant differ only by their
//! constant offsets, which is what adjacency and disjointness tests need.
//!
//! # Matched Shapes
//!
//! The address must be a chain of `AddP` nodes over a loop-invariant base.
//! Each `AddP` offset is matched by `scaled_iv_plus_offset`:
//!
//! - `scaled_iv`: `iv`, `iv * c`, `c * iv`, `iv << c`, `ConvI2L(x)`, and
//!   `x << c` where `x` itself matches `scaled_iv_plus_offset`
//! - `offset_plus_k`: constants, invariants, `inv + c`, `inv - c`, `c - inv`
//! - `scaled_iv + offset`, `scaled_iv - offset`, `offset - scaled_iv`
//!
//! In `offset - scaled_iv` every term of the subtrahend changes sign,
//! including any offset or invariant a nested shape contributed.
//!
//! Anything else leaves the pointer invalid. An invalid pointer compares as
//! `NotComparable` with everything, including itself.

use super::trace::Tracer;
use crate::ir::graph::Graph;
use crate::ir::loops::CountedLoop;
use crate::ir::node::NodeId;
use crate::ir::operators::{BinaryOp, Operator};
use crate::ir::types::BasicType;
use std::fmt;

/// Upper bound on nested `AddP` nodes in one address.
const MAX_ADDP_DEPTH: usize = 3;

// =============================================================================
// Comparison Result
// =============================================================================

/// Relation between two memory references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerCmp {
    /// Disjoint; `self` lies entirely below `other`.
    Less,
    /// Disjoint; `self` lies entirely above `other`.
    Greater,
    /// The accessed byte ranges overlap.
    Equal,
    /// Nothing is known; treat as possibly aliasing.
    NotComparable,
}

impl PointerCmp {
    /// Proven not to touch the same bytes.
    #[inline]
    pub const fn is_disjoint(self) -> bool {
        matches!(self, PointerCmp::Less | PointerCmp::Greater)
    }

    /// Result of the comparison with operands swapped.
    #[inline]
    pub const fn reverse(self) -> Self {
        match self {
            PointerCmp::Less => PointerCmp::Greater,
            PointerCmp::Greater => PointerCmp::Less,
            other => other,
        }
    }
}

// =============================================================================
// Invariant Term
// =============================================================================

/// Loop-invariant addend, possibly negated and shifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Invariant {
    pub node: NodeId,
    pub negated: bool,
    pub shift: u8,
}

// =============================================================================
// SwPointer
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SwPointer {
    mem: NodeId,
    base: NodeId,
    adr: NodeId,
    scale: i32,
    offset: i32,
    invar: Option<Invariant>,
    memory_size: i32,
    valid: bool,
}

impl SwPointer {
    /// Decompose the address of `mem`.
    pub fn new(graph: &Graph, lp: &CountedLoop, mem: NodeId) -> Self {
        Self::with_tracer(graph, lp, mem, &mut Tracer::disabled())
    }

    /// Decompose the address of `mem`, tracing every matcher step.
    pub fn with_tracer(graph: &Graph, lp: &CountedLoop, mem: NodeId, tracer: &mut Tracer) -> Self {
        let memory_size = graph
            .node(mem)
            .memory_type()
            .map_or(0, BasicType::size_in_bytes);
        let mut ptr = SwPointer {
            mem,
            base: NodeId::INVALID,
            adr: NodeId::INVALID,
            scale: 0,
            offset: 0,
            invar: None,
            memory_size,
            valid: false,
        };
        let Some(mut adr) = graph.node(mem).address_input() else {
            return ptr;
        };
        if graph.op(adr) != Operator::AddP {
            tracer.note(format_args!("{:?}: address is not an AddP", mem));
            return ptr;
        }
        let base = graph.input(adr, 0).unwrap_or(NodeId::INVALID);
        if !base.is_valid() || lp.contains(base) {
            tracer.note(format_args!("{:?}: base is loop variant", mem));
            return ptr;
        }

        let mut m = Matcher::new(graph, lp, tracer);
        for _ in 0..MAX_ADDP_DEPTH {
            let Some(off) = graph.input(adr, 2) else {
                return ptr;
            };
            if !m.scaled_iv_plus_offset(off) {
                return ptr;
            }
            adr = graph.input(adr, 1).unwrap_or(NodeId::INVALID);
            if !adr.is_valid() || adr == base || graph.op(adr) != Operator::AddP {
                break;
            }
        }
        if !adr.is_valid() || lp.contains(adr) || adr != base {
            m.tracer.note(format_args!("{:?}: adr {:?} and base {:?} differ", mem, adr, base));
            return ptr;
        }

        ptr.base = base;
        ptr.adr = adr;
        ptr.scale = m.scale;
        ptr.offset = m.offset;
        ptr.invar = m.invar;
        ptr.valid = true;
        ptr
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn mem(&self) -> NodeId {
        self.mem
    }

    #[inline]
    pub fn base(&self) -> NodeId {
        self.base
    }

    #[inline]
    pub fn adr(&self) -> NodeId {
        self.adr
    }

    #[inline]
    pub fn scale_in_bytes(&self) -> i32 {
        self.scale
    }

    #[inline]
    pub fn offset_in_bytes(&self) -> i32 {
        self.offset
    }

    #[inline]
    pub fn invar(&self) -> Option<Invariant> {
        self.invar
    }

    #[inline]
    pub fn memory_size(&self) -> i32 {
        self.memory_size
    }

    /// Same base, scale and invariant: offsets alone decide the relation.
    pub fn comparable(&self, q: &SwPointer) -> bool {
        self.valid
            && q.valid
            && self.base == q.base
            && (self.adr == q.adr || (self.base == self.adr && q.base == q.adr))
            && self.scale == q.scale
            && self.invar == q.invar
    }

    pub fn cmp(&self, q: &SwPointer) -> PointerCmp {
        if !self.comparable(q) {
            return PointerCmp::NotComparable;
        }
        let (lo, hi) = (i64::from(self.offset), i64::from(q.offset));
        let overlap = hi < lo + i64::from(self.memory_size) && lo < hi + i64::from(q.memory_size);
        if overlap {
            PointerCmp::Equal
        } else if lo < hi {
            PointerCmp::Less
        } else {
            PointerCmp::Greater
        }
    }

    /// `q` starts exactly where `self` ends.
    pub fn is_adjacent_to(&self, q: &SwPointer) -> bool {
        self.comparable(q) && q.offset - self.offset == self.memory_size
    }
}

impl fmt::Debug for SwPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return write!(f, "SwPointer({:?}: invalid)", self.mem);
        }
        write!(
            f,
            "SwPointer({:?}: base={:?} adr={:?} {}*iv{:+}",
            self.mem, self.base, self.adr, self.scale, self.offset
        )?;
        if let Some(inv) = self.invar {
            let sign = if inv.negated { '-' } else { '+' };
            write!(f, " {}{:?}<<{}", sign, inv.node, inv.shift)?;
        }
        write!(f, " size={})", self.memory_size)
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// Accumulates `scale`, `offset` and `invar` while walking an offset tree.
struct Matcher<'a, 't> {
    graph: &'a Graph,
    lp: &'a CountedLoop,
    tracer: &'t mut Tracer,
    scale: i32,
    offset: i32,
    invar: Option<Invariant>,
}

impl<'a, 't> Matcher<'a, 't> {
    fn new(graph: &'a Graph, lp: &'a CountedLoop, tracer: &'t mut Tracer) -> Self {
        Matcher {
            graph,
            lp,
            tracer,
            scale: 0,
            offset: 0,
            invar: None,
        }
    }

    fn has_iv(&self) -> bool {
        self.scale != 0
    }

    fn invariant(&self, n: NodeId) -> bool {
        !self.lp.contains(n)
    }

    fn con(&self, n: NodeId) -> Option<i32> {
        self.graph
            .op(n)
            .as_const_int()
            .and_then(|v| i32::try_from(v).ok())
    }

    fn add_offset(&mut self, k: i32, negate: bool) -> bool {
        let k = if negate { k.checked_neg() } else { Some(k) };
        match k.and_then(|k| self.offset.checked_add(k)) {
            Some(off) => {
                self.offset = off;
                true
            }
            None => false,
        }
    }

    fn binary(&self, n: NodeId) -> Option<(BinaryOp, NodeId, NodeId)> {
        match self.graph.op(n) {
            Operator::Binary(op, BasicType::Int | BasicType::Long) => {
                Some((op, self.graph.input(n, 0)?, self.graph.input(n, 1)?))
            }
            _ => None,
        }
    }

    fn is_conv_i2l(&self, n: NodeId) -> bool {
        matches!(
            self.graph.op(n),
            Operator::Convert {
                from: BasicType::Int,
                to: BasicType::Long
            }
        )
    }

    /// `scaled_iv`, `offset_plus_k`, or one of each joined by add/sub.
    fn scaled_iv_plus_offset(&mut self, n: NodeId) -> bool {
        self.tracer.enter(self.graph, "scaled_iv_plus_offset", n);
        let ok = self.scaled_iv_plus_offset_inner(n);
        self.tracer.leave("scaled_iv_plus_offset", ok)
    }

    fn scaled_iv_plus_offset_inner(&mut self, n: NodeId) -> bool {
        let saved = self.state();
        if self.scaled_iv(n) {
            return true;
        }
        self.restore(saved);
        if self.offset_plus_k(n, false) {
            return true;
        }
        self.restore(saved);
        match self.binary(n) {
            Some((BinaryOp::Add, a, b)) => {
                if self.scaled_iv(a) && self.offset_plus_k(b, false) {
                    return true;
                }
                self.restore(saved);
                if self.scaled_iv(b) && self.offset_plus_k(a, false) {
                    return true;
                }
            }
            Some((BinaryOp::Sub, a, b)) => {
                if self.scaled_iv(a) && self.offset_plus_k(b, true) {
                    return true;
                }
                self.restore(saved);
                if self.offset_plus_k(a, false) && self.negated_scaled_iv(b) {
                    return true;
                }
            }
            _ => {}
        }
        self.restore(saved);
        false
    }

    /// Fold in `-scaled_iv(n)`. The subtrahend is matched on its own so
    /// that its offset and invariant flip sign along with its scale.
    fn negated_scaled_iv(&mut self, n: NodeId) -> bool {
        if self.has_iv() {
            return false;
        }
        let mut tmp = Matcher::new(self.graph, self.lp, self.tracer);
        if !tmp.scaled_iv(n) {
            return false;
        }
        let (tmp_scale, tmp_offset, tmp_invar) = (tmp.scale, tmp.offset, tmp.invar);
        if tmp_invar.is_some() && self.invar.is_some() {
            return false;
        }
        let Some(scale) = tmp_scale.checked_neg() else {
            return false;
        };
        if !self.add_offset(tmp_offset, true) {
            return false;
        }
        self.scale = scale;
        if let Some(inv) = tmp_invar {
            self.invar = Some(Invariant {
                negated: !inv.negated,
                ..inv
            });
        }
        true
    }

    fn state(&self) -> (i32, i32, Option<Invariant>) {
        (self.scale, self.offset, self.invar)
    }

    fn restore(&mut self, (scale, offset, invar): (i32, i32, Option<Invariant>)) {
        self.scale = scale;
        self.offset = offset;
        self.invar = invar;
    }

    fn scaled_iv(&mut self, n: NodeId) -> bool {
        self.tracer.enter(self.graph, "scaled_iv", n);
        let ok = self.scaled_iv_inner(n);
        self.tracer.leave("scaled_iv", ok)
    }

    fn scaled_iv_inner(&mut self, n: NodeId) -> bool {
        if self.has_iv() {
            return false;
        }
        let iv = self.lp.iv;
        if n == iv {
            self.scale = 1;
            return true;
        }
        if self.is_conv_i2l(n) {
            return match self.graph.input(n, 0) {
                Some(x) => self.scaled_iv_plus_offset(x),
                None => false,
            };
        }
        match self.binary(n) {
            Some((BinaryOp::Mul, a, b)) => {
                let c = if a == iv {
                    self.con(b)
                } else if b == iv {
                    self.con(a)
                } else {
                    None
                };
                match c {
                    Some(c) if c != 0 => {
                        self.scale = c;
                        true
                    }
                    _ => false,
                }
            }
            Some((BinaryOp::Shl, a, b)) => {
                let Some(shift) = self.con(b).filter(|s| (0..31).contains(s)) else {
                    return false;
                };
                if a == iv {
                    self.scale = 1 << shift;
                    return true;
                }
                // Nested `(x) << c`: match `x` on its own, then scale it.
                if self.invar.is_some() {
                    return false;
                }
                let mut tmp = Matcher::new(self.graph, self.lp, self.tracer);
                if !tmp.scaled_iv_plus_offset(a) || !tmp.has_iv() {
                    return false;
                }
                let mult = 1i32 << shift;
                let (tmp_scale, tmp_offset, tmp_invar) = (tmp.scale, tmp.offset, tmp.invar);
                let (Some(scale), Some(off)) = (
                    tmp_scale.checked_mul(mult),
                    tmp_offset.checked_mul(mult),
                ) else {
                    return false;
                };
                if !self.add_offset(off, false) {
                    return false;
                }
                self.scale = scale;
                self.invar = tmp_invar.map(|inv| Invariant {
                    shift: inv.shift + shift as u8,
                    ..inv
                });
                true
            }
            _ => false,
        }
    }

    fn offset_plus_k(&mut self, n: NodeId, negate: bool) -> bool {
        self.tracer.enter(self.graph, "offset_plus_k", n);
        let ok = self.offset_plus_k_inner(n, negate);
        self.tracer.leave("offset_plus_k", ok)
    }

    fn offset_plus_k_inner(&mut self, n: NodeId, negate: bool) -> bool {
        if let Some(k) = self.graph.op(n).as_const_int() {
            return match i32::try_from(k) {
                Ok(k) => self.add_offset(k, negate),
                Err(_) => false,
            };
        }
        if self.invar.is_some() {
            return false;
        }
        if let Some((op @ (BinaryOp::Add | BinaryOp::Sub), a, b)) = self.binary(n) {
            if let Some(k) = self.con(b) {
                if self.invariant(a) {
                    // inv + k, inv - k
                    let k_neg = (op == BinaryOp::Sub) != negate;
                    if !self.add_offset(k, k_neg) {
                        return false;
                    }
                    self.invar = Some(Invariant {
                        node: a,
                        negated: negate,
                        shift: 0,
                    });
                    return true;
                }
            }
            if let Some(k) = self.con(a) {
                if self.invariant(b) {
                    // k + inv, k - inv
                    if !self.add_offset(k, negate) {
                        return false;
                    }
                    self.invar = Some(Invariant {
                        node: b,
                        negated: (op == BinaryOp::Sub) != negate,
                        shift: 0,
                    });
                    return true;
                }
            }
        }
        if self.invariant(n) {
            let node = if self.is_conv_i2l(n) {
                self.graph.input(n, 0).unwrap_or(n)
            } else {
                n
            };
            self.invar = Some(Invariant {
                node,
                negated: negate,
                shift: 0,
            });
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{LoopBuilder, ARRAY_HEADER_BYTES};
    use crate::ir::types::ValueType;

    fn pointer_of(b: LoopBuilder, mem: NodeId) -> SwPointer {
        let (g, lp) = b.finish();
        SwPointer::new(&g, &lp, mem)
    }

    #[test]
    fn test_array_element_decomposes() {
        let mut b = LoopBuilder::new(4);
        let a = b.array(BasicType::Int);
        let ld = b.load(a, 3);
        let p = pointer_of(b, ld);
        assert!(p.valid());
        assert_eq!(p.base(), a);
        assert_eq!(p.scale_in_bytes(), 4);
        assert_eq!(p.offset_in_bytes(), ARRAY_HEADER_BYTES as i32 + 12);
        assert_eq!(p.invar(), None);
        assert_eq!(p.memory_size(), 4);
    }

    #[test]
    fn test_byte_array_skips_shift() {
        let mut b = LoopBuilder::new(4);
        let a = b.array(BasicType::Byte);
        let ld = b.load(a, 2);
        let p = pointer_of(b, ld);
        assert!(p.valid());
        assert_eq!(p.scale_in_bytes(), 1);
        assert_eq!(p.offset_in_bytes(), ARRAY_HEADER_BYTES as i32 + 2);
    }

    #[test]
    fn test_invariant_index_term() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let n = b.invariant(BasicType::Int);
        let iv = b.iv();
        let shifted = b.binary(BinaryOp::Add, n, iv);
        let idx = {
            let five = b.constant(5, ValueType::INT);
            b.binary(BinaryOp::Add, shifted, five)
        };
        let ld = b.load_at(a, idx);
        let p = pointer_of(b, ld);
        // (n + iv) + 5 is not one of the matched shapes.
        assert!(!p.valid());
    }

    #[test]
    fn test_iv_minus_invariant() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Long);
        let n = b.invariant(BasicType::Int);
        let iv = b.iv();
        let idx = b.binary(BinaryOp::Sub, iv, n);
        let ld = b.load_at(a, idx);
        let p = pointer_of(b, ld);
        assert!(p.valid());
        assert_eq!(p.scale_in_bytes(), 8);
        let inv = p.invar().expect("invariant term");
        assert_eq!(inv.node, n);
        assert!(inv.negated);
        assert_eq!(inv.shift, 3);
    }

    #[test]
    fn test_subtracted_nested_shift_negates_offset() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let iv = b.iv();
        let one = b.constant(1, ValueType::INT);
        let ten = b.constant(10, ValueType::INT);
        let eight = b.constant(8, ValueType::INT);

        // a[10 - ((i + 1) << 1)]
        let i1 = b.binary(BinaryOp::Add, iv, one);
        let s1 = b.binary(BinaryOp::Shl, i1, one);
        let idx1 = b.binary(BinaryOp::Sub, ten, s1);
        let l1 = b.load_at(a, idx1);

        // a[8 - (i << 1)], the same element
        let s2 = b.binary(BinaryOp::Shl, iv, one);
        let idx2 = b.binary(BinaryOp::Sub, eight, s2);
        let l2 = b.load_at(a, idx2);

        let (g, lp) = b.finish();
        let p1 = SwPointer::new(&g, &lp, l1);
        let p2 = SwPointer::new(&g, &lp, l2);
        assert!(p1.valid() && p2.valid());
        assert_eq!(p1.scale_in_bytes(), -8);
        assert_eq!(p1.offset_in_bytes(), ARRAY_HEADER_BYTES as i32 + 32);
        assert_eq!(p2.offset_in_bytes(), ARRAY_HEADER_BYTES as i32 + 32);
        assert_eq!(p1.cmp(&p2), PointerCmp::Equal);
        assert!(!p1.cmp(&p2).is_disjoint());
    }

    #[test]
    fn test_subtracted_invariant_flips_sign() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let n = b.invariant(BasicType::Int);
        let iv = b.iv();
        let one = b.constant(1, ValueType::INT);
        let five = b.constant(5, ValueType::INT);

        // a[5 - ((i - n) << 1)] = a[5 - 2i + 2n]
        let d = b.binary(BinaryOp::Sub, iv, n);
        let s = b.binary(BinaryOp::Shl, d, one);
        let idx = b.binary(BinaryOp::Sub, five, s);
        let ld = b.load_at(a, idx);
        let p = pointer_of(b, ld);
        assert!(p.valid());
        assert_eq!(p.scale_in_bytes(), -8);
        assert_eq!(p.offset_in_bytes(), ARRAY_HEADER_BYTES as i32 + 20);
        let inv = p.invar().expect("invariant term");
        assert_eq!(inv.node, n);
        assert!(!inv.negated);
        assert_eq!(inv.shift, 3);
    }

    #[test]
    fn test_data_dependent_index_is_invalid() {
        let mut b = LoopBuilder::new(2);
        let a = b.array(BasicType::Int);
        let idx_arr = b.distinct_array(BasicType::Int);
        let idx = b.load(idx_arr, 0);
        let ld = b.load_at(a, idx);
        let p = pointer_of(b, ld);
        assert!(!p.valid());
    }

    #[test]
    fn test_cmp_relations() {
        let mut b = LoopBuilder::new(4);
        let a = b.array(BasicType::Int);
        let l0 = b.load(a, 0);
        let l1 = b.load(a, 1);
        let l0b = b.load(a, 0);
        let (g, lp) = b.finish();
        let p0 = SwPointer::new(&g, &lp, l0);
        let p1 = SwPointer::new(&g, &lp, l1);
        let p0b = SwPointer::new(&g, &lp, l0b);
        assert_eq!(p0.cmp(&p1), PointerCmp::Less);
        assert_eq!(p1.cmp(&p0), PointerCmp::Greater);
        assert_eq!(p0.cmp(&p0b), PointerCmp::Equal);
        assert!(p0.is_adjacent_to(&p1));
        assert!(!p1.is_adjacent_to(&p0));
    }

    #[test]
    fn test_different_bases_not_comparable() {
        let mut b = LoopBuilder::new(4);
        let a = b.array(BasicType::Int);
        let c = b.array(BasicType::Int);
        let la = b.load(a, 0);
        let lc = b.load(c, 1);
        let (g, lp) = b.finish();
        let pa = SwPointer::new(&g, &lp, la);
        let pc = SwPointer::new(&g, &lp, lc);
        assert_eq!(pa.cmp(&pc), PointerCmp::NotComparable);
        assert!(!PointerCmp::NotComparable.is_disjoint());
    }

    #[test]
    fn test_pointer_cmp_reverse() {
        assert_eq!(PointerCmp::Less.reverse(), PointerCmp::Greater);
        assert_eq!(PointerCmp::Equal.reverse(), PointerCmp::Equal);
        assert_eq!(PointerCmp::NotComparable.reverse(), PointerCmp::NotComparable);
    }
}
