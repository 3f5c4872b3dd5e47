//! Counted-loop construction.
//!
//! `LoopBuilder` emits the shape loop opts hand to the vectorizer: a counted
//! loop whose body has already been unrolled, with array accesses expanded
//! into explicit address arithmetic:
//!
//! ```text
//! adr = AddP(base, AddP(base, base, ConvI2L(iv + k) << log2(size)), HEADER)
//! ```
//!
//! Memory is threaded per alias slice. Arrays of the same element type share
//! a slice unless they are created with [`LoopBuilder::distinct_array`].

use super::graph::Graph;
use super::loops::CountedLoop;
use super::node::NodeId;
use super::operators::{BinaryOp, CmpOp, ControlOp, MemoryOp, Operator, UnaryOp};
use super::types::{BasicType, ValueType};

/// Bytes between an array reference and its first element.
pub const ARRAY_HEADER_BYTES: i64 = 16;

/// One memory alias slice: its phi and the newest state inside the body.
struct Slice {
    alias: u32,
    phi: NodeId,
    current: NodeId,
}

/// An array parameter and where its memory lives.
struct ArrayInfo {
    base: NodeId,
    elem: BasicType,
    alias: u32,
}

pub struct LoopBuilder {
    graph: Graph,
    head: NodeId,
    iv: NodeId,
    init: NodeId,
    limit: NodeId,
    stride: i32,
    unroll: u32,
    trip_count: Option<u64>,
    body: Vec<NodeId>,
    slices: Vec<Slice>,
    arrays: Vec<ArrayInfo>,
    next_param: u16,
    next_alias: u32,
}

impl LoopBuilder {
    /// Loop `for (i = 0; i < n; i++)` unrolled `unroll` times.
    pub fn new(unroll: u32) -> Self {
        Self::with_stride(1, unroll)
    }

    /// Loop with scalar stride `scalar_stride`, unrolled `unroll` times.
    pub fn with_stride(scalar_stride: i32, unroll: u32) -> Self {
        let mut graph = Graph::new();
        let start = graph.start;
        let head = graph.add_node(Operator::Control(ControlOp::CountedLoop), &[start]);
        let init = graph.const_int(0, ValueType::INT);
        let limit = graph.add_node_with_type(Operator::Parameter(0), &[], ValueType::INT);
        let iv = graph.add_node_with_type(Operator::Phi, &[head, init, init], ValueType::INT);
        LoopBuilder {
            graph,
            head,
            iv,
            init,
            limit,
            stride: scalar_stride * unroll as i32,
            unroll,
            trip_count: None,
            body: vec![iv],
            slices: Vec::new(),
            arrays: Vec::new(),
            next_param: 1,
            next_alias: 1000,
        }
    }

    pub fn set_trip_count(&mut self, trip_count: u64) {
        self.trip_count = Some(trip_count);
    }

    /// Read-only view of the graph under construction.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[inline]
    pub fn iv(&self) -> NodeId {
        self.iv
    }

    #[inline]
    pub fn head(&self) -> NodeId {
        self.head
    }

    // =========================================================================
    // Loop-Invariant Inputs
    // =========================================================================

    fn param(&mut self, ty: ValueType) -> NodeId {
        let id = self
            .graph
            .add_node_with_type(Operator::Parameter(self.next_param), &[], ty);
        self.next_param += 1;
        id
    }

    /// Array parameter sharing the slice of its element type.
    pub fn array(&mut self, elem: BasicType) -> NodeId {
        self.array_in_slice(elem, elem as u32)
    }

    /// Array parameter known not to alias any other array.
    pub fn distinct_array(&mut self, elem: BasicType) -> NodeId {
        let alias = self.next_alias;
        self.next_alias += 1;
        self.array_in_slice(elem, alias)
    }

    fn array_in_slice(&mut self, elem: BasicType, alias: u32) -> NodeId {
        let base = self.param(ValueType::Address);
        self.arrays.push(ArrayInfo { base, elem, alias });
        base
    }

    /// Loop-invariant scalar parameter.
    pub fn invariant(&mut self, bt: BasicType) -> NodeId {
        self.param(ValueType::Scalar(bt))
    }

    /// Constant defined outside the loop.
    pub fn constant(&mut self, value: i64, ty: ValueType) -> NodeId {
        self.graph.const_int(value, ty)
    }

    // =========================================================================
    // Body Nodes
    // =========================================================================

    fn emit(&mut self, op: Operator, inputs: &[NodeId]) -> NodeId {
        let id = self.graph.add_node(op, inputs);
        self.body.push(id);
        id
    }

    /// `iv + k`.
    pub fn index(&mut self, k: i64) -> NodeId {
        if k == 0 {
            return self.iv;
        }
        let con = self.constant(k, ValueType::INT);
        self.emit(Operator::Binary(BinaryOp::Add, BasicType::Int), &[self.iv, con])
    }

    fn array_info(&self, base: NodeId) -> (BasicType, u32) {
        self.arrays
            .iter()
            .find(|a| a.base == base)
            .map(|a| (a.elem, a.alias))
            .unwrap_or((BasicType::Int, BasicType::Int as u32))
    }

    /// Element address of `base[index]`.
    pub fn array_address(&mut self, base: NodeId, index: NodeId) -> NodeId {
        let (elem, _) = self.array_info(base);
        let wide = self.emit(
            Operator::Convert {
                from: BasicType::Int,
                to: BasicType::Long,
            },
            &[index],
        );
        let scaled = if elem.log2_size() == 0 {
            wide
        } else {
            let shift = self.constant(i64::from(elem.log2_size()), ValueType::INT);
            self.emit(Operator::Binary(BinaryOp::Shl, BasicType::Long), &[wide, shift])
        };
        let inner = self.emit(Operator::AddP, &[base, base, scaled]);
        let header = self.constant(ARRAY_HEADER_BYTES, ValueType::LONG);
        self.emit(Operator::AddP, &[base, inner, header])
    }

    fn slice_state(&mut self, alias: u32) -> usize {
        if let Some(pos) = self.slices.iter().position(|s| s.alias == alias) {
            return pos;
        }
        let entry = self.param(ValueType::Memory);
        let phi = self.graph.add_node_with_type(
            Operator::Phi,
            &[self.head, entry, entry],
            ValueType::Memory,
        );
        self.body.push(phi);
        self.slices.push(Slice {
            alias,
            phi,
            current: phi,
        });
        self.slices.len() - 1
    }

    /// `base[iv + k]`.
    pub fn load(&mut self, base: NodeId, k: i64) -> NodeId {
        let index = self.index(k);
        self.load_at(base, index)
    }

    /// `base[index]` for an arbitrary index expression.
    pub fn load_at(&mut self, base: NodeId, index: NodeId) -> NodeId {
        let (elem, alias) = self.array_info(base);
        let adr = self.array_address(base, index);
        let slice = self.slice_state(alias);
        let mem = self.slices[slice].current;
        self.emit(Operator::Memory(MemoryOp::Load(elem)), &[mem, adr])
    }

    /// `base[iv + k] = value`.
    pub fn store(&mut self, base: NodeId, k: i64, value: NodeId) -> NodeId {
        let index = self.index(k);
        self.store_at(base, index, value)
    }

    /// `base[index] = value` for an arbitrary index expression.
    pub fn store_at(&mut self, base: NodeId, index: NodeId, value: NodeId) -> NodeId {
        let (elem, alias) = self.array_info(base);
        let adr = self.array_address(base, index);
        let slice = self.slice_state(alias);
        let mem = self.slices[slice].current;
        let st = self.emit(Operator::Memory(MemoryOp::Store(elem)), &[mem, adr, value]);
        self.slices[slice].current = st;
        st
    }

    fn scalar_type(&self, n: NodeId) -> BasicType {
        self.graph
            .node(n)
            .ty
            .basic_type()
            .map(BasicType::promoted)
            .unwrap_or(BasicType::Int)
    }

    /// Binary op computed in the register type of `a`.
    pub fn binary(&mut self, op: BinaryOp, a: NodeId, b: NodeId) -> NodeId {
        let bt = self.scalar_type(a);
        self.emit(Operator::Binary(op, bt), &[a, b])
    }

    pub fn unary(&mut self, op: UnaryOp, a: NodeId) -> NodeId {
        let bt = self.scalar_type(a);
        self.emit(Operator::Unary(op, bt), &[a])
    }

    pub fn convert(&mut self, a: NodeId, to: BasicType) -> NodeId {
        let from = self.scalar_type(a);
        self.emit(Operator::Convert { from, to }, &[a])
    }

    pub fn cmp(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let bt = self.scalar_type(a);
        self.emit(Operator::Cmp(bt), &[a, b])
    }

    pub fn test(&mut self, cond: CmpOp, cmp: NodeId) -> NodeId {
        self.emit(Operator::Bool(cond), &[cmp])
    }

    /// `cond ? if_true : if_false`.
    pub fn cmove(&mut self, cond: NodeId, if_false: NodeId, if_true: NodeId) -> NodeId {
        let bt = self.scalar_type(if_false);
        self.emit(Operator::CMove(bt), &[cond, if_false, if_true])
    }

    /// Loop-carried scalar starting at `init`; close it with
    /// [`LoopBuilder::close_accumulator`].
    pub fn accumulator(&mut self, init: NodeId) -> NodeId {
        let ty = self.graph.node(init).ty;
        let phi = self
            .graph
            .add_node_with_type(Operator::Phi, &[self.head, init, init], ty);
        self.body.push(phi);
        phi
    }

    pub fn close_accumulator(&mut self, phi: NodeId, value: NodeId) {
        self.graph.replace_input(phi, 2, value);
    }

    /// Use of `value` after the loop exits.
    pub fn exit_use(&mut self, value: NodeId) -> NodeId {
        self.graph
            .add_node(Operator::Control(ControlOp::Return), &[value])
    }

    /// Close every memory slice and the induction variable.
    pub fn finish(mut self) -> (Graph, CountedLoop) {
        for slice in &self.slices {
            self.graph.replace_input(slice.phi, 2, slice.current);
        }
        let stride = self.constant(i64::from(self.stride), ValueType::INT);
        let incr = self.emit(
            Operator::Binary(BinaryOp::Add, BasicType::Int),
            &[self.iv, stride],
        );
        self.graph.replace_input(self.iv, 2, incr);
        let cmp = self.emit(Operator::Cmp(BasicType::Int), &[incr, self.limit]);
        let test = self.emit(Operator::Bool(CmpOp::Lt), &[cmp]);
        let loop_end = self
            .graph
            .add_node(Operator::Control(ControlOp::CountedLoopEnd), &[self.head, test]);
        self.graph.add_input(self.head, loop_end);

        let mut lp = CountedLoop::new(
            self.head,
            loop_end,
            self.iv,
            incr,
            self.init,
            self.limit,
            self.stride,
            self.unroll,
        );
        lp.trip_count = self.trip_count;
        for &n in &self.body {
            lp.add_to_body(n);
        }
        (self.graph, lp)
    }
}
