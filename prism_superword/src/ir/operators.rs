//! Operators for the loop IR.
//!
//! Scalar operators are typed by the register type they compute in
//! (`Int`, `Long`, `Float`, `Double`); memory operators carry the element
//! type they touch, so `Load(Byte)` and `Load(Int)` are distinct opcodes.
//! Vector operators carry their full [`VectorType`].
//!
//! Input conventions (positions matter to the vectorizer):
//!
//! | Operator        | Inputs                                   |
//! |-----------------|------------------------------------------|
//! | `Phi`           | region, entry value, backedge value      |
//! | `Binary`        | lhs, rhs                                 |
//! | `Unary`/`Convert` | value                                  |
//! | `Cmp`           | lhs, rhs                                 |
//! | `Bool`          | cmp                                      |
//! | `CMove`         | bool, if-false value, if-true value      |
//! | `AddP`          | base, address, offset                    |
//! | `Load`          | memory, address                          |
//! | `Store`         | memory, address, value                   |

use super::types::{BasicType, ValueType, VectorType};
use std::fmt;

// =============================================================================
// Scalar Operator Kinds
// =============================================================================

/// Two-operand arithmetic and bitwise operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    And,
    Or,
    Xor,
    /// Left shift.
    Shl,
    /// Arithmetic right shift.
    Sra,
    /// Logical right shift.
    Srl,
}

impl BinaryOp {
    #[inline]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Mul
                | BinaryOp::Min
                | BinaryOp::Max
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Xor
        )
    }

    /// Associative for exact (integer) arithmetic.
    #[inline]
    pub const fn is_associative(self) -> bool {
        self.is_commutative()
    }

    #[inline]
    pub const fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Sra | BinaryOp::Srl)
    }

    /// Whether a reduction over this op may be reassociated for `bt`.
    ///
    /// Floating add/mul change rounding under reassociation; min/max do not.
    #[inline]
    pub const fn reassociates_for(self, bt: BasicType) -> bool {
        if !self.is_associative() {
            return false;
        }
        if bt.is_floating() {
            return matches!(self, BinaryOp::Min | BinaryOp::Max);
        }
        true
    }

    pub const fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Sra => "sra",
            BinaryOp::Srl => "srl",
        }
    }
}

/// One-operand operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Not,
    PopCount,
    Sqrt,
}

impl UnaryOp {
    pub const fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Not => "not",
            UnaryOp::PopCount => "popcount",
            UnaryOp::Sqrt => "sqrt",
        }
    }
}

/// Condition tested by a `Bool` node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Condition that holds exactly when `self` does not.
    pub const fn negate(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    /// Condition with the compare operands exchanged.
    pub const fn commute(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }
}

// =============================================================================
// Control and Memory
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlOp {
    Start,
    End,
    /// Head of a counted loop; phis of the loop hang off it.
    CountedLoop,
    /// Backedge test of a counted loop.
    CountedLoopEnd,
    If,
    IfTrue,
    IfFalse,
    Region,
    Return,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Load(BasicType),
    Store(BasicType),
}

impl MemoryOp {
    /// Element type read or written.
    #[inline]
    pub const fn elem(self) -> BasicType {
        match self {
            MemoryOp::Load(bt) | MemoryOp::Store(bt) => bt,
        }
    }
}

// =============================================================================
// Vector Operators
// =============================================================================

/// What a vector node does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VectorKind {
    Load,
    Store,
    Binary(BinaryOp),
    Unary(UnaryOp),
    /// Lane-wise conversion from `from` to the vector's element type.
    Convert { from: BasicType },
    /// Broadcast a scalar to every lane.
    Replicate,
    /// Read one lane back out as a scalar.
    Extract { lane: u8 },
    /// Horizontal reduction of all lanes into one scalar.
    Reduce(BinaryOp),
    /// Lane-wise compare producing a mask.
    Cmp(CmpOp),
    /// Select lanes from two vectors by a mask.
    Blend,
    /// Fused compare-and-select.
    CMove(CmpOp),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VectorOp {
    pub kind: VectorKind,
    pub vt: VectorType,
}

impl VectorOp {
    #[inline]
    pub const fn new(kind: VectorKind, vt: VectorType) -> Self {
        Self { kind, vt }
    }
}

// =============================================================================
// Unified Operator
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    Control(ControlOp),
    /// Incoming method parameter (array bases, loop-invariant scalars).
    Parameter(u16),
    ConstInt(i64),
    /// Float/double constant stored as raw bits.
    ConstFloat(u64),
    Phi,
    Binary(BinaryOp, BasicType),
    Unary(UnaryOp, BasicType),
    Convert { from: BasicType, to: BasicType },
    Cmp(BasicType),
    Bool(CmpOp),
    CMove(BasicType),
    AddP,
    Memory(MemoryOp),
    Vector(VectorOp),
}

impl Operator {
    #[inline]
    pub const fn is_control(&self) -> bool {
        matches!(self, Operator::Control(_))
    }

    #[inline]
    pub const fn is_load(&self) -> bool {
        matches!(self, Operator::Memory(MemoryOp::Load(_)))
    }

    #[inline]
    pub const fn is_store(&self) -> bool {
        matches!(self, Operator::Memory(MemoryOp::Store(_)))
    }

    #[inline]
    pub const fn is_mem(&self) -> bool {
        matches!(self, Operator::Memory(_))
    }

    #[inline]
    pub const fn is_phi(&self) -> bool {
        matches!(self, Operator::Phi)
    }

    #[inline]
    pub const fn is_constant(&self) -> bool {
        matches!(self, Operator::ConstInt(_) | Operator::ConstFloat(_))
    }

    #[inline]
    pub const fn is_vector(&self) -> bool {
        matches!(self, Operator::Vector(_))
    }

    /// Element type of a load or store.
    #[inline]
    pub const fn memory_type(&self) -> Option<BasicType> {
        match self {
            Operator::Memory(m) => Some(m.elem()),
            _ => None,
        }
    }

    /// Integer constant value.
    #[inline]
    pub const fn as_const_int(&self) -> Option<i64> {
        match self {
            Operator::ConstInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Binary op with both operands interchangeable.
    #[inline]
    pub const fn is_commutative(&self) -> bool {
        match self {
            Operator::Binary(op, _) => op.is_commutative(),
            _ => false,
        }
    }

    /// Result type derived from the operator alone.
    ///
    /// `Parameter`, constants and `Phi` are typed by their creator; this
    /// returns `Top` for them unless a phi input type is supplied.
    pub fn result_type(&self, input_types: &[ValueType]) -> ValueType {
        match *self {
            Operator::Control(_) => ValueType::Control,
            Operator::Parameter(_) => ValueType::Top,
            Operator::ConstInt(_) => ValueType::INT,
            Operator::ConstFloat(_) => ValueType::Scalar(BasicType::Double),
            Operator::Phi => input_types.get(1).copied().unwrap_or(ValueType::Top),
            Operator::Binary(_, bt) | Operator::Unary(_, bt) => ValueType::Scalar(bt),
            Operator::Convert { to, .. } => ValueType::Scalar(to),
            Operator::Cmp(_) => ValueType::Flags,
            Operator::Bool(_) => ValueType::BOOL,
            Operator::CMove(bt) => ValueType::Scalar(bt),
            Operator::AddP => ValueType::Address,
            Operator::Memory(MemoryOp::Load(bt)) => ValueType::Scalar(bt.promoted()),
            Operator::Memory(MemoryOp::Store(_)) => ValueType::Memory,
            Operator::Vector(vop) => match vop.kind {
                VectorKind::Store => ValueType::Memory,
                VectorKind::Extract { .. } | VectorKind::Reduce(_) => {
                    ValueType::Scalar(vop.vt.elem.promoted())
                }
                _ => ValueType::Vector(vop.vt),
            },
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Control(c) => write!(f, "{:?}", c),
            Operator::Parameter(i) => write!(f, "Parm{}", i),
            Operator::ConstInt(v) => write!(f, "Con({})", v),
            Operator::ConstFloat(bits) => write!(f, "ConF({})", f64::from_bits(*bits)),
            Operator::Phi => f.write_str("Phi"),
            Operator::Binary(op, bt) => write!(f, "{}.{}", op.name(), bt),
            Operator::Unary(op, bt) => write!(f, "{}.{}", op.name(), bt),
            Operator::Convert { from, to } => write!(f, "Conv{}2{}", from, to),
            Operator::Cmp(bt) => write!(f, "Cmp.{}", bt),
            Operator::Bool(c) => write!(f, "Bool.{}", c.name()),
            Operator::CMove(bt) => write!(f, "CMove.{}", bt),
            Operator::AddP => f.write_str("AddP"),
            Operator::Memory(MemoryOp::Load(bt)) => write!(f, "Load.{}", bt),
            Operator::Memory(MemoryOp::Store(bt)) => write!(f, "Store.{}", bt),
            Operator::Vector(v) => write!(f, "V{:?}{}", v.kind, v.vt),
        }
    }
}
