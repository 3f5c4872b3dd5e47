//! Target capability oracle and cost model.
//!
//! The SuperWord pass never decides on its own whether an operation has a
//! vector form: it asks a [`VectorTarget`]. [`SimdTarget`] answers for the
//! x86-64 SIMD levels; tests and other back ends can supply their own.
//!
//! # SIMD Levels
//!
//! - **SSE4.2**: 128-bit vectors; compares produce masks that need a blend
//! - **AVX/AVX2**: 256-bit vectors
//! - **AVX-512**: 512-bit vectors, 64-bit multiply/min/max, popcount

use crate::ir::operators::{BinaryOp, MemoryOp, Operator, UnaryOp, VectorKind};
use crate::ir::types::BasicType;

// =============================================================================
// SIMD Level
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SimdLevel {
    Sse42,
    Avx,
    #[default]
    Avx2,
    Avx512,
}

impl SimdLevel {
    pub const fn max_vector_bytes(self) -> usize {
        match self {
            SimdLevel::Sse42 => 16,
            SimdLevel::Avx | SimdLevel::Avx2 => 32,
            SimdLevel::Avx512 => 64,
        }
    }

    /// Lanes of `bt` in the widest register.
    pub const fn max_lanes(self, bt: BasicType) -> usize {
        self.max_vector_bytes() / bt.size_in_bytes() as usize
    }

    pub const fn has_avx512(self) -> bool {
        matches!(self, SimdLevel::Avx512)
    }
}

// =============================================================================
// Capability Oracle
// =============================================================================

/// What the target can execute as a vector.
pub trait VectorTarget {
    /// Widest lane count for `bt`, 0 if `bt` never vectorizes.
    fn max_vector_size(&self, bt: BasicType) -> usize;

    /// Whether `kind` on `lanes` lanes of `bt` has an instruction.
    fn implemented(&self, kind: VectorKind, lanes: usize, bt: BasicType) -> bool;

    /// Vector selects must be lowered to compare + blend.
    fn cmove_needs_mask(&self) -> bool {
        false
    }

    /// Widest register in bytes for `bt`.
    fn vector_width_in_bytes(&self, bt: BasicType) -> usize {
        self.max_vector_size(bt) * bt.size_in_bytes() as usize
    }
}

/// x86-64 capability tables keyed by SIMD level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimdTarget {
    pub level: SimdLevel,
}

impl SimdTarget {
    pub const fn new(level: SimdLevel) -> Self {
        SimdTarget { level }
    }

    fn binary_supported(&self, op: BinaryOp, bt: BasicType) -> bool {
        let avx512 = self.level.has_avx512();
        match op {
            BinaryOp::Add | BinaryOp::Sub => true,
            BinaryOp::Mul => bt != BasicType::Byte && (bt != BasicType::Long || avx512),
            BinaryOp::Div => bt.is_floating(),
            BinaryOp::Min | BinaryOp::Max => bt != BasicType::Long || avx512,
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => bt.is_integral(),
            BinaryOp::Shl | BinaryOp::Sra | BinaryOp::Srl => {
                bt.is_integral() && bt != BasicType::Byte
            }
        }
    }

    fn unary_supported(&self, op: UnaryOp, bt: BasicType) -> bool {
        match op {
            UnaryOp::Neg | UnaryOp::Abs => true,
            UnaryOp::Not => bt.is_integral(),
            UnaryOp::PopCount => {
                self.level.has_avx512() && matches!(bt, BasicType::Int | BasicType::Long)
            }
            UnaryOp::Sqrt => bt.is_floating(),
        }
    }
}

impl VectorTarget for SimdTarget {
    fn max_vector_size(&self, bt: BasicType) -> usize {
        if bt == BasicType::Boolean {
            return 0;
        }
        self.level.max_lanes(bt)
    }

    fn implemented(&self, kind: VectorKind, lanes: usize, bt: BasicType) -> bool {
        if lanes < 2 || !lanes.is_power_of_two() || lanes > self.max_vector_size(bt) {
            return false;
        }
        match kind {
            VectorKind::Load | VectorKind::Store | VectorKind::Replicate => true,
            VectorKind::Extract { lane } => (lane as usize) < lanes,
            VectorKind::Binary(op) => self.binary_supported(op, bt),
            VectorKind::Unary(op) => self.unary_supported(op, bt),
            VectorKind::Reduce(op) => match op {
                BinaryOp::Mul => bt.is_integral() && bt != BasicType::Byte,
                _ => op.is_associative(),
            },
            VectorKind::Convert { from } => {
                // Both sides of the conversion must fit one register.
                let widest = from.size_in_bytes().max(bt.size_in_bytes()) as usize;
                from != BasicType::Boolean && lanes * widest <= self.level.max_vector_bytes()
            }
            VectorKind::Cmp(_) | VectorKind::Blend | VectorKind::CMove(_) => {
                bt.is_floating() || matches!(bt, BasicType::Int | BasicType::Long)
            }
        }
    }

    fn cmove_needs_mask(&self) -> bool {
        self.level == SimdLevel::Sse42
    }
}

// =============================================================================
// Operation Cost
// =============================================================================

/// Latency and reciprocal throughput of one instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpCost {
    pub latency: u8,
    pub throughput: f32,
}

impl OpCost {
    pub const fn new(latency: u8, throughput: f32) -> Self {
        Self {
            latency,
            throughput,
        }
    }

    pub const fn alu() -> Self {
        Self::new(1, 0.5)
    }

    pub const fn mul() -> Self {
        Self::new(3, 1.0)
    }

    pub const fn div() -> Self {
        Self::new(14, 6.0)
    }

    pub const fn load() -> Self {
        Self::new(5, 0.5)
    }

    pub const fn store() -> Self {
        Self::new(4, 1.0)
    }

    pub const fn shuffle() -> Self {
        Self::new(1, 1.0)
    }

    /// Single figure used for comparisons; throughput dominates in loops.
    pub fn total_cost(&self) -> f32 {
        self.throughput + self.latency as f32 * 0.2
    }
}

/// Scalar versus vector cost estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    /// Extra throughput charged per vector op on narrow targets.
    pub vector_penalty: f32,
}

impl CostModel {
    pub fn new(level: SimdLevel) -> Self {
        CostModel {
            vector_penalty: match level {
                SimdLevel::Sse42 => 0.25,
                SimdLevel::Avx | SimdLevel::Avx2 => 0.1,
                SimdLevel::Avx512 => 0.0,
            },
        }
    }

    fn binary_cost(op: BinaryOp) -> OpCost {
        match op {
            BinaryOp::Mul => OpCost::mul(),
            BinaryOp::Div => OpCost::div(),
            _ => OpCost::alu(),
        }
    }

    /// Cost of one scalar operation.
    pub fn scalar_cost(&self, op: &Operator) -> f32 {
        let cost = match op {
            Operator::Memory(MemoryOp::Load(_)) => OpCost::load(),
            Operator::Memory(MemoryOp::Store(_)) => OpCost::store(),
            Operator::Binary(b, _) => Self::binary_cost(*b),
            Operator::Unary(UnaryOp::Sqrt, _) => OpCost::div(),
            Operator::CMove(_) => OpCost::new(2, 1.0),
            _ => OpCost::alu(),
        };
        cost.total_cost()
    }

    /// Cost of one vector operation of `lanes` lanes.
    pub fn vector_cost(&self, kind: VectorKind, lanes: usize) -> f32 {
        let cost = match kind {
            VectorKind::Load => OpCost::load(),
            VectorKind::Store => OpCost::store(),
            VectorKind::Binary(b) => Self::binary_cost(b),
            VectorKind::Unary(UnaryOp::Sqrt) => OpCost::div(),
            VectorKind::Reduce(_) => return self.reduce_cost(lanes),
            VectorKind::Replicate | VectorKind::Extract { .. } | VectorKind::Blend => {
                OpCost::shuffle()
            }
            _ => OpCost::alu(),
        };
        cost.total_cost() + self.vector_penalty
    }

    /// Horizontal reduction: log2(lanes) shuffle + op steps.
    pub fn reduce_cost(&self, lanes: usize) -> f32 {
        let steps = lanes.max(2).trailing_zeros() as f32;
        steps * (OpCost::shuffle().total_cost() + OpCost::alu().total_cost())
    }

    pub fn extract_cost(&self) -> f32 {
        OpCost::shuffle().total_cost()
    }

    pub fn replicate_cost(&self) -> f32 {
        OpCost::shuffle().total_cost()
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::new(SimdLevel::default())
    }
}
