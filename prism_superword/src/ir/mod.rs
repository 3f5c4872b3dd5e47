//! Loop-level Sea-of-Nodes IR consumed by the SuperWord pass.
//!
//! # Core Components
//!
//! - **Arena** (`arena.rs`): typed ids, dense side tables, bit sets
//! - **Types** (`types.rs`): element and node output types
//! - **Operators** (`operators.rs`): scalar, memory and vector operators
//! - **Node** (`node.rs`): operator plus ordered inputs
//! - **Graph** (`graph.rs`): node storage with use-def chains
//! - **Loops** (`loops.rs`): counted-loop descriptor and loop feedback
//! - **Builder** (`builder.rs`): unrolled counted-loop construction

pub mod arena;
pub mod builder;
pub mod graph;
pub mod loops;
pub mod node;
pub mod operators;
pub mod types;

pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use builder::{LoopBuilder, ARRAY_HEADER_BYTES};
pub use graph::Graph;
pub use loops::{CountedLoop, LoopFlags, PreLoopAdjustment, UnrollHint};
pub use node::{Node, NodeFlags, NodeId};
pub use operators::{
    BinaryOp, CmpOp, ControlOp, MemoryOp, Operator, UnaryOp, VectorKind, VectorOp,
};
pub use types::{BasicType, ValueType, VectorType};
