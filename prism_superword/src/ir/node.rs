//! IR nodes.
//!
//! A node is an operator plus an ordered input list. Control and memory
//! ordering are ordinary inputs: a load names the memory state it reads, a
//! store produces the next memory state of its slice, a phi names its loop
//! head. Loop membership is tracked by the [`CountedLoop`] descriptor rather
//! than by a control input on every node.
//!
//! [`CountedLoop`]: super::loops::CountedLoop

use super::arena::Id;
use super::operators::{MemoryOp, Operator};
use super::types::{BasicType, ValueType};
use smallvec::SmallVec;

/// Unique identifier for a node in the graph.
pub type NodeId = Id<Node>;

/// Most nodes take at most four inputs; phis of wide regions spill.
pub type Inputs = SmallVec<[NodeId; 4]>;

// =============================================================================
// Node Flags
// =============================================================================

bitflags::bitflags! {
    /// Per-node status bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// Removed from the graph; inputs no longer list it as a use.
        const DEAD = 0b0000_0001;
        /// Scheduled outside the loop that would otherwise contain it.
        const PINNED = 0b0000_0010;
        /// Created by the vectorizer.
        const VECTORIZED = 0b0000_0100;
        /// Loop-invariant value computed before the loop.
        const LOOP_INVARIANT = 0b0000_1000;
    }
}

// =============================================================================
// Node
// =============================================================================

#[derive(Clone)]
pub struct Node {
    pub op: Operator,
    pub inputs: Inputs,
    pub ty: ValueType,
    pub flags: NodeFlags,
}

impl Node {
    pub fn new(op: Operator, inputs: &[NodeId], ty: ValueType) -> Self {
        Node {
            op,
            inputs: SmallVec::from_slice(inputs),
            ty,
            flags: NodeFlags::empty(),
        }
    }

    /// Input at position `index`.
    #[inline]
    pub fn input(&self, index: usize) -> Option<NodeId> {
        self.inputs.get(index).copied()
    }

    #[inline]
    pub fn req(&self) -> usize {
        self.inputs.len()
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.flags.contains(NodeFlags::DEAD)
    }

    #[inline]
    pub fn mark_dead(&mut self) {
        self.flags.insert(NodeFlags::DEAD);
    }

    #[inline]
    pub fn is_load(&self) -> bool {
        self.op.is_load()
    }

    #[inline]
    pub fn is_store(&self) -> bool {
        self.op.is_store()
    }

    #[inline]
    pub fn is_mem(&self) -> bool {
        self.op.is_mem()
    }

    #[inline]
    pub fn is_phi(&self) -> bool {
        self.op.is_phi()
    }

    /// Memory state input of a load or store.
    #[inline]
    pub fn memory_input(&self) -> Option<NodeId> {
        if self.is_mem() {
            self.input(0)
        } else {
            None
        }
    }

    /// Address input of a load or store.
    #[inline]
    pub fn address_input(&self) -> Option<NodeId> {
        if self.is_mem() {
            self.input(1)
        } else {
            None
        }
    }

    /// Stored value of a store.
    #[inline]
    pub fn value_input(&self) -> Option<NodeId> {
        if self.is_store() {
            self.input(2)
        } else {
            None
        }
    }

    /// Element type of a load or store.
    #[inline]
    pub fn memory_type(&self) -> Option<BasicType> {
        match self.op {
            Operator::Memory(MemoryOp::Load(bt) | MemoryOp::Store(bt)) => Some(bt),
            _ => None,
        }
    }

    /// First input position that carries data the vectorizer follows.
    ///
    /// Skips the memory state of loads/stores and the region of phis.
    #[inline]
    pub fn first_data_input(&self) -> usize {
        match self.op {
            Operator::Memory(_) | Operator::Phi => 1,
            _ => 0,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.op)?;
        if !self.inputs.is_empty() {
            write!(f, " {:?}", self.inputs.as_slice())?;
        }
        write!(f, " : {}", self.ty)
    }
}
