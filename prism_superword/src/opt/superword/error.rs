//! Failure statuses for one SuperWord invocation.
//!
//! None of these abort the surrounding compilation: the loop is left scalar
//! and the caller moves on.

use crate::ir::node::NodeId;
use thiserror::Error;

/// Why a loop was left scalar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlpError {
    #[error("loop descriptor does not describe a counted loop")]
    NotCountedLoop,

    #[error("unsupported control node {node:?} in loop body")]
    UnsupportedControl { node: NodeId },

    #[error("loop body has {nodes} nodes, limit is {limit}")]
    BlockTooLarge { nodes: usize, limit: usize },

    #[error("loop body has no memory operations to anchor packs")]
    NoMemoryOps,

    #[error("no adjacent memory references could be paired")]
    NoPacks,

    #[error("no pack survived the implementation and profitability filters")]
    NoProfitablePacks,

    #[error("packs cannot be scheduled consecutively around {node:?}")]
    ScheduleConflict { node: NodeId },

    #[error("no vector form for pack headed by {node:?}")]
    Unimplemented { node: NodeId },
}

/// Coarse classification of [`SlpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rejected before any graph mutation.
    Structural,
    /// Correct packs that were not worth emitting.
    Profitability,
    /// Late inconsistency; the graph is rolled back.
    Scheduling,
}

impl SlpError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SlpError::NotCountedLoop
            | SlpError::UnsupportedControl { .. }
            | SlpError::BlockTooLarge { .. }
            | SlpError::NoMemoryOps => ErrorCategory::Structural,
            SlpError::NoPacks | SlpError::NoProfitablePacks => ErrorCategory::Profitability,
            SlpError::ScheduleConflict { .. } | SlpError::Unimplemented { .. } => {
                ErrorCategory::Scheduling
            }
        }
    }
}
