//! Diagnostic tracing for the SuperWord pass.
//!
//! Output goes through the `log` facade at `trace` level, gated per category
//! by [`TraceFlags`]. Recursive matchers thread a [`Tracer`] that carries the
//! current nesting depth, so nested output is indented without any shared
//! mutable counter.

use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use log::trace;

bitflags::bitflags! {
    /// Trace categories.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TraceFlags: u16 {
        /// Phase boundaries and the final verdict.
        const PHASES = 0b0000_0001;
        /// Address decomposition steps.
        const POINTER = 0b0000_0010;
        /// Alignment anchor selection and pair seeding.
        const ADJACENT = 0b0000_0100;
        /// Pack set after each phase.
        const PACKSET = 0b0000_1000;
        /// Dependence graph edges.
        const DEPENDENCE = 0b0001_0000;
        /// Nodes created during emission.
        const NEW_VECTORS = 0b0010_0000;
        /// Reduction chain discovery.
        const REDUCTIONS = 0b0100_0000;
        /// Unroll analysis.
        const UNROLL = 0b1000_0000;
    }
}

/// Depth-counted tracer for recursive walks.
#[derive(Debug, Clone, Copy)]
pub struct Tracer {
    enabled: bool,
    depth: usize,
}

impl Tracer {
    pub fn new(enabled: bool) -> Self {
        Tracer { enabled, depth: 0 }
    }

    /// A tracer that never prints.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Print `what` for `node` at the current depth, then nest one level.
    pub fn enter(&mut self, graph: &Graph, what: &str, node: NodeId) {
        if self.enabled {
            trace!(
                "{:indent$}{} {:?} {}",
                "",
                what,
                node,
                graph.op(node),
                indent = self.depth * 2
            );
        }
        self.depth += 1;
    }

    /// Leave one level, printing the matcher's verdict.
    pub fn leave(&mut self, what: &str, matched: bool) -> bool {
        self.depth = self.depth.saturating_sub(1);
        if self.enabled {
            trace!(
                "{:indent$}{} -> {}",
                "",
                what,
                if matched { "match" } else { "fail" },
                indent = self.depth * 2
            );
        }
        matched
    }

    /// Free-form line at the current depth.
    pub fn note(&self, msg: std::fmt::Arguments<'_>) {
        if self.enabled {
            trace!("{:indent$}{}", "", msg, indent = self.depth * 2);
        }
    }
}
