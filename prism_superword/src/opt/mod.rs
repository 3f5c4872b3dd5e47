//! Optimization passes.

pub mod superword;

use crate::ir::graph::Graph;

/// A graph-to-graph transformation.
pub trait OptimizationPass {
    /// Stable pass name for logs and pipelines.
    fn name(&self) -> &'static str;

    /// Run over `graph`; returns whether anything changed.
    fn run(&mut self, graph: &mut Graph) -> bool;
}
