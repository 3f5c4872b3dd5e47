//! SuperWord-Level Parallelism (SLP) Loop Vectorization
//!
//! Rewrites the body of an unrolled counted loop so that groups of
//! isomorphic, independent scalar operations run as single SIMD operations.
//!
//! # Module Structure
//!
//! - `block`: loop body as one ordered block, memory slices
//! - `sw_pointer`: `base + offset + scale * iv + invar` address decomposition
//! - `dep_graph`: memory dependence graph and dependence iterators
//! - `node_info`: per-node alignment, depth, lane type and pack owner
//! - `pack`: packs, pack sets, element size statistics
//! - `reduction`: loop-carried reduction chains
//! - `cmove`: fusing compare/bool/select packs
//! - `packing`: pair seeding, extension and combination
//! - `filter`: implementation and profitability filtering
//! - `schedule`: scheduling packs as units, memory rethreading
//! - `output`: vector emission
//! - `unroll`: unroll factor hint for the loop optimizer
//! - `target`: capability oracle and cost model
//!
//! # Pipeline
//!
//! 1. **Seeding**: pair adjacent memory references that agree on alignment
//! 2. **Extension**: follow pairs through their operands and users
//! 3. **Combination**: chain pairs into packs of register width
//! 4. **Fusion**: merge compare, bool and select packs
//! 5. **Filtering**: drop packs without a vector form or not worth it
//! 6. **Emission**: schedule, rethread memory, build vector nodes
//!
//! Any failure leaves the loop exactly as it was.
//!
//! # Example
//!
//! ```text
//! Before (unrolled 4x):
//!   a[i+0] = b[i+0] + c
//!   a[i+1] = b[i+1] + c
//!   a[i+2] = b[i+2] + c
//!   a[i+3] = b[i+3] + c
//!
//! After:
//!   a[i:i+4] = b[i:i+4] + replicate(c)
//! ```

pub mod block;
pub mod cmove;
pub mod dep_graph;
pub mod error;
mod filter;
pub mod node_info;
mod output;
pub mod pack;
mod packing;
pub mod reduction;
mod schedule;
pub mod superword;
pub mod sw_pointer;
pub mod target;
pub mod trace;
mod unroll;

use crate::ir::graph::Graph;
use crate::ir::loops::CountedLoop;
use crate::opt::OptimizationPass;
use log::debug;

pub use error::{ErrorCategory, SlpError};
pub use node_info::Alignment;
pub use pack::{Lanes, OrderedPair, Pack, PackSet, VectorElementSizeStats};
pub use superword::{SlpOutcome, SuperWord};
pub use sw_pointer::{PointerCmp, SwPointer};
pub use target::{CostModel, OpCost, SimdLevel, SimdTarget, VectorTarget};
pub use trace::TraceFlags;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the SuperWord pass.
#[derive(Debug, Clone)]
pub struct SuperWordConfig {
    /// Target SIMD level.
    pub simd_level: SimdLevel,
    /// Largest unroll factor the hint may suggest.
    pub max_unroll: u32,
    /// Longest reduction chain followed from a phi.
    pub reduction_chain_limit: usize,
    /// Bodies larger than this are not analyzed.
    pub max_block_nodes: usize,
    /// Snapshot the graph before emission and restore it on failure.
    pub reserve_copy: bool,
    /// Fuse compare/bool/select packs into vector selects.
    pub enable_cmove: bool,
    /// Vectorize reduction chains.
    pub enable_reductions: bool,
    /// Hand the alignment anchor to the pre-loop.
    pub align_vector: bool,
    /// Diagnostic trace categories.
    pub trace: TraceFlags,
}

impl Default for SuperWordConfig {
    fn default() -> Self {
        Self {
            simd_level: SimdLevel::Avx2,
            max_unroll: 16,
            reduction_chain_limit: 16,
            max_block_nodes: 1000,
            reserve_copy: true,
            enable_cmove: true,
            enable_reductions: true,
            align_vector: true,
            trace: TraceFlags::empty(),
        }
    }
}

impl SuperWordConfig {
    /// Create configuration for SSE4.2 targets.
    pub fn sse42() -> Self {
        Self {
            simd_level: SimdLevel::Sse42,
            max_unroll: 8,
            ..Default::default()
        }
    }

    /// Create configuration for AVX2 targets.
    pub fn avx2() -> Self {
        Self {
            simd_level: SimdLevel::Avx2,
            ..Default::default()
        }
    }

    /// Create configuration for AVX-512 targets.
    pub fn avx512() -> Self {
        Self {
            simd_level: SimdLevel::Avx512,
            max_unroll: 64,
            ..Default::default()
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics accumulated over SuperWord runs.
#[derive(Debug, Clone, Default)]
pub struct SuperWordStats {
    /// Number of loops analyzed.
    pub loops_analyzed: usize,
    /// Number of loops successfully vectorized.
    pub loops_vectorized: usize,
    /// Loops rejected before any pack was formed.
    pub rejected_structural: usize,
    /// Loops whose packs were not worth emitting.
    pub rejected_unprofitable: usize,
    /// Loops rolled back during scheduling or emission.
    pub rejected_scheduling: usize,
    pub packs_emitted: usize,
    pub vector_nodes: usize,
    pub scalars_removed: usize,
    pub reductions: usize,
    pub cmoves_fused: usize,
}

impl SuperWordStats {
    /// Account for one `transform_loop` result.
    pub fn record(&mut self, result: &Result<SlpOutcome, SlpError>) {
        self.loops_analyzed += 1;
        match result {
            Ok(outcome) => {
                self.loops_vectorized += 1;
                self.packs_emitted += outcome.packs.len();
                self.vector_nodes += outcome.vector_nodes;
                self.scalars_removed += outcome.scalars_removed;
                self.reductions += outcome.reductions;
                self.cmoves_fused += outcome.fused_cmoves;
            }
            Err(err) => match err.category() {
                ErrorCategory::Structural => self.rejected_structural += 1,
                ErrorCategory::Profitability => self.rejected_unprofitable += 1,
                ErrorCategory::Scheduling => self.rejected_scheduling += 1,
            },
        }
    }

    /// Merge statistics from another instance.
    pub fn merge(&mut self, other: &SuperWordStats) {
        self.loops_analyzed += other.loops_analyzed;
        self.loops_vectorized += other.loops_vectorized;
        self.rejected_structural += other.rejected_structural;
        self.rejected_unprofitable += other.rejected_unprofitable;
        self.rejected_scheduling += other.rejected_scheduling;
        self.packs_emitted += other.packs_emitted;
        self.vector_nodes += other.vector_nodes;
        self.scalars_removed += other.scalars_removed;
        self.reductions += other.reductions;
        self.cmoves_fused += other.cmoves_fused;
    }

    /// Get the vectorization success rate.
    pub fn success_rate(&self) -> f32 {
        if self.loops_analyzed == 0 {
            0.0
        } else {
            self.loops_vectorized as f32 / self.loops_analyzed as f32
        }
    }
}

// =============================================================================
// Main Pass
// =============================================================================

/// SuperWord optimization pass over the counted loops registered with it.
///
/// Loop discovery belongs to the host's loop tree; callers register each
/// innermost main loop and read the updated descriptors back afterwards.
pub struct SuperWordPass {
    config: SuperWordConfig,
    target: SimdTarget,
    cost: CostModel,
    loops: Vec<CountedLoop>,
    stats: SuperWordStats,
}

impl SuperWordPass {
    /// Create the pass with default configuration.
    pub fn new() -> Self {
        Self::with_config(SuperWordConfig::default())
    }

    /// Create the pass with custom configuration.
    pub fn with_config(config: SuperWordConfig) -> Self {
        Self {
            target: SimdTarget::new(config.simd_level),
            cost: CostModel::new(config.simd_level),
            config,
            loops: Vec::new(),
            stats: SuperWordStats::default(),
        }
    }

    pub fn config(&self) -> &SuperWordConfig {
        &self.config
    }

    /// Queue `lp` for the next run.
    pub fn register_loop(&mut self, lp: CountedLoop) {
        self.loops.push(lp);
    }

    /// Registered loops with their updated descriptors.
    pub fn take_loops(&mut self) -> Vec<CountedLoop> {
        std::mem::take(&mut self.loops)
    }

    /// Get accumulated statistics.
    pub fn stats(&self) -> &SuperWordStats {
        &self.stats
    }

    /// Get number of loops vectorized.
    pub fn loops_vectorized(&self) -> usize {
        self.stats.loops_vectorized
    }
}

impl Default for SuperWordPass {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for SuperWordPass {
    fn name(&self) -> &'static str {
        "superword"
    }

    fn run(&mut self, graph: &mut Graph) -> bool {
        let mut sw = SuperWord::new(self.config.clone(), &self.target, self.cost);
        let mut changed = false;
        for lp in &mut self.loops {
            let result = sw.transform_loop(graph, lp);
            changed |= result.is_ok();
            self.stats.record(&result);
        }
        debug!(
            "superword: {}/{} loops vectorized",
            self.stats.loops_vectorized, self.stats.loops_analyzed
        );
        changed
    }
}

// =============================================================================
// Tests
// =============================================================================
