//! SuperWord-level parallelism for the Prism JIT.
//!
//! Rewrites unrolled counted-loop bodies so that groups of isomorphic,
//! independent scalar operations execute as single SIMD operations:
//! - Sea-of-Nodes loop IR (`ir`)
//! - SLP packing, scheduling and vector emission (`opt::superword`)
#![deny(unsafe_op_in_unsafe_fn)]
pub mod ir;
pub mod opt;
