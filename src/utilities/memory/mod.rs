//! Memory management utilities for the solver.
//!
//! Recycled ids, generation-checked slot storage for the constraint graph, and the shared-mutable
//! slice view used by parallel stages that write disjoint elements.

pub mod arena;
pub mod disjoint_slice;
pub mod id_pool;

pub use arena::{Arena, ArenaHandle};
pub use disjoint_slice::DisjointSlice;
pub use id_pool::IdPool;
