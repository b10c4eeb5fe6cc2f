//! Position-based dynamics solver core.
//!
//! Particles are predicted from forces, corrected by constraint rules and collisions over a fixed number of
//! iterations, then reconciled back into positions and velocities. Rules can dispatch serially, per island,
//! or per island by level and color so that independent constraints run on worker threads.

pub mod physics;
pub mod utilities;

pub use physics::*;
pub use utilities::thread_dispatcher::{IThreadDispatcher, ThreadDispatcher};
