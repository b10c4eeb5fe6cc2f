use crate::physics::error::EvolutionError;

/// How a constraint rule schedules its constraints.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DispatchMode {
    /// No graph: every constraint of the rule is solved serially in index order.
    Simple,
    /// Per-island serial solve in enumeration order. Islands run independently and may run in parallel.
    IslandSerial,
    /// Levels ascending, colors within a level solved by a lock-free parallel-for.
    /// Small islands fall back to island-serial.
    LevelColor,
}

/// Describes how the evolution schedules iterations and dispatches constraints.
///
/// Passed at construction and swapped wholesale through `Evolution::set_config`; there is no process-wide state.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    /// Number of constraint iterations per step. Always run in full.
    pub num_iterations: u32,
    /// Number of push-out passes (phase 2) run after the iteration loop.
    pub num_push_out_iterations: u32,
    /// Builds the constraint graph and solves islands independently. When false, rules use `DispatchMode::Simple`.
    pub use_islands: bool,
    /// Orders constraints by propagation depth from kinematic anchors.
    pub use_levels: bool,
    /// Colors constraints so same-colored constraints can be solved in parallel.
    pub use_colors: bool,
    /// Islands with fewer dynamic particles than this skip coloring and are solved serially.
    pub min_particles_for_coloring: usize,
    /// Low-pass factor applied to incoming time steps. `None` uses each dt as given.
    pub dt_smoothing: Option<f32>,
    /// Applies friction to velocities after reconciliation instead of during the collision projection.
    pub use_legacy_friction: bool,
    /// Smallest number of items worth splitting across workers.
    pub min_parallel_batch_size: usize,
}

impl SolverConfig {
    /// Default number of dynamic particles an island needs before coloring pays for itself.
    pub const DEFAULT_MIN_PARTICLES_FOR_COLORING: usize = 64;
    /// Default number of constraint iterations per step.
    pub const DEFAULT_ITERATION_COUNT: u32 = 8;

    /// Creates a configuration with the given iteration count and defaults for everything else.
    pub fn new(num_iterations: u32) -> Self {
        Self {
            num_iterations,
            ..Self::default()
        }
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), EvolutionError> {
        if self.num_iterations == 0 {
            return Err(EvolutionError::InvalidIterationCount(self.num_iterations));
        }
        if let Some(factor) = self.dt_smoothing {
            if !(factor > 0.0 && factor <= 1.0) {
                return Err(EvolutionError::InvalidSmoothingFactor(factor));
            }
        }
        if self.min_parallel_batch_size == 0 {
            return Err(EvolutionError::InvalidBatchSize);
        }
        Ok(())
    }

    /// Gets the dispatch strategy rules should use under this configuration.
    pub fn dispatch_mode(&self) -> DispatchMode {
        if !self.use_islands {
            DispatchMode::Simple
        } else if self.use_levels || self.use_colors {
            DispatchMode::LevelColor
        } else {
            DispatchMode::IslandSerial
        }
    }

    pub fn with_iterations(mut self, num_iterations: u32) -> Self {
        self.num_iterations = num_iterations;
        self
    }

    pub fn with_push_out_iterations(mut self, num_push_out_iterations: u32) -> Self {
        self.num_push_out_iterations = num_push_out_iterations;
        self
    }

    pub fn with_islands(mut self, use_islands: bool) -> Self {
        self.use_islands = use_islands;
        self
    }

    pub fn with_levels(mut self, use_levels: bool) -> Self {
        self.use_levels = use_levels;
        self
    }

    pub fn with_colors(mut self, use_colors: bool) -> Self {
        self.use_colors = use_colors;
        self
    }

    pub fn with_min_particles_for_coloring(mut self, min_particles_for_coloring: usize) -> Self {
        self.min_particles_for_coloring = min_particles_for_coloring;
        self
    }

    pub fn with_dt_smoothing(mut self, dt_smoothing: Option<f32>) -> Self {
        self.dt_smoothing = dt_smoothing;
        self
    }

    pub fn with_legacy_friction(mut self, use_legacy_friction: bool) -> Self {
        self.use_legacy_friction = use_legacy_friction;
        self
    }

    pub fn with_min_parallel_batch_size(mut self, min_parallel_batch_size: usize) -> Self {
        self.min_parallel_batch_size = min_parallel_batch_size;
        self
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            num_iterations: Self::DEFAULT_ITERATION_COUNT,
            num_push_out_iterations: 1,
            use_islands: true,
            use_levels: true,
            use_colors: true,
            min_particles_for_coloring: Self::DEFAULT_MIN_PARTICLES_FOR_COLORING,
            dt_smoothing: None,
            use_legacy_friction: false,
            min_parallel_batch_size: 64,
        }
    }
}
