#[cfg(feature = "profile")]
use std::collections::HashMap;
#[cfg(feature = "profile")]
use std::time::Instant;

/// Solver statistics from the last step. Always collected; they are plain counters bumped outside hot loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverCounters {
    /// Islands in the constraint graph.
    pub islands: usize,
    /// Rule islands solved with level/color buckets.
    pub colored_islands: usize,
    /// Rule islands that fell back to a serial solve because they were too small to color.
    pub serial_fallback_islands: usize,
    /// Largest color count of any rule island.
    pub max_colors: u32,
    /// Deepest level in the graph.
    pub max_level: u32,
    /// Constraints gathered into solver scratch.
    pub constraints_gathered: usize,
    /// Constraints skipped at gather because they were disabled or referenced invalid particles.
    pub constraints_skipped: usize,
    /// Edges not added to the graph because every particle they link is kinematic.
    pub kinematic_only_constraints: usize,
    /// Rule islands whose constraints were colored and sorted this step.
    pub constraint_sorts: usize,
    /// Whether the graph topology changed this step.
    pub topology_changed: bool,
    /// Whether any constraint asked for more iterations on the last pass.
    pub needs_more_iterations: bool,
}

/// Stores profiling information for the previous step.
///
/// Stage timing is only active when the `profile` feature is enabled; otherwise the timing methods are
/// no-ops. Counters are always available.
#[derive(Debug, Default)]
pub struct SimulationProfiler {
    #[cfg(feature = "profile")]
    stages: HashMap<&'static str, f64>,
    #[cfg(feature = "profile")]
    start_timestamps: HashMap<&'static str, Instant>,
    pub counters: SolverCounters,
}

impl SimulationProfiler {
    pub fn new(_initial_stage_count: usize) -> Self {
        Self {
            #[cfg(feature = "profile")]
            stages: HashMap::with_capacity(_initial_stage_count),
            #[cfg(feature = "profile")]
            start_timestamps: HashMap::with_capacity(_initial_stage_count),
            counters: SolverCounters::default(),
        }
    }

    /// Gets the time in seconds the given stage took during the last step, or -1 if it did not run.
    pub fn get(&self, _stage: &'static str) -> f64 {
        #[cfg(feature = "profile")]
        {
            if let Some(&time) = self.stages.get(_stage) {
                return time;
            }
        }
        -1.0
    }

    pub fn start(&mut self, _stage: &'static str) {
        #[cfg(feature = "profile")]
        {
            debug_assert!(
                !self.start_timestamps.contains_key(_stage),
                "Cannot start a stage that has already been started."
            );
            self.start_timestamps.insert(_stage, Instant::now());
        }
    }

    /// Ends timing a stage and accumulates the elapsed time.
    pub fn end(&mut self, _stage: &'static str) {
        #[cfg(feature = "profile")]
        {
            let end_time = Instant::now();
            let Some(start_time) = self.start_timestamps.remove(_stage) else {
                debug_assert!(false, "Stage {_stage} was ended without being started.");
                return;
            };
            let elapsed = end_time.duration_since(start_time).as_secs_f64();
            *self.stages.entry(_stage).or_insert(0.0) += elapsed;
        }
    }

    /// Clears stage times and counters before a new step.
    pub fn clear(&mut self) {
        #[cfg(feature = "profile")]
        {
            debug_assert!(
                self.start_timestamps.is_empty(),
                "It's likely that some stage was left unended from the previous step."
            );
            self.stages.clear();
        }
        self.counters = SolverCounters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_resets_counters() {
        let mut profiler = SimulationProfiler::new(4);
        profiler.counters.islands = 3;
        profiler.start("stage");
        profiler.end("stage");
        profiler.clear();
        assert_eq!(profiler.counters, SolverCounters::default());
        assert_eq!(profiler.get("missing"), -1.0);
    }

    #[cfg(feature = "profile")]
    #[test]
    fn ended_stage_reports_time() {
        let mut profiler = SimulationProfiler::new(1);
        profiler.start("stage");
        profiler.end("stage");
        assert!(profiler.get("stage") >= 0.0);
    }
}
