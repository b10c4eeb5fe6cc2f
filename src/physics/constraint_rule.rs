use crate::physics::constraint_coloring::{color_edges, BucketEntry, IslandBuckets};
use crate::physics::constraint_graph::ConstraintGraph;
use crate::physics::constraints::{IConstraintContainer, SolverSlot};
use crate::physics::handles::{ConstraintId, GraphEdgeHandle};
use crate::physics::particles::{ParticleStore, ParticleView};
use crate::physics::simulation_profiler::SolverCounters;
use crate::physics::solver_config::{DispatchMode, SolverConfig};
use crate::utilities::collections::IndexSet;
use crate::utilities::memory::DisjointSlice;
use crate::utilities::thread_dispatcher::{parallel_for, IThreadDispatcher};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Islands are coarse work units; a handful is enough to be worth spreading over workers.
const MIN_PARALLEL_ISLANDS: usize = 2;

/// Type-erased face of a [`ConstraintRule`], as stored by the evolution.
///
/// Every rule owns exactly one container and is driven through the same per-step sequence:
/// `init`, `add_to_graph`, `prepare`, `gather_solver_input`, then `apply_constraints` once per iteration,
/// `apply_push_out` once per push-out pass and finally `scatter_solver_output`.
pub trait IConstraintRule: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Id of the rule's container in the constraint graph.
    fn container_id(&self) -> u32;

    fn num_constraints(&self) -> usize;

    /// Dispatch the rule uses under `config`.
    fn dispatch_mode(&self, config: &SolverConfig) -> DispatchMode;

    /// Forces a dispatch mode for this rule. `None` follows the configuration.
    fn set_dispatch_mode(&mut self, mode: Option<DispatchMode>);

    /// Per-step container initialization.
    fn init(&mut self, particles: &ParticleStore, dt: f32, num_iterations: u32);

    /// Re-adds the rule's constraints to the graph. Rules dispatching without islands add nothing.
    ///
    /// Disabled constraints and constraints referencing invalid particles stay out of the graph and are
    /// counted as skipped here, since they never reach an island to be gathered.
    fn add_to_graph(
        &self,
        graph: &mut ConstraintGraph,
        particles: &ParticleStore,
        config: &SolverConfig,
        counters: &mut SolverCounters,
    );

    /// Rebuilds the rule's island schedule if the graph topology or the configuration changed since last time.
    fn prepare(
        &mut self,
        graph: &mut ConstraintGraph,
        particles: &ParticleStore,
        config: &SolverConfig,
        counters: &mut SolverCounters,
    );

    /// Fills every island's solver scratch from particle state.
    fn gather_solver_input(
        &mut self,
        particles: &ParticleStore,
        dt: f32,
        dispatcher: Option<&dyn IThreadDispatcher>,
        counters: &mut SolverCounters,
    );

    /// Runs phase 1 over every constraint. Returns whether any constraint asked for more iterations.
    fn apply_constraints(
        &mut self,
        particles: &ParticleView<'_>,
        dt: f32,
        iteration: u32,
        num_iterations: u32,
        dispatcher: Option<&dyn IThreadDispatcher>,
        min_batch_size: usize,
    ) -> bool;

    /// Runs phase 2 over every constraint.
    fn apply_push_out(
        &mut self,
        particles: &ParticleView<'_>,
        dt: f32,
        iteration: u32,
        num_iterations: u32,
        dispatcher: Option<&dyn IThreadDispatcher>,
        min_batch_size: usize,
    ) -> bool;

    fn scatter_solver_output(&mut self, dt: f32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IslandStrategy {
    /// One work unit walks every bucket in order.
    Serial,
    /// Levels in order; each color bucket is split across workers.
    Colored,
}

#[derive(Debug, Clone)]
struct RuleIsland<S> {
    buckets: IslandBuckets,
    strategy: IslandStrategy,
    /// Too small to color although colors are enabled.
    fell_back: bool,
    solver_data: Vec<SolverSlot<S>>,
}

impl<S> RuleIsland<S> {
    fn new(buckets: IslandBuckets, strategy: IslandStrategy, fell_back: bool) -> Self {
        Self {
            buckets,
            strategy,
            fell_back,
            solver_data: Vec::new(),
        }
    }
}

/// Everything the schedule depends on. The schedule is rebuilt only when this changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduleKey {
    mode: DispatchMode,
    topology_version: u64,
    num_constraints: usize,
    use_levels: bool,
    use_colors: bool,
    min_particles_for_coloring: usize,
}

/// Drives one constraint container through the step, scheduling its constraints by island, level and color.
pub struct ConstraintRule<C: IConstraintContainer> {
    container: C,
    container_id: u32,
    mode_override: Option<DispatchMode>,
    islands: Vec<RuleIsland<C::SolverConstraint>>,
    serial_islands: Vec<usize>,
    schedule_key: Option<ScheduleKey>,
    color_sets: Vec<IndexSet>,
}

impl<C: IConstraintContainer> ConstraintRule<C> {
    pub fn new(container: C, container_id: u32) -> Self {
        Self {
            container,
            container_id,
            mode_override: None,
            islands: Vec::new(),
            serial_islands: Vec::new(),
            schedule_key: None,
            color_sets: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn container(&self) -> &C {
        &self.container
    }

    /// Gets the container for editing. Added or removed constraints are picked up on the next step.
    #[inline(always)]
    pub fn container_mut(&mut self) -> &mut C {
        self.schedule_key = None;
        &mut self.container
    }

    /// Number of islands in the current schedule that contain constraints of this rule.
    pub fn island_count(&self) -> usize {
        self.islands.len()
    }

    /// Largest color count across the rule's islands.
    pub fn max_colors(&self) -> u32 {
        self.islands
            .iter()
            .filter(|island| island.strategy == IslandStrategy::Colored)
            .map(|island| island.buckets.num_colors)
            .max()
            .unwrap_or(0)
    }

    /// Dispatch order of the constraints in each island, bucket by bucket.
    pub fn island_constraint_order(&self) -> impl Iterator<Item = &[u32]> {
        self.islands
            .iter()
            .map(|island| island.buckets.constraints.as_slice())
    }

    fn constraint_id(&self, constraint_index: u32) -> ConstraintId {
        ConstraintId {
            container_id: self.container_id,
            constraint_index,
        }
    }

    fn rebuild_schedule(
        &mut self,
        graph: &mut ConstraintGraph,
        particles: &ParticleStore,
        config: &SolverConfig,
        mode: DispatchMode,
        counters: &mut SolverCounters,
    ) {
        self.islands.clear();
        let num_constraints = self.container.num_constraints() as u32;
        match mode {
            DispatchMode::Simple => {
                self.islands.push(RuleIsland::new(
                    IslandBuckets::serial((0..num_constraints).collect()),
                    IslandStrategy::Serial,
                    false,
                ));
            }
            DispatchMode::IslandSerial | DispatchMode::LevelColor => {
                let container_id = self.container_id;
                let island_edges: Vec<(usize, u32, Vec<GraphEdgeHandle>)> = graph
                    .islands()
                    .iter()
                    .map(|island| {
                        let edges: Vec<GraphEdgeHandle> = island
                            .edges
                            .iter()
                            .copied()
                            .filter(|&handle| {
                                graph
                                    .edge(handle)
                                    .is_some_and(|edge| edge.id.container_id == container_id)
                            })
                            .collect();
                        (island.num_particles(), island.max_level, edges)
                    })
                    .filter(|(_, _, edges)| !edges.is_empty())
                    .collect();

                for (num_particles, max_level, edges) in island_edges {
                    let island = if mode == DispatchMode::IslandSerial {
                        clear_colors(graph, &edges);
                        let constraints = edges
                            .iter()
                            .filter_map(|&handle| graph.edge(handle))
                            .map(|edge| edge.id.constraint_index)
                            .collect();
                        RuleIsland::new(
                            IslandBuckets::serial(constraints),
                            IslandStrategy::Serial,
                            false,
                        )
                    } else {
                        let colorable = config.use_colors
                            && num_particles >= config.min_particles_for_coloring;
                        let num_colors = if colorable {
                            color_edges(graph, &edges, particles.len(), &mut self.color_sets)
                        } else {
                            clear_colors(graph, &edges);
                            1
                        };
                        let entries: Vec<BucketEntry> = edges
                            .iter()
                            .filter_map(|&handle| graph.edge(handle))
                            .map(|edge| BucketEntry {
                                constraint_index: edge.id.constraint_index,
                                level: edge.level,
                                color: if colorable { edge.color.unwrap_or(0) } else { 0 },
                            })
                            .collect();
                        counters.constraint_sorts += 1;
                        RuleIsland::new(
                            IslandBuckets::sort(&entries, max_level + 1, num_colors),
                            if colorable {
                                IslandStrategy::Colored
                            } else {
                                IslandStrategy::Serial
                            },
                            config.use_colors && !colorable,
                        )
                    };
                    self.islands.push(island);
                }
            }
        }
        self.serial_islands = self
            .islands
            .iter()
            .enumerate()
            .filter(|(_, island)| island.strategy == IslandStrategy::Serial)
            .map(|(index, _)| index)
            .collect();
    }

    /// Runs `apply_range` over every slot: serial islands in parallel with one another, then each colored
    /// island level by level with its color buckets split across workers.
    fn dispatch<F>(
        &mut self,
        dispatcher: Option<&dyn IThreadDispatcher>,
        min_batch_size: usize,
        apply_range: F,
    ) -> bool
    where
        F: Fn(&C, &mut [SolverSlot<C::SolverConstraint>]) -> bool + Sync,
    {
        let needs_more = AtomicBool::new(false);
        let Self {
            container,
            islands,
            serial_islands,
            ..
        } = self;
        let container = &*container;

        {
            let shared_islands = DisjointSlice::new(islands.as_mut_slice());
            parallel_for(
                dispatcher,
                serial_islands.len(),
                MIN_PARALLEL_ISLANDS,
                &|range| {
                    let mut local_needs_more = false;
                    for &island_index in &serial_islands[range] {
                        // SAFETY: each island index appears once in the serial list and jobs never overlap.
                        let island = unsafe { shared_islands.get_mut(island_index) };
                        local_needs_more |= apply_range(container, &mut island.solver_data);
                    }
                    if local_needs_more {
                        needs_more.store(true, Ordering::Relaxed);
                    }
                },
            );
        }

        for island in islands
            .iter_mut()
            .filter(|island| island.strategy == IslandStrategy::Colored)
        {
            let RuleIsland {
                buckets,
                solver_data,
                ..
            } = island;
            let slots = DisjointSlice::new(solver_data.as_mut_slice());
            for level in 0..buckets.num_levels {
                for color in 0..buckets.num_colors {
                    let bucket = buckets.bucket(level, color);
                    parallel_for(dispatcher, bucket.len(), min_batch_size, &|range| {
                        // SAFETY: jobs are disjoint sub-ranges of the bucket, and constraints sharing a color
                        // share no dynamic particle.
                        let slice = unsafe {
                            slots.slice_mut(bucket.start + range.start..bucket.start + range.end)
                        };
                        if apply_range(container, slice) {
                            needs_more.store(true, Ordering::Relaxed);
                        }
                    });
                }
            }
        }
        needs_more.into_inner()
    }
}

/// Drops colors left over from an earlier colored schedule.
fn clear_colors(graph: &mut ConstraintGraph, edges: &[GraphEdgeHandle]) {
    for &handle in edges {
        graph.set_edge_color(handle, None);
    }
}

impl<C: IConstraintContainer> IConstraintRule for ConstraintRule<C> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    #[inline(always)]
    fn container_id(&self) -> u32 {
        self.container_id
    }

    #[inline(always)]
    fn num_constraints(&self) -> usize {
        self.container.num_constraints()
    }

    fn dispatch_mode(&self, config: &SolverConfig) -> DispatchMode {
        if !config.use_islands {
            return DispatchMode::Simple;
        }
        self.mode_override.unwrap_or_else(|| config.dispatch_mode())
    }

    fn set_dispatch_mode(&mut self, mode: Option<DispatchMode>) {
        self.mode_override = mode;
        self.schedule_key = None;
    }

    fn init(&mut self, particles: &ParticleStore, dt: f32, num_iterations: u32) {
        self.container.init(particles, dt);
        self.container
            .update_position_based_state(particles, dt, num_iterations);
    }

    fn add_to_graph(
        &self,
        graph: &mut ConstraintGraph,
        particles: &ParticleStore,
        config: &SolverConfig,
        counters: &mut SolverCounters,
    ) {
        if self.dispatch_mode(config) == DispatchMode::Simple {
            return;
        }
        for constraint_index in 0..self.container.num_constraints() as u32 {
            let linked = self.container.constraint_particles(constraint_index);
            if !self.container.is_enabled(constraint_index)
                || !linked.iter().all(|&particle| particles.is_valid(particle))
            {
                counters.constraints_skipped += 1;
                continue;
            }
            graph.add_edge(
                self.constraint_id(constraint_index),
                linked,
                linked.map(|particle| particles.is_kinematic(particle)),
            );
        }
    }

    fn prepare(
        &mut self,
        graph: &mut ConstraintGraph,
        particles: &ParticleStore,
        config: &SolverConfig,
        counters: &mut SolverCounters,
    ) {
        let mode = self.dispatch_mode(config);
        let key = ScheduleKey {
            mode,
            topology_version: if mode == DispatchMode::Simple {
                0
            } else {
                graph.topology_version()
            },
            num_constraints: self.container.num_constraints(),
            use_levels: config.use_levels,
            use_colors: config.use_colors,
            min_particles_for_coloring: config.min_particles_for_coloring,
        };
        if self.schedule_key != Some(key) {
            self.rebuild_schedule(graph, particles, config, mode, counters);
            self.schedule_key = Some(key);
            debug!(
                container_id = self.container_id,
                ?mode,
                islands = self.islands.len(),
                colored = self.islands.len() - self.serial_islands.len(),
                max_colors = self.max_colors(),
                "rebuilt constraint schedule"
            );
        }
        for island in &self.islands {
            match island.strategy {
                IslandStrategy::Colored => {
                    counters.colored_islands += 1;
                    counters.max_colors = counters.max_colors.max(island.buckets.num_colors);
                }
                IslandStrategy::Serial if island.fell_back => {
                    counters.serial_fallback_islands += 1;
                }
                IslandStrategy::Serial => {}
            }
        }
    }

    fn gather_solver_input(
        &mut self,
        particles: &ParticleStore,
        dt: f32,
        dispatcher: Option<&dyn IThreadDispatcher>,
        counters: &mut SolverCounters,
    ) {
        let container = &self.container;
        let islands = DisjointSlice::new(self.islands.as_mut_slice());
        parallel_for(dispatcher, islands.len(), MIN_PARALLEL_ISLANDS, &|range| {
            for island_index in range {
                // SAFETY: jobs never overlap, so each island is gathered by one worker.
                let island = unsafe { islands.get_mut(island_index) };
                container.set_num_island_constraints(
                    island.buckets.constraints.len(),
                    &mut island.solver_data,
                );
                container.gather_input_range(
                    particles,
                    dt,
                    &island.buckets.constraints,
                    &mut island.solver_data,
                );
            }
        });
        for island in &self.islands {
            let active = island.solver_data.iter().filter(|slot| slot.active).count();
            counters.constraints_gathered += active;
            counters.constraints_skipped += island.solver_data.len() - active;
        }
    }

    fn apply_constraints(
        &mut self,
        particles: &ParticleView<'_>,
        dt: f32,
        iteration: u32,
        num_iterations: u32,
        dispatcher: Option<&dyn IThreadDispatcher>,
        min_batch_size: usize,
    ) -> bool {
        self.dispatch(dispatcher, min_batch_size, |container, slots| {
            container.apply_phase1_range(particles, dt, iteration, num_iterations, slots)
        })
    }

    fn apply_push_out(
        &mut self,
        particles: &ParticleView<'_>,
        dt: f32,
        iteration: u32,
        num_iterations: u32,
        dispatcher: Option<&dyn IThreadDispatcher>,
        min_batch_size: usize,
    ) -> bool {
        self.dispatch(dispatcher, min_batch_size, |container, slots| {
            container.apply_phase2_range(particles, dt, iteration, num_iterations, slots)
        })
    }

    fn scatter_solver_output(&mut self, dt: f32) {
        let Self {
            container, islands, ..
        } = self;
        for island in islands.iter() {
            container.scatter_output_range(dt, &island.solver_data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::constraints::SpringConstraints;
    use glam::Vec3;

    /// Star of `leaves` dynamic particles around dynamic particle 0, plus a kinematic anchor on the hub.
    fn star(leaves: u32) -> (ParticleStore, SpringConstraints) {
        let mut particles = ParticleStore::default();
        particles.add_particles(leaves + 2, 0);
        let anchor = leaves + 1;
        particles.set_kinematic(anchor);
        let mut springs = SpringConstraints::new();
        for leaf in 1..=leaves {
            particles.set_position(leaf, Vec3::new(leaf as f32, 0.0, 0.0));
            springs.add_constraint([0, leaf], 1.0, 1.0);
        }
        springs.add_constraint([anchor, 0], 1.0, 1.0);
        (particles, springs)
    }

    fn prepared(
        config: &SolverConfig,
        particles: &ParticleStore,
        springs: SpringConstraints,
    ) -> (ConstraintRule<SpringConstraints>, ConstraintGraph, SolverCounters) {
        let mut graph = ConstraintGraph::new();
        let mut rule = ConstraintRule::new(springs, graph.register_container());
        let mut counters = SolverCounters::default();
        rule.init(particles, 0.01, config.num_iterations);
        graph.begin_build(particles.len());
        rule.add_to_graph(&mut graph, particles, config, &mut counters);
        graph.end_build(config.use_levels);
        rule.prepare(&mut graph, particles, config, &mut counters);
        (rule, graph, counters)
    }

    #[test]
    fn simple_mode_keeps_index_order() {
        let (particles, springs) = star(3);
        let config = SolverConfig::default().with_islands(false);
        let (rule, graph, _) = prepared(&config, &particles, springs);
        assert_eq!(graph.edge_count(), 0);
        let order: Vec<&[u32]> = rule.island_constraint_order().collect();
        assert_eq!(order, vec![&[0, 1, 2, 3][..]]);
    }

    #[test]
    fn small_islands_fall_back_to_serial() {
        let (particles, springs) = star(3);
        let config = SolverConfig::default();
        let (rule, _, counters) = prepared(&config, &particles, springs);
        assert_eq!(counters.serial_fallback_islands, 1);
        assert_eq!(counters.colored_islands, 0);
        // Levels still order the serial walk: the anchored edge first.
        let order: Vec<&[u32]> = rule.island_constraint_order().collect();
        assert_eq!(order[0][0], 3);
    }

    #[test]
    fn colored_island_puts_each_hub_edge_in_its_own_color() {
        let (particles, springs) = star(4);
        let config = SolverConfig::default().with_min_particles_for_coloring(1);
        let (rule, graph, counters) = prepared(&config, &particles, springs);
        assert_eq!(counters.colored_islands, 1);
        // Every edge shares the hub, so every edge needs its own color.
        assert_eq!(rule.max_colors(), 5);
        let colors: Vec<Option<u32>> = (0..5)
            .map(|i| {
                graph
                    .edge_for(ConstraintId {
                        container_id: 0,
                        constraint_index: i,
                    })
                    .and_then(|edge| edge.color)
            })
            .collect();
        assert!(colors.iter().all(Option::is_some));
    }

    #[test]
    fn unchanged_topology_skips_resorting() {
        let (particles, springs) = star(4);
        let config = SolverConfig::default().with_min_particles_for_coloring(1);
        let (mut rule, mut graph, first) = prepared(&config, &particles, springs);
        assert_eq!(first.constraint_sorts, 1);
        let order_before: Vec<Vec<u32>> =
            rule.island_constraint_order().map(<[u32]>::to_vec).collect();
        let mut counters = SolverCounters::default();
        graph.begin_build(particles.len());
        rule.add_to_graph(&mut graph, &particles, &config, &mut counters);
        graph.end_build(config.use_levels);
        rule.prepare(&mut graph, &particles, &config, &mut counters);
        assert_eq!(counters.constraint_sorts, 0);
        let order_after: Vec<Vec<u32>> =
            rule.island_constraint_order().map(<[u32]>::to_vec).collect();
        assert_eq!(order_before, order_after);
    }

    #[test]
    fn gather_skips_disabled_constraints() {
        for config in [
            SolverConfig::default().with_islands(false),
            SolverConfig::default(),
            SolverConfig::default().with_min_particles_for_coloring(1),
        ] {
            let (particles, mut springs) = star(3);
            springs.set_enabled(1, false);
            let (mut rule, _, mut counters) = prepared(&config, &particles, springs);
            rule.gather_solver_input(&particles, 0.01, None, &mut counters);
            assert_eq!(counters.constraints_gathered, 3, "{:?}", config.dispatch_mode());
            assert_eq!(counters.constraints_skipped, 1, "{:?}", config.dispatch_mode());
        }
    }

    #[test]
    fn constraints_on_inactive_particles_count_as_skipped() {
        let (mut particles, springs) = star(3);
        particles.activate_particle_range(0, false);
        let config = SolverConfig::default();
        let (mut rule, graph, mut counters) = prepared(&config, &particles, springs);
        rule.gather_solver_input(&particles, 0.01, None, &mut counters);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(counters.constraints_gathered, 0);
        assert_eq!(counters.constraints_skipped, 4);
    }

    #[test]
    fn raising_the_coloring_threshold_clears_edge_colors() {
        let (particles, springs) = star(4);
        let config = SolverConfig::default().with_min_particles_for_coloring(1);
        let (mut rule, mut graph, _) = prepared(&config, &particles, springs);
        let color_of = |graph: &ConstraintGraph, constraint_index: u32| {
            graph
                .edge_for(ConstraintId {
                    container_id: 0,
                    constraint_index,
                })
                .and_then(|edge| edge.color)
        };
        assert!((0..5).all(|i| color_of(&graph, i).is_some()));

        // Same topology, new threshold: the island falls back to serial and drops its colors.
        let raised = config.with_min_particles_for_coloring(100);
        let mut counters = SolverCounters::default();
        rule.prepare(&mut graph, &particles, &raised, &mut counters);
        assert_eq!(counters.serial_fallback_islands, 1);
        assert!((0..5).all(|i| color_of(&graph, i).is_none()));
    }
}
