use crate::physics::collision_particles::{CollisionGeometry, CollisionParticles};
use crate::physics::collision_rule::{CollisionRule, CollisionSettings, ContactRecord};
use crate::physics::constraint_graph::ConstraintGraph;
use crate::physics::constraint_rule::{ConstraintRule, IConstraintRule};
use crate::physics::constraints::IConstraintContainer;
use crate::physics::error::EvolutionError;
use crate::physics::particle_group::{ParticleGroup, ParticleGroups};
use crate::physics::particles::ParticleStore;
use crate::physics::pose_integrator::{post_iteration_update, pre_iteration_update, KinematicUpdate};
use crate::physics::rigid_pose::RigidPose;
use crate::physics::simulation_profiler::{SimulationProfiler, SolverCounters};
use crate::physics::solver_config::{DispatchMode, SolverConfig};
use crate::utilities::thread_dispatcher::IThreadDispatcher;
use std::sync::Arc;
use tracing::{debug, debug_span, trace, warn};

/// Moves collision particles. Called once per step with the colliders, the step's dt and the time at the end
/// of the step, after the previous transforms were snapshotted.
pub type CollisionKinematicUpdate = Box<dyn FnMut(&mut CollisionParticles, f32, f32) + Send>;

/// Names of the profiled stages of a step.
pub mod stages {
    pub const PRE_ITERATION: &str = "pre_iteration_update";
    pub const COLLISION_BOOKKEEPING: &str = "collision_bookkeeping";
    pub const CONSTRAINT_INIT: &str = "constraint_init";
    pub const ITERATIONS: &str = "iterations";
    pub const PUSH_OUT: &str = "push_out";
    pub const RECONCILIATION: &str = "reconciliation";
    pub const LEGACY_FRICTION: &str = "legacy_friction";
}

/// Owns the particles, their groups, the colliders and every constraint rule, and advances them one step at
/// a time.
///
/// A step runs, in order: time bookkeeping, pre-iteration integration, collision bookkeeping, constraint
/// initialization and graph maintenance, the fixed iteration loop (rules in registration order, then
/// collisions), push-out passes, reconciliation of velocities and positions, and optionally legacy friction.
pub struct Evolution {
    particles: ParticleStore,
    groups: ParticleGroups,
    collision_particles: CollisionParticles,
    graph: ConstraintGraph,
    rules: Vec<Box<dyn IConstraintRule>>,
    collision_rule: CollisionRule,
    config: SolverConfig,
    dispatcher: Option<Arc<dyn IThreadDispatcher>>,
    kinematic_update: Option<KinematicUpdate>,
    collision_kinematic_update: Option<CollisionKinematicUpdate>,
    time: f32,
    smoothed_dt: Option<f32>,
    profiler: SimulationProfiler,
}

impl Evolution {
    /// Creates an empty evolution. Group 0 exists from the start with default settings.
    pub fn new(config: SolverConfig) -> Result<Self, EvolutionError> {
        config.validate()?;
        let mut groups = ParticleGroups::default();
        groups.ensure(0);
        debug!(
            num_iterations = config.num_iterations,
            dispatch_mode = ?config.dispatch_mode(),
            "evolution created"
        );
        Ok(Self {
            particles: ParticleStore::default(),
            groups,
            collision_particles: CollisionParticles::default(),
            graph: ConstraintGraph::new(),
            rules: Vec::new(),
            collision_rule: CollisionRule::default(),
            config,
            dispatcher: None,
            kinematic_update: None,
            collision_kinematic_update: None,
            time: 0.0,
            smoothed_dt: None,
            profiler: SimulationProfiler::new(8),
        })
    }

    /// Sets the dispatcher used for every parallel stage. `None` runs everything on the calling thread.
    pub fn set_thread_dispatcher(&mut self, dispatcher: Option<Arc<dyn IThreadDispatcher>>) {
        self.dispatcher = dispatcher;
    }

    pub fn with_thread_dispatcher(mut self, dispatcher: Arc<dyn IThreadDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    #[inline(always)]
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Replaces the configuration. Rules pick up dispatch changes on the next step.
    pub fn set_config(&mut self, config: SolverConfig) -> Result<(), EvolutionError> {
        config.validate()?;
        if config.dt_smoothing.is_none() {
            self.smoothed_dt = None;
        }
        self.config = config;
        Ok(())
    }

    #[inline(always)]
    pub fn particles(&self) -> &ParticleStore {
        &self.particles
    }

    #[inline(always)]
    pub fn particles_mut(&mut self) -> &mut ParticleStore {
        &mut self.particles
    }

    /// Adds `count` particles in `group_id`, creating the group if needed. Returns the first particle's index.
    pub fn add_particles(&mut self, count: u32, group_id: u32) -> u32 {
        self.groups.ensure(group_id);
        self.particles.add_particles(count, group_id)
    }

    /// Activates or deactivates the particle range starting at `offset`. Returns false if no range starts there.
    pub fn activate_particle_range(&mut self, offset: u32, active: bool) -> bool {
        self.particles.activate_particle_range(offset, active)
    }

    #[inline(always)]
    pub fn groups(&self) -> &ParticleGroups {
        &self.groups
    }

    #[inline(always)]
    pub fn groups_mut(&mut self) -> &mut ParticleGroups {
        &mut self.groups
    }

    pub fn group_mut(&mut self, group_id: u32) -> Result<&mut ParticleGroup, EvolutionError> {
        self.groups.try_get_mut(group_id)
    }

    #[inline(always)]
    pub fn collision_particles(&self) -> &CollisionParticles {
        &self.collision_particles
    }

    #[inline(always)]
    pub fn collision_particles_mut(&mut self) -> &mut CollisionParticles {
        &mut self.collision_particles
    }

    pub fn add_collision_particle(
        &mut self,
        geometry: CollisionGeometry,
        pose: RigidPose,
        group_id: u32,
    ) -> u32 {
        self.collision_particles.add(geometry, pose, group_id)
    }

    /// Contacts recorded against collision particles during the last step.
    #[inline(always)]
    pub fn contacts(&self) -> &[ContactRecord] {
        self.collision_rule.contacts()
    }

    pub fn set_kinematic_update(&mut self, update: Option<KinematicUpdate>) {
        self.kinematic_update = update;
    }

    pub fn set_collision_kinematic_update(&mut self, update: Option<CollisionKinematicUpdate>) {
        self.collision_kinematic_update = update;
    }

    /// Registers a container. Rules are applied in registration order every iteration. Returns the rule index.
    pub fn add_constraint_rule<C: IConstraintContainer>(&mut self, container: C) -> usize {
        let container_id = self.graph.register_container();
        self.rules
            .push(Box::new(ConstraintRule::new(container, container_id)));
        self.rules.len() - 1
    }

    #[inline(always)]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Gets a rule by index, if it holds a container of type `C`.
    pub fn rule<C: IConstraintContainer>(&self, index: usize) -> Option<&ConstraintRule<C>> {
        self.rules.get(index)?.as_any().downcast_ref()
    }

    pub fn rule_mut<C: IConstraintContainer>(
        &mut self,
        index: usize,
    ) -> Option<&mut ConstraintRule<C>> {
        self.rules.get_mut(index)?.as_any_mut().downcast_mut()
    }

    /// Forces the dispatch of one rule. `None` follows the configuration. Returns false for an unknown rule.
    pub fn set_rule_dispatch_mode(&mut self, index: usize, mode: Option<DispatchMode>) -> bool {
        match self.rules.get_mut(index) {
            Some(rule) => {
                rule.set_dispatch_mode(mode);
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    pub fn graph(&self) -> &ConstraintGraph {
        &self.graph
    }

    /// Simulated time, accumulated from the (smoothed) time steps.
    #[inline(always)]
    pub fn time(&self) -> f32 {
        self.time
    }

    #[inline(always)]
    pub fn counters(&self) -> &SolverCounters {
        &self.profiler.counters
    }

    #[inline(always)]
    pub fn profiler(&self) -> &SimulationProfiler {
        &self.profiler
    }

    /// Advances the simulation by `dt`, or does nothing if `dt` is not finite and positive.
    pub fn advance_one_time_step(&mut self, dt: f32) {
        if let Err(error) = self.try_advance_one_time_step(dt) {
            warn!(%error, "step ignored");
        }
    }

    /// Advances the simulation by `dt`, reporting an unusable time step instead of ignoring it.
    pub fn try_advance_one_time_step(&mut self, dt: f32) -> Result<(), EvolutionError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(EvolutionError::InvalidTimeStep(dt));
        }
        let dt = self.update_time(dt);
        let _span = debug_span!("advance_one_time_step", dt, time = self.time).entered();
        self.profiler.clear();
        let dispatcher = self.dispatcher.clone();
        let dispatcher = dispatcher.as_deref();
        let min_batch_size = self.config.min_parallel_batch_size;

        self.profiler.start(stages::PRE_ITERATION);
        pre_iteration_update(
            &mut self.particles,
            &self.groups,
            dt,
            self.time,
            self.kinematic_update.as_ref(),
            dispatcher,
            min_batch_size,
        );
        self.profiler.end(stages::PRE_ITERATION);

        self.profiler.start(stages::COLLISION_BOOKKEEPING);
        self.collision_particles.snapshot_transforms();
        if let Some(update) = self.collision_kinematic_update.as_mut() {
            update(&mut self.collision_particles, dt, self.time);
        }
        self.collision_particles.reset_collided();
        self.collision_rule.reset(self.particles.len());
        self.profiler.end(stages::COLLISION_BOOKKEEPING);

        self.profiler.start(stages::CONSTRAINT_INIT);
        self.init_constraints(dt, dispatcher);
        self.profiler.end(stages::CONSTRAINT_INIT);

        self.profiler.start(stages::ITERATIONS);
        self.iterate(dt, dispatcher);
        self.profiler.end(stages::ITERATIONS);

        self.profiler.start(stages::PUSH_OUT);
        self.push_out(dt, dispatcher);
        self.profiler.end(stages::PUSH_OUT);

        self.profiler.start(stages::RECONCILIATION);
        for rule in &mut self.rules {
            rule.scatter_solver_output(dt);
        }
        post_iteration_update(&mut self.particles, dt, dispatcher, min_batch_size);
        self.profiler.end(stages::RECONCILIATION);

        if self.config.use_legacy_friction {
            self.profiler.start(stages::LEGACY_FRICTION);
            self.collision_rule
                .apply_legacy_friction(&mut self.particles, &self.groups, dt);
            self.profiler.end(stages::LEGACY_FRICTION);
        }
        Ok(())
    }

    /// Applies dt smoothing and advances the clock. Returns the dt the step should use.
    fn update_time(&mut self, dt: f32) -> f32 {
        let dt = match (self.config.dt_smoothing, self.smoothed_dt) {
            (Some(factor), Some(previous)) => previous + factor * (dt - previous),
            _ => dt,
        };
        if self.config.dt_smoothing.is_some() {
            self.smoothed_dt = Some(dt);
        }
        self.time += dt;
        dt
    }

    fn init_constraints(&mut self, dt: f32, dispatcher: Option<&dyn IThreadDispatcher>) {
        let num_iterations = self.config.num_iterations;
        for rule in &mut self.rules {
            rule.init(&self.particles, dt, num_iterations);
        }

        let counters = &mut self.profiler.counters;
        let uses_graph = self
            .rules
            .iter()
            .any(|rule| rule.dispatch_mode(&self.config) != DispatchMode::Simple);
        if uses_graph {
            self.graph.begin_build(self.particles.len());
            for rule in &self.rules {
                rule.add_to_graph(&mut self.graph, &self.particles, &self.config, counters);
            }
            counters.topology_changed = self.graph.end_build(self.config.use_levels);
            counters.islands = self.graph.islands().len();
            counters.max_level = self.graph.max_level();
            counters.kinematic_only_constraints = self.graph.kinematic_only_edges();
        }

        for rule in &mut self.rules {
            rule.prepare(&mut self.graph, &self.particles, &self.config, counters);
            rule.gather_solver_input(&self.particles, dt, dispatcher, counters);
        }
        if counters.constraints_skipped > 0 {
            debug!(
                skipped = counters.constraints_skipped,
                "skipped disabled constraints or constraints referencing inactive particles"
            );
        }
    }

    fn collision_settings(&self) -> CollisionSettings {
        CollisionSettings {
            use_legacy_friction: self.config.use_legacy_friction,
            min_batch_size: self.config.min_parallel_batch_size,
        }
    }

    fn iterate(&mut self, dt: f32, dispatcher: Option<&dyn IThreadDispatcher>) {
        let num_iterations = self.config.num_iterations;
        let min_batch_size = self.config.min_parallel_batch_size;
        let settings = self.collision_settings();
        let view = self.particles.view();
        let mut needs_more = false;
        // The loop always runs the configured count; the advisory flag is only reported.
        for iteration in 0..num_iterations {
            needs_more = false;
            for rule in &mut self.rules {
                needs_more |= rule.apply_constraints(
                    &view,
                    dt,
                    iteration,
                    num_iterations,
                    dispatcher,
                    min_batch_size,
                );
            }
            self.collision_rule.apply(
                &view,
                &self.groups,
                &self.collision_particles,
                settings,
                dispatcher,
            );
            trace!(iteration, needs_more, "constraint iteration");
        }
        self.profiler.counters.needs_more_iterations = needs_more;
    }

    fn push_out(&mut self, dt: f32, dispatcher: Option<&dyn IThreadDispatcher>) {
        let passes = self.config.num_push_out_iterations;
        let min_batch_size = self.config.min_parallel_batch_size;
        let settings = self.collision_settings();
        let view = self.particles.view();
        for pass in 0..passes {
            for rule in &mut self.rules {
                rule.apply_push_out(&view, dt, pass, passes, dispatcher, min_batch_size);
            }
            self.collision_rule.apply(
                &view,
                &self.groups,
                &self.collision_particles,
                settings,
                dispatcher,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::constraints::SpringConstraints;
    use glam::Vec3;

    #[test]
    fn invalid_time_steps_are_no_ops() {
        let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
        evolution.add_particles(1, 0);
        evolution.advance_one_time_step(0.0);
        evolution.advance_one_time_step(f32::NAN);
        assert_eq!(evolution.time(), 0.0);
        assert_eq!(evolution.particles().x()[0], Vec3::ZERO);
        assert_eq!(
            evolution.try_advance_one_time_step(-1.0),
            Err(EvolutionError::InvalidTimeStep(-1.0))
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(Evolution::new(SolverConfig::new(0)).is_err());
        let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
        assert!(evolution
            .set_config(SolverConfig::default().with_dt_smoothing(Some(0.0)))
            .is_err());
    }

    #[test]
    fn dt_smoothing_low_passes_the_clock() {
        let config = SolverConfig::default().with_dt_smoothing(Some(0.5));
        let mut evolution = Evolution::new(config).unwrap();
        evolution.advance_one_time_step(0.02);
        evolution.advance_one_time_step(0.04);
        // 0.02, then 0.02 + 0.5 * (0.04 - 0.02) = 0.03.
        assert!((evolution.time() - 0.05).abs() < 1e-6);
    }

    #[test]
    fn rules_are_downcast_by_container_type() {
        let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
        let index = evolution.add_constraint_rule(SpringConstraints::new());
        assert!(evolution.rule::<SpringConstraints>(index).is_some());
        assert!(evolution
            .rule::<crate::physics::constraints::LongRangeConstraints>(index)
            .is_none());
        let rule = evolution.rule_mut::<SpringConstraints>(index).unwrap();
        rule.container_mut().add_constraint([0, 1], 1.0, 1.0);
        let rule = evolution.rule::<SpringConstraints>(index).unwrap();
        assert_eq!(rule.num_constraints(), 1);
        assert_eq!(evolution.rule_count(), 1);
        assert!(evolution.set_rule_dispatch_mode(index, Some(DispatchMode::IslandSerial)));
        assert!(!evolution.set_rule_dispatch_mode(5, None));
    }
}
