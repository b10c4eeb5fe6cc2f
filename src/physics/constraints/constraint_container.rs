use crate::physics::particles::{ParticleStore, ParticleView};

/// Every container in this crate links constraints between particle pairs.
pub const PARTICLES_PER_CONSTRAINT: usize = 2;

/// Below this, lengths and mass sums are treated as degenerate and the projection is skipped.
pub const SOLVER_EPSILON: f32 = 1e-8;

/// Solver-local record for one constraint in an island's scratch.
#[derive(Clone, Debug, Default)]
pub struct SolverSlot<S> {
    /// Index of the constraint in its container.
    pub constraint_index: u32,
    /// False when the constraint was disabled or referenced invalid particles at gather time.
    pub active: bool,
    /// Cache-friendly copy of everything the projection needs.
    pub data: S,
}

/// Owns one homogeneous set of constraints and exposes the batch contract rules dispatch through.
///
/// Every operation taking `&self` may run concurrently with other containers or other buckets of the same
/// container, as long as the particles involved are disjoint. The rule scheduling guarantees that.
pub trait IConstraintContainer: Send + Sync + 'static {
    /// Per-constraint solver state gathered before iterating and scattered afterwards.
    type SolverConstraint: Clone + Default + Send + Sync + 'static;

    fn num_constraints(&self) -> usize;

    /// Particles linked by the constraint. Valid for any index below `num_constraints`.
    fn constraint_particles(&self, constraint_index: u32) -> [u32; PARTICLES_PER_CONSTRAINT];

    fn is_enabled(&self, constraint_index: u32) -> bool;

    /// Called once per step before anything else touches the container. Resets incremental state.
    fn init(&mut self, _particles: &ParticleStore, _dt: f32) {}

    /// Recomputes per-constraint coefficients that depend on the step before iterating.
    fn update_position_based_state(
        &mut self,
        _particles: &ParticleStore,
        _dt: f32,
        _num_iterations: u32,
    ) {
    }

    /// Presizes an island's scratch for `count` constraints.
    fn set_num_island_constraints(
        &self,
        count: usize,
        solver_data: &mut Vec<SolverSlot<Self::SolverConstraint>>,
    ) {
        solver_data.clear();
        solver_data.resize_with(count, SolverSlot::default);
    }

    /// Reads particle state for a constraint into its solver-local record.
    fn gather_input(
        &self,
        particles: &ParticleStore,
        dt: f32,
        constraint_index: u32,
        solver_constraint: &mut Self::SolverConstraint,
    );

    /// Main projection for one iteration. Returns whether the constraint would like more work.
    fn apply_phase1(
        &self,
        particles: &ParticleView<'_>,
        dt: f32,
        iteration: u32,
        num_iterations: u32,
        solver_constraint: &mut Self::SolverConstraint,
    ) -> bool;

    /// Push-out projection run after the iteration loop.
    fn apply_phase2(
        &self,
        _particles: &ParticleView<'_>,
        _dt: f32,
        _iteration: u32,
        _num_iterations: u32,
        _solver_constraint: &mut Self::SolverConstraint,
    ) -> bool {
        false
    }

    /// Writes solver results back into the container.
    fn scatter_output(
        &mut self,
        _dt: f32,
        _constraint_index: u32,
        _solver_constraint: &Self::SolverConstraint,
    ) {
    }

    /// Gathers a slot, skipping constraints that are disabled or reference particles that no longer exist.
    fn gather_slot(
        &self,
        particles: &ParticleStore,
        dt: f32,
        constraint_index: u32,
        slot: &mut SolverSlot<Self::SolverConstraint>,
    ) {
        slot.constraint_index = constraint_index;
        slot.active = self.is_enabled(constraint_index)
            && self
                .constraint_particles(constraint_index)
                .iter()
                .all(|&particle| particles.is_valid(particle));
        if slot.active {
            self.gather_input(particles, dt, constraint_index, &mut slot.data);
        }
    }

    /// Gathers a range of slots.
    fn gather_input_range(
        &self,
        particles: &ParticleStore,
        dt: f32,
        constraint_indices: &[u32],
        slots: &mut [SolverSlot<Self::SolverConstraint>],
    ) {
        debug_assert_eq!(constraint_indices.len(), slots.len());
        for (slot, &constraint_index) in slots.iter_mut().zip(constraint_indices) {
            self.gather_slot(particles, dt, constraint_index, slot);
        }
    }

    /// Runs phase 1 over a range of slots in order.
    fn apply_phase1_range(
        &self,
        particles: &ParticleView<'_>,
        dt: f32,
        iteration: u32,
        num_iterations: u32,
        slots: &mut [SolverSlot<Self::SolverConstraint>],
    ) -> bool {
        let mut needs_more = false;
        for slot in slots.iter_mut().filter(|slot| slot.active) {
            needs_more |=
                self.apply_phase1(particles, dt, iteration, num_iterations, &mut slot.data);
        }
        needs_more
    }

    /// Runs phase 2 over a range of slots in order.
    fn apply_phase2_range(
        &self,
        particles: &ParticleView<'_>,
        dt: f32,
        iteration: u32,
        num_iterations: u32,
        slots: &mut [SolverSlot<Self::SolverConstraint>],
    ) -> bool {
        let mut needs_more = false;
        for slot in slots.iter_mut().filter(|slot| slot.active) {
            needs_more |=
                self.apply_phase2(particles, dt, iteration, num_iterations, &mut slot.data);
        }
        needs_more
    }

    /// Scatters a range of slots.
    fn scatter_output_range(&mut self, dt: f32, slots: &[SolverSlot<Self::SolverConstraint>]) {
        for slot in slots.iter().filter(|slot| slot.active) {
            self.scatter_output(dt, slot.constraint_index, &slot.data);
        }
    }
}

/// Moves the two ends of a distance-like constraint along `direction`, weighted by inverse mass.
///
/// `delta_lambda` is the multiplier change; the first particle moves by `-w0 * delta_lambda * direction`,
/// the second by `+w1 * delta_lambda * direction`.
///
/// # Safety
/// The caller must own both particles for the current bucket.
#[inline(always)]
pub(crate) unsafe fn apply_pair_correction(
    particles: &ParticleView<'_>,
    indices: [u32; 2],
    inv_m: [f32; 2],
    direction: glam::Vec3,
    delta_lambda: f32,
) {
    particles.add_to_p(indices[0], -inv_m[0] * delta_lambda * direction);
    particles.add_to_p(indices[1], inv_m[1] * delta_lambda * direction);
}
