use super::constraint_container::{
    apply_pair_correction, IConstraintContainer, PARTICLES_PER_CONSTRAINT, SOLVER_EPSILON,
};
use crate::physics::particles::{ParticleStore, ParticleView};
use glam::Vec3;

/// Residual below which a spring stops asking for more iterations.
pub const SPRING_TOLERANCE: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spring {
    pub particles: [u32; PARTICLES_PER_CONSTRAINT],
    pub rest_length: f32,
    /// Fraction of the error removed over a whole step, in [0, 1].
    pub stiffness: f32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SolverSpring {
    pub particles: [u32; PARTICLES_PER_CONSTRAINT],
    pub inv_m: [f32; PARTICLES_PER_CONSTRAINT],
    pub rest_length: f32,
    pub iteration_stiffness: f32,
}

/// Classic position based distance constraints.
///
/// The step stiffness is converted into an iteration stiffness `1 - (1 - k)^(1 / N)` before iterating so the
/// effective stiffness does not depend on the iteration count.
#[derive(Debug, Clone, Default)]
pub struct SpringConstraints {
    springs: Vec<Spring>,
    iteration_stiffness: Vec<f32>,
}

impl SpringConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a spring whose rest length is the current distance between the particles.
    pub fn add_constraint_at_rest(
        &mut self,
        particles: &ParticleStore,
        indices: [u32; PARTICLES_PER_CONSTRAINT],
        stiffness: f32,
    ) -> u32 {
        let rest_length = particles.x()[indices[0] as usize]
            .distance(particles.x()[indices[1] as usize]);
        self.add_constraint(indices, rest_length, stiffness)
    }

    pub fn add_constraint(
        &mut self,
        particles: [u32; PARTICLES_PER_CONSTRAINT],
        rest_length: f32,
        stiffness: f32,
    ) -> u32 {
        debug_assert!(
            (0.0..=1.0).contains(&stiffness),
            "Spring stiffness must be within [0, 1]."
        );
        let index = self.springs.len() as u32;
        self.springs.push(Spring {
            particles,
            rest_length: rest_length.max(0.0),
            stiffness: stiffness.clamp(0.0, 1.0),
            enabled: true,
        });
        index
    }

    #[inline(always)]
    pub fn spring(&self, index: u32) -> &Spring {
        &self.springs[index as usize]
    }

    pub fn set_enabled(&mut self, index: u32, enabled: bool) {
        self.springs[index as usize].enabled = enabled;
    }

    pub fn set_rest_length(&mut self, index: u32, rest_length: f32) {
        self.springs[index as usize].rest_length = rest_length.max(0.0);
    }
}

/// Converts a per-step stiffness into the per-iteration stiffness that removes the same fraction of error
/// over `num_iterations` passes.
#[inline(always)]
pub fn iteration_stiffness(stiffness: f32, num_iterations: u32) -> f32 {
    if num_iterations <= 1 || stiffness >= 1.0 {
        return stiffness;
    }
    1.0 - (1.0 - stiffness).powf(1.0 / num_iterations as f32)
}

impl IConstraintContainer for SpringConstraints {
    type SolverConstraint = SolverSpring;

    #[inline(always)]
    fn num_constraints(&self) -> usize {
        self.springs.len()
    }

    #[inline(always)]
    fn constraint_particles(&self, constraint_index: u32) -> [u32; PARTICLES_PER_CONSTRAINT] {
        self.springs[constraint_index as usize].particles
    }

    #[inline(always)]
    fn is_enabled(&self, constraint_index: u32) -> bool {
        self.springs[constraint_index as usize].enabled
    }

    fn update_position_based_state(
        &mut self,
        _particles: &ParticleStore,
        _dt: f32,
        num_iterations: u32,
    ) {
        self.iteration_stiffness.clear();
        self.iteration_stiffness.extend(
            self.springs
                .iter()
                .map(|spring| iteration_stiffness(spring.stiffness, num_iterations)),
        );
    }

    fn gather_input(
        &self,
        particles: &ParticleStore,
        _dt: f32,
        constraint_index: u32,
        solver_constraint: &mut SolverSpring,
    ) {
        let spring = &self.springs[constraint_index as usize];
        let inv_m = particles.inv_m();
        *solver_constraint = SolverSpring {
            particles: spring.particles,
            inv_m: spring.particles.map(|particle| inv_m[particle as usize]),
            rest_length: spring.rest_length,
            iteration_stiffness: self
                .iteration_stiffness
                .get(constraint_index as usize)
                .copied()
                .unwrap_or(spring.stiffness),
        };
    }

    #[inline(always)]
    fn apply_phase1(
        &self,
        particles: &ParticleView<'_>,
        _dt: f32,
        _iteration: u32,
        _num_iterations: u32,
        spring: &mut SolverSpring,
    ) -> bool {
        let weight = spring.inv_m[0] + spring.inv_m[1];
        if weight < SOLVER_EPSILON {
            return false;
        }
        let offset = particles.p(spring.particles[1]) - particles.p(spring.particles[0]);
        let length = offset.length();
        if length < SOLVER_EPSILON {
            return false;
        }
        let error = length - spring.rest_length;
        let direction: Vec3 = offset / length;
        let delta_lambda = -spring.iteration_stiffness * error / weight;
        // SAFETY: the dispatching rule owns both particles for this bucket.
        unsafe {
            apply_pair_correction(
                particles,
                spring.particles,
                spring.inv_m,
                direction,
                delta_lambda,
            );
        }
        error.abs() * (1.0 - spring.iteration_stiffness) > SPRING_TOLERANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn stretched_pair(distance: f32) -> ParticleStore {
        let mut particles = ParticleStore::default();
        particles.add_particles(2, 0);
        particles.set_position(1, Vec3::new(distance, 0.0, 0.0));
        particles
    }

    #[test]
    fn iteration_stiffness_compounds_to_step_stiffness() {
        let per_iteration = iteration_stiffness(0.5, 4);
        assert_abs_diff_eq!(
            1.0 - (1.0 - per_iteration).powi(4),
            0.5,
            epsilon = 1e-6
        );
        assert_eq!(iteration_stiffness(1.0, 4), 1.0);
        assert_eq!(iteration_stiffness(0.3, 1), 0.3);
    }

    #[test]
    fn rigid_spring_reaches_rest_length_in_one_projection() {
        let mut particles = stretched_pair(2.0);
        let mut springs = SpringConstraints::new();
        springs.add_constraint([0, 1], 1.0, 1.0);
        springs.update_position_based_state(&particles, 0.01, 1);
        let mut solver = SolverSpring::default();
        springs.gather_input(&particles, 0.01, 0, &mut solver);
        let view = particles.view();
        assert!(!springs.apply_phase1(&view, 0.01, 0, 1, &mut solver));
        assert_abs_diff_eq!(view.p(0).x, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(view.p(1).x, 1.5, epsilon = 1e-6);
    }

    #[test]
    fn soft_spring_error_shrinks_every_iteration() {
        const NUM_ITERATIONS: u32 = 8;
        let mut particles = stretched_pair(2.0);
        let mut springs = SpringConstraints::new();
        springs.add_constraint([0, 1], 1.0, 0.75);
        springs.update_position_based_state(&particles, 0.01, NUM_ITERATIONS);
        let mut solver = SolverSpring::default();
        springs.gather_input(&particles, 0.01, 0, &mut solver);
        let view = particles.view();
        let error = |view: &ParticleView<'_>| view.p(0).distance(view.p(1)) - 1.0;

        let mut errors = vec![error(&view)];
        for iteration in 0..NUM_ITERATIONS {
            springs.apply_phase1(&view, 0.01, iteration, NUM_ITERATIONS, &mut solver);
            errors.push(error(&view));
        }
        for pair in errors.windows(2) {
            assert!(pair[1] >= 0.0);
            assert!(pair[1] < pair[0], "{errors:?}");
        }
        // The configured iterations remove exactly the step stiffness share of the error.
        assert_abs_diff_eq!(errors[NUM_ITERATIONS as usize], 0.25, epsilon = 1e-4);

        // Iterating on keeps closing the gap towards the rest length.
        for iteration in 0..64 {
            springs.apply_phase1(&view, 0.01, iteration, NUM_ITERATIONS, &mut solver);
            let next = error(&view);
            assert!(next <= *errors.last().unwrap() + 1e-6);
            errors.push(next);
        }
        assert_abs_diff_eq!(*errors.last().unwrap(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn kinematic_end_takes_no_correction() {
        let mut particles = stretched_pair(2.0);
        particles.set_kinematic(0);
        let mut springs = SpringConstraints::new();
        springs.add_constraint([0, 1], 1.0, 1.0);
        let mut solver = SolverSpring::default();
        springs.gather_input(&particles, 0.01, 0, &mut solver);
        let view = particles.view();
        springs.apply_phase1(&view, 0.01, 0, 1, &mut solver);
        assert_eq!(view.p(0), Vec3::ZERO);
        assert_abs_diff_eq!(view.p(1).x, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn coincident_particles_are_skipped() {
        let mut particles = stretched_pair(0.0);
        let mut springs = SpringConstraints::new();
        springs.add_constraint([0, 1], 1.0, 1.0);
        let mut solver = SolverSpring::default();
        springs.gather_input(&particles, 0.01, 0, &mut solver);
        let view = particles.view();
        assert!(!springs.apply_phase1(&view, 0.01, 0, 1, &mut solver));
        assert_eq!(view.p(1), Vec3::ZERO);
    }
}
