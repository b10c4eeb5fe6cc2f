use super::constraint_container::{
    apply_pair_correction, IConstraintContainer, PARTICLES_PER_CONSTRAINT, SOLVER_EPSILON,
};
use crate::physics::particles::{ParticleStore, ParticleView};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XpbdSpring {
    pub particles: [u32; PARTICLES_PER_CONSTRAINT],
    pub rest_length: f32,
    /// Inverse stiffness. Zero is perfectly rigid.
    pub compliance: f32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SolverXpbdSpring {
    pub particles: [u32; PARTICLES_PER_CONSTRAINT],
    pub inv_m: [f32; PARTICLES_PER_CONSTRAINT],
    pub rest_length: f32,
    /// Compliance scaled by `1 / dt^2`.
    pub alpha_tilde: f32,
    /// Accumulated multiplier for this step.
    pub lambda: f32,
}

/// Compliant distance constraints solved with accumulated multipliers.
///
/// The multipliers are reset on init every step and written back on scatter, where they can be read as the
/// constraint force magnitude through [`XpbdSpringConstraints::force`].
#[derive(Debug, Clone, Default)]
pub struct XpbdSpringConstraints {
    springs: Vec<XpbdSpring>,
    lambdas: Vec<f32>,
    last_dt: f32,
}

impl XpbdSpringConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(
        &mut self,
        particles: [u32; PARTICLES_PER_CONSTRAINT],
        rest_length: f32,
        compliance: f32,
    ) -> u32 {
        let index = self.springs.len() as u32;
        self.springs.push(XpbdSpring {
            particles,
            rest_length: rest_length.max(0.0),
            compliance: compliance.max(0.0),
            enabled: true,
        });
        self.lambdas.push(0.0);
        index
    }

    #[inline(always)]
    pub fn spring(&self, index: u32) -> &XpbdSpring {
        &self.springs[index as usize]
    }

    pub fn set_enabled(&mut self, index: u32, enabled: bool) {
        self.springs[index as usize].enabled = enabled;
    }

    /// Accumulated multiplier from the last step.
    #[inline(always)]
    pub fn lambda(&self, index: u32) -> f32 {
        self.lambdas[index as usize]
    }

    /// Magnitude of the force the constraint applied during the last step.
    pub fn force(&self, index: u32) -> f32 {
        if self.last_dt <= 0.0 {
            return 0.0;
        }
        self.lambdas[index as usize].abs() / (self.last_dt * self.last_dt)
    }
}

impl IConstraintContainer for XpbdSpringConstraints {
    type SolverConstraint = SolverXpbdSpring;

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

    fn init(&mut self, _particles: &ParticleStore, dt: f32) {
        self.lambdas.iter_mut().for_each(|lambda| *lambda = 0.0);
        self.last_dt = dt;
    }

    fn gather_input(
        &self,
        particles: &ParticleStore,
        dt: f32,
        constraint_index: u32,
        solver_constraint: &mut SolverXpbdSpring,
    ) {
        let spring = &self.springs[constraint_index as usize];
        let inv_m = particles.inv_m();
        *solver_constraint = SolverXpbdSpring {
            particles: spring.particles,
            inv_m: spring.particles.map(|particle| inv_m[particle as usize]),
            rest_length: spring.rest_length,
            alpha_tilde: spring.compliance / (dt * dt),
            lambda: 0.0,
        };
    }

    #[inline(always)]
    fn apply_phase1(
        &self,
        particles: &ParticleView<'_>,
        _dt: f32,
        _iteration: u32,
        _num_iterations: u32,
        spring: &mut SolverXpbdSpring,
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
        let delta_lambda =
            (-error - spring.alpha_tilde * spring.lambda) / (weight + spring.alpha_tilde);
        spring.lambda += delta_lambda;
        // SAFETY: the dispatching rule owns both particles for this bucket.
        unsafe {
            apply_pair_correction(
                particles,
                spring.particles,
                spring.inv_m,
                offset / length,
                delta_lambda,
            );
        }
        delta_lambda.abs() > SOLVER_EPSILON
    }

    fn scatter_output(&mut self, _dt: f32, constraint_index: u32, spring: &SolverXpbdSpring) {
        self.lambdas[constraint_index as usize] = spring.lambda;
    }
}
