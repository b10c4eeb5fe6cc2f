use super::constraint_container::{IConstraintContainer, PARTICLES_PER_CONSTRAINT, SOLVER_EPSILON};
use crate::physics::particles::{ParticleStore, ParticleView};

/// Tether keeping a particle within `max_length` of an anchor particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tether {
    /// `[anchor, particle]`. The anchor is normally kinematic.
    pub particles: [u32; PARTICLES_PER_CONSTRAINT],
    pub max_length: f32,
    pub stiffness: f32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SolverTether {
    pub particles: [u32; PARTICLES_PER_CONSTRAINT],
    pub inv_m: [f32; PARTICLES_PER_CONSTRAINT],
    pub max_length: f32,
    pub stiffness: f32,
}

/// Inequality tethers. Slack tethers do nothing; taut ones pull the particle back towards its anchor.
///
/// Phase 1 uses the tether stiffness. Phase 2 is a hard projection used as a final push-out so no particle
/// ends the step beyond its tether length.
#[derive(Debug, Clone, Default)]
pub struct LongRangeConstraints {
    tethers: Vec<Tether>,
}

impl LongRangeConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(
        &mut self,
        anchor: u32,
        particle: u32,
        max_length: f32,
        stiffness: f32,
    ) -> u32 {
        let index = self.tethers.len() as u32;
        self.tethers.push(Tether {
            particles: [anchor, particle],
            max_length: max_length.max(0.0),
            stiffness: stiffness.clamp(0.0, 1.0),
            enabled: true,
        });
        index
    }

    #[inline(always)]
    pub fn tether(&self, index: u32) -> &Tether {
        &self.tethers[index as usize]
    }

    pub fn set_enabled(&mut self, index: u32, enabled: bool) {
        self.tethers[index as usize].enabled = enabled;
    }
}

/// Projects the tether with the given stiffness. Returns whether it was taut.
#[inline(always)]
fn project(particles: &ParticleView<'_>, tether: &SolverTether, stiffness: f32) -> bool {
    let weight = tether.inv_m[0] + tether.inv_m[1];
    if weight < SOLVER_EPSILON {
        return false;
    }
    let [anchor, particle] = tether.particles;
    let offset = particles.p(particle) - particles.p(anchor);
    let length = offset.length();
    if length <= tether.max_length || length < SOLVER_EPSILON {
        return false;
    }
    let correction = offset * (stiffness * (length - tether.max_length) / (length * weight));
    // SAFETY: the dispatching rule owns both particles for this bucket.
    unsafe {
        particles.add_to_p(anchor, tether.inv_m[0] * correction);
        particles.add_to_p(particle, -tether.inv_m[1] * correction);
    }
    true
}

impl IConstraintContainer for LongRangeConstraints {
    type SolverConstraint = SolverTether;

    #[inline(always)]
    fn num_constraints(&self) -> usize {
        self.tethers.len()
    }

    #[inline(always)]
    fn constraint_particles(&self, constraint_index: u32) -> [u32; PARTICLES_PER_CONSTRAINT] {
        self.tethers[constraint_index as usize].particles
    }

    #[inline(always)]
    fn is_enabled(&self, constraint_index: u32) -> bool {
        self.tethers[constraint_index as usize].enabled
    }

    fn gather_input(
        &self,
        particles: &ParticleStore,
        _dt: f32,
        constraint_index: u32,
        solver_constraint: &mut SolverTether,
    ) {
        let tether = &self.tethers[constraint_index as usize];
        let inv_m = particles.inv_m();
        *solver_constraint = SolverTether {
            particles: tether.particles,
            inv_m: tether.particles.map(|particle| inv_m[particle as usize]),
            max_length: tether.max_length,
            stiffness: tether.stiffness,
        };
    }

    #[inline(always)]
    fn apply_phase1(
        &self,
        particles: &ParticleView<'_>,
        _dt: f32,
        _iteration: u32,
        _num_iterations: u32,
        tether: &mut SolverTether,
    ) -> bool {
        project(particles, tether, tether.stiffness)
    }

    #[inline(always)]
    fn apply_phase2(
        &self,
        particles: &ParticleView<'_>,
        _dt: f32,
        _iteration: u32,
        _num_iterations: u32,
        tether: &mut SolverTether,
    ) -> bool {
        project(particles, tether, 1.0)
    }
}
