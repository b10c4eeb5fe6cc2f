use crate::physics::particle_group::{ForceRule, ForceRuleInput, ParticleGroup, ParticleGroups, VelocityField};
use crate::physics::particles::{IntegrationState, ParticleRange, ParticleStore};
use crate::utilities::thread_dispatcher::{parallel_for, IThreadDispatcher};
use glam::Vec3;
use std::ops::Range;
use tracing::trace;

/// Kinematic particle handed to the kinematic update. `p` arrives preset to `x`; whatever the callback leaves in it
/// is where the particle ends the step.
pub struct KinematicParticle<'a> {
    pub index: u32,
    pub x: Vec3,
    pub p: &'a mut Vec3,
    pub v: &'a mut Vec3,
}

/// Drives kinematic particles. Called with the particle, the step's dt and the time at the end of the step.
/// Invoked from worker threads.
pub type KinematicUpdate = Box<dyn Fn(KinematicParticle<'_>, f32, f32) + Send + Sync>;

/// Force contribution resolved once per group before the per-particle loop.
pub trait IForceTerm: Sync {
    fn force(&self, input: &ForceRuleInput) -> Vec3;
}

/// Velocity damping resolved once per group before the per-particle loop.
pub trait IDampingTerm: Sync {
    fn damp(&self, v: Vec3) -> Vec3;
}

pub struct NoForce;

impl IForceTerm for NoForce {
    #[inline(always)]
    fn force(&self, _input: &ForceRuleInput) -> Vec3 {
        Vec3::ZERO
    }
}

pub struct CustomForce<'a>(pub &'a ForceRule);

impl IForceTerm for CustomForce<'_> {
    #[inline(always)]
    fn force(&self, input: &ForceRuleInput) -> Vec3 {
        (self.0)(input)
    }
}

pub struct FieldForce<'a>(pub &'a VelocityField);

impl IForceTerm for FieldForce<'_> {
    #[inline(always)]
    fn force(&self, input: &ForceRuleInput) -> Vec3 {
        self.0.force(input.x, input.v)
    }
}

pub struct NoDamping;

impl IDampingTerm for NoDamping {
    #[inline(always)]
    fn damp(&self, v: Vec3) -> Vec3 {
        v
    }
}

/// Keeps `retained` of the velocity each step.
pub struct LinearDamping {
    pub retained: f32,
}

impl IDampingTerm for LinearDamping {
    #[inline(always)]
    fn damp(&self, v: Vec3) -> Vec3 {
        v * self.retained
    }
}

struct PreIterationContext<'a> {
    state: &'a IntegrationState<'a>,
    dt: f32,
    time: f32,
    kinematic_update: Option<&'a KinematicUpdate>,
}

/// Integrates one range of particles. Every feature branch has been resolved through the type parameters,
/// so the only per-particle branch is the kinematic check.
#[inline(always)]
fn integrate_range<TForce: IForceTerm, TField: IForceTerm, TDamping: IDampingTerm>(
    force: &TForce,
    field: &TField,
    damping: &TDamping,
    gravity: Vec3,
    context: &PreIterationContext<'_>,
    range: Range<usize>,
) {
    let state = context.state;
    let dt = context.dt;
    for i in range {
        // SAFETY: the parallel-for hands every worker a disjoint particle range.
        let (x, p, v) = unsafe { (*state.x.get(i), state.p.get_mut(i), state.v.get_mut(i)) };
        let inv_m = state.inv_m[i];
        if inv_m == 0.0 {
            *p = x;
            if let Some(update) = context.kinematic_update {
                update(
                    KinematicParticle {
                        index: i as u32,
                        x,
                        p,
                        v,
                    },
                    dt,
                    context.time,
                );
            }
            continue;
        }
        let input = ForceRuleInput {
            index: i as u32,
            x,
            v: *v,
            m: state.m[i],
            dt,
        };
        let total_force = gravity * input.m + force.force(&input) + field.force(&input);
        *v = damping.damp(*v + total_force * (inv_m * dt));
        *p = x + *v * dt;
    }
}

fn with_damping<TForce: IForceTerm, TField: IForceTerm>(
    force: &TForce,
    field: &TField,
    group: &ParticleGroup,
    context: &PreIterationContext<'_>,
    range: Range<usize>,
) {
    if group.damping > 0.0 {
        let damping = LinearDamping {
            retained: (1.0 - group.damping).clamp(0.0, 1.0),
        };
        integrate_range(force, field, &damping, group.gravity, context, range);
    } else {
        integrate_range(force, field, &NoDamping, group.gravity, context, range);
    }
}

fn with_field<TForce: IForceTerm>(
    force: &TForce,
    group: &ParticleGroup,
    context: &PreIterationContext<'_>,
    range: Range<usize>,
) {
    match &group.velocity_field {
        Some(field) => with_damping(force, &FieldForce(field), group, context, range),
        None => with_damping(force, &NoForce, group, context, range),
    }
}

fn integrate_group(group: &ParticleGroup, context: &PreIterationContext<'_>, range: Range<usize>) {
    match &group.force_rule {
        Some(rule) => with_field(&CustomForce(rule), group, context, range),
        None => with_field(&NoForce, group, context, range),
    }
}

/// Predicts positions for every active particle: `V += F * inv_m * dt`, damping, then `P = X + V * dt`.
/// Kinematic particles get `P = X` and the kinematic update instead.
pub fn pre_iteration_update(
    particles: &mut ParticleStore,
    groups: &ParticleGroups,
    dt: f32,
    time: f32,
    kinematic_update: Option<&KinematicUpdate>,
    dispatcher: Option<&dyn IThreadDispatcher>,
    min_batch_size: usize,
) {
    let ranges: Vec<ParticleRange> = particles.active_ranges().copied().collect();
    let state = particles.integration_state();
    let context = PreIterationContext {
        state: &state,
        dt,
        time,
        kinematic_update,
    };
    for range in ranges.iter().filter(|range| range.size > 0) {
        let group = groups.get(state.group_id[range.offset as usize]);
        trace!(
            offset = range.offset,
            size = range.size,
            features = ?group.features(),
            "pre-iteration update"
        );
        let offset = range.offset as usize;
        parallel_for(dispatcher, range.size as usize, min_batch_size, &|job| {
            integrate_group(group, &context, offset + job.start..offset + job.end);
        });
    }
}

/// Reconciles every active particle after solving: `V = (P - X) / dt`, then `X = P`.
pub fn post_iteration_update(
    particles: &mut ParticleStore,
    dt: f32,
    dispatcher: Option<&dyn IThreadDispatcher>,
    min_batch_size: usize,
) {
    let ranges: Vec<ParticleRange> = particles.active_ranges().copied().collect();
    let state = particles.integration_state();
    let inv_dt = 1.0 / dt;
    for range in ranges.iter().filter(|range| range.size > 0) {
        let offset = range.offset as usize;
        parallel_for(dispatcher, range.size as usize, min_batch_size, &|job| {
            for i in offset + job.start..offset + job.end {
                // SAFETY: the parallel-for hands every worker a disjoint particle range.
                unsafe {
                    let p = *state.p.get(i);
                    let x = state.x.get_mut(i);
                    *state.v.get_mut(i) = (p - *x) * inv_dt;
                    *x = p;
                }
            }
        });
    }
}
