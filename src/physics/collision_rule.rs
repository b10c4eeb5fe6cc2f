use crate::physics::collision_particles::{CollisionGeometry, CollisionParticles};
use crate::physics::particle_group::ParticleGroups;
use crate::physics::particles::{ParticleStore, ParticleView};
use crate::physics::rigid_pose::RigidPose;
use crate::utilities::memory::DisjointSlice;
use crate::utilities::thread_dispatcher::{parallel_for, IThreadDispatcher};
use glam::Vec3;

/// Conservative advancement gives up after this many steps and leaves the particle to the discrete test.
pub const MAX_CCD_STEPS: u32 = 32;
/// A sweep stops once it is this close to the thickness shell.
pub const CCD_TOLERANCE: f32 = 1e-4;
const FRICTION_EPSILON: f32 = 1e-9;

/// Deepest contact a particle had with any collider during the step. A zero normal means no contact.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContactRecord {
    pub normal: Vec3,
    pub depth: f32,
    pub collider: u32,
}

impl ContactRecord {
    #[inline(always)]
    pub fn is_contact(&self) -> bool {
        self.normal != Vec3::ZERO
    }
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    position: Vec3,
    normal: Vec3,
    depth: f32,
}

/// Settings shared by every particle a collision pass touches.
#[derive(Debug, Clone, Copy)]
pub struct CollisionSettings {
    /// Friction is applied to velocities after reconciliation instead of inside the projection.
    pub use_legacy_friction: bool,
    pub min_batch_size: usize,
}

/// Pushes dynamic particles out of kinematic colliders, with optional swept tests and positional friction.
#[derive(Debug, Default)]
pub struct CollisionRule {
    contacts: Vec<ContactRecord>,
}

impl CollisionRule {
    /// Contacts recorded during the last step, one per particle.
    #[inline(always)]
    pub fn contacts(&self) -> &[ContactRecord] {
        &self.contacts
    }

    /// Forgets last step's contacts.
    pub(crate) fn reset(&mut self, particle_count: usize) {
        self.contacts.clear();
        self.contacts.resize(particle_count, ContactRecord::default());
    }

    /// Projects every active dynamic particle against every collider its group may touch.
    pub(crate) fn apply(
        &mut self,
        particles: &ParticleView<'_>,
        groups: &ParticleGroups,
        colliders: &CollisionParticles,
        settings: CollisionSettings,
        dispatcher: Option<&dyn IThreadDispatcher>,
    ) {
        if colliders.is_empty() {
            return;
        }
        if self.contacts.len() < particles.len() {
            self.contacts.resize(particles.len(), ContactRecord::default());
        }
        let contacts = DisjointSlice::new(self.contacts.as_mut_slice());
        for range in particles.active_ranges().filter(|range| range.size > 0) {
            let offset = range.offset as usize;
            parallel_for(
                dispatcher,
                range.size as usize,
                settings.min_batch_size,
                &|job| {
                    for i in offset + job.start..offset + job.end {
                        // SAFETY: jobs hand out disjoint particle ranges; each particle's contact is written
                        // only by the worker that owns the particle.
                        unsafe {
                            collide_particle(
                                particles,
                                groups,
                                colliders,
                                settings,
                                i as u32,
                                contacts.get_mut(i),
                            );
                        }
                    }
                },
            );
        }
    }

    /// Scales tangential velocity of particles that touched a collider this step.
    ///
    /// The normal impulse is estimated from the contact depth as `depth / dt`.
    pub(crate) fn apply_legacy_friction(
        &self,
        particles: &mut ParticleStore,
        groups: &ParticleGroups,
        dt: f32,
    ) {
        for (index, contact) in self.contacts.iter().enumerate() {
            if !contact.is_contact() || !particles.is_valid(index as u32) {
                continue;
            }
            let friction = groups.get(particles.group_id()[index]).friction;
            if friction <= 0.0 {
                continue;
            }
            let velocity = particles.v()[index];
            let normal_speed = velocity.dot(contact.normal);
            let tangential = velocity - contact.normal * normal_speed;
            let tangential_speed = tangential.length();
            if tangential_speed < FRICTION_EPSILON {
                continue;
            }
            let scale = (1.0 - friction * (contact.depth / dt) / tangential_speed).max(0.0);
            particles.set_velocity(
                index as u32,
                contact.normal * normal_speed + tangential * scale,
            );
        }
    }
}

/// # Safety
/// The caller must own particle `index` for the duration of the call.
#[inline(always)]
unsafe fn collide_particle(
    particles: &ParticleView<'_>,
    groups: &ParticleGroups,
    colliders: &CollisionParticles,
    settings: CollisionSettings,
    index: u32,
    contact: &mut ContactRecord,
) {
    if particles.inv_m(index) == 0.0 {
        return;
    }
    let group_id = particles.group_id(index);
    let group = groups.get(group_id);
    let x = particles.x(index);
    let mut p = particles.p(index);
    let positional_friction = if settings.use_legacy_friction {
        0.0
    } else {
        group.friction
    };
    for collider in 0..colliders.len() as u32 {
        if !colliders.collides_with_group(collider, group_id) {
            continue;
        }
        let geometry = colliders.geometry(collider);
        let pose = colliders.transform(collider);
        let previous_pose = colliders.previous_transform(collider);
        let swept = if group.use_ccd {
            sweep(geometry, pose, previous_pose, x, p, group.collision_thickness)
        } else {
            None
        };
        let hit = swept.or_else(|| {
            project(
                geometry,
                pose,
                previous_pose,
                x,
                p,
                group.collision_thickness,
                positional_friction,
            )
        });
        if let Some(hit) = hit {
            p = hit.position;
            colliders.mark_collided(collider);
            if !contact.is_contact() || hit.depth >= contact.depth {
                *contact = ContactRecord {
                    normal: hit.normal,
                    depth: hit.depth,
                    collider,
                };
            }
        }
    }
    particles.set_p(index, p);
}

/// Discrete test of `p` against the collider's current pose. Pushes the particle out to the thickness shell
/// along the surface normal, then removes tangential motion relative to the collider up to the Coulomb bound
/// `friction * depth`.
#[inline(always)]
fn project(
    geometry: &CollisionGeometry,
    pose: &RigidPose,
    previous_pose: &RigidPose,
    x: Vec3,
    p: Vec3,
    thickness: f32,
    friction: f32,
) -> Option<Hit> {
    let local = pose.inverse_transform(p);
    let (phi, local_normal) = geometry.phi_with_normal(local);
    if phi >= thickness {
        return None;
    }
    let depth = thickness - phi;
    let normal = pose.transform_vector(local_normal);
    let mut position = p + normal * depth;
    if friction > 0.0 {
        let collider_motion = pose.transform(local) - previous_pose.transform(local);
        let relative = (position - x) - collider_motion;
        let tangential = relative - normal * relative.dot(normal);
        let tangential_length = tangential.length();
        if tangential_length > FRICTION_EPSILON {
            let bound = friction * depth;
            position -= if tangential_length <= bound {
                tangential
            } else {
                tangential * (bound / tangential_length)
            };
        }
    }
    Some(Hit {
        position,
        normal,
        depth,
    })
}

/// Swept test from `x` in the collider's previous pose to `p` in its current pose, by conservative advancement
/// in collider space. Returns the first point on the path within the thickness shell, or `None` if the path
/// never gets there or already starts inside it.
#[inline(always)]
fn sweep(
    geometry: &CollisionGeometry,
    pose: &RigidPose,
    previous_pose: &RigidPose,
    x: Vec3,
    p: Vec3,
    thickness: f32,
) -> Option<Hit> {
    let start = previous_pose.inverse_transform(x);
    let end = pose.inverse_transform(p);
    let travel = end - start;
    let travel_length = travel.length();
    if travel_length < CCD_TOLERANCE || geometry.phi(start) < thickness {
        return None;
    }
    let mut t = 0.0;
    for _ in 0..MAX_CCD_STEPS {
        let point = start + travel * t;
        let (phi, local_normal) = geometry.phi_with_normal(point);
        let distance = phi - thickness;
        if distance <= CCD_TOLERANCE {
            return Some(Hit {
                position: pose.transform(point),
                normal: pose.transform_vector(local_normal),
                depth: (thickness - geometry.phi(end)).max(0.0),
            });
        }
        t += distance / travel_length;
        if t >= 1.0 {
            return None;
        }
    }
    None
}
