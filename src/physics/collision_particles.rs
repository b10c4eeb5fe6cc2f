use crate::physics::rigid_pose::RigidPose;
use glam::Vec3;
use std::sync::atomic::{AtomicBool, Ordering};

/// Below this length a direction is considered degenerate.
const DIRECTION_EPSILON: f32 = 1e-6;

/// Kinematic collider shape, expressed in the collision particle's local space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollisionGeometry {
    Sphere { radius: f32 },
    /// Segment along local Z from `-half_length` to `half_length`, inflated by `radius`.
    Capsule { half_length: f32, radius: f32 },
    /// Half-space below the local XY plane; the surface normal is local +Z.
    Plane,
    Box { half_extents: Vec3 },
}

impl CollisionGeometry {
    /// Signed distance from `local` to the surface and the outward normal at the closest surface point.
    #[inline(always)]
    pub fn phi_with_normal(&self, local: Vec3) -> (f32, Vec3) {
        match *self {
            CollisionGeometry::Sphere { radius } => {
                let length = local.length();
                let normal = if length > DIRECTION_EPSILON {
                    local / length
                } else {
                    Vec3::Z
                };
                (length - radius, normal)
            }
            CollisionGeometry::Capsule {
                half_length,
                radius,
            } => {
                let closest = Vec3::new(0.0, 0.0, local.z.clamp(-half_length, half_length));
                let offset = local - closest;
                let length = offset.length();
                let normal = if length > DIRECTION_EPSILON {
                    offset / length
                } else {
                    Vec3::X
                };
                (length - radius, normal)
            }
            CollisionGeometry::Plane => (local.z, Vec3::Z),
            CollisionGeometry::Box { half_extents } => {
                let q = local.abs() - half_extents;
                let outside = q.max(Vec3::ZERO);
                let outside_length = outside.length();
                if outside_length > 0.0 {
                    let normal = (outside * local.signum()) / outside_length;
                    (outside_length, normal)
                } else {
                    // Inside: push out through the nearest face.
                    let max_component = q.max_element();
                    let normal = if q.x == max_component {
                        Vec3::new(local.x.signum(), 0.0, 0.0)
                    } else if q.y == max_component {
                        Vec3::new(0.0, local.y.signum(), 0.0)
                    } else {
                        Vec3::new(0.0, 0.0, local.z.signum())
                    };
                    (max_component, normal)
                }
            }
        }
    }

    #[inline(always)]
    pub fn phi(&self, local: Vec3) -> f32 {
        self.phi_with_normal(local).0
    }
}

/// Kinematic colliders the dynamic particles are pushed out of.
///
/// Transforms are written by the collision-kinematic update each step. The previous transforms are a
/// snapshot taken just before that update and are what CCD sweeps start from.
#[derive(Debug, Default)]
pub struct CollisionParticles {
    transforms: Vec<RigidPose>,
    previous_transforms: Vec<RigidPose>,
    geometry: Vec<CollisionGeometry>,
    group_id: Vec<u32>,
    collided: Vec<AtomicBool>,
}

impl CollisionParticles {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.geometry.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.geometry.is_empty()
    }

    /// Adds a collider. Group id 0 collides with every particle, any other id only with particles of that group.
    pub fn add(&mut self, geometry: CollisionGeometry, pose: RigidPose, group_id: u32) -> u32 {
        let index = self.len() as u32;
        self.transforms.push(pose);
        self.previous_transforms.push(pose);
        self.geometry.push(geometry);
        self.group_id.push(group_id);
        self.collided.push(AtomicBool::new(false));
        index
    }

    #[inline(always)]
    pub fn transform(&self, index: u32) -> &RigidPose {
        &self.transforms[index as usize]
    }

    #[inline(always)]
    pub fn previous_transform(&self, index: u32) -> &RigidPose {
        &self.previous_transforms[index as usize]
    }

    #[inline(always)]
    pub fn set_transform(&mut self, index: u32, pose: RigidPose) {
        self.transforms[index as usize] = pose;
    }

    #[inline(always)]
    pub fn geometry(&self, index: u32) -> &CollisionGeometry {
        &self.geometry[index as usize]
    }

    #[inline(always)]
    pub fn group_id(&self, index: u32) -> u32 {
        self.group_id[index as usize]
    }

    /// Whether the collider can touch a particle of `particle_group`.
    #[inline(always)]
    pub fn collides_with_group(&self, index: u32, particle_group: u32) -> bool {
        let group = self.group_id[index as usize];
        group == 0 || group == particle_group
    }

    /// Whether any particle touched this collider during the last step.
    #[inline(always)]
    pub fn collided(&self, index: u32) -> bool {
        self.collided[index as usize].load(Ordering::Relaxed)
    }

    /// Flags the collider as touched. Safe to call from any worker.
    #[inline(always)]
    pub(crate) fn mark_collided(&self, index: u32) {
        self.collided[index as usize].store(true, Ordering::Relaxed);
    }

    /// Copies the current transforms into the CCD sweep start snapshot.
    pub(crate) fn snapshot_transforms(&mut self) {
        self.previous_transforms.copy_from_slice(&self.transforms);
    }

    pub(crate) fn reset_collided(&mut self) {
        for flag in &mut self.collided {
            *flag.get_mut() = false;
        }
    }
}
