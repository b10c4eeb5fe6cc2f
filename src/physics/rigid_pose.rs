use glam::{Quat, Vec3};

/// Represents a rigid transformation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidPose {
    /// Orientation of the pose.
    pub orientation: Quat,
    /// Position of the pose.
    pub position: Vec3,
}

impl Default for RigidPose {
    #[inline(always)]
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl RigidPose {
    /// Returns a pose with a position at (0,0,0) and identity orientation.
    pub const IDENTITY: Self = Self {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    /// Creates a rigid pose with the given position and orientation.
    #[inline(always)]
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Creates a rigid pose with the given position and identity orientation.
    #[inline(always)]
    pub fn from_position(position: Vec3) -> Self {
        Self::new(position, Quat::IDENTITY)
    }

    /// Transforms a local point into world space.
    #[inline(always)]
    pub fn transform(&self, local: Vec3) -> Vec3 {
        self.orientation * local + self.position
    }

    /// Transforms a world point into the pose's local space.
    #[inline(always)]
    pub fn inverse_transform(&self, world: Vec3) -> Vec3 {
        self.orientation.inverse() * (world - self.position)
    }

    /// Rotates a local direction into world space.
    #[inline(always)]
    pub fn transform_vector(&self, local: Vec3) -> Vec3 {
        self.orientation * local
    }
}
