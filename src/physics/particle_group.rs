use crate::physics::error::EvolutionError;
use glam::Vec3;
use std::sync::Arc;

/// State handed to a group's custom force rule for one dynamic particle.
#[derive(Debug, Clone, Copy)]
pub struct ForceRuleInput {
    pub index: u32,
    pub x: Vec3,
    pub v: Vec3,
    pub m: f32,
    pub dt: f32,
}

/// Custom per-particle force, added on top of gravity. Invoked from worker threads.
pub type ForceRule = Arc<dyn Fn(&ForceRuleInput) -> Vec3 + Send + Sync>;

/// Samples a velocity field at a world position. Invoked from worker threads.
pub type VelocityFieldSampler = Arc<dyn Fn(Vec3) -> Vec3 + Send + Sync>;

/// Drags particles towards the velocity of a surrounding medium: `F = drag * (field(x) - v)`.
#[derive(Clone)]
pub struct VelocityField {
    pub drag: f32,
    pub sampler: VelocityFieldSampler,
}

impl VelocityField {
    pub fn new(drag: f32, sampler: VelocityFieldSampler) -> Self {
        Self { drag, sampler }
    }

    /// Field velocity constant over space.
    pub fn uniform(drag: f32, velocity: Vec3) -> Self {
        Self::new(drag, Arc::new(move |_: Vec3| velocity))
    }

    #[inline(always)]
    pub fn force(&self, x: Vec3, v: Vec3) -> Vec3 {
        self.drag * ((self.sampler)(x) - v)
    }
}

impl std::fmt::Debug for VelocityField {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VelocityField")
            .field("drag", &self.drag)
            .finish_non_exhaustive()
    }
}

/// Optional pre-iteration features a group has turned on.
///
/// Resolved once per group per dispatch and matched outside the per-particle loop, so each particle
/// runs a kernel with no feature branches in it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct GroupFeatures {
    pub force_rule: bool,
    pub velocity_field: bool,
    pub damping: bool,
}

/// Configuration shared by every particle carrying the same group id.
#[derive(Clone)]
pub struct ParticleGroup {
    /// Gravitational acceleration.
    pub gravity: Vec3,
    /// Fraction of velocity removed per step, in [0, 1]. Zero disables damping.
    pub damping: f32,
    /// Coulomb friction coefficient used against collision particles.
    pub friction: f32,
    /// Distance kept between particles of this group and collision particles.
    pub collision_thickness: f32,
    /// Distance kept between particles of this group by self-collision systems layered on top.
    pub self_collision_thickness: f32,
    /// Sweeps X to P against collision particles instead of only testing P.
    pub use_ccd: bool,
    pub force_rule: Option<ForceRule>,
    pub velocity_field: Option<VelocityField>,
}

impl ParticleGroup {
    /// Standard gravity in centimeters per second squared.
    pub const DEFAULT_GRAVITY: Vec3 = Vec3::new(0.0, 0.0, -980.665);

    #[inline(always)]
    pub fn features(&self) -> GroupFeatures {
        GroupFeatures {
            force_rule: self.force_rule.is_some(),
            velocity_field: self.velocity_field.is_some(),
            damping: self.damping > 0.0,
        }
    }
}

impl Default for ParticleGroup {
    fn default() -> Self {
        Self {
            gravity: Self::DEFAULT_GRAVITY,
            damping: 0.0,
            friction: 0.0,
            collision_thickness: 0.0,
            self_collision_thickness: 0.0,
            use_ccd: false,
            force_rule: None,
            velocity_field: None,
        }
    }
}

impl std::fmt::Debug for ParticleGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ParticleGroup")
            .field("gravity", &self.gravity)
            .field("damping", &self.damping)
            .field("friction", &self.friction)
            .field("collision_thickness", &self.collision_thickness)
            .field("self_collision_thickness", &self.self_collision_thickness)
            .field("use_ccd", &self.use_ccd)
            .field("force_rule", &self.force_rule.is_some())
            .field("velocity_field", &self.velocity_field)
            .finish()
    }
}

/// Per-group configuration table. Grows whenever a group id is first referenced.
#[derive(Debug, Clone, Default)]
pub struct ParticleGroups {
    groups: Vec<ParticleGroup>,
}

impl ParticleGroups {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Makes sure `group_id` exists, creating default-configured groups up to it.
    pub fn ensure(&mut self, group_id: u32) {
        let required = group_id as usize + 1;
        if self.groups.len() < required {
            self.groups.resize_with(required, ParticleGroup::default);
        }
    }

    /// Gets a group that must already exist.
    #[inline(always)]
    pub fn get(&self, group_id: u32) -> &ParticleGroup {
        debug_assert!(
            (group_id as usize) < self.groups.len(),
            "Group {group_id} referenced before creation."
        );
        &self.groups[group_id as usize]
    }

    /// Gets a group that must already exist.
    #[inline(always)]
    pub fn get_mut(&mut self, group_id: u32) -> &mut ParticleGroup {
        debug_assert!(
            (group_id as usize) < self.groups.len(),
            "Group {group_id} referenced before creation."
        );
        &mut self.groups[group_id as usize]
    }

    pub fn try_get(&self, group_id: u32) -> Result<&ParticleGroup, EvolutionError> {
        self.groups
            .get(group_id as usize)
            .ok_or(EvolutionError::UnknownGroup {
                group: group_id,
                group_count: self.groups.len(),
            })
    }

    pub fn try_get_mut(&mut self, group_id: u32) -> Result<&mut ParticleGroup, EvolutionError> {
        let group_count = self.groups.len();
        self.groups
            .get_mut(group_id as usize)
            .ok_or(EvolutionError::UnknownGroup {
                group: group_id,
                group_count,
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParticleGroup> {
        self.groups.iter()
    }
}
