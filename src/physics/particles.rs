use crate::physics::error::EvolutionError;
use crate::utilities::memory::DisjointSlice;
use glam::Vec3;
use std::ops::Range;

/// Contiguous block of particles added together. The unit of activation and of pre/post-iteration dispatch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ParticleRange {
    pub offset: u32,
    pub size: u32,
    pub active: bool,
}

impl ParticleRange {
    #[inline(always)]
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

/// Structure-of-arrays storage of every simulated particle.
///
/// A particle with an inverse mass of zero is kinematic: it is driven by the kinematic update callback and
/// never written by constraint application.
#[derive(Debug, Clone, Default)]
pub struct ParticleStore {
    x: Vec<Vec3>,
    p: Vec<Vec3>,
    v: Vec<Vec3>,
    m: Vec<f32>,
    inv_m: Vec<f32>,
    group_id: Vec<u32>,
    active: Vec<bool>,
    ranges: Vec<ParticleRange>,
}

impl ParticleStore {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Appends `count` active particles with unit mass at the origin. Returns the offset of the first one.
    pub fn add_particles(&mut self, count: u32, group_id: u32) -> u32 {
        let offset = self.len() as u32;
        let new_len = self.len() + count as usize;
        self.x.resize(new_len, Vec3::ZERO);
        self.p.resize(new_len, Vec3::ZERO);
        self.v.resize(new_len, Vec3::ZERO);
        self.m.resize(new_len, 1.0);
        self.inv_m.resize(new_len, 1.0);
        self.group_id.resize(new_len, group_id);
        self.active.resize(new_len, true);
        self.ranges.push(ParticleRange {
            offset,
            size: count,
            active: true,
        });
        offset
    }

    /// Activates or deactivates the range starting at `offset`. Returns false if no range starts there.
    pub fn activate_particle_range(&mut self, offset: u32, active: bool) -> bool {
        let Some(range) = self.ranges.iter_mut().find(|range| range.offset == offset) else {
            return false;
        };
        range.active = active;
        let span = range.range();
        self.active[span].iter_mut().for_each(|flag| *flag = active);
        true
    }

    #[inline(always)]
    pub fn ranges(&self) -> &[ParticleRange] {
        &self.ranges
    }

    /// Gets the active ranges.
    pub fn active_ranges(&self) -> impl Iterator<Item = &ParticleRange> {
        self.ranges.iter().filter(|range| range.active)
    }

    /// Whether `index` names an existing, active particle.
    #[inline(always)]
    pub fn is_valid(&self, index: u32) -> bool {
        self.active.get(index as usize).copied().unwrap_or(false)
    }

    #[inline(always)]
    pub fn is_kinematic(&self, index: u32) -> bool {
        self.inv_m[index as usize] == 0.0
    }

    /// Sets the mass of a particle. A non-positive or non-finite mass makes it kinematic.
    pub fn set_mass(&mut self, index: u32, mass: f32) {
        let i = index as usize;
        if mass > 0.0 && mass.is_finite() {
            self.m[i] = mass;
            self.inv_m[i] = 1.0 / mass;
        } else {
            self.m[i] = 0.0;
            self.inv_m[i] = 0.0;
        }
    }

    #[inline(always)]
    pub fn set_kinematic(&mut self, index: u32) {
        self.set_mass(index, 0.0);
    }

    /// Sets the current position and resets the predicted position to it.
    pub fn set_position(&mut self, index: u32, position: Vec3) {
        self.x[index as usize] = position;
        self.p[index as usize] = position;
    }

    #[inline(always)]
    pub fn set_velocity(&mut self, index: u32, velocity: Vec3) {
        self.v[index as usize] = velocity;
    }

    pub fn try_position(&self, index: u32) -> Result<Vec3, EvolutionError> {
        self.x
            .get(index as usize)
            .copied()
            .ok_or(EvolutionError::ParticleOutOfRange {
                index,
                count: self.len(),
            })
    }

    #[inline(always)]
    pub fn x(&self) -> &[Vec3] {
        &self.x
    }

    #[inline(always)]
    pub fn p(&self) -> &[Vec3] {
        &self.p
    }

    #[inline(always)]
    pub fn v(&self) -> &[Vec3] {
        &self.v
    }

    #[inline(always)]
    pub fn m(&self) -> &[f32] {
        &self.m
    }

    #[inline(always)]
    pub fn inv_m(&self) -> &[f32] {
        &self.inv_m
    }

    #[inline(always)]
    pub fn group_id(&self) -> &[u32] {
        &self.group_id
    }

    #[inline(always)]
    pub fn p_mut(&mut self) -> &mut [Vec3] {
        &mut self.p
    }

    /// Splits the store into the pieces the integration kernels need at once.
    pub(crate) fn integration_state(&mut self) -> IntegrationState<'_> {
        IntegrationState {
            x: DisjointSlice::new(&mut self.x),
            p: DisjointSlice::new(&mut self.p),
            v: DisjointSlice::new(&mut self.v),
            m: &self.m,
            inv_m: &self.inv_m,
            group_id: &self.group_id,
        }
    }

    /// Gets the solver's view of the predicted positions.
    pub fn view(&mut self) -> ParticleView<'_> {
        ParticleView {
            x: &self.x,
            p: DisjointSlice::new(&mut self.p),
            inv_m: &self.inv_m,
            group_id: &self.group_id,
            ranges: &self.ranges,
        }
    }
}

/// Per-particle arrays shared across workers during pre- and post-iteration updates.
/// Each worker only touches the particle range it claimed.
pub(crate) struct IntegrationState<'a> {
    pub x: DisjointSlice<'a, Vec3>,
    pub p: DisjointSlice<'a, Vec3>,
    pub v: DisjointSlice<'a, Vec3>,
    pub m: &'a [f32],
    pub inv_m: &'a [f32],
    pub group_id: &'a [u32],
}

/// Shared-mutable view of predicted positions used while solving constraints.
///
/// Writes are only permitted to dynamic particles, and only by the single work unit that owns them for the
/// current bucket. Kinematic particles are read-only, which is what lets same-colored constraints share them.
pub struct ParticleView<'a> {
    x: &'a [Vec3],
    p: DisjointSlice<'a, Vec3>,
    inv_m: &'a [f32],
    group_id: &'a [u32],
    ranges: &'a [ParticleRange],
}

impl ParticleView<'_> {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.inv_m.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.inv_m.is_empty()
    }

    /// Position at the start of the step.
    #[inline(always)]
    pub fn x(&self, index: u32) -> Vec3 {
        self.x[index as usize]
    }

    /// Predicted position.
    #[inline(always)]
    pub fn p(&self, index: u32) -> Vec3 {
        // SAFETY: the scheduling partition guarantees nobody else writes this particle right now.
        unsafe { *self.p.get(index as usize) }
    }

    #[inline(always)]
    pub fn inv_m(&self, index: u32) -> f32 {
        self.inv_m[index as usize]
    }

    #[inline(always)]
    pub fn group_id(&self, index: u32) -> u32 {
        self.group_id[index as usize]
    }

    pub fn active_ranges(&self) -> impl Iterator<Item = &ParticleRange> {
        self.ranges.iter().filter(|range| range.active)
    }

    /// Moves a dynamic particle's predicted position by `delta`. Kinematic particles are left untouched.
    ///
    /// # Safety
    /// The caller must be the only work unit touching `index` in the current bucket.
    #[inline(always)]
    pub unsafe fn add_to_p(&self, index: u32, delta: Vec3) {
        if self.inv_m[index as usize] != 0.0 {
            *self.p.get_mut(index as usize) += delta;
        }
    }

    /// Overwrites a dynamic particle's predicted position. Kinematic particles are left untouched.
    ///
    /// # Safety
    /// The caller must be the only work unit touching `index` in the current bucket.
    #[inline(always)]
    pub unsafe fn set_p(&self, index: u32, value: Vec3) {
        if self.inv_m[index as usize] != 0.0 {
            *self.p.get_mut(index as usize) = value;
        }
    }
}
