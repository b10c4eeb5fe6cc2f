pub mod collision_particles;
pub mod collision_rule;
pub mod constraint_coloring;
pub mod constraint_graph;
pub mod constraint_rule;
pub mod constraints;
pub mod error;
pub mod evolution;
pub mod handles;
pub mod particle_group;
pub mod particles;
pub mod pose_integrator;
pub mod rigid_pose;
pub mod simulation_profiler;
pub mod solver_config;

pub use collision_particles::{CollisionGeometry, CollisionParticles};
pub use collision_rule::ContactRecord;
pub use constraint_graph::ConstraintGraph;
pub use constraint_rule::{ConstraintRule, IConstraintRule};
pub use error::EvolutionError;
pub use evolution::{CollisionKinematicUpdate, Evolution};
pub use handles::{ConstraintId, GraphEdgeHandle, GraphNodeHandle};
pub use particle_group::{ForceRule, ForceRuleInput, ParticleGroup, ParticleGroups, VelocityField};
pub use particles::{ParticleRange, ParticleStore, ParticleView};
pub use pose_integrator::{KinematicParticle, KinematicUpdate};
pub use rigid_pose::RigidPose;
pub use simulation_profiler::{SimulationProfiler, SolverCounters};
pub use solver_config::{DispatchMode, SolverConfig};
