use thiserror::Error;

/// Errors reported by the configuration surface of the evolution.
///
/// Nothing inside a step returns these. Per-substep failures (invalid topology, numerical degeneracies)
/// are skipped or clamped instead, so the hot path never branches on a `Result`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvolutionError {
    #[error("iteration count must be at least 1, got {0}")]
    InvalidIterationCount(u32),
    #[error("dt smoothing factor must be in (0, 1], got {0}")]
    InvalidSmoothingFactor(f32),
    #[error("minimum parallel batch size must be at least 1")]
    InvalidBatchSize,
    #[error("group {group} has not been created (group count {group_count})")]
    UnknownGroup { group: u32, group_count: usize },
    #[error("particle {index} is out of range (particle count {count})")]
    ParticleOutOfRange { index: u32, count: usize },
    #[error("time step must be finite and positive, got {0}")]
    InvalidTimeStep(f32),
}
