use thiserror::Error;

/// Failures that leave no usable ranking at all.
///
/// Conditions that still allow a ranking (non-convergence, singular
/// covariance) are reported as `RankingCondition`s instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RankingError {
    #[error("answer log contains no comparable options")]
    EmptyLog,
    #[error("answer log contains no valid wins; abilities cannot be normalized")]
    NoValidWins,
    #[error("max_iterations must be at least 1")]
    ZeroIterations,
    #[error("Bradley-Terry iteration did not converge after {iterations} sweeps (max change {max_change:e})")]
    NotConverged { iterations: usize, max_change: f64 },
}
