/// Initial Bradley-Terry ability assigned to every option before the first sweep.
/// Any positive constant works; the first renormalization removes the scale.
pub const INITIAL_ABILITY: f64 = 1.0;

/// Default convergence threshold on the largest per-option ability change
/// between two consecutive (normalized) sweeps.
pub const DEFAULT_TOLERANCE: f64 = 1e-8;

/// Default cap on fixed-point sweeps. Reaching it without meeting the tolerance
/// is reported as a `NotConverged` condition on the ranking report.
pub const DEFAULT_MAX_ITERATIONS: usize = 10_000;

/// Two-sided 95% normal quantile used for the log-scale confidence bounds.
pub const Z_95: f64 = 1.96;
