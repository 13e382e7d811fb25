use crate::constants::{DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE, Z_95};
use crate::error::RankingError;

/// One row of an answer log: a forced choice between two options and the
/// responder's raw answer.
///
/// The answer counts as a win only if, after trimming, it equals one of the
/// two options exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnswerRow {
    pub option_a: String,
    pub option_b: String,
    pub answer: String,
}

impl AnswerRow {
    pub fn new(option_a: impl Into<String>, option_b: impl Into<String>, answer: impl Into<String>) -> Self {
        AnswerRow {
            option_a: option_a.into(),
            option_b: option_b.into(),
            answer: answer.into(),
        }
    }
}

/// Why a log row did not contribute a win.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum WarningKind {
    /// The answer matched neither option. The contest is still counted.
    AnswerMatchesNeither { answer: String },
    /// Both sides name the same option. The row is ignored entirely.
    SelfComparison,
}

/// A data-validation finding for one answer-log row (0-based row index).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValidationWarning {
    pub row: usize,
    pub option_a: String,
    pub option_b: String,
    pub kind: WarningKind,
}

/// How an option's ability came out of the fixed-point solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AbilityStatus {
    /// Positive ability estimated from at least one recorded win.
    Estimated,
    /// Compared at least once but never won: the MLE sits on the zero boundary.
    NoWins,
    /// Never compared against any other option.
    NeverCompared,
}

/// Standard error and 95% bounds for one option, on both scales.
///
/// Log-scale bounds are symmetric around `beta`; the ability-scale bounds are
/// their exponentials and therefore asymmetric around `relative_ability`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interval {
    pub standard_error: f64,
    pub beta_lower: f64,
    pub beta_upper: f64,
    pub ability_lower: f64,
    pub ability_upper: f64,
}

/// One option in the final report.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RankedOption {
    pub option: String,
    /// Normalized Bradley-Terry ability; abilities of one report sum to 1.
    pub ability: f64,
    pub status: AbilityStatus,
    /// Log ability relative to the reference option. `None` when `ability == 0`.
    pub beta: Option<f64>,
    /// `exp(beta)`: ability relative to the reference option.
    pub relative_ability: Option<f64>,
    /// `None` when the interval is not computable for this option.
    pub interval: Option<Interval>,
    pub is_reference: bool,
    pub wins: u64,
    pub contests: u64,
}

/// Why covariance could not be obtained for some options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SingularReason {
    /// The options have zero ability (never compared or never won), so their
    /// rows of the observed information are empty.
    ZeroAbility,
    /// The comparison graph over positive-ability options is disconnected.
    DisconnectedGraph,
    /// The reduced information matrix could not be inverted numerically.
    NotInvertible,
}

/// A numerical condition attached to an otherwise usable report.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "condition", rename_all = "snake_case"))]
pub enum RankingCondition {
    /// The fixed-point iteration hit its sweep cap before meeting the tolerance.
    NotConverged { iterations: usize, max_change: f64 },
    /// Confidence intervals are not computable for the listed options.
    SingularCovariance { options: Vec<String>, reason: SingularReason },
}

/// Tuning knobs for `rank_answers()`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RankingOptions {
    /// Convergence threshold on the largest ability change between sweeps (e.g. 1e-8).
    pub tolerance: f64,
    /// Maximum number of fixed-point sweeps (e.g. 10000).
    pub max_iterations: usize,
    /// Normal quantile for the two-sided bounds (1.96 for 95%).
    pub z_score: f64,
}

impl Default for RankingOptions {
    fn default() -> Self {
        RankingOptions {
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            z_score: Z_95,
        }
    }
}

/// Result of `rank_answers()`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RankingReport {
    /// Options sorted by ability, descending. Ties keep sorted option order.
    pub rankings: Vec<RankedOption>,
    /// The option whose log ability is fixed to zero, if any option has positive ability.
    pub reference: Option<String>,
    /// Fixed-point sweeps performed.
    pub iterations: usize,
    pub total_contests: u64,
    pub total_wins: u64,
    pub conditions: Vec<RankingCondition>,
    pub warnings: Vec<ValidationWarning>,
}

impl RankingReport {
    /// True if the solver met its tolerance.
    pub fn converged(&self) -> bool {
        !self
            .conditions
            .iter()
            .any(|c| matches!(c, RankingCondition::NotConverged { .. }))
    }

    /// True if every option has a computable interval.
    pub fn intervals_complete(&self) -> bool {
        !self
            .conditions
            .iter()
            .any(|c| matches!(c, RankingCondition::SingularCovariance { .. }))
    }

    /// Escalate a `NotConverged` condition into an error.
    pub fn ensure_converged(&self) -> Result<(), RankingError> {
        for condition in &self.conditions {
            if let RankingCondition::NotConverged { iterations, max_change } = *condition {
                return Err(RankingError::NotConverged { iterations, max_change });
            }
        }
        Ok(())
    }

    pub fn get(&self, option: &str) -> Option<&RankedOption> {
        self.rankings.iter().find(|r| r.option == option)
    }
}
