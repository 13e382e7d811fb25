/// pairpoll-core: Pure-computation ranking of forced-choice answer logs.
///
/// Answer log → contest matrix → Bradley-Terry abilities → asymptotic confidence
/// intervals. No IO here: collecting the answers is the caller's job.
///
/// Options are identified by their text. The crate sorts them lexicographically
/// for indexing, so the same log always produces the same matrix.
///
/// # Quick start
///
/// ```rust
/// use pairpoll_core::{rank_answers, AnswerRow, RankingOptions};
///
/// let log = vec![
///     AnswerRow::new("Jollof Rice", "Pepperoni Pizza", "Jollof Rice"),
///     AnswerRow::new("Pepperoni Pizza", "Jollof Rice", "Jollof Rice"),
///     AnswerRow::new("Jollof Rice", "Pepperoni Pizza", "Pepperoni Pizza"),
/// ];
///
/// let report = rank_answers(&log, &RankingOptions::default()).unwrap();
///
/// for r in &report.rankings {
///     match r.interval {
///         Some(ci) => println!("{}: {:.4} [{:.4}, {:.4}]", r.option, r.ability, ci.ability_lower, ci.ability_upper),
///         None => println!("{}: {:.4} (interval not computable)", r.option, r.ability),
///     }
/// }
/// ```

pub mod aggregate;
pub mod bradley_terry;
pub mod constants;
pub mod error;
pub mod ranking;
pub mod types;
pub mod uncertainty;

// Re-export primary public API at crate root.
pub use aggregate::{Aggregation, ContestMatrix};
pub use bradley_terry::{fit, BradleyTerry, Convergence, Fit};
pub use error::RankingError;
pub use ranking::{rank_answers, rank_matrix};
pub use types::{
    AbilityStatus, AnswerRow, Interval, RankedOption, RankingCondition, RankingOptions, RankingReport,
    SingularReason, ValidationWarning, WarningKind,
};
pub use uncertainty::{Uncertainty, UncertaintyEstimator};
