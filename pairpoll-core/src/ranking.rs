/// One-call ranking: answer log -> contest matrix -> abilities -> intervals.
///
/// Pure function, no IO. Validation warnings and numerical conditions travel
/// on the report rather than aborting the run.
use crate::aggregate::{Aggregation, ContestMatrix};
use crate::bradley_terry::{fit, Convergence};
use crate::error::RankingError;
use crate::types::{AnswerRow, RankedOption, RankingCondition, RankingOptions, RankingReport};
use crate::uncertainty::UncertaintyEstimator;

/// Rank every option that appears in `rows`.
pub fn rank_answers(rows: &[AnswerRow], options: &RankingOptions) -> Result<RankingReport, RankingError> {
    let Aggregation { matrix, warnings } = ContestMatrix::from_log(rows);
    let mut report = rank_matrix(&matrix, options)?;
    report.warnings = warnings;
    Ok(report)
}

/// Rank a pre-built contest matrix.
pub fn rank_matrix(matrix: &ContestMatrix, options: &RankingOptions) -> Result<RankingReport, RankingError> {
    let fit = fit(matrix, options.tolerance, options.max_iterations)?;
    let uncertainty = UncertaintyEstimator::new(matrix, &fit.abilities, options.z_score).estimate();

    let mut conditions = Vec::new();
    if let Convergence::IterationLimit { iterations, max_change } = fit.convergence {
        conditions.push(RankingCondition::NotConverged { iterations, max_change });
    }
    for (reason, indices) in &uncertainty.singular {
        conditions.push(RankingCondition::SingularCovariance {
            options: indices.iter().map(|&i| matrix.options()[i].clone()).collect(),
            reason: *reason,
        });
    }

    let mut rankings: Vec<RankedOption> = matrix
        .options()
        .iter()
        .enumerate()
        .map(|(i, option)| RankedOption {
            option: option.clone(),
            ability: fit.abilities[i],
            status: fit.statuses[i],
            beta: uncertainty.betas[i],
            relative_ability: uncertainty.betas[i].map(f64::exp),
            interval: uncertainty.intervals[i],
            is_reference: uncertainty.reference == Some(i),
            wins: matrix.wins()[i],
            contests: matrix.contests_of(i),
        })
        .collect();

    // Stable sort keeps lexicographic order among ties.
    rankings.sort_by(|a, b| b.ability.total_cmp(&a.ability));

    Ok(RankingReport {
        rankings,
        reference: uncertainty.reference.map(|i| matrix.options()[i].clone()),
        iterations: fit.convergence.iterations(),
        total_contests: matrix.total_contests(),
        total_wins: matrix.total_wins(),
        conditions,
        warnings: Vec::new(),
    })
}
