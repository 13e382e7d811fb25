/// Fixed-point maximum likelihood estimation for the Bradley-Terry model.
///
/// P(i beats j) = pi_i / (pi_i + pi_j). Each sweep applies
/// `pi_i <- wins_i / sum_{j != i} contests[i][j] / (pi_i + pi_j)` to every option
/// using the previous sweep's abilities, then rescales so the abilities sum to 1.
use crate::aggregate::ContestMatrix;
use crate::constants::INITIAL_ABILITY;
use crate::error::RankingError;
use crate::types::AbilityStatus;

/// Whether the solver met its tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Convergence {
    Converged { iterations: usize },
    IterationLimit { iterations: usize, max_change: f64 },
}

impl Convergence {
    pub fn iterations(&self) -> usize {
        match *self {
            Convergence::Converged { iterations } => iterations,
            Convergence::IterationLimit { iterations, .. } => iterations,
        }
    }
}

/// Fitted abilities, indexed like the matrix options.
#[derive(Debug, Clone)]
pub struct Fit {
    pub abilities: Vec<f64>,
    pub statuses: Vec<AbilityStatus>,
    pub convergence: Convergence,
}

pub struct BradleyTerry<'a> {
    matrix: &'a ContestMatrix,
    /// Current abilities, normalized after every sweep.
    pub abilities: Vec<f64>,
}

impl<'a> BradleyTerry<'a> {
    pub fn new(matrix: &'a ContestMatrix) -> Self {
        BradleyTerry {
            matrix,
            abilities: vec![INITIAL_ABILITY; matrix.len()],
        }
    }

    fn run_iteration(&self) -> Vec<f64> {
        let n = self.matrix.len();
        let wins = self.matrix.wins();
        let mut next = vec![0.0; n];

        for i in 0..n {
            if wins[i] == 0 {
                continue;
            }

            let pi_i = self.abilities[i];
            let mut denominator = 0.0;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let contests = self.matrix.contests(i, j);
                let pair = pi_i + self.abilities[j];
                if contests > 0 && pair > 0.0 {
                    denominator += contests as f64 / pair;
                }
            }

            // A zero denominator leaves pi_i at 0.
            if denominator > 0.0 {
                next[i] = wins[i] as f64 / denominator;
            }
        }

        next
    }

    /// Rescale so the abilities sum to 1. Returns false if every ability is zero.
    fn normalize(abilities: &mut [f64]) -> bool {
        let total: f64 = abilities.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return false;
        }
        for a in abilities.iter_mut() {
            *a /= total;
        }
        true
    }

    /// Iterate until the largest ability change drops below `tolerance` or
    /// `max_iterations` sweeps have run.
    pub fn calculate_abilities(&mut self, tolerance: f64, max_iterations: usize) -> Result<Convergence, RankingError> {
        // Without a sweep the uniform start would give never-compared options a positive ability.
        if max_iterations == 0 {
            return Err(RankingError::ZeroIterations);
        }
        if self.matrix.is_empty() {
            return Err(RankingError::EmptyLog);
        }
        if self.matrix.total_wins() == 0 {
            return Err(RankingError::NoValidWins);
        }

        Self::normalize(&mut self.abilities);
        let mut max_change = f64::INFINITY;

        for iteration in 1..=max_iterations {
            let mut next = self.run_iteration();
            if !Self::normalize(&mut next) {
                return Err(RankingError::NoValidWins);
            }

            max_change = next
                .iter()
                .zip(self.abilities.iter())
                .map(|(new, old)| (new - old).abs())
                .fold(0.0_f64, f64::max);
            self.abilities = next;

            if max_change < tolerance {
                return Ok(Convergence::Converged { iterations: iteration });
            }
        }

        Ok(Convergence::IterationLimit {
            iterations: max_iterations,
            max_change,
        })
    }

    /// Classify each option's ability.
    pub fn statuses(&self) -> Vec<AbilityStatus> {
        (0..self.matrix.len())
            .map(|i| {
                if self.matrix.contests_of(i) == 0 {
                    AbilityStatus::NeverCompared
                } else if self.abilities[i] > 0.0 {
                    AbilityStatus::Estimated
                } else {
                    AbilityStatus::NoWins
                }
            })
            .collect()
    }
}

/// Fit abilities for a matrix in one call.
pub fn fit(matrix: &ContestMatrix, tolerance: f64, max_iterations: usize) -> Result<Fit, RankingError> {
    let mut bt = BradleyTerry::new(matrix);
    let convergence = bt.calculate_abilities(tolerance, max_iterations)?;
    let statuses = bt.statuses();

    Ok(Fit {
        abilities: bt.abilities,
        statuses,
        convergence,
    })
}
