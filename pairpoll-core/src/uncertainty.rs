/// Asymptotic confidence intervals for fitted Bradley-Terry abilities.
///
/// Works on the log scale `beta_i = ln(pi_i) - ln(pi_ref)`. The Hessian of the
/// log-likelihood at `beta` is
///
/// ```text
/// H[i][j] = n_ij * e^bi * e^bj / (e^bi + e^bj)^2     (i != j)
/// H[i][i] = -sum_{j != i} H[i][j]
/// ```
///
/// Dropping the reference row/column leaves the observed information `-H_reduced`,
/// whose inverse is the covariance of the free parameters.
///
/// Options with zero ability have no finite `beta`; they are excluded from the
/// matrix and reported as not computable.
use std::collections::VecDeque;

use nalgebra::DMatrix;

use crate::aggregate::ContestMatrix;
use crate::types::{Interval, SingularReason};

/// Per-option log-scale estimates, indexed like the matrix options.
#[derive(Debug, Clone)]
pub struct Uncertainty {
    /// Index of the reference option (`beta == 0`), if any option has positive ability.
    pub reference: Option<usize>,
    pub betas: Vec<Option<f64>>,
    pub intervals: Vec<Option<Interval>>,
    /// Options whose interval is not computable, grouped by cause.
    pub singular: Vec<(SingularReason, Vec<usize>)>,
}

pub struct UncertaintyEstimator<'a> {
    matrix: &'a ContestMatrix,
    abilities: &'a [f64],
    z_score: f64,
}

impl<'a> UncertaintyEstimator<'a> {
    pub fn new(matrix: &'a ContestMatrix, abilities: &'a [f64], z_score: f64) -> Self {
        assert_eq!(
            matrix.len(),
            abilities.len(),
            "abilities must be indexed like the contest matrix"
        );
        UncertaintyEstimator { matrix, abilities, z_score }
    }

    fn interval(&self, beta: f64, standard_error: f64) -> Interval {
        let beta_lower = beta - self.z_score * standard_error;
        let beta_upper = beta + self.z_score * standard_error;
        Interval {
            standard_error,
            beta_lower,
            beta_upper,
            ability_lower: beta_lower.exp(),
            ability_upper: beta_upper.exp(),
        }
    }

    /// Hessian of the log-likelihood over the `active` options at `betas`.
    fn hessian(&self, active: &[usize], betas: &[f64]) -> DMatrix<f64> {
        let m = active.len();
        let exp_beta: Vec<f64> = betas.iter().map(|b| b.exp()).collect();
        let mut hessian = DMatrix::zeros(m, m);

        for a in 0..m {
            let mut row_sum = 0.0;
            for b in 0..m {
                if a == b {
                    continue;
                }
                let contests = self.matrix.contests(active[a], active[b]);
                if contests == 0 {
                    continue;
                }
                let sum = exp_beta[a] + exp_beta[b];
                let term = contests as f64 * exp_beta[a] * exp_beta[b] / (sum * sum);
                hessian[(a, b)] = term;
                row_sum += term;
            }
            hessian[(a, a)] = -row_sum;
        }

        hessian
    }

    /// True if every active option is reachable from the first through
    /// pairs with at least one contest.
    fn connected(&self, active: &[usize]) -> bool {
        if active.is_empty() {
            return true;
        }
        let mut seen = vec![false; active.len()];
        let mut queue = VecDeque::from([0usize]);
        seen[0] = true;

        while let Some(a) = queue.pop_front() {
            for b in 0..active.len() {
                if !seen[b] && self.matrix.contests(active[a], active[b]) > 0 {
                    seen[b] = true;
                    queue.push_back(b);
                }
            }
        }

        seen.into_iter().all(|s| s)
    }

    pub fn estimate(&self) -> Uncertainty {
        let n = self.matrix.len();
        let mut betas = vec![None; n];
        let mut intervals = vec![None; n];
        let mut singular = Vec::new();

        // Options with positive ability, in sorted option order.
        let active: Vec<usize> = (0..n).filter(|&i| self.abilities[i] > 0.0).collect();
        let zero: Vec<usize> = (0..n).filter(|&i| self.abilities[i] <= 0.0).collect();
        if !zero.is_empty() {
            singular.push((SingularReason::ZeroAbility, zero));
        }

        let Some(&reference) = active.first() else {
            return Uncertainty { reference: None, betas, intervals, singular };
        };

        let log_ref = self.abilities[reference].ln();
        let active_betas: Vec<f64> = active
            .iter()
            .map(|&i| self.abilities[i].ln() - log_ref)
            .collect();
        for (k, &i) in active.iter().enumerate() {
            betas[i] = Some(active_betas[k]);
        }

        // The reference is fixed, so it carries no variance.
        intervals[reference] = Some(self.interval(0.0, 0.0));

        let free = &active[1..];
        if free.is_empty() {
            return Uncertainty { reference: Some(reference), betas, intervals, singular };
        }

        if !self.connected(&active) {
            singular.push((SingularReason::DisconnectedGraph, free.to_vec()));
            return Uncertainty { reference: Some(reference), betas, intervals, singular };
        }

        let hessian = self.hessian(&active, &active_betas);
        let m = free.len();
        let information = -hessian.view((1, 1), (m, m)).clone_owned();

        let covariance = information
            .try_inverse()
            .filter(|cov| (0..m).all(|k| cov[(k, k)].is_finite() && cov[(k, k)] > 0.0));

        match covariance {
            Some(cov) => {
                for (k, &i) in free.iter().enumerate() {
                    let se = cov[(k, k)].sqrt();
                    intervals[i] = Some(self.interval(active_betas[k + 1], se));
                }
            }
            None => singular.push((SingularReason::NotInvertible, free.to_vec())),
        }

        Uncertainty { reference: Some(reference), betas, intervals, singular }
    }
}
