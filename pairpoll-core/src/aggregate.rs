/// Reduce an answer log into win counts and a symmetric contest matrix.
///
/// Options are indexed in lexicographic order so repeated runs over the same
/// log produce identical matrices.
use std::collections::{BTreeSet, HashMap};

use crate::types::{AnswerRow, ValidationWarning, WarningKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContestMatrix {
    /// Sorted option universe; position is the option's index.
    options: Vec<String>,
    index: HashMap<String, usize>,
    /// wins[i] = recorded wins of option i.
    wins: Vec<u64>,
    /// contests[i][j] = number of times i and j were compared. Always symmetric.
    contests: Vec<Vec<u64>>,
}

/// Output of `ContestMatrix::from_log`.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub matrix: ContestMatrix,
    pub warnings: Vec<ValidationWarning>,
}

impl ContestMatrix {
    /// Empty matrix over the given options (deduplicated and sorted).
    pub fn with_options<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options: Vec<String> = options
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let n = options.len();
        let index = options
            .iter()
            .enumerate()
            .map(|(i, o)| (o.clone(), i))
            .collect();

        ContestMatrix {
            options,
            index,
            wins: vec![0; n],
            contests: vec![vec![0; n]; n],
        }
    }

    /// Build the matrix from an answer log. Options, and the answer, are
    /// compared after trimming surrounding whitespace.
    pub fn from_log(rows: &[AnswerRow]) -> Aggregation {
        let mut matrix = ContestMatrix::with_options(
            rows.iter()
                .flat_map(|r| [r.option_a.trim(), r.option_b.trim()]),
        );
        let mut warnings = Vec::new();

        for (row_idx, row) in rows.iter().enumerate() {
            let a = row.option_a.trim();
            let b = row.option_b.trim();
            let answer = row.answer.trim();

            if a == b {
                warnings.push(ValidationWarning {
                    row: row_idx,
                    option_a: a.to_string(),
                    option_b: b.to_string(),
                    kind: WarningKind::SelfComparison,
                });
                continue;
            }

            let i = matrix.index[a];
            let j = matrix.index[b];
            matrix.record_contest(i, j);

            if answer == a {
                matrix.wins[i] += 1;
            } else if answer == b {
                matrix.wins[j] += 1;
            } else {
                warnings.push(ValidationWarning {
                    row: row_idx,
                    option_a: a.to_string(),
                    option_b: b.to_string(),
                    kind: WarningKind::AnswerMatchesNeither {
                        answer: answer.to_string(),
                    },
                });
            }
        }

        Aggregation { matrix, warnings }
    }

    fn record_contest(&mut self, i: usize, j: usize) {
        self.contests[i][j] += 1;
        self.contests[j][i] += 1;
    }

    /// Record `count` contests between `winner` and `loser`, all won by `winner`.
    /// Panics on unknown options.
    #[cfg(test)]
    pub(crate) fn record_wins(&mut self, winner: &str, loser: &str, count: u64) {
        let i = *self
            .index
            .get(winner)
            .unwrap_or_else(|| panic!("Unknown option: {winner}"));
        let j = *self
            .index
            .get(loser)
            .unwrap_or_else(|| panic!("Unknown option: {loser}"));
        assert_ne!(i, j, "An option cannot be compared with itself: {winner}");
        self.contests[i][j] += count;
        self.contests[j][i] += count;
        self.wins[i] += count;
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn index_of(&self, option: &str) -> Option<usize> {
        self.index.get(option).copied()
    }

    pub fn wins(&self) -> &[u64] {
        &self.wins
    }

    pub fn contests(&self, i: usize, j: usize) -> u64 {
        self.contests[i][j]
    }

    /// Total contests option `i` took part in.
    pub fn contests_of(&self, i: usize) -> u64 {
        self.contests[i].iter().sum()
    }

    /// Sum over i < j of contests[i][j].
    pub fn total_contests(&self) -> u64 {
        (0..self.len())
            .map(|i| self.contests[i][i + 1..].iter().sum::<u64>())
            .sum()
    }

    pub fn total_wins(&self) -> u64 {
        self.wins.iter().sum()
    }
}
