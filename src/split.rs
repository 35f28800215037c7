//! Dataset Splitter: train/test partitioning

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::ChurnError;

/// How rows are assigned to the held-out partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Seeded sample without replacement
    #[default]
    Random,
    /// The newest rows are held out; input must be sorted by date
    Temporal,
}

/// Rows that can be ordered in time
pub trait Timestamped {
    fn timestamp(&self) -> NaiveDate;
}

/// Partition `rows` into `(train, test)`.
///
/// Both partitions keep the input order. A fraction that rounds to zero test
/// rows yields an empty test set.
pub fn split<T>(
    rows: &[T],
    test_fraction: f64,
    mode: SplitMode,
    seed: u64,
) -> Result<(Vec<T>, Vec<T>), ChurnError>
where
    T: Clone + Timestamped,
{
    if !(0.0..1.0).contains(&test_fraction) {
        return Err(ChurnError::InvalidFraction(test_fraction));
    }

    let n = rows.len();
    match mode {
        SplitMode::Random => {
            let n_test = ((n as f64) * test_fraction).round() as usize;
            let mut rng = StdRng::seed_from_u64(seed);
            let mut held_out = vec![false; n];
            for index in rand::seq::index::sample(&mut rng, n, n_test.min(n)) {
                held_out[index] = true;
            }

            let (mut train, mut test) = (Vec::with_capacity(n - n_test), Vec::with_capacity(n_test));
            for (row, is_test) in rows.iter().zip(held_out) {
                if is_test {
                    test.push(row.clone());
                } else {
                    train.push(row.clone());
                }
            }
            Ok((train, test))
        }
        SplitMode::Temporal => {
            if let Some(row) = rows
                .windows(2)
                .position(|pair| pair[1].timestamp() < pair[0].timestamp())
            {
                return Err(ChurnError::UnsortedInput { row: row + 1 });
            }

            let n_test = ((n as f64) * test_fraction).ceil() as usize;
            let (train, test) = rows.split_at(n - n_test.min(n));
            Ok((train.to_vec(), test.to_vec()))
        }
    }
}
