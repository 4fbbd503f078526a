use std::{
    fs::File,
    io::{BufRead, BufReader},
    num::NonZeroUsize,
    path::Path,
};

use ndarray::{Array1, Array2};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// A single labeled sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub features: Vec<f32>,
    pub target: f32,
}

/// A batch of examples laid out as a `(rows, features)` matrix and its targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Array2<f32>,
    pub y: Array1<f32>,
}

impl Batch {
    /// Stacks examples into a batch.
    ///
    /// # Arguments
    /// * `examples` - Examples that all have the same amount of features.
    ///
    /// # Returns
    /// The batch or an `MlErr::SizeMismatch` if an example has a different amount of features.
    pub fn from_examples(examples: &[Example]) -> Result<Self> {
        let features = examples.first().map_or(0, |ex| ex.features.len());
        let mut x = Vec::with_capacity(examples.len() * features);

        for ex in examples {
            if ex.features.len() != features {
                return Err(MlErr::SizeMismatch {
                    a: "example",
                    b: "batch",
                    got: ex.features.len(),
                    expected: features,
                });
            }

            x.extend_from_slice(&ex.features);
        }

        let y = examples.iter().map(|ex| ex.target).collect();
        let x = Array2::from_shape_vec((examples.len(), features), x).map_err(|e| {
            MlErr::MalformedExample {
                line: 0,
                detail: e.to_string(),
            }
        })?;

        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// An in-memory set of examples with a fixed amount of features.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: usize,
    examples: Vec<Example>,
}

impl Dataset {
    /// Creates a new `Dataset` checking every example has `features` features.
    ///
    /// # Returns
    /// The dataset or an `MlErr::SizeMismatch` on the first offending example.
    pub fn new(features: usize, examples: Vec<Example>) -> Result<Self> {
        if let Some(ex) = examples.iter().find(|ex| ex.features.len() != features) {
            return Err(MlErr::SizeMismatch {
                a: "example",
                b: "dataset",
                got: ex.features.len(),
                expected: features,
            });
        }

        Ok(Self { features, examples })
    }

    /// Loads a JSON lines file, one `Example` per line. Blank lines are skipped.
    ///
    /// # Arguments
    /// * `path` - The path to the file.
    /// * `features` - The amount of features every example must have.
    ///
    /// # Returns
    /// The dataset or an `MlErr` if the file can't be read or a line is malformed.
    pub fn load(path: impl AsRef<Path>, features: usize) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut examples = Vec::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line?;

            if line.trim().is_empty() {
                continue;
            }

            let example: Example =
                serde_json::from_str(&line).map_err(|e| MlErr::MalformedExample {
                    line: i + 1,
                    detail: e.to_string(),
                })?;

            if example.features.len() != features {
                return Err(MlErr::MalformedExample {
                    line: i + 1,
                    detail: format!(
                        "expected {features} features, got {}",
                        example.features.len()
                    ),
                });
            }

            examples.push(example);
        }

        Ok(Self { features, examples })
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Turns the dataset into a stream of shuffled batches.
    ///
    /// # Arguments
    /// * `batch_size` - The maximum amount of examples per batch, the last batch of an
    ///   epoch may be smaller.
    /// * `epochs` - How many passes over the data to make, `None` streams forever.
    /// * `seed` - An optional seed for the shuffling.
    ///
    /// # Returns
    /// An iterator of batches.
    pub fn batches(
        self,
        batch_size: NonZeroUsize,
        epochs: Option<usize>,
        seed: Option<u64>,
    ) -> Batches {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Batches {
            order: (0..self.examples.len()).collect(),
            dataset: self,
            batch_size,
            remaining_epochs: epochs,
            cursor: 0,
            rng,
        }
    }
}

/// A stream of batches over a `Dataset`, reshuffled every epoch.
pub struct Batches {
    dataset: Dataset,
    order: Vec<usize>,
    batch_size: NonZeroUsize,
    remaining_epochs: Option<usize>,
    cursor: usize,
    rng: StdRng,
}

impl Batches {
    /// Starts a new epoch if the current one is over.
    ///
    /// # Returns
    /// `false` once every epoch was consumed.
    fn ensure_epoch(&mut self) -> bool {
        if self.cursor > 0 && self.cursor < self.order.len() {
            return true;
        }

        match &mut self.remaining_epochs {
            Some(0) => return false,
            Some(n) => *n -= 1,
            None => {}
        }

        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
        true
    }
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dataset.is_empty() || !self.ensure_epoch() {
            return None;
        }

        let end = (self.cursor + self.batch_size.get()).min(self.order.len());
        let features = self.dataset.features;
        let rows = end - self.cursor;
        let mut x = Array2::zeros((rows, features));
        let mut y = Array1::zeros(rows);

        for (row, &i) in self.order[self.cursor..end].iter().enumerate() {
            let ex = &self.dataset.examples[i];
            x.row_mut(row)
                .iter_mut()
                .zip(&ex.features)
                .for_each(|(dst, src)| *dst = *src);
            y[row] = ex.target;
        }

        self.cursor = end;
        Some(Batch { x, y })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn examples(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| Example {
                features: vec![i as f32],
                target: i as f32,
            })
            .collect()
    }

    #[test]
    fn load_skips_blank_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"features": [1.0, 2.0], "target": 3.0}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"features": [4.0, 5.0], "target": 6.0}}"#).unwrap();

        let dataset = Dataset::load(file.path(), 2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.features(), 2);
    }

    #[test]
    fn load_reports_the_offending_line() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"features": [1.0], "target": 3.0}}"#).unwrap();
        writeln!(file, "not json").unwrap();

        let err = Dataset::load(file.path(), 1).unwrap_err();
        assert!(matches!(err, MlErr::MalformedExample { line: 2, .. }));
    }

    #[test]
    fn finite_epochs_end_the_stream() {
        let dataset = Dataset::new(1, examples(5)).unwrap();
        let batch_size = NonZeroUsize::new(2).unwrap();

        let sizes: Vec<_> = dataset
            .batches(batch_size, Some(2), Some(1))
            .map(|batch| batch.len())
            .collect();

        assert_eq!(sizes, [2, 2, 1, 2, 2, 1]);
    }

    #[test]
    fn every_epoch_visits_every_example() {
        let dataset = Dataset::new(1, examples(6)).unwrap();
        let batch_size = NonZeroUsize::new(4).unwrap();

        let mut targets: Vec<f32> = dataset
            .batches(batch_size, Some(1), Some(3))
            .flat_map(|batch| batch.y.to_vec())
            .collect();

        targets.sort_by(f32::total_cmp);
        assert_eq!(targets, [0., 1., 2., 3., 4., 5.]);
    }

    #[test]
    fn unbounded_streams_keep_going() {
        let dataset = Dataset::new(1, examples(1)).unwrap();
        let batch_size = NonZeroUsize::new(1).unwrap();

        assert_eq!(dataset.batches(batch_size, None, None).take(10).count(), 10);
    }

    #[test]
    fn mismatched_examples_are_rejected() {
        let mut examples = examples(2);
        examples[1].features.push(0.);

        assert!(Dataset::new(1, examples.clone()).is_err());
        assert!(Batch::from_examples(&examples).is_err());
    }
}
