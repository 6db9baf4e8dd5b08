use crate::error::DatasetError;
use ndarray::{Array2, ArrayView2, Axis};

// Turn class labels into one row per label, with a 1.0 in the label's column and 0.0 everywhere
// else. This is the shape the loss and accuracy computations compare logits against.
pub fn one_hot(labels: &[usize], n_class: usize) -> Array2<f64> {
    Array2::from_shape_fn((labels.len(), n_class), |(row, class)| {
        if labels[row] == class { 1.0 } else { 0.0 }
    })
}

// The features and one-hot labels sliced out of a dataset for a single training step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: Array2<f64>,
    pub labels: Array2<f64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// An immutable collection of samples: one feature row and one class label per sample. The one-hot
// encoding is computed once up front because every batch and every evaluation needs it.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Array2<f64>,
    labels: Vec<usize>,
    one_hot: Array2<f64>,
    n_class: usize,
}

impl Dataset {
    pub fn new(
        features: Array2<f64>,
        labels: Vec<usize>,
        n_class: usize,
    ) -> Result<Dataset, DatasetError> {
        if features.nrows() != labels.len() {
            return Err(DatasetError::LengthMismatch {
                features: features.nrows(),
                labels: labels.len(),
            });
        }
        if let Some((row, &label)) = labels
            .iter()
            .enumerate()
            .find(|&(_, &label)| label >= n_class)
        {
            return Err(DatasetError::LabelOutOfRange {
                row,
                label,
                n_class,
            });
        }

        let one_hot = one_hot(&labels, n_class);
        Ok(Dataset {
            features,
            labels,
            one_hot,
            n_class,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_class(&self) -> usize {
        self.n_class
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn one_hot_labels(&self) -> ArrayView2<'_, f64> {
        self.one_hot.view()
    }

    // Number of samples carrying each label, indexed by label.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_class];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }

    fn check_indices(&self, indices: &[usize]) -> Result<(), DatasetError> {
        match indices.iter().find(|&&index| index >= self.len()) {
            Some(&index) => Err(DatasetError::IndexOutOfBounds {
                index,
                len: self.len(),
            }),
            None => Ok(()),
        }
    }

    // Slice out the rows named by `indices` (in that order) as a training batch.
    pub fn select(&self, indices: &[usize]) -> Result<Batch, DatasetError> {
        self.check_indices(indices)?;
        Ok(Batch {
            features: self.features.select(Axis(0), indices),
            labels: self.one_hot.select(Axis(0), indices),
        })
    }

    // Build a new dataset out of the rows named by `indices`, e.g. a validation split.
    pub fn subset(&self, indices: &[usize]) -> Result<Dataset, DatasetError> {
        self.check_indices(indices)?;
        Ok(Dataset {
            features: self.features.select(Axis(0), indices),
            labels: indices.iter().map(|&index| self.labels[index]).collect(),
            one_hot: self.one_hot.select(Axis(0), indices),
            n_class: self.n_class,
        })
    }

    // Replace the features wholesale, keeping the labels. Used after scaling.
    pub fn with_features(self, features: Array2<f64>) -> Result<Dataset, DatasetError> {
        Dataset::new(features, self.labels, self.n_class)
    }
}
