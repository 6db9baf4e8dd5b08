use std::{io, path::PathBuf};
use thiserror::Error;

// Failures while partitioning an index set into stratified folds or splits.
#[derive(Debug, Error, PartialEq)]
pub enum StratifyError {
    #[error("cannot partition into zero folds")]
    ZeroFolds,

    #[error("cannot partition {examples} examples into {folds} folds")]
    TooFewExamples { examples: usize, folds: usize },

    #[error("class {class} has {count} examples, fewer than the {folds} folds requested")]
    ClassTooSmall {
        class: usize,
        count: usize,
        folds: usize,
    },

    #[error("split fraction {0} must lie strictly between 0 and 1")]
    InvalidFraction(f64),

    #[error("label {label} is outside the label set of {n_class} classes")]
    LabelOutOfRange { label: usize, n_class: usize },
}

// Problems with the trainer configuration. These are all detected before the first training step.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("target batch size must be at least 1")]
    ZeroBatchSize,

    #[error("epoch count must be at least 1")]
    ZeroEpochs,

    #[error("report interval must be at least 1")]
    ZeroReportInterval,

    #[error("training set is empty")]
    EmptyDataset,

    #[error("{examples} examples yield no batches of target size {target_batch_size}")]
    NoBatches {
        examples: usize,
        target_batch_size: usize,
    },

    #[error(transparent)]
    Stratify(#[from] StratifyError),
}

// Everything the trainer can fail with. Model errors are passed through as-is.
#[derive(Debug, Error)]
pub enum TrainError<E> {
    #[error("invalid training configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DatasetError),

    #[error("model failed during training")]
    Model(#[source] E),
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{features} feature rows but {labels} labels")]
    LengthMismatch { features: usize, labels: usize },

    #[error("label {label} at row {row} is outside the label set of {n_class} classes")]
    LabelOutOfRange {
        row: usize,
        label: usize,
        n_class: usize,
    },

    #[error("index {index} is out of bounds for a dataset of {len} samples")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("malformed data file {}: {message}", path.display())]
    Format { path: PathBuf, message: String },
}
