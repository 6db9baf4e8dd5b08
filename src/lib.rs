pub mod analysis;
pub mod config;
pub mod dataset;
pub mod error;
pub mod mnist;
pub mod model;
pub mod network;
pub mod preprocess;
pub mod stratify;
pub mod trainer;

pub use config::{ExperimentConfig, TrainerConfig};
pub use dataset::{Batch, Dataset};
pub use error::{ConfigError, DatasetError, StratifyError, TrainError};
pub use model::Model;
pub use network::{Architecture, Network, NetworkError};
pub use trainer::{EpochReport, Trainer, TrainingHistory};
