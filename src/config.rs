use crate::error::ConfigError;
use crate::network::Architecture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fs, io, path::Path};
use thiserror::Error;

// Knobs for the stratified mini-batch trainer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    // Only used to derive how many batches an epoch is split into.
    pub target_batch_size: usize,
    pub epoch_count: usize,
    // Progress is reported every this many epochs, and always after the last one.
    pub report_interval: usize,
    // Seeds the per-epoch stratified partitions.
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            target_batch_size: 100,
            epoch_count: 50,
            report_interval: 5,
            seed: 428,
        }
    }
}

impl TrainerConfig {
    // Reject settings that can never produce a training run, independent of the data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.epoch_count == 0 {
            return Err(ConfigError::ZeroEpochs);
        }
        if self.report_interval == 0 {
            return Err(ConfigError::ZeroReportInterval);
        }
        Ok(())
    }

    // Zero when the batch size is zero or larger than the data.
    pub fn batch_count(&self, example_count: usize) -> usize {
        example_count
            .checked_div(self.target_batch_size)
            .unwrap_or(0)
    }

    pub fn is_report_epoch(&self, epoch: usize) -> bool {
        epoch % self.report_interval == 0 || epoch + 1 == self.epoch_count
    }
}

// Everything a single experiment needs besides the data itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub architecture: Architecture,
    pub trainer: TrainerConfig,
    // Fraction of the labelled data held out for validation, split per class.
    pub validation_fraction: f64,
    pub split_seed: u64,
    // When set, train on only this fraction of the training split (stratified).
    pub tune_fraction: Option<f64>,
    pub tune_seed: u64,
    // Seeds weight initialisation and dropout masks.
    pub model_seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            architecture: Architecture::Logistic,
            trainer: TrainerConfig::default(),
            validation_fraction: 0.25,
            split_seed: 46,
            tune_fraction: None,
            tune_seed: 96,
            model_seed: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to access config at {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config at {path}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

// Read a JSON config from `path`. If the file does not exist yet, the value produced by
// `initializer` is written there first so later runs pick up the same settings.
pub fn load_or_init<T, F>(path: &Path, initializer: F) -> Result<T, ConfigFileError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    let display = path.display().to_string();
    let io_error = |source| ConfigFileError::Io {
        path: display.clone(),
        source,
    };

    if path.exists() {
        let contents = fs::read_to_string(path).map_err(io_error)?;
        return serde_json::from_str(&contents).map_err(|source| ConfigFileError::Json {
            path: display.clone(),
            source,
        });
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let value = initializer();
    let serialized = serde_json::to_string_pretty(&value).map_err(|source| ConfigFileError::Json {
        path: display.clone(),
        source,
    })?;
    fs::write(path, serialized).map_err(io_error)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_epochs_include_last_without_duplicates() {
        let config = TrainerConfig {
            epoch_count: 11,
            report_interval: 5,
            ..TrainerConfig::default()
        };

        let reported: Vec<usize> = (0..config.epoch_count)
            .filter(|&epoch| config.is_report_epoch(epoch))
            .collect();

        assert_eq!(reported, vec![0, 5, 10]);
    }

    #[test]
    fn batch_count_floors_and_tolerates_zero_size() {
        let config = TrainerConfig {
            target_batch_size: 30,
            ..TrainerConfig::default()
        };
        assert_eq!(config.batch_count(100), 3);
        assert_eq!(config.batch_count(29), 0);

        let config = TrainerConfig {
            target_batch_size: 0,
            ..TrainerConfig::default()
        };
        assert_eq!(config.batch_count(100), 0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchSize));
    }

    #[test]
    fn final_epoch_is_reported_off_cadence() {
        let config = TrainerConfig {
            epoch_count: 12,
            report_interval: 5,
            ..TrainerConfig::default()
        };

        assert!(config.is_report_epoch(11));
        assert!(!config.is_report_epoch(9));
    }

    #[test]
    fn validate_rejects_zero_settings() {
        let base = TrainerConfig::default();
        assert_eq!(base.validate(), Ok(()));

        let zero_batch = TrainerConfig {
            target_batch_size: 0,
            ..base.clone()
        };
        assert_eq!(zero_batch.validate(), Err(ConfigError::ZeroBatchSize));

        let zero_epochs = TrainerConfig {
            epoch_count: 0,
            ..base.clone()
        };
        assert_eq!(zero_epochs.validate(), Err(ConfigError::ZeroEpochs));

        let zero_interval = TrainerConfig {
            report_interval: 0,
            ..base
        };
        assert_eq!(zero_interval.validate(), Err(ConfigError::ZeroReportInterval));
    }

    #[test]
    fn load_or_init_writes_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("experiment.json");

        let created: ExperimentConfig = load_or_init(&path, || ExperimentConfig {
            architecture: Architecture::Cnn,
            ..ExperimentConfig::default()
        })
        .unwrap();
        assert!(path.exists());

        let loaded: ExperimentConfig = load_or_init(&path, ExperimentConfig::default).unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.architecture, Architecture::Cnn);
    }

    #[test]
    fn load_or_init_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let result: Result<ExperimentConfig, _> = load_or_init(&path, ExperimentConfig::default);

        assert!(matches!(result, Err(ConfigFileError::Json { .. })));
    }
}
