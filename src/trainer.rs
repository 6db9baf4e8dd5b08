use crate::config::TrainerConfig;
use crate::dataset::Dataset;
use crate::error::{ConfigError, TrainError};
use crate::model::Model;
use crate::stratify::{check_folds, stratified_folds};
use log::{debug, info};
use ndarray_rand::rand::Rng;
use std::time::{Duration, Instant};

// What was observed at one reporting epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    // Mean of the epoch's batch losses, one term per batch.
    pub cost: f64,
    pub train_accuracy: f64,
    // None when there is no validation data to score.
    pub validation_accuracy: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct TrainingHistory {
    pub reports: Vec<EpochReport>,
    pub epoch_costs: Vec<f64>,
    pub batch_count: usize,
    pub steps: usize,
    pub elapsed: Duration,
}

impl TrainingHistory {
    pub fn last_report(&self) -> Option<&EpochReport> {
        self.reports.last()
    }
}

// Drives a model through a fixed number of epochs. Every epoch the training set is split afresh
// into class-balanced batches, each example lands in exactly one batch, and the model takes one
// optimisation step per batch. The trainer itself keeps no model state.
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Trainer {
        Trainer { config }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    // Train with floor(examples / target_batch_size) batches per epoch.
    pub fn fit<M: Model, R: Rng + ?Sized>(
        &self,
        model: &mut M,
        training: &Dataset,
        validation: &Dataset,
        rng: &mut R,
    ) -> Result<TrainingHistory, TrainError<M::Error>> {
        let batch_count = self.config.batch_count(training.len());
        self.fit_with_batch_count(model, training, validation, batch_count, rng)
    }

    // Train with an explicit number of batches per epoch.
    pub fn fit_with_batch_count<M: Model, R: Rng + ?Sized>(
        &self,
        model: &mut M,
        training: &Dataset,
        validation: &Dataset,
        batch_count: usize,
        rng: &mut R,
    ) -> Result<TrainingHistory, TrainError<M::Error>> {
        // Everything that could stop the run for configuration reasons is checked before the model
        // is touched.
        self.config.validate()?;
        if training.is_empty() {
            return Err(ConfigError::EmptyDataset.into());
        }
        if batch_count == 0 {
            return Err(ConfigError::NoBatches {
                examples: training.len(),
                target_batch_size: self.config.target_batch_size,
            }
            .into());
        }
        check_folds(training.labels(), training.n_class(), batch_count)
            .map_err(ConfigError::from)?;

        let mut reports = Vec::new();
        let mut epoch_costs = Vec::with_capacity(self.config.epoch_count);
        let mut steps = 0;
        let start = Instant::now();

        info!(
            "training on {} examples in {batch_count} stratified batches for {} epochs",
            training.len(),
            self.config.epoch_count
        );

        for epoch in 0..self.config.epoch_count {
            let batches =
                stratified_folds(training.labels(), training.n_class(), batch_count, rng)
                    .map_err(ConfigError::from)?;

            // Running cost for progress output only; it never feeds back into training. Every
            // batch counts equally, whatever its size.
            let mut cost = 0.0;
            for (index, indices) in batches.iter().enumerate() {
                let batch = training.select(indices)?;
                let loss = model
                    .train_step(batch.features.view(), batch.labels.view())
                    .map_err(TrainError::Model)?;
                cost += loss / batch_count as f64;
                steps += 1;
                debug!(
                    "epoch {epoch} batch {}/{batch_count}: {} examples, loss {loss:.6}",
                    index + 1,
                    batch.len()
                );
            }
            epoch_costs.push(cost);

            if self.config.is_report_epoch(epoch) {
                let report = self.report(model, training, validation, epoch, cost)?;
                reports.push(report);
            }
        }

        let elapsed = start.elapsed();
        info!("Optimization finished in {:.2} seconds", elapsed.as_secs_f64());

        Ok(TrainingHistory {
            reports,
            epoch_costs,
            batch_count,
            steps,
            elapsed,
        })
    }

    // Score the model on the full training and validation sets with regularisation switched off.
    fn report<M: Model>(
        &self,
        model: &mut M,
        training: &Dataset,
        validation: &Dataset,
        epoch: usize,
        cost: f64,
    ) -> Result<EpochReport, TrainError<M::Error>> {
        let train_accuracy = model
            .evaluate(training.features(), training.one_hot_labels(), true)
            .map_err(TrainError::Model)?;
        let validation_accuracy = if validation.is_empty() {
            None
        } else {
            Some(
                model
                    .evaluate(validation.features(), validation.one_hot_labels(), true)
                    .map_err(TrainError::Model)?,
            )
        };

        info!("Epoch: {epoch:04} cost = {cost:.6}");
        info!("TRAIN ACCURACY: {train_accuracy:.3}");
        if let Some(accuracy) = validation_accuracy {
            info!("VALIDATION ACCURACY: {accuracy:.3}");
        }

        Ok(EpochReport {
            epoch,
            cost,
            train_accuracy,
            validation_accuracy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StratifyError;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, ArrayView2};
    use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
    use std::fmt;

    // Features carry the example's own index in column 0, so a model can tell which examples it
    // was handed.
    fn indexed_dataset(labels: Vec<usize>, n_class: usize) -> Dataset {
        let features =
            Array2::from_shape_fn((labels.len(), 2), |(r, c)| if c == 0 { r as f64 } else { 1.0 });
        Dataset::new(features, labels, n_class).unwrap()
    }

    fn empty_dataset(n_class: usize) -> Dataset {
        Dataset::new(Array2::zeros((0, 2)), Vec::new(), n_class).unwrap()
    }

    #[derive(Debug)]
    struct ModelFailure(&'static str);

    impl fmt::Display for ModelFailure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl std::error::Error for ModelFailure {}

    // Records every batch it is trained on. The loss of a batch is the mean of its example indices,
    // or its size when `loss_is_batch_len` is set.
    #[derive(Default)]
    struct RecordingModel {
        batches: Vec<Vec<usize>>,
        losses: Vec<f64>,
        evaluations: Vec<bool>,
        fail_on_step: Option<usize>,
        loss_is_batch_len: bool,
    }

    impl Model for RecordingModel {
        type Error = ModelFailure;

        fn train_step(
            &mut self,
            features: ArrayView2<f64>,
            labels: ArrayView2<f64>,
        ) -> Result<f64, ModelFailure> {
            assert_eq!(features.nrows(), labels.nrows());
            if self.fail_on_step == Some(self.batches.len()) {
                return Err(ModelFailure("step failed"));
            }
            let indices: Vec<usize> = features.column(0).iter().map(|&v| v as usize).collect();
            let loss = if self.loss_is_batch_len {
                indices.len() as f64
            } else {
                indices.iter().sum::<usize>() as f64 / indices.len() as f64
            };
            self.batches.push(indices);
            self.losses.push(loss);
            Ok(loss)
        }

        fn evaluate(
            &mut self,
            _: ArrayView2<f64>,
            _: ArrayView2<f64>,
            inference_mode: bool,
        ) -> Result<f64, ModelFailure> {
            self.evaluations.push(inference_mode);
            Ok(0.5)
        }
    }

    fn config(
        target_batch_size: usize,
        epoch_count: usize,
        report_interval: usize,
    ) -> TrainerConfig {
        TrainerConfig {
            target_batch_size,
            epoch_count,
            report_interval,
            seed: 0,
        }
    }

    #[test]
    fn every_example_used_once_per_epoch() {
        let labels: Vec<usize> = (0..100).map(|i| i % 4).collect();
        let training = indexed_dataset(labels, 4);
        let mut model = RecordingModel::default();
        let mut rng = StdRng::seed_from_u64(428);

        let history = Trainer::new(config(30, 4, 10))
            .fit(&mut model, &training, &empty_dataset(4), &mut rng)
            .unwrap();

        assert_eq!(history.batch_count, 3);
        assert_eq!(history.steps, 12);
        for epoch in model.batches.chunks(3) {
            let mut seen: Vec<usize> = epoch.iter().flatten().copied().collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..100).collect::<Vec<_>>());
            for batch in epoch {
                assert!(batch.len() == 33 || batch.len() == 34);
            }
        }
        // Partitions are redrawn every epoch rather than replayed.
        assert_ne!(model.batches[0..3], model.batches[3..6]);
    }

    #[test]
    fn ten_examples_two_classes_two_batches() {
        let training = indexed_dataset(vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1], 2);
        let mut model = RecordingModel::default();
        let mut rng = StdRng::seed_from_u64(1);

        Trainer::new(config(5, 1, 1))
            .fit(&mut model, &training, &empty_dataset(2), &mut rng)
            .unwrap();

        assert_eq!(model.batches.len(), 2);
        for batch in &model.batches {
            assert_eq!(batch.len(), 5);
            let class_one = batch.iter().filter(|&&index| index >= 5).count();
            assert!((2..=3).contains(&class_one));
        }
    }

    #[test]
    fn running_cost_averages_batch_losses() {
        // 47 examples in 4 batches: one batch of 11 and three of 12.
        let labels: Vec<usize> = (0..47).map(|i| i % 3).collect();
        let training = indexed_dataset(labels, 3);
        let mut model = RecordingModel {
            loss_is_batch_len: true,
            ..RecordingModel::default()
        };
        let mut rng = StdRng::seed_from_u64(9);

        let history = Trainer::new(config(10, 2, 1))
            .fit(&mut model, &training, &empty_dataset(3), &mut rng)
            .unwrap();

        assert_eq!(history.batch_count, 4);
        for (epoch, &cost) in history.epoch_costs.iter().enumerate() {
            let losses = &model.losses[epoch * 4..(epoch + 1) * 4];
            let mut sizes = losses.to_vec();
            sizes.sort_by(f64::total_cmp);
            assert_eq!(sizes, vec![11.0, 12.0, 12.0, 12.0]);
            assert_abs_diff_eq!(cost, losses.iter().sum::<f64>() / 4.0, epsilon = 1e-12);
            assert_abs_diff_eq!(cost, 11.75, epsilon = 1e-12);
        }
        assert_eq!(history.last_report().unwrap().cost, history.epoch_costs[1]);
    }

    #[test]
    fn reports_on_cadence_and_final_epoch_once() {
        let training = indexed_dataset((0..20).map(|i| i % 2).collect(), 2);
        let validation = indexed_dataset(vec![0, 1], 2);
        let mut model = RecordingModel::default();
        let mut rng = StdRng::seed_from_u64(0);

        let history = Trainer::new(config(5, 11, 5))
            .fit(&mut model, &training, &validation, &mut rng)
            .unwrap();

        let epochs: Vec<usize> = history.reports.iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![0, 5, 10]);
        assert_eq!(history.last_report().unwrap().validation_accuracy, Some(0.5));
        // Training and validation accuracy per report, always in inference mode.
        assert_eq!(model.evaluations, vec![true; 6]);
    }

    #[test]
    fn same_seed_replays_same_batches() {
        let training = indexed_dataset((0..60).map(|i| i % 3).collect(), 3);
        let run = |seed| {
            let mut model = RecordingModel::default();
            Trainer::new(config(10, 3, 3))
                .fit(&mut model, &training, &empty_dataset(3), &mut StdRng::seed_from_u64(seed))
                .unwrap();
            model.batches
        };

        assert_eq!(run(5), run(5));
        assert_ne!(run(5), run(6));
    }

    #[test]
    fn too_many_batches_fails_before_training() {
        let training = indexed_dataset(vec![0, 1, 0, 1], 2);
        let mut model = RecordingModel::default();
        let mut rng = StdRng::seed_from_u64(0);

        let result = Trainer::new(config(1, 3, 1)).fit_with_batch_count(
            &mut model,
            &training,
            &empty_dataset(2),
            10,
            &mut rng,
        );

        assert!(matches!(
            result,
            Err(TrainError::Config(ConfigError::Stratify(StratifyError::TooFewExamples {
                examples: 4,
                folds: 10
            })))
        ));
        assert!(model.batches.is_empty());
    }

    #[test]
    fn zero_batch_size_is_a_config_error() {
        let training = indexed_dataset(vec![0, 1, 0, 1], 2);
        let mut model = RecordingModel::default();
        let mut rng = StdRng::seed_from_u64(0);

        let result = Trainer::new(config(0, 3, 1)).fit(
            &mut model,
            &training,
            &empty_dataset(2),
            &mut rng,
        );

        assert!(matches!(
            result,
            Err(TrainError::Config(ConfigError::ZeroBatchSize))
        ));
        assert!(model.batches.is_empty());
    }

    #[test]
    fn batch_size_larger_than_dataset_fails() {
        let training = indexed_dataset(vec![0, 1, 0, 1], 2);
        let mut model = RecordingModel::default();
        let mut rng = StdRng::seed_from_u64(0);

        let result = Trainer::new(config(10, 3, 1)).fit(
            &mut model,
            &training,
            &empty_dataset(2),
            &mut rng,
        );

        assert!(matches!(
            result,
            Err(TrainError::Config(ConfigError::NoBatches {
                examples: 4,
                target_batch_size: 10
            }))
        ));
        assert!(model.batches.is_empty());
    }

    #[test]
    fn rare_class_fails_before_training() {
        let training = indexed_dataset(vec![0, 0, 0, 0, 0, 0, 0, 1], 2);
        let mut model = RecordingModel::default();
        let mut rng = StdRng::seed_from_u64(0);

        let result = Trainer::new(config(4, 1, 1)).fit(
            &mut model,
            &training,
            &empty_dataset(2),
            &mut rng,
        );

        assert!(matches!(
            result,
            Err(TrainError::Config(ConfigError::Stratify(StratifyError::ClassTooSmall {
                class: 1,
                ..
            })))
        ));
        assert!(model.batches.is_empty());
    }

    #[test]
    fn model_errors_abort_the_run() {
        let training = indexed_dataset((0..20).map(|i| i % 2).collect(), 2);
        let mut model = RecordingModel {
            fail_on_step: Some(5),
            ..RecordingModel::default()
        };
        let mut rng = StdRng::seed_from_u64(0);

        let result = Trainer::new(config(5, 3, 1)).fit(
            &mut model,
            &training,
            &empty_dataset(2),
            &mut rng,
        );

        assert!(matches!(result, Err(TrainError::Model(ModelFailure("step failed")))));
        assert_eq!(model.batches.len(), 5);
    }
}
