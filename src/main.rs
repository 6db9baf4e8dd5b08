use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};
use digit_trainer::{
    Architecture, Dataset, ExperimentConfig, Network, Trainer,
    analysis::{accuracy, confusion_matrix, format_confusion_matrix, misclassified},
    config::load_or_init,
    mnist::{load_csv, load_idx, render_digit},
    network::argmax,
    preprocess::MaxAbsScaler,
    stratify::stratified_shuffle_split,
};
use log::info;
use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
use std::path::PathBuf;

/// Train a digit classifier on labelled images with stratified mini-batches.
#[derive(Parser, Debug)]
#[command(version, about)]
#[command(group(ArgGroup::new("data").required(true).args(["train_csv", "idx_images"])))]
struct Cli {
    /// CSV with a header row and label,pixel0..pixel783 rows.
    #[arg(long)]
    train_csv: Option<PathBuf>,

    /// Gzipped IDX image file; needs --idx-labels.
    #[arg(long, requires = "idx_labels")]
    idx_images: Option<PathBuf>,

    #[arg(long, requires = "idx_images")]
    idx_labels: Option<PathBuf>,

    /// JSON experiment config, created from the defaults when missing. Flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    model: Option<Architecture>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    report_every: Option<usize>,

    /// Seeds the per-epoch batch partitions.
    #[arg(long)]
    seed: Option<u64>,

    /// Seeds weight initialisation and dropout.
    #[arg(long)]
    model_seed: Option<u64>,

    /// 0 trains on everything and skips validation.
    #[arg(long)]
    validation_fraction: Option<f64>,

    #[arg(long)]
    split_seed: Option<u64>,

    /// Train on only this stratified fraction of the training split.
    #[arg(long)]
    tune_fraction: Option<f64>,

    /// Print this many misclassified validation digits.
    #[arg(long, default_value_t = 0)]
    show_errors: usize,
}

impl Cli {
    fn experiment(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => load_or_init(path, ExperimentConfig::default)
                .with_context(|| format!("loading experiment config {}", path.display()))?,
            None => ExperimentConfig::default(),
        };

        if let Some(model) = self.model {
            config.architecture = model;
        }
        if let Some(epochs) = self.epochs {
            config.trainer.epoch_count = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.trainer.target_batch_size = batch_size;
        }
        if let Some(interval) = self.report_every {
            config.trainer.report_interval = interval;
        }
        if let Some(seed) = self.seed {
            config.trainer.seed = seed;
        }
        if let Some(seed) = self.model_seed {
            config.model_seed = seed;
        }
        if let Some(fraction) = self.validation_fraction {
            config.validation_fraction = fraction;
        }
        if let Some(seed) = self.split_seed {
            config.split_seed = seed;
        }
        if self.tune_fraction.is_some() {
            config.tune_fraction = self.tune_fraction;
        }
        Ok(config)
    }

    fn load(&self) -> Result<Dataset> {
        match (&self.train_csv, &self.idx_images, &self.idx_labels) {
            (Some(csv), _, _) => {
                load_csv(csv).with_context(|| format!("loading {}", csv.display()))
            }
            (None, Some(images), Some(labels)) => load_idx(images, labels)
                .with_context(|| format!("loading {} and {}", images.display(), labels.display())),
            _ => bail!("no training data given"),
        }
    }
}

// Split off a stratified validation set. A fraction of 0 keeps every example for training.
fn split(data: &Dataset, fraction: f64, seed: u64) -> Result<(Dataset, Dataset)> {
    if fraction == 0.0 {
        return Ok((data.clone(), data.subset(&[])?));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let (train, test) =
        stratified_shuffle_split(data.labels(), data.n_class(), fraction, &mut rng)
            .context("splitting off the validation set")?;
    Ok((data.subset(&train)?, data.subset(&test)?))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let experiment = cli.experiment()?;
    info!("experiment: {experiment:?}");

    let data = cli.load()?;
    let (mut training, validation) =
        split(&data, experiment.validation_fraction, experiment.split_seed)?;

    if let Some(fraction) = experiment.tune_fraction {
        let mut rng = StdRng::seed_from_u64(experiment.tune_seed);
        let (_, tune) =
            stratified_shuffle_split(training.labels(), training.n_class(), fraction, &mut rng)
                .context("drawing the tuning subsample")?;
        training = training.subset(&tune)?;
        info!("tuning on a subsample of {} examples", training.len());
    }
    info!(
        "{} training and {} validation examples, class counts {:?}",
        training.len(),
        validation.len(),
        training.class_counts()
    );

    // Scale with statistics from the training split only.
    let (scaler, scaled) = MaxAbsScaler::fit_transform(training.features());
    let training = training.with_features(scaled)?;
    let validation_features = scaler.transform(validation.features());
    let validation = validation.with_features(validation_features)?;

    let mut network = Network::for_architecture(
        experiment.architecture,
        training.n_features(),
        training.n_class(),
        experiment.model_seed,
    )
    .context("building the network")?;

    let trainer = Trainer::new(experiment.trainer.clone());
    let mut rng = StdRng::seed_from_u64(trainer.config().seed);
    let history = trainer
        .fit(&mut network, &training, &validation, &mut rng)
        .context("training")?;
    info!(
        "{} steps of {} batches per epoch in {:.2} seconds",
        history.steps,
        history.batch_count,
        history.elapsed.as_secs_f64()
    );

    if validation.is_empty() {
        return Ok(());
    }

    let probabilities = network.predict_proba(validation.features())?;
    let predicted: Vec<usize> = probabilities.outer_iter().map(argmax).collect();
    let actual = validation.labels();
    println!("Validation accuracy: {:.4}", accuracy(actual, &predicted));
    let counts = confusion_matrix(actual, &predicted, validation.n_class());
    println!("{}", format_confusion_matrix(&counts));

    let width = (validation.n_features() as f64).sqrt().round() as usize;
    for error in misclassified(actual, probabilities.view()).iter().take(cli.show_errors) {
        let pixels = validation.features().row(error.index).to_vec();
        println!(
            "#{}: labelled {}, predicted {} ({:.3}), then {} ({:.3})",
            error.index,
            error.actual,
            error.predicted,
            error.confidence,
            error.second_choice,
            error.second_confidence
        );
        println!("{}\n", render_digit(&pixels, width));
    }

    Ok(())
}
