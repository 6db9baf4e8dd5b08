use crate::model::Model;
use clap::ValueEnum;
use ndarray::{Array2, ArrayView2, Axis, s};
use ndarray_rand::rand::{Rng, RngCore, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod layers;
mod loss;
mod optimizer;

pub use layers::{Conv2d, Dense, Dropout, ImageShape, Layer, MaxPool2d, Relu, TruncatedNormal};
pub use loss::{argmax, correct_count, softmax, softmax_cross_entropy};
pub use optimizer::{Adam, Optimizer};

// Forward passes over whole datasets are done this many rows at a time to bound the memory used
// by convolution patches.
const EVAL_CHUNK: usize = 1000;

// Initialisation used by every architecture except logistic regression.
const WEIGHT_STD_DEV: f64 = 0.1;
const BIAS_INIT: f64 = 0.1;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("cannot train on an empty batch")]
    EmptyBatch,

    #[error("loss diverged to {loss}")]
    Diverged { loss: f64 },

    #[error("backward pass requested before any forward pass")]
    NoForwardPass,

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

// The model families trained on the digits, from plain logistic regression up to a small
// convolutional network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    Logistic,
    Mlp,
    DeepMlp,
    Cnn,
}

// A feed-forward stack of layers plus the optimizer that updates them. Each experiment builds and
// owns its own network, so several can live side by side.
#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Layer>,
    optimizer: Optimizer,
    n_features: usize,
    n_class: usize,
}

impl Network {
    pub fn new(
        layers: Vec<Layer>,
        optimizer: Optimizer,
        n_features: usize,
        n_class: usize,
    ) -> Network {
        Network {
            layers,
            optimizer,
            n_features,
            n_class,
        }
    }

    // Softmax regression: a single zero-initialised linear layer trained with plain gradient
    // descent.
    pub fn logistic_regression(n_features: usize, n_class: usize, learning_rate: f64) -> Network {
        Network::new(
            vec![Layer::Dense(Dense::zeros(n_features, n_class))],
            Optimizer::gradient_descent(learning_rate),
            n_features,
            n_class,
        )
    }

    // Fully connected network with a ReLU and a dropout layer after every hidden layer, trained
    // with Adam.
    pub fn mlp<R: Rng + ?Sized>(
        n_features: usize,
        hidden_widths: &[usize],
        n_class: usize,
        keep_prob: f64,
        learning_rate: f64,
        rng: &mut R,
    ) -> Result<Network, NetworkError> {
        let mut layers = Vec::with_capacity(hidden_widths.len() * 3 + 1);
        let mut inputs = n_features;
        for &width in hidden_widths {
            layers.push(Layer::Dense(Dense::truncated_normal(
                inputs,
                width,
                WEIGHT_STD_DEV,
                BIAS_INIT,
                rng,
            )));
            layers.push(Layer::Relu(Relu::default()));
            layers.push(Layer::Dropout(Dropout::new(keep_prob, rng.next_u64())?));
            inputs = width;
        }
        layers.push(Layer::Dense(Dense::truncated_normal(
            inputs,
            n_class,
            WEIGHT_STD_DEV,
            BIAS_INIT,
            rng,
        )));

        Ok(Network::new(
            layers,
            Optimizer::adam(learning_rate),
            n_features,
            n_class,
        ))
    }

    // Convolutional network: for each entry of `conv_channels`, a SAME convolution, ReLU and 2x2
    // max pool; then one fully connected hidden layer with dropout and the output layer.
    #[allow(clippy::too_many_arguments)]
    pub fn convolutional<R: Rng + ?Sized>(
        image: ImageShape,
        conv_channels: &[usize],
        kernel_size: usize,
        dense_width: usize,
        n_class: usize,
        keep_prob: f64,
        learning_rate: f64,
        rng: &mut R,
    ) -> Result<Network, NetworkError> {
        let mut layers = Vec::with_capacity(conv_channels.len() * 3 + 4);
        let mut shape = image;
        for &channels in conv_channels {
            let conv = Conv2d::truncated_normal(
                shape,
                kernel_size,
                channels,
                WEIGHT_STD_DEV,
                BIAS_INIT,
                rng,
            )?;
            let pool = MaxPool2d::new(conv.output_shape(), 2, 2)?;
            shape = pool.output_shape();
            layers.push(Layer::Conv2d(conv));
            layers.push(Layer::Relu(Relu::default()));
            layers.push(Layer::MaxPool2d(pool));
        }
        layers.push(Layer::Dense(Dense::truncated_normal(
            shape.len(),
            dense_width,
            WEIGHT_STD_DEV,
            BIAS_INIT,
            rng,
        )));
        layers.push(Layer::Relu(Relu::default()));
        layers.push(Layer::Dropout(Dropout::new(keep_prob, rng.next_u64())?));
        layers.push(Layer::Dense(Dense::truncated_normal(
            dense_width,
            n_class,
            WEIGHT_STD_DEV,
            BIAS_INIT,
            rng,
        )));

        Ok(Network::new(
            layers,
            Optimizer::adam(learning_rate),
            image.len(),
            n_class,
        ))
    }

    // The four standard digit classifiers with their usual widths and learning rates. The
    // convolutional network needs square single-channel images.
    pub fn for_architecture(
        architecture: Architecture,
        n_features: usize,
        n_class: usize,
        seed: u64,
    ) -> Result<Network, NetworkError> {
        let mut rng = StdRng::seed_from_u64(seed);
        match architecture {
            Architecture::Logistic => Ok(Network::logistic_regression(n_features, n_class, 0.002)),
            Architecture::Mlp => Network::mlp(n_features, &[1024], n_class, 0.5, 0.001, &mut rng),
            Architecture::DeepMlp => {
                Network::mlp(n_features, &[512, 512], n_class, 0.5, 0.001, &mut rng)
            }
            Architecture::Cnn => {
                let side = (n_features as f64).sqrt().round() as usize;
                if side * side != n_features {
                    return Err(NetworkError::InvalidArchitecture(format!(
                        "{n_features} features do not form a square image"
                    )));
                }
                let image = ImageShape {
                    height: side,
                    width: side,
                    channels: 1,
                };
                Network::convolutional(image, &[16, 16], 5, 512, n_class, 0.5, 0.001, &mut rng)
            }
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_class(&self) -> usize {
        self.n_class
    }

    fn check_shapes(
        &self,
        features: &ArrayView2<f64>,
        labels: Option<&ArrayView2<f64>>,
    ) -> Result<(), NetworkError> {
        if features.ncols() != self.n_features {
            return Err(NetworkError::ShapeMismatch {
                what: "feature columns",
                expected: self.n_features,
                found: features.ncols(),
            });
        }
        if let Some(labels) = labels {
            if labels.ncols() != self.n_class {
                return Err(NetworkError::ShapeMismatch {
                    what: "label columns",
                    expected: self.n_class,
                    found: labels.ncols(),
                });
            }
            if labels.nrows() != features.nrows() {
                return Err(NetworkError::ShapeMismatch {
                    what: "label rows",
                    expected: features.nrows(),
                    found: labels.nrows(),
                });
            }
        }
        Ok(())
    }

    // Run a batch through every layer and return the logits.
    fn forward(
        &mut self,
        features: ArrayView2<f64>,
        dropout_active: bool,
    ) -> Result<Array2<f64>, NetworkError> {
        let mut activation = features.to_owned();
        for layer in self.layers.iter_mut() {
            activation = layer.forward(&activation, dropout_active)?;
        }
        Ok(activation)
    }

    fn backward(&mut self, grad: Array2<f64>) -> Result<(), NetworkError> {
        let mut grad = grad;
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(())
    }

    // Logits for every row, computed chunk by chunk with dropout disabled unless asked for.
    pub fn logits(
        &mut self,
        features: ArrayView2<f64>,
        dropout_active: bool,
    ) -> Result<Array2<f64>, NetworkError> {
        self.check_shapes(&features, None)?;
        let mut logits = Array2::zeros((features.nrows(), self.n_class));
        for (chunk, mut target) in features
            .axis_chunks_iter(Axis(0), EVAL_CHUNK)
            .zip(logits.axis_chunks_iter_mut(Axis(0), EVAL_CHUNK))
        {
            target.assign(&self.forward(chunk, dropout_active)?);
        }
        Ok(logits)
    }

    // Class probabilities for every row, in inference mode.
    pub fn predict_proba(
        &mut self,
        features: ArrayView2<f64>,
    ) -> Result<Array2<f64>, NetworkError> {
        Ok(softmax(self.logits(features, false)?.view()))
    }

    pub fn predict(&mut self, features: ArrayView2<f64>) -> Result<Vec<usize>, NetworkError> {
        let logits = self.logits(features, false)?;
        Ok(logits.outer_iter().map(argmax).collect())
    }
}

impl Model for Network {
    type Error = NetworkError;

    fn train_step(
        &mut self,
        features: ArrayView2<f64>,
        labels: ArrayView2<f64>,
    ) -> Result<f64, NetworkError> {
        self.check_shapes(&features, Some(&labels))?;
        if features.nrows() == 0 {
            return Err(NetworkError::EmptyBatch);
        }

        let logits = self.forward(features, true)?;
        let (loss, grad) = softmax_cross_entropy(logits.view(), labels);
        if !loss.is_finite() {
            return Err(NetworkError::Diverged { loss });
        }

        self.backward(grad)?;
        let parameters = self
            .layers
            .iter_mut()
            .flat_map(|layer| layer.parameters())
            .collect();
        self.optimizer.step(parameters);

        Ok(loss)
    }

    fn evaluate(
        &mut self,
        features: ArrayView2<f64>,
        labels: ArrayView2<f64>,
        inference_mode: bool,
    ) -> Result<f64, NetworkError> {
        self.check_shapes(&features, Some(&labels))?;
        if features.nrows() == 0 {
            return Ok(0.0);
        }

        let mut correct = 0;
        for start in (0..features.nrows()).step_by(EVAL_CHUNK) {
            let end = (start + EVAL_CHUNK).min(features.nrows());
            let logits = self.forward(features.slice(s![start..end, ..]), !inference_mode)?;
            correct += correct_count(logits.view(), labels.slice(s![start..end, ..]));
        }
        Ok(correct as f64 / features.nrows() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::one_hot;
    use ndarray_rand::{RandomExt, rand_distr::Uniform};

    // Two well separated blobs in two dimensions.
    fn blobs(rows: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Array2::random_using((rows, 2), Uniform::new(-0.5, 0.5), &mut rng);
        let labels: Vec<usize> = (0..rows).map(|i| i % 2).collect();
        let features = Array2::from_shape_fn((rows, 2), |(r, c)| {
            let centre = if labels[r] == 0 { -1.0 } else { 1.0 };
            centre + noise[[r, c]]
        });
        (features, one_hot(&labels, 2))
    }

    #[test]
    fn logistic_regression_learns_separable_blobs() {
        let (features, labels) = blobs(200, 1);
        let mut network = Network::logistic_regression(2, 2, 0.5);

        assert_eq!(network.evaluate(features.view(), labels.view(), true).unwrap(), 0.5);
        let first = network.train_step(features.view(), labels.view()).unwrap();
        assert!((first - 2.0_f64.ln()).abs() < 1e-12);
        for _ in 0..50 {
            network.train_step(features.view(), labels.view()).unwrap();
        }
        let last = network.train_step(features.view(), labels.view()).unwrap();

        assert!(last < first);
        assert_eq!(network.evaluate(features.view(), labels.view(), true).unwrap(), 1.0);
    }

    #[test]
    fn mlp_with_dropout_learns_separable_blobs() {
        let (features, labels) = blobs(200, 2);
        let mut rng = StdRng::seed_from_u64(3);
        let mut network = Network::mlp(2, &[16], 2, 0.5, 0.01, &mut rng).unwrap();

        for _ in 0..100 {
            network.train_step(features.view(), labels.view()).unwrap();
        }

        assert!(network.evaluate(features.view(), labels.view(), true).unwrap() > 0.95);
    }

    #[test]
    fn inference_mode_is_deterministic() {
        let (features, labels) = blobs(50, 4);
        let mut network = Network::for_architecture(Architecture::DeepMlp, 2, 2, 9).unwrap();

        let first = network.evaluate(features.view(), labels.view(), true).unwrap();
        let second = network.evaluate(features.view(), labels.view(), true).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn small_cnn_trains_and_predicts() {
        let image = ImageShape {
            height: 6,
            width: 6,
            channels: 1,
        };
        let mut rng = StdRng::seed_from_u64(5);
        let mut network =
            Network::convolutional(image, &[2, 3], 3, 8, 3, 0.5, 0.001, &mut rng).unwrap();
        let features = Array2::random_using((4, 36), Uniform::new(0.0, 1.0), &mut rng);
        let labels = one_hot(&[0, 1, 2, 1], 3);

        let loss = network.train_step(features.view(), labels.view()).unwrap();
        let probabilities = network.predict_proba(features.view()).unwrap();

        assert!(loss.is_finite());
        assert_eq!(probabilities.dim(), (4, 3));
        for row in probabilities.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert_eq!(network.predict(features.view()).unwrap().len(), 4);
    }

    #[test]
    fn standard_cnn_fits_mnist_shape() {
        let network = Network::for_architecture(Architecture::Cnn, 784, 10, 0).unwrap();

        // Two 2x2 pools take 28x28 down to 7x7 with 16 channels.
        let Layer::Dense(hidden) = &network.layers()[6] else {
            panic!("expected the hidden dense layer after two conv blocks");
        };
        assert_eq!(hidden.inputs(), 7 * 7 * 16);
        assert_eq!(hidden.outputs(), 512);
        assert_eq!(hidden.weights().dim(), (784, 512));
        assert!(hidden.weights().iter().all(|w| w.abs() <= 0.2));

        let Layer::Dropout(dropout) = &network.layers()[8] else {
            panic!("expected dropout after the hidden dense layer");
        };
        assert_eq!(dropout.keep_prob(), 0.5);
    }

    #[test]
    fn cnn_rejects_non_square_inputs() {
        assert!(matches!(
            Network::for_architecture(Architecture::Cnn, 780, 10, 0),
            Err(NetworkError::InvalidArchitecture(_))
        ));
    }

    #[test]
    fn train_step_rejects_mismatched_shapes() {
        let mut network = Network::logistic_regression(3, 2, 0.1);

        let result = network.train_step(Array2::zeros((2, 4)).view(), Array2::zeros((2, 2)).view());
        assert!(matches!(
            result,
            Err(NetworkError::ShapeMismatch {
                what: "feature columns",
                ..
            })
        ));

        let result = network.train_step(Array2::zeros((2, 3)).view(), Array2::zeros((3, 2)).view());
        assert!(matches!(
            result,
            Err(NetworkError::ShapeMismatch {
                what: "label rows",
                ..
            })
        ));
    }

    #[test]
    fn train_step_reports_divergence() {
        let mut network = Network::logistic_regression(1, 2, 0.1);
        let features = Array2::from_elem((1, 1), f64::NAN);

        let result = network.train_step(features.view(), one_hot(&[0], 2).view());

        assert!(matches!(result, Err(NetworkError::Diverged { .. })));
    }
}
