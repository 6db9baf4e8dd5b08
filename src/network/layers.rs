use super::NetworkError;
use ndarray::{Array2, Axis, s};
use ndarray_rand::{
    RandomExt,
    rand::{Rng, SeedableRng, rngs::StdRng},
    rand_distr::{Distribution, StandardNormal},
};

// Normal distribution that redraws any sample further than two standard deviations from the mean,
// so no weight starts out far from zero.
#[derive(Clone, Copy, Debug)]
pub struct TruncatedNormal {
    pub std_dev: f64,
}

impl Distribution<f64> for TruncatedNormal {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        loop {
            let z: f64 = rng.sample(StandardNormal);
            if z.abs() <= 2.0 {
                return z * self.std_dev;
            }
        }
    }
}

// The dimensions of the image stored in each activation row. Rows are laid out height-major, then
// width, then channel, so the channel values of one pixel sit next to each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn offset(&self, y: usize, x: usize) -> usize {
        (y * self.width + x) * self.channels
    }
}

fn check_width(expected: usize, input: &Array2<f64>) -> Result<(), NetworkError> {
    if input.ncols() == expected {
        Ok(())
    } else {
        Err(NetworkError::ShapeMismatch {
            what: "layer input width",
            expected,
            found: input.ncols(),
        })
    }
}

// Fully connected layer computing x.W + b for a batch of rows.
#[derive(Debug, Clone)]
pub struct Dense {
    weights: Array2<f64>,
    biases: Array2<f64>,
    grad_weights: Array2<f64>,
    grad_biases: Array2<f64>,
    input: Option<Array2<f64>>,
}

impl Dense {
    pub fn from_parameters(weights: Array2<f64>, biases: Array2<f64>) -> Dense {
        Dense {
            grad_weights: Array2::zeros(weights.raw_dim()),
            grad_biases: Array2::zeros(biases.raw_dim()),
            weights,
            biases,
            input: None,
        }
    }

    pub fn zeros(inputs: usize, outputs: usize) -> Dense {
        Dense::from_parameters(Array2::zeros((inputs, outputs)), Array2::zeros((1, outputs)))
    }

    pub fn truncated_normal<R: Rng + ?Sized>(
        inputs: usize,
        outputs: usize,
        std_dev: f64,
        bias: f64,
        rng: &mut R,
    ) -> Dense {
        Dense::from_parameters(
            Array2::random_using((inputs, outputs), TruncatedNormal { std_dev }, rng),
            Array2::from_elem((1, outputs), bias),
        )
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.weights.ncols()
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    fn forward(&mut self, input: &Array2<f64>) -> Result<Array2<f64>, NetworkError> {
        check_width(self.inputs(), input)?;
        let output = input.dot(&self.weights) + &self.biases;
        self.input = Some(input.clone());
        Ok(output)
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>, NetworkError> {
        let input = self.input.as_ref().ok_or(NetworkError::NoForwardPass)?;
        self.grad_weights = input.t().dot(grad);
        self.grad_biases = grad.sum_axis(Axis(0)).insert_axis(Axis(0));
        Ok(grad.dot(&self.weights.t()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Relu {
    mask: Option<Array2<f64>>,
}

impl Relu {
    fn forward(&mut self, input: &Array2<f64>) -> Array2<f64> {
        self.mask = Some(input.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }));
        input.mapv(|v| v.max(0.0))
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>, NetworkError> {
        let mask = self.mask.as_ref().ok_or(NetworkError::NoForwardPass)?;
        Ok(grad * mask)
    }
}

// Inverted dropout: while active, every value is kept with probability `keep_prob` and scaled by
// 1 / keep_prob, so the expected activation matches the inactive (inference) pass exactly.
#[derive(Debug, Clone)]
pub struct Dropout {
    keep_prob: f64,
    rng: StdRng,
    mask: Option<Array2<f64>>,
}

impl Dropout {
    pub fn new(keep_prob: f64, seed: u64) -> Result<Dropout, NetworkError> {
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(NetworkError::InvalidArchitecture(format!(
                "dropout keep probability {keep_prob} must be in (0, 1]"
            )));
        }
        Ok(Dropout {
            keep_prob,
            rng: StdRng::seed_from_u64(seed),
            mask: None,
        })
    }

    pub fn keep_prob(&self) -> f64 {
        self.keep_prob
    }

    fn forward(&mut self, input: &Array2<f64>, active: bool) -> Array2<f64> {
        if !active || self.keep_prob >= 1.0 {
            self.mask = None;
            return input.clone();
        }

        let keep_prob = self.keep_prob;
        let rng = &mut self.rng;
        let mask = Array2::from_shape_simple_fn(input.raw_dim(), || {
            if rng.gen_bool(keep_prob) { 1.0 / keep_prob } else { 0.0 }
        });
        let output = input * &mask;
        self.mask = Some(mask);
        output
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Array2<f64> {
        match &self.mask {
            Some(mask) => grad * mask,
            None => grad.clone(),
        }
    }
}

// Stride-1 convolution with SAME zero padding, so the output keeps the input's height and width.
// The batch is unrolled into one patch row per output pixel (im2col), which turns the convolution
// into a single matrix product with the kernel.
#[derive(Debug, Clone)]
pub struct Conv2d {
    input_shape: ImageShape,
    kernel_size: usize,
    // Shape [kernel_size * kernel_size * in_channels, out_channels].
    kernel: Array2<f64>,
    biases: Array2<f64>,
    grad_kernel: Array2<f64>,
    grad_biases: Array2<f64>,
    patches: Option<Array2<f64>>,
}

impl Conv2d {
    pub fn from_parameters(
        input_shape: ImageShape,
        kernel_size: usize,
        kernel: Array2<f64>,
        biases: Array2<f64>,
    ) -> Result<Conv2d, NetworkError> {
        let patch_len = kernel_size * kernel_size * input_shape.channels;
        if kernel_size == 0 || kernel.nrows() != patch_len || biases.dim() != (1, kernel.ncols()) {
            let (k, channels) = (kernel_size, input_shape.channels);
            return Err(NetworkError::InvalidArchitecture(format!(
                "kernel {:?} and biases {:?} do not fit a {k}x{k} window of {channels} channels",
                kernel.dim(),
                biases.dim()
            )));
        }
        Ok(Conv2d {
            input_shape,
            kernel_size,
            grad_kernel: Array2::zeros(kernel.raw_dim()),
            grad_biases: Array2::zeros(biases.raw_dim()),
            kernel,
            biases,
            patches: None,
        })
    }

    pub fn truncated_normal<R: Rng + ?Sized>(
        input_shape: ImageShape,
        kernel_size: usize,
        out_channels: usize,
        std_dev: f64,
        bias: f64,
        rng: &mut R,
    ) -> Result<Conv2d, NetworkError> {
        let patch_len = kernel_size * kernel_size * input_shape.channels;
        Conv2d::from_parameters(
            input_shape,
            kernel_size,
            Array2::random_using((patch_len, out_channels), TruncatedNormal { std_dev }, rng),
            Array2::from_elem((1, out_channels), bias),
        )
    }

    pub fn output_shape(&self) -> ImageShape {
        ImageShape {
            channels: self.kernel.ncols(),
            ..self.input_shape
        }
    }

    // Calls `visit(sample, patch_row, patch_column, input_column)` for every in-bounds pairing of a
    // patch entry with the input pixel it reads, one run of channels at a time. Padding is skipped.
    fn for_each_window(&self, batch: usize, mut visit: impl FnMut(usize, usize, usize, usize)) {
        let ImageShape {
            height,
            width,
            channels,
        } = self.input_shape;
        let k = self.kernel_size;
        let pad = (k - 1) / 2;

        for b in 0..batch {
            for y in 0..height {
                for x in 0..width {
                    let row = (b * height + y) * width + x;
                    for ky in 0..k {
                        let Some(iy) = (y + ky).checked_sub(pad).filter(|&iy| iy < height) else {
                            continue;
                        };
                        for kx in 0..k {
                            let Some(ix) = (x + kx).checked_sub(pad).filter(|&ix| ix < width)
                            else {
                                continue;
                            };
                            visit(
                                b,
                                row,
                                (ky * k + kx) * channels,
                                self.input_shape.offset(iy, ix),
                            );
                        }
                    }
                }
            }
        }
    }

    fn im2col(&self, input: &Array2<f64>) -> Array2<f64> {
        let ImageShape {
            height,
            width,
            channels,
        } = self.input_shape;
        let mut patches = Array2::zeros((
            input.nrows() * height * width,
            self.kernel_size * self.kernel_size * channels,
        ));
        self.for_each_window(input.nrows(), |b, row, column, source| {
            patches
                .slice_mut(s![row, column..column + channels])
                .assign(&input.slice(s![b, source..source + channels]));
        });
        patches
    }

    fn col2im(&self, grad_patches: &Array2<f64>, batch: usize) -> Array2<f64> {
        let channels = self.input_shape.channels;
        let mut grad_input = Array2::zeros((batch, self.input_shape.len()));
        self.for_each_window(batch, |b, row, column, source| {
            let mut target = grad_input.slice_mut(s![b, source..source + channels]);
            target += &grad_patches.slice(s![row, column..column + channels]);
        });
        grad_input
    }

    fn forward(&mut self, input: &Array2<f64>) -> Result<Array2<f64>, NetworkError> {
        check_width(self.input_shape.len(), input)?;
        let batch = input.nrows();
        let patches = self.im2col(input);
        let output = patches.dot(&self.kernel) + &self.biases;
        self.patches = Some(patches);
        Ok(output.into_shape_with_order((batch, self.output_shape().len()))?)
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>, NetworkError> {
        let patches = self.patches.as_ref().ok_or(NetworkError::NoForwardPass)?;
        let batch = grad.nrows();
        let grad = grad.to_shape((patches.nrows(), self.kernel.ncols()))?;

        self.grad_kernel = patches.t().dot(&grad);
        self.grad_biases = grad.sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_patches = grad.dot(&self.kernel.t());
        Ok(self.col2im(&grad_patches, batch))
    }
}

// Max pooling with SAME padding: the output is ceil(input / stride) on each side and padded
// positions never win the max.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    input_shape: ImageShape,
    size: usize,
    stride: usize,
    // For every output value, the input column it was taken from.
    argmax: Option<Array2<usize>>,
}

impl MaxPool2d {
    pub fn new(
        input_shape: ImageShape,
        size: usize,
        stride: usize,
    ) -> Result<MaxPool2d, NetworkError> {
        if size == 0 || stride == 0 {
            return Err(NetworkError::InvalidArchitecture(
                "pooling window and stride must be at least 1".into(),
            ));
        }
        Ok(MaxPool2d {
            input_shape,
            size,
            stride,
            argmax: None,
        })
    }

    pub fn output_shape(&self) -> ImageShape {
        ImageShape {
            height: self.input_shape.height.div_ceil(self.stride),
            width: self.input_shape.width.div_ceil(self.stride),
            channels: self.input_shape.channels,
        }
    }

    // Number of padding rows/columns placed before the input along one side.
    fn leading_padding(&self, input: usize, output: usize) -> usize {
        ((output - 1) * self.stride + self.size).saturating_sub(input) / 2
    }

    // Input indices along one side covered by the window starting at output position `o`.
    fn window(&self, o: usize, pad: usize, input: usize) -> std::ops::Range<usize> {
        let start = (o * self.stride).saturating_sub(pad);
        let end = (o * self.stride + self.size).saturating_sub(pad).min(input);
        start..end
    }

    fn forward(&mut self, input: &Array2<f64>) -> Result<Array2<f64>, NetworkError> {
        check_width(self.input_shape.len(), input)?;
        let out = self.output_shape();
        let pad_y = self.leading_padding(self.input_shape.height, out.height);
        let pad_x = self.leading_padding(self.input_shape.width, out.width);

        let mut output = Array2::zeros((input.nrows(), out.len()));
        let mut argmax = Array2::zeros((input.nrows(), out.len()));
        for (b, image) in input.outer_iter().enumerate() {
            for oy in 0..out.height {
                for ox in 0..out.width {
                    for c in 0..out.channels {
                        let mut best: Option<(usize, f64)> = None;
                        for iy in self.window(oy, pad_y, self.input_shape.height) {
                            for ix in self.window(ox, pad_x, self.input_shape.width) {
                                let column = self.input_shape.offset(iy, ix) + c;
                                let value = image[column];
                                if best.is_none_or(|(_, max)| value > max) {
                                    best = Some((column, value));
                                }
                            }
                        }
                        // SAME padding guarantees every window overlaps the input.
                        let (column, value) = best.ok_or_else(|| {
                            NetworkError::InvalidArchitecture(
                                "pooling window fell entirely into padding".into(),
                            )
                        })?;
                        let target = out.offset(oy, ox) + c;
                        output[[b, target]] = value;
                        argmax[[b, target]] = column;
                    }
                }
            }
        }

        self.argmax = Some(argmax);
        Ok(output)
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>, NetworkError> {
        let argmax = self.argmax.as_ref().ok_or(NetworkError::NoForwardPass)?;
        let mut grad_input = Array2::zeros((grad.nrows(), self.input_shape.len()));
        for ((b, o), &column) in argmax.indexed_iter() {
            grad_input[[b, column]] += grad[[b, o]];
        }
        Ok(grad_input)
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Dense(Dense),
    Relu(Relu),
    Dropout(Dropout),
    Conv2d(Conv2d),
    MaxPool2d(MaxPool2d),
}

impl Layer {
    // Compute this layer's output, remembering whatever the backward pass will need. Dropout only
    // drops values when `dropout_active` is set.
    pub fn forward(
        &mut self,
        input: &Array2<f64>,
        dropout_active: bool,
    ) -> Result<Array2<f64>, NetworkError> {
        match self {
            Layer::Dense(layer) => layer.forward(input),
            Layer::Relu(layer) => Ok(layer.forward(input)),
            Layer::Dropout(layer) => Ok(layer.forward(input, dropout_active)),
            Layer::Conv2d(layer) => layer.forward(input),
            Layer::MaxPool2d(layer) => layer.forward(input),
        }
    }

    // Given the loss gradient with respect to this layer's output, store the parameter gradients
    // and return the gradient with respect to its input.
    pub fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>, NetworkError> {
        match self {
            Layer::Dense(layer) => layer.backward(grad),
            Layer::Relu(layer) => layer.backward(grad),
            Layer::Dropout(layer) => Ok(layer.backward(grad)),
            Layer::Conv2d(layer) => layer.backward(grad),
            Layer::MaxPool2d(layer) => layer.backward(grad),
        }
    }

    // Each trainable parameter paired with its gradient from the latest backward pass.
    pub fn parameters(&mut self) -> Vec<(&mut Array2<f64>, &Array2<f64>)> {
        match self {
            Layer::Dense(layer) => vec![
                (&mut layer.weights, &layer.grad_weights),
                (&mut layer.biases, &layer.grad_biases),
            ],
            Layer::Conv2d(layer) => vec![
                (&mut layer.kernel, &layer.grad_kernel),
                (&mut layer.biases, &layer.grad_biases),
            ],
            Layer::Relu(_) | Layer::Dropout(_) | Layer::MaxPool2d(_) => Vec::new(),
        }
    }
}
