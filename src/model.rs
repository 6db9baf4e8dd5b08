use ndarray::ArrayView2;

// The boundary between the trainer and whatever computes gradients. The trainer only ever asks a
// model to take one optimisation step on a batch, or to score a set of examples. Features arrive
// one row per example and labels one-hot encoded, one row per example.
pub trait Model {
    type Error: std::error::Error;

    // Forward pass, loss, backward pass and one parameter update on this batch. Returns the batch's
    // mean loss.
    fn train_step(
        &mut self,
        features: ArrayView2<f64>,
        labels: ArrayView2<f64>,
    ) -> Result<f64, Self::Error>;

    // Forward pass only, returning the fraction of examples classified correctly. Parameters are
    // left untouched. With `inference_mode` set, regularisation such as dropout is switched off.
    fn evaluate(
        &mut self,
        features: ArrayView2<f64>,
        labels: ArrayView2<f64>,
        inference_mode: bool,
    ) -> Result<f64, Self::Error>;
}
