use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

// Index of the largest value in a row. Ties go to the first occurrence.
pub fn argmax(row: ArrayView1<f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, max), (index, &value)| {
            if value > max { (index, value) } else { (best, max) }
        })
        .0
}

// Per-row log of the softmax, with each row shifted by its maximum first so exp never overflows.
fn log_softmax(logits: ArrayView2<f64>) -> Array2<f64> {
    let max = logits
        .map_axis(Axis(1), |row| row.fold(f64::NEG_INFINITY, |max, &v| max.max(v)))
        .insert_axis(Axis(1));
    let shifted = &logits - &max;
    let log_sum = shifted
        .mapv(f64::exp)
        .sum_axis(Axis(1))
        .mapv(f64::ln)
        .insert_axis(Axis(1));
    shifted - &log_sum
}

// Class probabilities for each row of logits.
pub fn softmax(logits: ArrayView2<f64>) -> Array2<f64> {
    log_softmax(logits).mapv(f64::exp)
}

// Mean cross-entropy between softmax(logits) and one-hot labels, together with its gradient with
// respect to the logits. `logits` and `labels` must have the same shape and at least one row.
pub fn softmax_cross_entropy(
    logits: ArrayView2<f64>,
    labels: ArrayView2<f64>,
) -> (f64, Array2<f64>) {
    let rows = logits.nrows() as f64;
    let log_probs = log_softmax(logits);
    let loss = -(&labels * &log_probs).sum() / rows;
    let grad = (log_probs.mapv(f64::exp) - &labels) / rows;
    (loss, grad)
}

// Number of rows whose highest logit sits in the same column as the label's 1.0.
pub fn correct_count(logits: ArrayView2<f64>, labels: ArrayView2<f64>) -> usize {
    logits
        .outer_iter()
        .zip(labels.outer_iter())
        .filter(|(prediction, truth)| argmax(prediction.view()) == argmax(truth.view()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn softmax_rows_sum_to_one_even_for_huge_logits() {
        let probabilities = softmax(array![[1000.0, 1000.0], [0.0, f64::ln(3.0)]].view());

        assert_abs_diff_eq!(probabilities, array![[0.5, 0.5], [0.25, 0.75]], epsilon = 1e-12);
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_classes() {
        let logits = Array2::zeros((3, 4));
        let labels = array![
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0]
        ];

        let (loss, grad) = softmax_cross_entropy(logits.view(), labels.view());

        assert_abs_diff_eq!(loss, 4.0_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(grad[[0, 0]], (0.25 - 1.0) / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[[0, 1]], 0.25 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn cross_entropy_gradient_matches_numeric() {
        let logits = array![[0.3, -1.2, 2.0], [1.0, 0.5, -0.5]];
        let labels = array![[0.0, 0.0, 1.0], [0.0, 1.0, 0.0]];
        let (_, grad) = softmax_cross_entropy(logits.view(), labels.view());

        let step = 1e-6;
        for ((r, c), &analytic) in grad.indexed_iter() {
            let mut plus = logits.clone();
            plus[[r, c]] += step;
            let mut minus = logits.clone();
            minus[[r, c]] -= step;
            let numeric = (softmax_cross_entropy(plus.view(), labels.view()).0
                - softmax_cross_entropy(minus.view(), labels.view()).0)
                / (2.0 * step);
            assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn correct_count_compares_argmax() {
        let logits = array![[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]];
        let labels = array![[0.0, 1.0], [0.0, 1.0], [0.0, 1.0]];

        assert_eq!(correct_count(logits.view(), labels.view()), 2);
    }
}
