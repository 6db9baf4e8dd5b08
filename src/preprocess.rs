use ndarray::{Array1, Array2, ArrayView2, Axis};

// Scales every feature column into [-1, 1] by its largest absolute value on the data it was fitted
// on. Zero stays zero, so sparse inputs like mostly-blank digit images stay sparse. Fit on the
// training set only, then transform training and validation data with the same scaler.
#[derive(Debug, Clone, PartialEq)]
pub struct MaxAbsScaler {
    scale: Array1<f64>,
}

impl MaxAbsScaler {
    pub fn fit(features: ArrayView2<f64>) -> MaxAbsScaler {
        let scale = features
            .map(|value| value.abs())
            .fold_axis(Axis(0), 0.0_f64, |&max, &value| max.max(value))
            // A column that is zero everywhere is left untouched rather than divided by zero.
            .mapv(|max| if max == 0.0 { 1.0 } else { max });
        MaxAbsScaler { scale }
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    pub fn transform(&self, features: ArrayView2<f64>) -> Array2<f64> {
        &features / &self.scale
    }

    pub fn fit_transform(features: ArrayView2<f64>) -> (MaxAbsScaler, Array2<f64>) {
        let scaler = MaxAbsScaler::fit(features);
        let scaled = scaler.transform(features);
        (scaler, scaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn scales_by_column_max_abs() {
        let features = array![[0.0, -4.0, 255.0], [0.0, 2.0, 51.0]];

        let (scaler, scaled) = MaxAbsScaler::fit_transform(features.view());

        assert_eq!(scaler.scale(), &array![1.0, 4.0, 255.0]);
        assert_abs_diff_eq!(scaled[[0, 1]], -1.0);
        assert_abs_diff_eq!(scaled[[1, 1]], 0.5);
        assert_abs_diff_eq!(scaled[[1, 2]], 0.2);
    }

    #[test]
    fn zeros_stay_zero() {
        let training = array![[0.0, 10.0], [0.0, 0.0]];
        let validation = array![[0.0, 0.0], [3.0, 20.0]];

        let scaler = MaxAbsScaler::fit(training.view());
        let scaled = scaler.transform(validation.view());

        assert_eq!(scaled[[0, 0]], 0.0);
        assert_eq!(scaled[[0, 1]], 0.0);
        // Values the scaler was not fitted on may fall outside [-1, 1].
        assert_abs_diff_eq!(scaled[[1, 1]], 2.0);
        assert_abs_diff_eq!(scaled[[1, 0]], 3.0);
    }
}
