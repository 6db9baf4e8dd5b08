use crate::network::argmax;
use ndarray::{Array2, ArrayView2};

// counts[[actual, predicted]] is how many examples of class `actual` were predicted as `predicted`.
pub fn confusion_matrix(actual: &[usize], predicted: &[usize], n_class: usize) -> Array2<usize> {
    let mut counts = Array2::zeros((n_class, n_class));
    for (&truth, &guess) in actual.iter().zip(predicted) {
        if truth < n_class && guess < n_class {
            counts[[truth, guess]] += 1;
        }
    }
    counts
}

// Fraction of examples where prediction and label agree.
pub fn accuracy(actual: &[usize], predicted: &[usize]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let correct = actual.iter().zip(predicted).filter(|(a, p)| a == p).count();
    correct as f64 / actual.len() as f64
}

#[derive(Clone, Debug, PartialEq)]
pub struct Misclassification {
    pub index: usize,
    pub actual: usize,
    pub predicted: usize,
    pub confidence: f64,
    pub second_choice: usize,
    pub second_confidence: f64,
}

// Every row whose most probable class differs from its label, along with the runner-up. With a
// single class there is no runner-up and nothing can be misclassified.
pub fn misclassified(actual: &[usize], probabilities: ArrayView2<f64>) -> Vec<Misclassification> {
    if probabilities.ncols() < 2 {
        return Vec::new();
    }
    actual
        .iter()
        .zip(probabilities.outer_iter())
        .enumerate()
        .filter_map(|(index, (&actual, row))| {
            let predicted = argmax(row);
            if predicted == actual {
                return None;
            }
            let second_choice = row
                .iter()
                .enumerate()
                .filter(|&(class, _)| class != predicted)
                .fold((0, f64::NEG_INFINITY), |(best, max), (class, &p)| {
                    if p > max { (class, p) } else { (best, max) }
                })
                .0;
            Some(Misclassification {
                index,
                actual,
                predicted,
                confidence: row[predicted],
                second_choice,
                second_confidence: row[second_choice],
            })
        })
        .collect()
}

// Rows are true classes, columns predicted classes.
pub fn format_confusion_matrix(counts: &Array2<usize>) -> String {
    let width = counts
        .iter()
        .map(|c| c.to_string().len())
        .max()
        .unwrap_or(1)
        .max(counts.ncols().to_string().len())
        .max(4);

    let mut table = format!("{:>6} |", "actual");
    for class in 0..counts.ncols() {
        table.push_str(&format!(" {class:>width$}"));
    }
    table.push('\n');
    table.push_str(&"-".repeat(8 + counts.ncols() * (width + 1)));
    table.push('\n');
    for (class, row) in counts.outer_iter().enumerate() {
        table.push_str(&format!("{class:>6} |"));
        for count in row {
            table.push_str(&format!(" {count:>width$}"));
        }
        table.push('\n');
    }
    table
}
