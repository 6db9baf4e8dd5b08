use crate::error::StratifyError;
use ndarray_rand::rand::{Rng, seq::SliceRandom};

// Group the indices 0..labels.len() by their label. Labels outside 0..n_class are rejected so
// that an unexpected class can never slip through unbucketed.
fn bucket_by_label(labels: &[usize], n_class: usize) -> Result<Vec<Vec<usize>>, StratifyError> {
    let mut buckets = vec![Vec::new(); n_class];
    for (index, &label) in labels.iter().enumerate() {
        buckets
            .get_mut(label)
            .ok_or(StratifyError::LabelOutOfRange { label, n_class })?
            .push(index);
    }
    Ok(buckets)
}

// Bucket the labels and confirm they can be dealt into `folds` groups without leaving any present
// class out of some fold.
fn fold_buckets(
    labels: &[usize],
    n_class: usize,
    folds: usize,
) -> Result<Vec<Vec<usize>>, StratifyError> {
    if folds == 0 {
        return Err(StratifyError::ZeroFolds);
    }
    if labels.len() < folds {
        return Err(StratifyError::TooFewExamples {
            examples: labels.len(),
            folds,
        });
    }

    let buckets = bucket_by_label(labels, n_class)?;

    // A class that is present but smaller than the fold count would be missing from some folds.
    if let Some((class, bucket)) = buckets
        .iter()
        .enumerate()
        .find(|(_, bucket)| !bucket.is_empty() && bucket.len() < folds)
    {
        return Err(StratifyError::ClassTooSmall {
            class,
            count: bucket.len(),
            folds,
        });
    }
    Ok(buckets)
}

// Fails exactly when `stratified_folds` would, without drawing from any generator.
pub fn check_folds(labels: &[usize], n_class: usize, folds: usize) -> Result<(), StratifyError> {
    fold_buckets(labels, n_class, folds).map(|_| ())
}

// Partition the indices of `labels` into `folds` disjoint groups whose union is every index, with
// each group's label distribution as close as possible to the full set's.
//
// Every class bucket is shuffled on its own, then the buckets are laid end to end and dealt out
// round-robin with a single cursor. Because the cursor carries over from one class to the next,
// fold sizes differ by at most one overall, and each fold receives either floor or ceil of
// count / folds members of every class. The cursor starts at a random fold so the leftover
// examples are not always handed to the same fold, and both the folds and their contents are
// shuffled before returning.
pub fn stratified_folds<R: Rng + ?Sized>(
    labels: &[usize],
    n_class: usize,
    folds: usize,
    rng: &mut R,
) -> Result<Vec<Vec<usize>>, StratifyError> {
    let mut buckets = fold_buckets(labels, n_class, folds)?;

    let mut partition: Vec<Vec<usize>> = (0..folds)
        .map(|_| Vec::with_capacity(labels.len() / folds + 1))
        .collect();

    let mut cursor = rng.gen_range(0..folds);
    for bucket in buckets.iter_mut() {
        bucket.shuffle(rng);
        for &index in bucket.iter() {
            partition[cursor].push(index);
            cursor = (cursor + 1) % folds;
        }
    }

    for fold in partition.iter_mut() {
        fold.shuffle(rng);
    }
    partition.shuffle(rng);

    Ok(partition)
}

// Split the indices of `labels` once into a (train, test) pair, with `test_fraction` of every
// class (rounded) landing on the test side. Both halves come back sorted.
pub fn stratified_shuffle_split<R: Rng + ?Sized>(
    labels: &[usize],
    n_class: usize,
    test_fraction: f64,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<usize>), StratifyError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(StratifyError::InvalidFraction(test_fraction));
    }

    let mut train = Vec::with_capacity(labels.len());
    let mut test = Vec::with_capacity(labels.len());

    for mut bucket in bucket_by_label(labels, n_class)? {
        bucket.shuffle(rng);
        let test_count = (bucket.len() as f64 * test_fraction).round() as usize;
        let (test_part, train_part) = bucket.split_at(test_count);
        test.extend_from_slice(test_part);
        train.extend_from_slice(train_part);
    }

    train.sort_unstable();
    test.sort_unstable();

    Ok((train, test))
}
