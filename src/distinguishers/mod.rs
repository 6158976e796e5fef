//! Key-recovery distinguishers and ranking metrics.
pub mod cpa;

use rayon::prelude::{IntoParallelIterator, ParallelIterator};

/// Score every key candidate in `0..guess_range` with `score_fn` and rank
/// them by descending score.
///
/// Returns `(candidate, score)` pairs, best candidate first. Candidates with
/// equal scores keep their index order.
pub fn score_and_rank<F>(guess_range: usize, score_fn: F) -> Vec<(usize, f64)>
where
    F: Fn(usize) -> f64 + Sync,
{
    let mut scores: Vec<(usize, f64)> = (0..guess_range)
        .into_par_iter()
        .map(|candidate| (candidate, score_fn(candidate)))
        .collect();

    scores.sort_by(|a, b| f64::total_cmp(&b.1, &a.1));

    scores
}

/// Success rate and guessing entropy over repeated key-recovery experiments.
///
/// An experiment succeeds when its correct key ranks within the first `order`
/// candidates. Guessing entropy is the average log2 rank (1-based) of the
/// correct key.
///
/// # Panics
/// Panic if `correct_keys.len() != experiment_ranks.len()`.
pub fn success_rate_guessing_entropy(
    correct_keys: &[usize],
    experiment_ranks: &[Vec<(usize, f64)>],
    order: usize,
) -> (f64, f64) {
    assert_eq!(correct_keys.len(), experiment_ranks.len());

    let num_experiments = correct_keys.len();
    let mut success_rate = 0.0;
    let mut guessing_entropy = 0.0;

    for (&correct_key, ranks) in correct_keys.iter().zip(experiment_ranks.iter()) {
        if ranks
            .iter()
            .take(order)
            .any(|&(candidate, _)| candidate == correct_key)
        {
            success_rate += 1.0;
        }

        if let Some(position) = ranks
            .iter()
            .position(|&(candidate, _)| candidate == correct_key)
        {
            guessing_entropy += ((position + 1) as f64).log2();
        }
    }

    (
        success_rate / num_experiments as f64,
        guessing_entropy / num_experiments as f64,
    )
}
