//! Correlation power analysis.
use crate::{
    Error,
    preprocessors::moving_average,
    util::{argmax_by, argsort_by, max_abs_per_row},
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::{IntoParallelIterator, ParallelIterator};

/// Compute the [`Cpa`] of the given traces.
///
/// The Pearson correlation between the observed traces and the leakage
/// predicted by `leakage_func` is computed per sample for every key guess.
/// `order` raises the centered values to the given power before correlating,
/// for higher-order analysis of masked implementations. `window_size` smooths
/// the observed traces with a moving average to absorb sample-alignment
/// jitter; a window of 1 disables smoothing.
///
/// A leakage model that maps every trace to the same predicted value has no
/// variance to correlate against and fails with
/// [`Error::ZeroVariancePrediction`].
///
/// # Panics
/// - Panic if `order` is 0.
/// - Panic if `window_size` is 0.
pub fn cpa<F>(
    traces: ArrayView2<f64>,
    plaintexts: ArrayView2<u8>,
    guess_range: usize,
    target_byte: usize,
    leakage_func: F,
    order: u32,
    window_size: usize,
) -> Result<Cpa, Error>
where
    F: Fn(usize, usize) -> usize + Sync,
{
    let (num_traces, num_samples) = (traces.shape()[0], traces.shape()[1]);
    if plaintexts.shape()[0] != num_traces {
        return Err(Error::MismatchedTraceCount {
            traces: num_traces,
            rows: plaintexts.shape()[0],
        });
    }
    if target_byte >= plaintexts.shape()[1] {
        return Err(Error::TargetByteOutOfRange {
            byte: target_byte,
            width: plaintexts.shape()[1],
        });
    }

    // Smoothing does not depend on the guess, apply it once up front.
    let smoothed = smooth_traces(traces, window_size);

    let rows = (0..guess_range)
        .into_par_iter()
        .map(|guess| {
            let predicted = plaintexts
                .column(target_byte)
                .mapv(|plaintext_byte| leakage_func(plaintext_byte as usize, guess) as f64);

            correlation_trace(smoothed.view(), predicted.view(), guess, order, 1)
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let mut corr = Array2::zeros((guess_range, num_samples));
    for (guess, row) in rows.into_iter().enumerate() {
        corr.row_mut(guess).assign(&row);
    }

    Ok(Cpa { corr })
}

/// Per-sample Pearson correlation between observed traces and the predicted
/// leakage of a single key hypothesis.
///
/// `guess` is only used to report which hypothesis produced a degenerate
/// prediction. Samples where the observed traces have zero variance yield a
/// correlation of 0 instead of NaN.
///
/// # Panics
/// - Panic if `order` is 0.
/// - Panic if `window_size` is 0.
pub fn correlation_trace(
    observed: ArrayView2<f64>,
    predicted: ArrayView1<f64>,
    guess: usize,
    order: u32,
    window_size: usize,
) -> Result<Array1<f64>, Error> {
    assert!(order > 0);

    let num_traces = observed.shape()[0];
    if predicted.len() != num_traces {
        return Err(Error::MismatchedTraceCount {
            traces: num_traces,
            rows: predicted.len(),
        });
    }

    let predicted = center_to_order(predicted, order);
    let predicted_sum_squares = predicted.dot(&predicted);
    if predicted_sum_squares == 0.0 {
        return Err(Error::ZeroVariancePrediction { guess });
    }

    let smoothed = smooth_traces(observed, window_size);
    let centered = center_columns_to_order(smoothed, order);

    // covariance numerator and observed sum of squares, per sample
    let numerator = centered.t().dot(&predicted);
    let observed_sum_squares = (&centered * &centered).sum_axis(Axis(0));

    Ok(numerator
        .iter()
        .zip(observed_sum_squares.iter())
        .map(|(&num, &obs_ss)| {
            let denominator = (obs_ss * predicted_sum_squares).sqrt();
            if denominator == 0.0 { 0.0 } else { num / denominator }
        })
        .collect())
}

/// Center a predicted leakage vector, raising to `order` for higher-order
/// analysis. The powered values are centered again so the correlation
/// numerator stays a covariance.
fn center_to_order(predicted: ArrayView1<f64>, order: u32) -> Array1<f64> {
    let mean = predicted.sum() / predicted.len() as f64;
    let mut centered = predicted.mapv(|x| x - mean);

    if order > 1 {
        centered.mapv_inplace(|x| x.powi(order as i32));
        let mean = centered.sum() / centered.len() as f64;
        centered.mapv_inplace(|x| x - mean);
    }

    centered
}

/// Center every sample column across traces, raising to `order` like
/// [`center_to_order`].
fn center_columns_to_order(traces: Array2<f64>, order: u32) -> Array2<f64> {
    let num_traces = traces.shape()[0] as f64;
    let mean = traces.sum_axis(Axis(0)) / num_traces;
    let mut centered = traces - &mean;

    if order > 1 {
        centered.mapv_inplace(|x| x.powi(order as i32));
        let mean = centered.sum_axis(Axis(0)) / num_traces;
        centered -= &mean;
    }

    centered
}

/// Smooth every trace with a trailing moving average. A window of 1 is the
/// identity.
fn smooth_traces(traces: ArrayView2<f64>, window_size: usize) -> Array2<f64> {
    assert!(window_size > 0);

    if window_size == 1 {
        return traces.to_owned();
    }

    let mut smoothed = Array2::zeros(traces.raw_dim());
    for (trace, mut out) in traces.rows().into_iter().zip(smoothed.rows_mut()) {
        out.assign(&moving_average(trace, window_size));
    }
    smoothed
}

/// Result of the CPA[^1] on some traces.
///
/// [^1]: <https://www.iacr.org/archive/ches2004/31560016/31560016.pdf>
#[derive(Debug)]
pub struct Cpa {
    /// Pearson correlation coefficients
    pub(crate) corr: Array2<f64>,
}

impl Cpa {
    /// Rank guesses by increasing peak correlation magnitude.
    pub fn rank(&self) -> Array1<usize> {
        let rank = argsort_by(&self.max_corr().to_vec()[..], f64::total_cmp);

        Array1::from_vec(rank)
    }

    /// Return the Pearson correlation coefficients.
    pub fn corr(&self) -> ArrayView2<f64> {
        self.corr.view()
    }

    /// Return the guess with the highest peak correlation magnitude.
    pub fn best_guess(&self) -> usize {
        argmax_by(self.max_corr().view(), f64::total_cmp)
    }

    /// Return the maximum absolute correlation coefficient for each guess.
    pub fn max_corr(&self) -> Array1<f64> {
        max_abs_per_row(self.corr.view())
    }
}

#[cfg(test)]
mod tests {
    use super::{Cpa, correlation_trace, cpa};
    use crate::{Error, leakage_model::sbox_hw};
    use ndarray::{Array1, Array2, array};
    use ndarray_rand::rand_distr::{Distribution, Normal};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    /// Traces leaking hw(sbox(pt ^ key)) at one sample index.
    fn synthetic_traces(
        key: u8,
        num_traces: usize,
        num_samples: usize,
        leaky_sample: usize,
        noise_std: f64,
        rng: &mut StdRng,
    ) -> (Array2<f64>, Array2<u8>) {
        let noise = Normal::new(0.0, noise_std).unwrap();
        let plaintexts = Array2::from_shape_fn((num_traces, 16), |_| rng.r#gen::<u8>());
        let mut traces = Array2::from_shape_fn((num_traces, num_samples), |_| noise.sample(rng));
        for i in 0..num_traces {
            traces[[i, leaky_sample]] +=
                2.0 * sbox_hw(plaintexts[[i, 0]], key as usize) as f64;
        }

        (traces, plaintexts)
    }

    #[test]
    fn test_cpa_recovers_key() {
        let mut rng = StdRng::seed_from_u64(42);
        let key = 0x2b;
        let (traces, plaintexts) = synthetic_traces(key, 800, 16, 5, 0.5, &mut rng);

        let cpa = cpa(
            traces.view(),
            plaintexts.view(),
            256,
            0,
            |plaintext_byte, guess| sbox_hw(plaintext_byte as u8, guess),
            1,
            1,
        )
        .unwrap();

        assert_eq!(cpa.corr().shape(), [256, 16]);
        assert_eq!(cpa.best_guess(), key as usize);
        assert_eq!(cpa.rank()[255], key as usize);

        // the peak sits at the leaky sample
        let best_row = cpa.corr();
        let best_row = best_row.row(key as usize);
        for i in 0..16 {
            if i != 5 {
                assert!(best_row[5].abs() > best_row[i].abs());
            }
        }
    }

    #[test]
    fn test_cpa_smoothing_keeps_key() {
        let mut rng = StdRng::seed_from_u64(43);
        let key = 0xa7;
        let (traces, plaintexts) = synthetic_traces(key, 800, 16, 5, 0.5, &mut rng);

        let cpa = cpa(
            traces.view(),
            plaintexts.view(),
            256,
            0,
            |plaintext_byte, guess| sbox_hw(plaintext_byte as u8, guess),
            1,
            3,
        )
        .unwrap();

        assert_eq!(cpa.best_guess(), key as usize);
    }

    #[test]
    fn test_cpa_degenerate_prediction() {
        let mut rng = StdRng::seed_from_u64(44);
        let (traces, plaintexts) = synthetic_traces(0x00, 50, 4, 1, 0.5, &mut rng);

        // constant leakage model has zero variance for every guess
        let result = cpa(
            traces.view(),
            plaintexts.view(),
            256,
            0,
            |_, _| 3,
            1,
            1,
        );
        assert!(matches!(
            result,
            Err(Error::ZeroVariancePrediction { .. })
        ));
    }

    #[test]
    fn test_correlation_trace_perfect_correlation() {
        let observed = array![[1.0, 4.0], [2.0, 4.0], [3.0, 4.0]];
        let predicted = array![1.0, 2.0, 3.0];

        let corr = correlation_trace(observed.view(), predicted.view(), 0, 1, 1).unwrap();
        assert!((corr[0] - 1.0).abs() < 1e-12);
        // zero-variance observed sample reports 0 instead of NaN
        assert_eq!(corr[1], 0.0);
    }

    #[test]
    fn test_correlation_trace_length_mismatch() {
        let observed = array![[1.0, 2.0], [3.0, 4.0]];
        let predicted = array![1.0, 2.0, 3.0];

        assert!(matches!(
            correlation_trace(observed.view(), predicted.view(), 0, 1, 1),
            Err(Error::MismatchedTraceCount { traces: 2, rows: 3 })
        ));
    }

    #[test]
    fn test_second_order_runs() {
        let mut rng = StdRng::seed_from_u64(45);
        let observed = Array2::from_shape_fn((100, 8), |_| rng.r#gen::<f64>());
        let predicted = Array1::from_shape_fn(100, |_| rng.gen_range(0.0..8.0));

        let corr = correlation_trace(observed.view(), predicted.view(), 0, 2, 2).unwrap();
        assert_eq!(corr.len(), 8);
        for value in corr.iter() {
            assert!(value.is_finite());
            assert!(value.abs() <= 1.0 + 1e-9);
        }
    }

    #[test]
    fn test_max_corr() {
        let cpa = Cpa {
            corr: array![[0.1, -0.9], [0.4, 0.2]],
        };
        assert_eq!(cpa.max_corr(), array![0.9, 0.4]);
        assert_eq!(cpa.best_guess(), 0);
    }
}
