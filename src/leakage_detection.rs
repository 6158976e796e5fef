//! Leakage detection methods
use crate::{Error, processors::MeanVar};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use num_traits::AsPrimitive;
use rayon::iter::{ParallelBridge, ParallelIterator};
use std::{iter::zip, ops::Add, ops::Range};

/// Compute the SNR of the given traces.
///
/// `get_class` is a function returning the class of the given trace by index.
///
/// # Panics
/// Panic if `batch_size` is 0.
pub fn snr<T, F>(
    traces: ArrayView2<T>,
    num_classes: usize,
    get_class: F,
    batch_size: usize,
) -> Array1<f64>
where
    T: AsPrimitive<f64> + Copy + Sync,
    F: Fn(usize) -> usize + Sync,
{
    assert!(batch_size > 0);

    // From benchmarks fold + reduce_with is faster than map + reduce/reduce_with and fold + reduce
    traces
        .axis_chunks_iter(Axis(0), batch_size)
        .enumerate()
        .par_bridge()
        .fold(
            || SnrProcessor::new(traces.shape()[1], num_classes),
            |mut snr, (batch_idx, trace_batch)| {
                for i in 0..trace_batch.shape()[0] {
                    snr.process(trace_batch.row(i), get_class(batch_idx * batch_size + i));
                }
                snr
            },
        )
        .reduce_with(|a, b| a + b)
        .unwrap()
        .snr()
}

/// Processes traces to calculate the Signal-to-Noise Ratio.
///
/// SNR = Var(per-class means) / Mean(per-class variances), computed per
/// sample. Classes with no member traces are excluded from both terms.
#[derive(Debug, Clone)]
pub struct SnrProcessor {
    /// Sum of traces per class
    classes_sum: Array2<f64>,
    /// Sum of square of traces per class
    classes_sum_squares: Array2<f64>,
    /// Counts the number of traces per class
    classes_count: Array1<usize>,
}

impl SnrProcessor {
    /// Create a new SNR processor.
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the input traces
    /// * `num_classes` - Number of classes
    pub fn new(size: usize, num_classes: usize) -> Self {
        Self {
            classes_sum: Array2::zeros((num_classes, size)),
            classes_sum_squares: Array2::zeros((num_classes, size)),
            classes_count: Array1::zeros(num_classes),
        }
    }

    /// Process an input trace to update internal accumulators.
    ///
    /// # Panics
    /// - Panics in debug if the length of the trace is different from the size of
    ///   [`SnrProcessor`].
    /// - Panics if `class` is out of range.
    pub fn process<T: AsPrimitive<f64>>(&mut self, trace: ArrayView1<T>, class: usize) {
        debug_assert!(trace.len() == self.size());

        for i in 0..self.size() {
            let x = trace[i].as_();

            self.classes_sum[[class, i]] += x;
            self.classes_sum_squares[[class, i]] += x * x;
        }

        self.classes_count[class] += 1;
    }

    /// Returns the Signal-to-Noise Ratio of the traces.
    pub fn snr(&self) -> Array1<f64> {
        let size = self.size();

        let mut mean_sum: Array1<f64> = Array1::zeros(size);
        let mut mean_sum_squares: Array1<f64> = Array1::zeros(size);
        let mut var_sum: Array1<f64> = Array1::zeros(size);
        let mut populated = 0usize;

        for class in 0..self.num_classes() {
            let count = self.classes_count[class];
            if count == 0 {
                continue;
            }
            populated += 1;

            let count = count as f64;
            for i in 0..size {
                let mean = self.classes_sum[[class, i]] / count;
                let var = self.classes_sum_squares[[class, i]] / count - mean * mean;

                mean_sum[i] += mean;
                mean_sum_squares[i] += mean * mean;
                var_sum[i] += var;
            }
        }

        let populated = populated as f64;

        // Variance of the class means; rounding can push it barely below zero
        let signal = (mean_sum_squares / populated
            - (mean_sum / populated).mapv(|mean| mean * mean))
        .mapv(|var| var.max(0.0));
        // Mean of the within-class variances
        let noise = var_sum / populated;

        signal / noise
    }

    /// Return the trace size handled
    pub fn size(&self) -> usize {
        self.classes_sum.shape()[1]
    }

    /// Return the number of classes handled.
    pub fn num_classes(&self) -> usize {
        self.classes_count.len()
    }

    /// Determine if two [`SnrProcessor`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.size() == other.size() && self.num_classes() == other.num_classes()
    }
}

impl Add for SnrProcessor {
    type Output = Self;

    /// Merge computations of two [`SnrProcessor`]. Processors need to be compatible to be merged
    /// together, otherwise it can panic or yield incoherent result (see
    /// [`SnrProcessor::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        Self {
            classes_sum: self.classes_sum + rhs.classes_sum,
            classes_sum_squares: self.classes_sum_squares + rhs.classes_sum_squares,
            classes_count: self.classes_count + rhs.classes_count,
        }
    }
}

/// Compute the Welch's T-test of the given traces.
///
/// `trace_classes` tells for each trace whether it belongs to the fixed
/// (`false`) or random (`true`) set.
///
/// # Panics
/// - Panic if `traces.shape()[0] != trace_classes.shape()[0]`
/// - Panic if `batch_size` is 0.
pub fn ttest<T>(
    traces: ArrayView2<T>,
    trace_classes: ArrayView1<bool>,
    batch_size: usize,
) -> Array1<f64>
where
    T: AsPrimitive<f64> + Copy + Sync,
{
    assert_eq!(traces.shape()[0], trace_classes.shape()[0]);
    assert!(batch_size > 0);

    zip(
        traces.axis_chunks_iter(Axis(0), batch_size),
        trace_classes.axis_chunks_iter(Axis(0), batch_size),
    )
    .par_bridge()
    .fold(
        || TTestProcessor::new(traces.shape()[1]),
        |mut ttest, (trace_batch, trace_classes_batch)| {
            for i in 0..trace_batch.shape()[0] {
                ttest.process(trace_batch.row(i), trace_classes_batch[i]);
            }
            ttest
        },
    )
    .reduce_with(|a, b| a + b)
    .unwrap()
    .ttest()
}

/// Compute the Welch's T-test over a contiguous range of dataset partitions.
///
/// `fixed_partitions[i]` and `random_partitions[i]` hold the i-th partition of
/// the fixed and random trace sets. The statistic is accumulated partition by
/// partition, so the concatenation of the selected range is never
/// materialized. Partition trace counts may differ between the two sets, but
/// every partition must share the same sample count. An empty range is
/// rejected, as the statistic is undefined without traces.
pub fn ttest_partitions<'a>(
    fixed_partitions: &[ArrayView2<'a, f64>],
    random_partitions: &[ArrayView2<'a, f64>],
    range: Range<usize>,
) -> Result<Array1<f64>, Error> {
    if range.is_empty() {
        return Err(Error::EmptyPartitionRange {
            start: range.start,
            end: range.end,
        });
    }

    let count = usize::min(fixed_partitions.len(), random_partitions.len());
    if range.end > count {
        return Err(Error::PartitionOutOfRange {
            index: range.end - 1,
            count,
        });
    }

    let size = fixed_partitions[range.start].shape()[1];
    let mut processor = TTestProcessor::new(size);
    for index in range {
        let (fixed, random) = (&fixed_partitions[index], &random_partitions[index]);
        for partition in [fixed, random] {
            if partition.shape()[1] != size {
                return Err(Error::MismatchedSampleCount {
                    left: size,
                    right: partition.shape()[1],
                });
            }
        }

        for trace in fixed.rows() {
            processor.process(trace, false);
        }
        for trace in random.rows() {
            processor.process(trace, true);
        }
    }

    Ok(processor.ttest())
}

/// Maximum absolute t-statistic of a t-test result, ignoring NaN samples
/// (zero-variance boundary case).
pub fn max_t(t: ArrayView1<f64>) -> f64 {
    t.iter()
        .filter(|x| !x.is_nan())
        .fold(0.0, |acc: f64, x| acc.max(x.abs()))
}

/// Process traces to calculate Welch's T-Test.
#[derive(Debug)]
pub struct TTestProcessor {
    mean_var_fixed: MeanVar,
    mean_var_random: MeanVar,
}

impl TTestProcessor {
    /// Create a new Welch's T-Test processor.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of samples per trace
    pub fn new(size: usize) -> Self {
        Self {
            mean_var_fixed: MeanVar::new(size),
            mean_var_random: MeanVar::new(size),
        }
    }

    /// Process an input trace to update internal accumulators.
    ///
    /// # Arguments
    ///
    /// * `trace` - Input trace.
    /// * `class` - Indicates to which of the two sets the given trace belongs (`false` for
    ///   fixed, `true` for random).
    ///
    /// # Panics
    /// Panics in debug if `trace.len() != self.size()`.
    pub fn process<T: AsPrimitive<f64>>(&mut self, trace: ArrayView1<T>, class: bool) {
        debug_assert!(trace.len() == self.size());

        if class {
            self.mean_var_random.process(trace);
        } else {
            self.mean_var_fixed.process(trace);
        }
    }

    /// Calculate and return Welch's T-Test result.
    ///
    /// The variances of the two sets are not pooled; each is divided by its
    /// own trace count.
    pub fn ttest(&self) -> Array1<f64> {
        // E(fixed) - E(random)
        let q = self.mean_var_fixed.mean() - self.mean_var_random.mean();

        // √(σf²/Nf + σr²/Nr), with population variances like MeanVar; the
        // n/(n-1) correction is negligible at TVLA trace counts
        let d = ((self.mean_var_fixed.var() / self.mean_var_fixed.count() as f64)
            + (self.mean_var_random.var() / self.mean_var_random.count() as f64))
            .mapv(f64::sqrt);
        q / d
    }

    /// Return the trace size handled.
    pub fn size(&self) -> usize {
        self.mean_var_fixed.size()
    }

    /// Determine if two [`TTestProcessor`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.size() == other.size()
    }
}

impl Add for TTestProcessor {
    type Output = Self;

    /// Merge computations of two [`TTestProcessor`]. Processors need to be compatible to be
    /// merged together, otherwise it can panic or yield incoherent result (see
    /// [`TTestProcessor::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        Self {
            mean_var_fixed: self.mean_var_fixed + rhs.mean_var_fixed,
            mean_var_random: self.mean_var_random + rhs.mean_var_random,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SnrProcessor, TTestProcessor, max_t, snr, ttest, ttest_partitions};
    use crate::Error;
    use ndarray::{Array1, Array2, array, s};
    use ndarray_rand::rand_distr::{Distribution, Normal};
    use rand::{SeedableRng, rngs::StdRng};

    fn gaussian_traces(
        num_traces: usize,
        num_samples: usize,
        std: f64,
        rng: &mut StdRng,
    ) -> Array2<f64> {
        let normal = Normal::new(0.0, std).unwrap();
        Array2::from_shape_fn((num_traces, num_samples), |_| normal.sample(rng))
    }

    #[test]
    fn test_snr_flags_leaky_sample() {
        let mut rng = StdRng::seed_from_u64(17);
        let num_traces = 500;
        let mut traces = gaussian_traces(num_traces, 8, 1.0, &mut rng);

        // classes 0..4 leak into sample 2 only
        let classes: Vec<usize> = (0..num_traces).map(|i| i % 4).collect();
        for (i, class) in classes.iter().enumerate() {
            traces[[i, 2]] += 10.0 * *class as f64;
        }

        let snr = snr(traces.view(), 4, |i| classes[i], 100);

        assert_eq!(snr.len(), 8);
        for value in snr.iter() {
            assert!(*value >= 0.0);
        }
        for i in 0..8 {
            if i != 2 {
                assert!(snr[2] > snr[i]);
            }
        }
    }

    #[test]
    fn test_snr_skips_empty_classes() {
        let mut rng = StdRng::seed_from_u64(18);
        let traces = gaussian_traces(100, 4, 1.0, &mut rng);

        // only classes 0 and 1 out of 9 are populated
        let mut sparse = SnrProcessor::new(4, 9);
        let mut dense = SnrProcessor::new(4, 2);
        for (i, trace) in traces.rows().into_iter().enumerate() {
            sparse.process(trace, i % 2);
            dense.process(trace, i % 2);
        }

        assert_eq!(sparse.snr(), dense.snr());
    }

    #[test]
    fn test_ttest_identical_sets() {
        let traces = array![
            [77.0, 137.0, 51.0, 91.0],
            [72.0, 61.0, 91.0, 83.0],
            [39.0, 49.0, 52.0, 23.0],
            [26.0, 114.0, 63.0, 45.0],
        ];

        let mut processor = TTestProcessor::new(4);
        for trace in traces.rows() {
            processor.process(trace, false);
            processor.process(trace, true);
        }

        let t = processor.ttest();
        assert_eq!(t, Array1::<f64>::zeros(4));
        assert_eq!(max_t(t.view()), 0.0);
    }

    #[test]
    fn test_ttest_mean_shift() {
        let mut rng = StdRng::seed_from_u64(19);
        let fixed = gaussian_traces(400, 6, 1.0, &mut rng);
        let mut random = gaussian_traces(400, 6, 1.0, &mut rng);
        // inject a constant offset at sample 3
        for mut trace in random.rows_mut() {
            trace[3] += 5.0;
        }

        let mut processor = TTestProcessor::new(6);
        for trace in fixed.rows() {
            processor.process(trace, false);
        }
        for trace in random.rows() {
            processor.process(trace, true);
        }

        let t = processor.ttest();
        for i in 0..6 {
            if i != 3 {
                assert!(t[3].abs() > t[i].abs());
            }
        }
    }

    #[test]
    fn test_ttest_same_distribution_stays_below_threshold() {
        let mut rng = StdRng::seed_from_u64(20);
        let fixed = gaussian_traces(1000, 32, 1.0, &mut rng);
        let random = gaussian_traces(1000, 32, 1.0, &mut rng);

        let mut processor = TTestProcessor::new(32);
        for trace in fixed.rows() {
            processor.process(trace, false);
        }
        for trace in random.rows() {
            processor.process(trace, true);
        }

        assert!(max_t(processor.ttest().view()) < 4.5);
    }

    #[test]
    fn test_ttest_helper_matches_sequential() {
        let mut rng = StdRng::seed_from_u64(21);
        let traces = gaussian_traces(64, 5, 1.0, &mut rng);
        let trace_classes: Array1<bool> = (0..64).map(|i| i % 3 == 0).collect();

        let mut processor = TTestProcessor::new(5);
        for (i, trace) in traces.rows().into_iter().enumerate() {
            processor.process(trace, trace_classes[i]);
        }
        let expected = processor.ttest();

        let parallel = ttest(traces.view(), trace_classes.view(), 16);
        for (a, b) in expected.iter().zip(parallel.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_ttest_partitions() {
        let mut rng = StdRng::seed_from_u64(22);
        let fixed = gaussian_traces(90, 4, 1.0, &mut rng);
        let random = gaussian_traces(90, 4, 1.0, &mut rng);

        let fixed_partitions = [
            fixed.slice(s![0..30, ..]),
            fixed.slice(s![30..60, ..]),
            fixed.slice(s![60..90, ..]),
        ];
        let random_partitions = [
            random.slice(s![0..30, ..]),
            random.slice(s![30..60, ..]),
            random.slice(s![60..90, ..]),
        ];

        let whole = ttest_partitions(&fixed_partitions, &random_partitions, 0..3).unwrap();

        let mut processor = TTestProcessor::new(4);
        for trace in fixed.rows() {
            processor.process(trace, false);
        }
        for trace in random.rows() {
            processor.process(trace, true);
        }
        assert_eq!(whole, processor.ttest());

        assert!(matches!(
            ttest_partitions(&fixed_partitions, &random_partitions, 0..4),
            Err(Error::PartitionOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_ttest_partitions_empty_range() {
        let mut rng = StdRng::seed_from_u64(23);
        let fixed = gaussian_traces(30, 4, 1.0, &mut rng);
        let random = gaussian_traces(30, 4, 1.0, &mut rng);

        let fixed_partitions = [fixed.slice(s![0..15, ..]), fixed.slice(s![15..30, ..])];
        let random_partitions = [random.slice(s![0..15, ..]), random.slice(s![15..30, ..])];

        // empty at the boundary of the partition count
        assert!(matches!(
            ttest_partitions(&fixed_partitions, &random_partitions, 2..2),
            Err(Error::EmptyPartitionRange { start: 2, end: 2 })
        ));
        // empty but in bounds, would otherwise divide by a zero trace count
        assert!(matches!(
            ttest_partitions(&fixed_partitions, &random_partitions, 0..0),
            Err(Error::EmptyPartitionRange { start: 0, end: 0 })
        ));
    }
}
