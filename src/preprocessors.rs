//! Trace preprocessing.
use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use num_traits::AsPrimitive;
use std::ops::Range;

use crate::processors::MeanVar;

/// Epsilon added to the standard deviation so flat samples do not divide by zero.
const STD_EPSILON: f64 = 1e-9;

/// Smooth a trace with a trailing moving average of `window_size` samples.
///
/// The window is clamped at the start of the trace so the output keeps the
/// input length. A window size of 1 returns the trace unchanged.
///
/// # Panics
/// Panics if `window_size` is 0.
pub fn moving_average(trace: ArrayView1<f64>, window_size: usize) -> Array1<f64> {
    assert!(window_size > 0);

    if window_size == 1 {
        return trace.to_owned();
    }

    let mut out = Array1::zeros(trace.len());
    let mut acc = 0.0;
    for i in 0..trace.len() {
        acc += trace[i];
        if i >= window_size {
            acc -= trace[i - window_size];
        }

        let len = usize::min(i + 1, window_size);
        out[i] = acc / len as f64;
    }

    out
}

/// Computes the centered product of "order" leakage samples
/// Used particularly when performing high-order SCA
#[derive(Debug)]
pub struct CenteredProduct {
    /// Sum of traces
    acc: Array1<f64>,
    /// Number of traces processed
    count: usize,
    /// Mean of traces
    mean: Array1<f64>,
    /// Indices of samples to combine
    intervals: Vec<Range<usize>>,
    /// Boolean to ensure that finalize function happened before apply
    processed: bool,
}

impl CenteredProduct {
    /// Creates a new CenteredProduct processor.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of samples per trace
    /// * `intervals` - Intervals to combine
    pub fn new(size: usize, intervals: Vec<Range<usize>>) -> Self {
        Self {
            acc: Array1::zeros(size),
            count: 0,
            intervals,
            processed: false,
            mean: Array1::zeros(size),
        }
    }

    /// Processes an input trace to update internal accumulators.
    pub fn process<T: AsPrimitive<f64>>(&mut self, trace: ArrayView1<T>) {
        for i in 0..self.acc.len() {
            self.acc[i] += trace[i].as_();
        }
        self.count += 1
    }

    /// Compute the mean
    pub fn finalize(&mut self) {
        if self.count != 0 {
            self.mean = self.acc.mapv(|x| x / self.count as f64)
        }
        self.processed = true
    }

    /// Apply the processing to an input trace
    /// The centered product subtracts the mean of the traces and then performs products between
    /// every combination of input time samples
    pub fn apply<T: AsPrimitive<f64>>(&self, trace: ArrayView1<T>) -> Array1<f64> {
        debug_assert!(self.processed);

        let centered_trace: Array1<f64> = trace.mapv(|x| x.as_()) - &self.mean;
        let length_out_trace: usize = self.intervals.iter().map(|x| x.len()).product();

        let mut centered_product_trace = Array1::ones(length_out_trace);

        let multi_prod = self
            .intervals
            .iter()
            .cloned()
            .multi_cartesian_product();

        for (idx, combination) in multi_prod.enumerate() {
            for i in combination {
                centered_product_trace[idx] *= centered_trace[i];
            }
        }

        centered_product_trace
    }
}

/// Standardization of the traces by removing the mean and scaling to unit variance
#[derive(Debug)]
pub struct StandardScaler {
    /// meanVar processor
    meanvar: MeanVar,
    /// mean
    mean: Array1<f64>,
    /// std
    std: Array1<f64>,
}

impl StandardScaler {
    pub fn new(size: usize) -> Self {
        Self {
            meanvar: MeanVar::new(size),
            mean: Array1::zeros(size),
            std: Array1::zeros(size),
        }
    }

    /// Processes an input trace to update internal accumulators.
    pub fn process<T: AsPrimitive<f64>>(&mut self, trace: ArrayView1<T>) {
        self.meanvar.process(trace);
    }

    /// Compute mean and std
    pub fn finalize(&mut self) {
        self.mean = self.meanvar.mean();
        self.std = self.meanvar.var().mapv(f64::sqrt) + STD_EPSILON;
    }

    /// Apply the processing to an input trace
    pub fn apply<T: AsPrimitive<f64>>(&self, trace: ArrayView1<T>) -> Array1<f64> {
        (trace.mapv(|x| x.as_()) - &self.mean) / &self.std
    }

    /// Per-sample mean of the fitted traces.
    pub fn mean(&self) -> ArrayView1<f64> {
        self.mean.view()
    }

    /// Per-sample standard deviation of the fitted traces.
    pub fn std(&self) -> ArrayView1<f64> {
        self.std.view()
    }
}

#[cfg(test)]
mod tests {
    use super::{CenteredProduct, StandardScaler, moving_average};
    use ndarray::array;

    fn round_to_2_digits(x: f64) -> f64 {
        (x * 100f64).round() / 100f64
    }

    #[test]
    fn test_moving_average_identity() {
        let trace = array![4.0, -2.0, 7.0, 0.0];
        assert_eq!(moving_average(trace.view(), 1), trace);
    }

    #[test]
    fn test_moving_average_window() {
        let trace = array![2.0, 4.0, 6.0, 8.0, 10.0];
        assert_eq!(
            moving_average(trace.view(), 2),
            array![2.0, 3.0, 5.0, 7.0, 9.0]
        );
        assert_eq!(
            moving_average(trace.view(), 4),
            array![2.0, 3.0, 4.0, 5.0, 7.0]
        );
    }

    #[test]
    fn test_centered_product() {
        let traces = [
            array![2.0, 8.0, -2.0, 4.0],
            array![6.0, 0.0, 2.0, -4.0],
            array![4.0, 4.0, 0.0, 0.0],
        ];

        let mut processor = CenteredProduct::new(4, vec![0..1, 2..4]);
        for trace in traces.iter() {
            processor.process(trace.view());
        }
        processor.finalize();

        // means are [4, 4, 0, 0]
        assert_eq!(
            processor.apply(traces[0].view()),
            array![4.0, -8.0]
        );
        assert_eq!(
            processor.apply(traces[1].view()),
            array![4.0, -8.0]
        );
        assert_eq!(processor.apply(traces[2].view()), array![0.0, 0.0]);
    }

    #[test]
    fn test_standard_scaler() {
        let traces = [
            array![1.0, 10.0],
            array![3.0, 30.0],
            array![5.0, 50.0],
            array![7.0, 70.0],
        ];

        let mut processor = StandardScaler::new(2);
        for trace in traces.iter() {
            processor.process(trace.view());
        }
        processor.finalize();

        // means [4, 40], stds roughly [2.24, 22.36]
        let expected = [
            array![-1.34, -1.34],
            array![-0.45, -0.45],
            array![0.45, 0.45],
            array![1.34, 1.34],
        ];
        for (trace, expected) in traces.iter().zip(expected.iter()) {
            assert_eq!(
                processor.apply(trace.view()).mapv(round_to_2_digits),
                *expected
            );
        }
    }
}
