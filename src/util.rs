//! Convenient utility functions.

use std::{cmp::Ordering, io::Read};

use ndarray::{Array, Array1, ArrayView1, ArrayView2, Axis};
use npyz::{Deserialize, NpyFile};

#[cfg(feature = "progress_bar")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress_bar")]
use std::time::Duration;

/// Reads a [`NpyFile`] as a [`Array1`]
///
/// This does the same as [`NpyFile.into_vec`] but faster, as this method reserves the resulting
/// vector to the final size directly instead of relying on `collect`.
///
/// # Panics
/// This function panics in case of IO error.
pub fn read_array1_from_npy_file<T: Deserialize, R: Read>(npy: NpyFile<R>) -> Array1<T> {
    let mut v: Vec<T> = Vec::new();
    v.reserve_exact(npy.shape()[0].try_into().unwrap());
    v.extend(npy.data().unwrap().map(|x| x.unwrap()));
    Array::from_vec(v)
}

/// Creates a [`ProgressBar`] with a predefined default style.
#[cfg(feature = "progress_bar")]
pub fn progress_bar(len: usize) -> ProgressBar {
    let progress_bar = ProgressBar::new(len as u64).with_style(
        ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta})").unwrap(),
    );
    progress_bar.enable_steady_tick(Duration::new(0, 100000000));
    progress_bar
}

/// Return an array where the i-th element contains the maximum absolute value of the i-th row of
/// the input array.
pub fn max_abs_per_row(arr: ArrayView2<f64>) -> Array1<f64> {
    arr.axis_iter(Axis(0))
        .map(|row| row.iter().fold(0.0, |acc: f64, x| acc.max(x.abs())))
        .collect()
}

/// Return the indices that would sort the given array with a comparison function.
pub fn argsort_by<T, F>(data: &[T], compare: F) -> Vec<usize>
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut indices: Vec<usize> = (0..data.len()).collect();

    indices.sort_by(|&a, &b| compare(&data[a], &data[b]));

    indices
}

/// Return the index of the maximum value in the given array.
pub fn argmax_by<T, F>(array: ArrayView1<T>, compare: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut idx_max = 0;

    for i in 0..array.shape()[0] {
        if compare(&array[i], &array[idx_max]).is_gt() {
            idx_max = i;
        }
    }

    idx_max
}

#[cfg(test)]
mod tests {
    use super::{argmax_by, argsort_by, max_abs_per_row};
    use ndarray::array;

    #[test]
    fn test_max_abs_per_row() {
        let arr = array![[1.0, -5.0, 3.0], [-7.0, 2.0, 0.0]];
        assert_eq!(max_abs_per_row(arr.view()), array![5.0, 7.0]);
    }

    #[test]
    fn test_argsort_argmax() {
        let data = [0.5, -1.0, 2.0, 1.5];
        assert_eq!(argsort_by(&data, f64::total_cmp), vec![1, 0, 3, 2]);
        assert_eq!(
            argmax_by(array![0.5, -1.0, 2.0, 1.5].view(), f64::total_cmp),
            2
        );
    }
}
