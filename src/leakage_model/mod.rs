//! Leakage models mapping intermediate cryptographic values to discrete
//! classes.
//!
//! The default model labels a trace with the Hamming weight of the first-round
//! S-box output, `hw(sbox(plaintext_byte ^ guess))`. Engines accept any
//! labeling through [`labels_with`], which checks the caller-supplied function
//! at the boundary.
pub mod aes;

use crate::Error;
use ndarray::{Array1, ArrayView2};

/// Number of Hamming weight classes for a byte (0 through 8).
pub const NUM_HW_CLASSES: usize = 9;

pub fn hw(value: usize) -> usize {
    let mut tmp = 0;
    for i in 0..8 {
        if (value & (1 << i)) == (1 << i) {
            tmp += 1;
        }
    }
    tmp
}

/// Hamming weight of the S-box output of `plaintext_byte ^ guess`.
pub fn sbox_hw(plaintext_byte: u8, guess: usize) -> usize {
    hw(aes::sbox(plaintext_byte ^ guess as u8) as usize)
}

/// Labels every trace for one key guess from the selected plaintext byte.
pub fn hw_labels(
    plaintexts: ArrayView2<u8>,
    target_byte: usize,
    guess: usize,
) -> Result<Array1<usize>, Error> {
    let width = plaintexts.shape()[1];
    if target_byte >= width {
        return Err(Error::TargetByteOutOfRange {
            byte: target_byte,
            width,
        });
    }

    Ok(plaintexts
        .column(target_byte)
        .mapv(|plaintext_byte| sbox_hw(plaintext_byte, guess)))
}

/// Run a caller-supplied labeling function `(guess, num_traces) -> labels` and
/// check the length of its output.
pub fn labels_with<F>(model: F, guess: usize, num_traces: usize) -> Result<Array1<usize>, Error>
where
    F: Fn(usize, usize) -> Array1<usize>,
{
    let labels = model(guess, num_traces);
    if labels.len() != num_traces {
        return Err(Error::BadLabelLength {
            got: labels.len(),
            expected: num_traces,
        });
    }

    Ok(labels)
}
