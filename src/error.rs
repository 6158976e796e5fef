use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("mismatched trace count: {traces} traces but {rows} associated rows")]
    MismatchedTraceCount { traces: usize, rows: usize },
    #[error("mismatched sample count: {left} samples vs {right}")]
    MismatchedSampleCount { left: usize, right: usize },
    #[error("target byte {byte} out of range for {width}-byte blocks")]
    TargetByteOutOfRange { byte: usize, width: usize },
    #[error("leakage model produced {got} labels, expected {expected}")]
    BadLabelLength { got: usize, expected: usize },
    #[error("predicted leakage for guess {guess} has zero variance")]
    ZeroVariancePrediction { guess: usize },
    #[error("covariance matrix of class {class} is singular after regularization")]
    SingularCovariance { class: usize },
    #[error("pooled covariance matrix is singular after regularization")]
    SingularPooledCovariance,
    #[error("partition {index} out of range, {count} partitions available")]
    PartitionOutOfRange { index: usize, count: usize },
    #[error("empty partition range {start}..{end}")]
    EmptyPartitionRange { start: usize, end: usize },
    #[error("step {step} exceeds the {subset} sampled attack traces")]
    StepExceedsSubset { step: usize, subset: usize },
    #[error("failed to save/load leakstat data")]
    SaveLoad(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
