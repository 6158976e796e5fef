//! Statistical side-channel leakage analysis.
//!
//! leakstat evaluates the key secrecy of a cryptographic implementation from
//! power/EM traces: SNR estimation, TVLA leakage detection (Welch's t-test),
//! correlation power analysis and Gaussian template attacks with
//! guessing-entropy evaluation. Trace acquisition, storage and plotting are
//! left to the caller; every engine here borrows trace matrices read-only and
//! returns freshly allocated statistics.

pub mod distinguishers;
mod error;
pub mod leakage_detection;
pub mod leakage_model;
pub mod preprocessors;
pub mod processors;
pub mod template_attack;
pub mod util;

pub use error::Error;
