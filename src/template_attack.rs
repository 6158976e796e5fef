//! Gaussian template attack with guessing-entropy evaluation.
//!
//! Profiling builds one multivariate Gaussian template per Hamming-weight
//! class from traces captured with a known key. Scoring sums the
//! log-likelihood of attack traces under those templates for each of the 256
//! key hypotheses. Guessing entropy measures how fast the rank of the correct
//! key drops as attack traces accumulate, averaged over randomized trials.
use crate::{
    Error,
    leakage_model::{self, NUM_HW_CLASSES},
    processors::MeanVar,
    util::argsort_by,
};
use nalgebra::{Cholesky, DMatrix};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{SeedableRng, rngs::StdRng, seq::index};
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{f64::consts::PI, fs::File, path::Path};

/// Classes below this profiling trace count are dropped from the template set.
pub const DEFAULT_MIN_CLASS_SUPPORT: usize = 10;
/// Ridge term added to covariance diagonals before inversion.
pub const DEFAULT_RIDGE: f64 = 1e-4;
/// Floor added to per-sample variances in diagonal mode.
const DIAG_VAR_FLOOR: f64 = 1e-6;
/// Epsilon added to the profiling standard deviation before scaling.
const SCALER_EPSILON: f64 = 1e-9;
/// Key hypothesis space for one byte.
const GUESS_RANGE: usize = 256;

/// How class dispersion is estimated during profiling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum CovarianceMode {
    /// Per-sample variance only. Fastest and most stable with few traces, but
    /// blind to inter-sample correlation.
    Diag,
    /// One regularized covariance matrix per class.
    Full,
    /// A single regularized covariance matrix shared by all classes. Cheaper
    /// and more stable than [`CovarianceMode::Full`] with limited per-class
    /// samples.
    #[default]
    Pooled,
}

/// Profiling configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub cov_mode: CovarianceMode,
    /// Minimum number of profiling traces per class; smaller classes are
    /// dropped and contribute nothing at scoring time.
    pub min_class_support: usize,
    /// Ridge regularization added before covariance inversion.
    pub ridge: f64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            cov_mode: CovarianceMode::default(),
            min_class_support: DEFAULT_MIN_CLASS_SUPPORT,
            ridge: DEFAULT_RIDGE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Dispersion {
    Diag {
        var: Array1<f64>,
    },
    Full {
        inv_cov: Array2<f64>,
        logdet: f64,
    },
}

/// Gaussian template of one leakage class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassTemplate {
    mean: Array1<f64>,
    dispersion: Dispersion,
}

impl ClassTemplate {
    /// Mean trace of the class.
    pub fn mean(&self) -> ArrayView1<f64> {
        self.mean.view()
    }

    /// Log-likelihood of a standardized trace under this template.
    fn log_likelihood(&self, trace: ArrayView1<f64>) -> f64 {
        match &self.dispersion {
            Dispersion::Diag { var } => {
                let mut sum = 0.0;
                for i in 0..var.len() {
                    let diff = trace[i] - self.mean[i];
                    sum += var[i].ln() + diff * diff / var[i];
                }
                -0.5 * sum
            }
            Dispersion::Full { inv_cov, logdet } => {
                let diff = &trace - &self.mean;
                let quad = diff.dot(&inv_cov.dot(&diff));
                let dims = self.mean.len() as f64;
                -0.5 * (dims * (2.0 * PI).ln() + logdet + quad)
            }
        }
    }
}

/// Per-class Gaussian templates fitted on a profiling trace set.
///
/// Immutable once fitted. The profiling standardization (per-sample mean and
/// std) is stored so attack traces are scaled identically at scoring time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateSet {
    /// One slot per Hamming-weight class; `None` for dropped classes.
    classes: Vec<Option<ClassTemplate>>,
    scaler_mean: Array1<f64>,
    scaler_std: Array1<f64>,
    target_byte: usize,
    num_samples: usize,
}

impl TemplateSet {
    /// Build templates from profiling traces captured with a known key byte.
    ///
    /// Traces are standardized with the profiling per-sample mean/std, then
    /// grouped by `hw(sbox(plaintext[target_byte] ^ key_byte))`. Classes with
    /// fewer than `config.min_class_support` traces are dropped.
    pub fn fit(
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
        key_byte: u8,
        target_byte: usize,
        config: &TemplateConfig,
    ) -> Result<Self, Error> {
        let (num_traces, num_samples) = (traces.shape()[0], traces.shape()[1]);
        if plaintexts.shape()[0] != num_traces {
            return Err(Error::MismatchedTraceCount {
                traces: num_traces,
                rows: plaintexts.shape()[0],
            });
        }

        let labels = leakage_model::hw_labels(plaintexts, target_byte, key_byte as usize)?;

        let mut mean_var = MeanVar::new(num_samples);
        for trace in traces.rows() {
            mean_var.process(trace);
        }
        let scaler_mean = mean_var.mean();
        let scaler_std = mean_var.var().mapv(f64::sqrt) + SCALER_EPSILON;
        let scaled = standardize(traces, &scaler_mean, &scaler_std);

        // Shared dispersion for pooled mode, estimated over the whole
        // profiling set.
        let pooled = match config.cov_mode {
            CovarianceMode::Pooled => {
                let cov = regularized_covariance(scaled.view(), config.ridge);
                Some(invert_covariance(cov).ok_or(Error::SingularPooledCovariance)?)
            }
            _ => None,
        };

        let mut classes = vec![None; NUM_HW_CLASSES];
        for (class, slot) in classes.iter_mut().enumerate() {
            let members: Vec<usize> = labels
                .iter()
                .enumerate()
                .filter(|&(_, &label)| label == class)
                .map(|(i, _)| i)
                .collect();
            if members.len() < config.min_class_support {
                continue;
            }

            let class_traces = scaled.select(Axis(0), &members);
            let count = class_traces.shape()[0] as f64;
            let mean = class_traces.sum_axis(Axis(0)) / count;

            let dispersion = match (config.cov_mode, &pooled) {
                (CovarianceMode::Diag, _) => {
                    let centered = &class_traces - &mean;
                    let var =
                        (&centered * &centered).sum_axis(Axis(0)) / count + DIAG_VAR_FLOOR;
                    Dispersion::Diag { var }
                }
                (CovarianceMode::Full, _) => {
                    let cov = regularized_covariance(class_traces.view(), config.ridge);
                    let (inv_cov, logdet) =
                        invert_covariance(cov).ok_or(Error::SingularCovariance { class })?;
                    Dispersion::Full { inv_cov, logdet }
                }
                (CovarianceMode::Pooled, Some((inv_cov, logdet))) => Dispersion::Full {
                    inv_cov: inv_cov.clone(),
                    logdet: *logdet,
                },
                (CovarianceMode::Pooled, None) => unreachable!(),
            };

            *slot = Some(ClassTemplate { mean, dispersion });
        }

        Ok(Self {
            classes,
            scaler_mean,
            scaler_std,
            target_byte,
            num_samples,
        })
    }

    /// Total log-likelihood of the attack traces under every key hypothesis.
    pub fn score(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
    ) -> Result<Array1<f64>, Error> {
        self.check_shapes(traces, plaintexts)?;

        let scaled = standardize(traces, &self.scaler_mean, &self.scaler_std);
        Ok(self.score_scaled(scaled.view(), plaintexts))
    }

    /// Rank of every key hypothesis by descending score, best first.
    pub fn key_ranking(scores: ArrayView1<f64>) -> Array1<usize> {
        let order = argsort_by(
            &scores.to_vec()[..],
            |a, b| f64::total_cmp(b, a),
        );

        Array1::from_vec(order)
    }

    /// Template of a single class, `None` if it was dropped during profiling.
    pub fn class(&self, class: usize) -> Option<&ClassTemplate> {
        self.classes[class].as_ref()
    }

    /// Number of classes that survived profiling.
    pub fn populated_classes(&self) -> usize {
        self.classes.iter().filter(|slot| slot.is_some()).count()
    }

    /// Return the trace size handled.
    pub fn size(&self) -> usize {
        self.num_samples
    }

    /// Index of the attacked plaintext byte.
    pub fn target_byte(&self) -> usize {
        self.target_byte
    }

    /// Save the [`TemplateSet`] to a file.
    ///
    /// # Warning
    /// The file format is not stable as leakstat is in active development.
    /// Thus, the format might change between versions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;

        Ok(())
    }

    /// Load a [`TemplateSet`] from a file.
    ///
    /// # Warning
    /// The file format is not stable as leakstat is in active development.
    /// Thus, the format might change between versions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let templates: TemplateSet = serde_json::from_reader(file)?;

        Ok(templates)
    }

    fn check_shapes(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
    ) -> Result<(), Error> {
        if traces.shape()[1] != self.num_samples {
            return Err(Error::MismatchedSampleCount {
                left: self.num_samples,
                right: traces.shape()[1],
            });
        }
        if plaintexts.shape()[0] != traces.shape()[0] {
            return Err(Error::MismatchedTraceCount {
                traces: traces.shape()[0],
                rows: plaintexts.shape()[0],
            });
        }

        Ok(())
    }

    /// Score already-standardized traces for every hypothesis in parallel.
    fn score_scaled(&self, scaled: ArrayView2<f64>, plaintexts: ArrayView2<u8>) -> Array1<f64> {
        let indices: Vec<usize> = (0..scaled.shape()[0]).collect();

        let scores = (0..GUESS_RANGE)
            .into_par_iter()
            .map(|guess| self.score_chunk(scaled, plaintexts, &indices, guess))
            .collect::<Vec<f64>>();

        Array1::from_vec(scores)
    }

    /// Log-likelihood of the selected traces under one hypothesis. Traces
    /// whose class was dropped during profiling contribute nothing.
    fn score_chunk(
        &self,
        scaled: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
        indices: &[usize],
        guess: usize,
    ) -> f64 {
        let mut log_likelihood = 0.0;
        for &i in indices {
            let label = leakage_model::sbox_hw(plaintexts[[i, self.target_byte]], guess);
            if let Some(template) = &self.classes[label] {
                log_likelihood += template.log_likelihood(scaled.row(i));
            }
        }

        log_likelihood
    }
}

/// Guessing-entropy evaluation configuration.
#[derive(Clone, Debug)]
pub struct GeConfig {
    /// Number of independent randomized trials.
    pub n_trials: usize,
    /// Number of attack traces sampled (without replacement) per trial;
    /// `None` uses the whole attack set.
    pub n_atk_subset: Option<usize>,
    /// Number of attack traces added per evaluation point.
    pub step: usize,
    /// Base seed of the per-trial RNGs.
    pub seed: u64,
}

impl Default for GeConfig {
    fn default() -> Self {
        Self {
            n_trials: 10,
            n_atk_subset: None,
            step: 10,
            seed: 0,
        }
    }
}

/// Result of a guessing-entropy evaluation.
#[derive(Clone, Debug)]
pub struct GuessingEntropy {
    /// Number of attack traces incorporated at each evaluation point.
    pub trace_counts: Array1<usize>,
    /// Rank of the correct key per trial (row) and evaluation point (column).
    pub trial_curves: Array2<usize>,
    /// Mean rank across trials at each evaluation point.
    pub avg_curve: Array1<f64>,
    /// Rank of the correct key at the end of each trial.
    pub final_ranks: Array1<usize>,
    /// All 256 hypotheses ranked by descending score over the full attack
    /// set, best first.
    pub key_ranking: Array1<usize>,
}

/// Evaluate the guessing entropy of fitted templates on an attack trace set.
///
/// Each trial draws `n_atk_subset` attack traces without replacement in random
/// order, grows the attack window by `step` traces at a time and records the
/// 0-based rank of `correct_key` at each point. Only the newly added chunk is
/// scored per point; per-hypothesis totals accumulate across the trial.
/// Trials are independent and run in parallel with private RNG state. The
/// final key ranking uses every attack trace.
///
/// A `step` larger than the sampled subset would leave the curve without a
/// single evaluation point and is rejected with
/// [`Error::StepExceedsSubset`].
///
/// # Panics
/// Panic if `config.step` is 0 or `config.n_trials` is 0.
pub fn guessing_entropy(
    templates: &TemplateSet,
    atk_traces: ArrayView2<f64>,
    atk_plaintexts: ArrayView2<u8>,
    correct_key: u8,
    config: &GeConfig,
) -> Result<GuessingEntropy, Error> {
    assert!(config.step > 0);
    assert!(config.n_trials > 0);

    templates.check_shapes(atk_traces, atk_plaintexts)?;

    let n_attack = atk_traces.shape()[0];
    let n_subset = config.n_atk_subset.unwrap_or(n_attack).min(n_attack);
    if config.step > n_subset {
        return Err(Error::StepExceedsSubset {
            step: config.step,
            subset: n_subset,
        });
    }
    let n_points = n_subset / config.step;

    let scaled = standardize(atk_traces, &templates.scaler_mean, &templates.scaler_std);

    let curves = (0..config.n_trials)
        .into_par_iter()
        .map(|trial| {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(trial as u64));
            let picks = index::sample(&mut rng, n_attack, n_subset).into_vec();

            ge_curve(
                templates,
                scaled.view(),
                atk_plaintexts,
                &picks,
                correct_key,
                config.step,
            )
        })
        .collect::<Vec<Vec<usize>>>();

    let mut trial_curves = Array2::zeros((config.n_trials, n_points));
    for (trial, curve) in curves.iter().enumerate() {
        for (point, &rank) in curve.iter().enumerate() {
            trial_curves[[trial, point]] = rank;
        }
    }

    let avg_curve = trial_curves
        .map_axis(Axis(0), |ranks| {
            ranks.iter().sum::<usize>() as f64 / config.n_trials as f64
        });
    // step <= n_subset guarantees at least one evaluation point
    let final_ranks = trial_curves.column(n_points - 1).to_owned();

    let scores = templates.score_scaled(scaled.view(), atk_plaintexts);
    let key_ranking = TemplateSet::key_ranking(scores.view());

    Ok(GuessingEntropy {
        trace_counts: (1..=n_points).map(|point| point * config.step).collect(),
        trial_curves,
        avg_curve,
        final_ranks,
        key_ranking,
    })
}

/// Fit templates on a profiling set and evaluate guessing entropy on an
/// attack set in one call.
pub fn template_attack(
    prof_traces: ArrayView2<f64>,
    prof_plaintexts: ArrayView2<u8>,
    atk_traces: ArrayView2<f64>,
    atk_plaintexts: ArrayView2<u8>,
    correct_key: u8,
    target_byte: usize,
    template_config: &TemplateConfig,
    ge_config: &GeConfig,
) -> Result<GuessingEntropy, Error> {
    let templates = TemplateSet::fit(
        prof_traces,
        prof_plaintexts,
        correct_key,
        target_byte,
        template_config,
    )?;

    guessing_entropy(&templates, atk_traces, atk_plaintexts, correct_key, ge_config)
}

/// One incremental scoring pass over a sampled attack subset. Trailing traces
/// that do not fill a whole step are left out, like the reference protocol.
fn ge_curve(
    templates: &TemplateSet,
    scaled: ArrayView2<f64>,
    plaintexts: ArrayView2<u8>,
    picks: &[usize],
    correct_key: u8,
    step: usize,
) -> Vec<usize> {
    let mut scores = Array1::zeros(GUESS_RANGE);
    let mut curve = Vec::with_capacity(picks.len() / step);

    for chunk in picks.chunks_exact(step) {
        for guess in 0..GUESS_RANGE {
            scores[guess] += templates.score_chunk(scaled, plaintexts, chunk, guess);
        }

        curve.push(rank_of(scores.view(), correct_key as usize));
    }

    curve
}

/// 0-based rank of `key` under descending-score stable order.
fn rank_of(scores: ArrayView1<f64>, key: usize) -> usize {
    let target = scores[key];
    let mut rank = 0;
    for (candidate, &score) in scores.iter().enumerate() {
        if score > target || (score == target && candidate < key) {
            rank += 1;
        }
    }

    rank
}

/// Standardize traces with per-sample mean and std.
fn standardize(
    traces: ArrayView2<f64>,
    mean: &Array1<f64>,
    std: &Array1<f64>,
) -> Array2<f64> {
    (&traces - mean) / std
}

/// Sample covariance (n-1 normalization) of row observations, with a ridge
/// term on the diagonal.
fn regularized_covariance(traces: ArrayView2<f64>, ridge: f64) -> Array2<f64> {
    let (count, dims) = (traces.shape()[0] as f64, traces.shape()[1]);
    let mean = traces.sum_axis(Axis(0)) / count;
    let centered = &traces - &mean;
    let mut cov = centered.t().dot(&centered) / (count - 1.0);
    for i in 0..dims {
        cov[[i, i]] += ridge;
    }

    cov
}

/// Invert a covariance matrix through its Cholesky factorization, returning
/// the inverse and the log-determinant. `None` if the matrix is not positive
/// definite.
fn invert_covariance(cov: Array2<f64>) -> Option<(Array2<f64>, f64)> {
    let dims = cov.shape()[0];
    let matrix = DMatrix::from_row_iterator(dims, dims, cov.iter().copied());
    let cholesky = Cholesky::new(matrix)?;

    let logdet = 2.0 * cholesky
        .l()
        .diagonal()
        .iter()
        .map(|x| x.ln())
        .sum::<f64>();
    let inverse = cholesky.inverse();
    let inverse = Array2::from_shape_fn((dims, dims), |(i, j)| inverse[(i, j)]);

    Some((inverse, logdet))
}
