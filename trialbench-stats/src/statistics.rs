//! Sample Statistics
//!
//! Read-only statistical views over an append-only set of doubles.

use crate::percentiles::compute_percentile;
use crate::student_t;
use serde::{Deserialize, Serialize};

/// Statistical view over a sample distribution.
///
/// Implementors provide the primitive accessors; mean, deviation and
/// Student-t error bars are derived from them.
pub trait Statistics {
    /// Number of samples
    fn n(&self) -> usize;
    /// Sum of all samples
    fn sum(&self) -> f64;
    /// Smallest sample, NaN when empty
    fn min(&self) -> f64;
    /// Largest sample, NaN when empty
    fn max(&self) -> f64;
    /// Unbiased sample variance (n - 1 denominator)
    fn variance(&self) -> f64;
    /// Percentile on the 0..=100 scale
    fn percentile(&self, percentile: f64) -> f64;

    /// Arithmetic mean, NaN when empty
    fn mean(&self) -> f64 {
        match self.n() {
            0 => f64::NAN,
            n => self.sum() / n as f64,
        }
    }

    /// Standard deviation
    fn standard_deviation(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Half-width of the two-sided confidence interval around the mean.
    ///
    /// NaN for fewer than two samples.
    fn mean_error(&self, confidence: f64) -> f64 {
        let n = self.n();
        if n < 2 {
            return f64::NAN;
        }
        let t = student_t::two_sided(confidence, n - 1);
        t * self.standard_deviation() / (n as f64).sqrt()
    }

    /// Two-sided confidence interval around the mean, `[NaN, NaN]` for fewer
    /// than two samples.
    fn confidence_interval(&self, confidence: f64) -> [f64; 2] {
        let error = self.mean_error(confidence);
        let mean = self.mean();
        [mean - error, mean + error]
    }
}

/// List-backed sample distribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleSet {
    values: Vec<f64>,
}

impl SampleSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding a single value
    pub fn singleton(value: f64) -> Self {
        Self {
            values: vec![value],
        }
    }

    /// Append one sample
    pub fn add(&mut self, value: f64) {
        self.values.push(value);
    }

    /// Append every sample of another distribution
    pub fn extend_from(&mut self, other: &SampleSet) {
        self.values.extend_from_slice(&other.values);
    }

    /// Raw samples in insertion order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Whether no samples were recorded
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<f64>> for SampleSet {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl FromIterator<f64> for SampleSet {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl Statistics for SampleSet {
    fn n(&self) -> usize {
        self.values.len()
    }

    fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    fn min(&self) -> f64 {
        self.values
            .iter()
            .copied()
            .reduce(f64::min)
            .unwrap_or(f64::NAN)
    }

    fn max(&self) -> f64 {
        self.values
            .iter()
            .copied()
            .reduce(f64::max)
            .unwrap_or(f64::NAN)
    }

    fn variance(&self) -> f64 {
        let n = self.values.len();
        match n {
            0 => f64::NAN,
            1 => 0.0,
            _ => {
                let mean = self.mean();
                let squares: f64 = self.values.iter().map(|v| (v - mean).powi(2)).sum();
                squares / (n - 1) as f64
            }
        }
    }

    fn percentile(&self, percentile: f64) -> f64 {
        compute_percentile(&self.values, percentile)
    }
}
