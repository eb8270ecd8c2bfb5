//! Percentile Computation
//!
//! Percentiles are taken over the raw distribution. Tail percentiles of
//! sampled invocation times are the signal, so nothing is trimmed.

/// Percentile levels reported for sampled-time results.
pub const SAMPLE_TIME_LEVELS: [f64; 10] = [
    0.0, 50.0, 90.0, 95.0, 99.0, 99.9, 99.99, 99.999, 99.9999, 100.0,
];

/// Tail summary of a distribution at [`SAMPLE_TIME_LEVELS`].
#[derive(Debug, Clone, PartialEq)]
pub struct Percentiles {
    /// `(level, value)` pairs in ascending level order
    pub levels: Vec<(f64, f64)>,
}

/// Percentile from already sorted samples using linear interpolation between
/// nearest ranks. `percentile` is on the 0..=100 scale.
pub fn percentile_of_sorted(sorted: &[f64], percentile: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let p = (percentile / 100.0).clamp(0.0, 1.0);
            let rank = p * (n - 1) as f64;
            let lower_idx = rank.floor() as usize;
            let upper_idx = (lower_idx + 1).min(n - 1);
            let fraction = rank - lower_idx as f64;

            sorted[lower_idx] + fraction * (sorted[upper_idx] - sorted[lower_idx])
        }
    }
}

/// Compute a single percentile from unsorted samples.
///
/// ```
/// # use trialbench_stats::compute_percentile;
/// let samples = vec![5.0, 1.0, 3.0, 2.0, 4.0];
/// assert_eq!(compute_percentile(&samples, 50.0), 3.0);
/// ```
pub fn compute_percentile(samples: &[f64], percentile: f64) -> f64 {
    percentile_of_sorted(&sorted_copy(samples), percentile)
}

/// Compute the sampled-time tail summary, sorting once.
pub fn compute_percentiles(samples: &[f64]) -> Percentiles {
    let sorted = sorted_copy(samples);
    Percentiles {
        levels: SAMPLE_TIME_LEVELS
            .iter()
            .map(|&level| (level, percentile_of_sorted(&sorted, level)))
            .collect(),
    }
}

fn sorted_copy(samples: &[f64]) -> Vec<f64> {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted
}
