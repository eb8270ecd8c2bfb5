#![warn(missing_docs)]
//! Trialbench Statistical Engine
//!
//! Pure computation over benchmark samples:
//! - Append-only sample sets with mean, variance, percentiles
//! - Student-t confidence intervals from a fixed critical-value table
//! - Result variants with average/sum/max reduction policies
//! - Thread and iteration aggregation by concatenating distributions

mod aggregation;
mod mode;
mod percentiles;
mod result;
mod statistics;
pub mod student_t;

pub use aggregation::{AggregatedResults, Aggregator, IterationResult, ThreadResult};
pub use mode::{Mode, TimeUnit};
pub use percentiles::{
    Percentiles, SAMPLE_TIME_LEVELS, compute_percentile, compute_percentiles, percentile_of_sorted,
};
pub use result::{
    AggregationPolicy, BenchResult, REPORTED_CONFIDENCE, ResultKind, ResultRole, format_number,
};
pub use statistics::{SampleSet, Statistics};

/// Confidence levels with their own column in the critical-value table
pub const CANONICAL_CONFIDENCE_LEVELS: [f64; 6] = [0.90, 0.95, 0.975, 0.99, 0.995, 0.999];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(CANONICAL_CONFIDENCE_LEVELS, student_t::QUANTILES);
        assert!((REPORTED_CONFIDENCE - 0.999).abs() < f64::EPSILON);
    }
}
