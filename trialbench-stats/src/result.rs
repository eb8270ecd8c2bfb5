//! Benchmark Results
//!
//! A [`BenchResult`] is a sample distribution plus the metadata needed to
//! reduce it to a score: a variant tag, a role, a unit, a label and a fixed
//! [`AggregationPolicy`].

use crate::mode::Mode;
use crate::percentiles::compute_percentiles;
use crate::statistics::{SampleSet, Statistics};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};

/// Confidence level used for reported error bars.
pub const REPORTED_CONFIDENCE: f64 = 0.999;

/// Rule reducing a distribution to a scalar score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationPolicy {
    /// Mean of the samples, with Student-t error bars
    Average,
    /// Sum of the samples
    Sum,
    /// Largest sample
    Max,
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregationPolicy::Average => "Average",
            AggregationPolicy::Sum => "Sum",
            AggregationPolicy::Max => "Max",
        })
    }
}

/// Result variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    /// Cold single-invocation timing
    SingleShot,
    /// Time per operation
    AverageTime,
    /// Operations per time
    Throughput,
    /// Per-invocation timing distribution
    SampleTime,
    /// Auxiliary value reported by a task or profiler
    ScalarDerived,
}

impl ResultKind {
    /// Variant produced by a concrete benchmark mode
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Throughput => ResultKind::Throughput,
            Mode::SampleTime => ResultKind::SampleTime,
            Mode::SingleShot => ResultKind::SingleShot,
            Mode::AverageTime | Mode::All => ResultKind::AverageTime,
        }
    }

    /// Policy used when folding thread results of one iteration.
    ///
    /// Throughput adds up across threads; scalar results keep their own policy.
    pub fn thread_policy(self, own: AggregationPolicy) -> AggregationPolicy {
        match self {
            ResultKind::Throughput => AggregationPolicy::Sum,
            ResultKind::ScalarDerived => own,
            _ => AggregationPolicy::Average,
        }
    }

    /// Policy used when folding iteration results into the trial result
    pub fn iteration_policy(self, own: AggregationPolicy) -> AggregationPolicy {
        match self {
            ResultKind::ScalarDerived => own,
            _ => AggregationPolicy::Average,
        }
    }
}

/// Whether a result is the benchmark's score or an auxiliary metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultRole {
    /// The benchmark score
    Primary,
    /// Auxiliary metric (task counters, profiler output)
    Secondary,
}

/// A labelled sample distribution with a fixed reduction policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    kind: ResultKind,
    role: ResultRole,
    label: String,
    unit: String,
    policy: AggregationPolicy,
    statistics: SampleSet,
}

impl BenchResult {
    /// Create a result. The policy cannot change afterwards.
    pub fn new(
        kind: ResultKind,
        role: ResultRole,
        label: impl Into<String>,
        unit: impl Into<String>,
        policy: AggregationPolicy,
        statistics: SampleSet,
    ) -> Self {
        Self {
            kind,
            role,
            label: label.into(),
            unit: unit.into(),
            policy,
            statistics,
        }
    }

    /// Secondary scalar result holding one value
    pub fn scalar(
        label: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        policy: AggregationPolicy,
    ) -> Self {
        Self::new(
            ResultKind::ScalarDerived,
            ResultRole::Secondary,
            label,
            unit,
            policy,
            SampleSet::singleton(value),
        )
    }

    /// Result variant
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    /// Primary or secondary
    pub fn role(&self) -> ResultRole {
        self.role
    }

    /// Label used to match results across threads and iterations
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Score unit
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Reduction policy
    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Underlying distribution
    pub fn statistics(&self) -> &SampleSet {
        &self.statistics
    }

    /// Number of raw samples
    pub fn sample_count(&self) -> usize {
        self.statistics.n()
    }

    /// Score under the result's policy
    pub fn score(&self) -> f64 {
        match self.policy {
            AggregationPolicy::Average => self.statistics.mean(),
            AggregationPolicy::Sum => self.statistics.sum(),
            AggregationPolicy::Max => self.statistics.max(),
        }
    }

    /// 99.9% error bar; NaN unless the policy is `Average` with two or more samples
    pub fn score_error(&self) -> f64 {
        match self.policy {
            AggregationPolicy::Average => self.statistics.mean_error(REPORTED_CONFIDENCE),
            _ => f64::NAN,
        }
    }

    /// 99.9% confidence interval; collapses to `[score, score]` when no error
    /// bar is defined
    pub fn score_confidence(&self) -> [f64; 2] {
        match self.policy {
            AggregationPolicy::Average if self.statistics.n() >= 2 => {
                self.statistics.confidence_interval(REPORTED_CONFIDENCE)
            }
            _ => {
                let score = self.score();
                [score, score]
            }
        }
    }

    /// Free-text rendering for human-readable output.
    pub fn extended_info(&self) -> String {
        let stats = &self.statistics;
        let mut out = String::new();
        if stats.n() <= 2 {
            let _ = writeln!(
                out,
                "Run result \"{}\": {} {}",
                self.label,
                format_number(self.score()),
                self.unit
            );
            return out;
        }

        let [lo, hi] = self.score_confidence();
        let _ = writeln!(out, "Result \"{}\":", self.label);
        let _ = writeln!(
            out,
            "  {} ±(99.9%) {} {} [{}]",
            format_number(self.score()),
            format_number(self.score_error()),
            self.unit,
            self.policy
        );
        let _ = writeln!(
            out,
            "  (min, avg, max) = ({}, {}, {}), stdev = {}",
            format_number(stats.min()),
            format_number(stats.mean()),
            format_number(stats.max()),
            format_number(stats.standard_deviation())
        );
        let _ = writeln!(
            out,
            "  CI (99.9%): [{}, {}] (assumes normal distribution)",
            format_number(lo),
            format_number(hi)
        );

        if self.kind == ResultKind::SampleTime {
            for (level, value) in compute_percentiles(stats.values()).levels {
                let _ = writeln!(
                    out,
                    "    p({:>8}) = {} {}",
                    format!("{level:.4}"),
                    format_number(value),
                    self.unit
                );
            }
        }
        out
    }
}

/// Format a score with precision that scales with its magnitude.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    let magnitude = value.abs();
    if magnitude >= 1000.0 || magnitude == 0.0 {
        format!("{value:.3}")
    } else if magnitude >= 1.0 {
        format!("{value:.4}")
    } else {
        format!("{value:.6}")
    }
}
