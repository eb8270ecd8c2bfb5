//! Result Aggregation
//!
//! Results move up three levels:
//!
//! ```text
//! ThreadResult ──thread aggregator──▶ IterationResult ──iteration aggregator──▶ trial results
//! ```
//!
//! Both aggregators concatenate the underlying sample distributions so that
//! error bars computed afterwards reflect the real combined sample count. A
//! result reduced by `Sum` or `Max` is not decomposable into its raw samples,
//! so at the iteration level it contributes its score as a single sample.

use crate::result::{AggregationPolicy, BenchResult, ResultRole};
use crate::statistics::SampleSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which fold an aggregator performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    /// Threads of one iteration into one result
    Thread,
    /// Iterations of one trial into one result
    Iteration,
}

impl Aggregator {
    /// Fold results that share a label. Returns `None` for an empty input.
    ///
    /// The output takes its kind, role, label and unit from the first input;
    /// its policy comes from the kind's policy for this aggregation level.
    pub fn fold<'a, I>(self, results: I) -> Option<BenchResult>
    where
        I: IntoIterator<Item = &'a BenchResult>,
    {
        let mut iter = results.into_iter();
        let first = iter.next()?;
        let policy = match self {
            Aggregator::Thread => first.kind().thread_policy(first.policy()),
            Aggregator::Iteration => first.kind().iteration_policy(first.policy()),
        };

        let mut samples = SampleSet::new();
        for result in std::iter::once(first).chain(iter) {
            debug_assert_eq!(result.label(), first.label());
            match (self, result.policy()) {
                (Aggregator::Iteration, AggregationPolicy::Sum | AggregationPolicy::Max) => {
                    samples.add(result.score())
                }
                _ => samples.extend_from(result.statistics()),
            }
        }

        Some(BenchResult::new(
            first.kind(),
            first.role(),
            first.label(),
            first.unit(),
            policy,
            samples,
        ))
    }
}

/// Results of one thread in one iteration.
pub type ThreadResult = Vec<BenchResult>;

/// All results of one iteration, keyed by role and label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    /// Folded primary result, absent when no thread produced one
    pub primary: Option<BenchResult>,
    /// Folded secondary results by label
    pub secondary: BTreeMap<String, BenchResult>,
    /// Number of threads whose results were folded
    pub threads: usize,
    /// Invocations issued during the measured portion
    pub operations: u64,
}

impl IterationResult {
    /// Fold the per-thread results of one iteration.
    pub fn from_threads(threads: &[ThreadResult]) -> Self {
        let mut grouped = LabelGroups::default();
        for result in threads.iter().flatten() {
            grouped.push(result);
        }
        let (primary, secondary) = grouped.fold(Aggregator::Thread);
        Self {
            primary,
            secondary,
            threads: threads.len(),
            operations: 0,
        }
    }

    /// Attach results produced outside the task, e.g. by internal profilers
    pub fn add_secondary(&mut self, result: BenchResult) {
        self.secondary.insert(result.label().to_string(), result);
    }

    /// Every result of the iteration, primary first
    pub fn all(&self) -> impl Iterator<Item = &BenchResult> {
        self.primary.iter().chain(self.secondary.values())
    }
}

/// Final results of a trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResults {
    /// Folded primary result
    pub primary: Option<BenchResult>,
    /// Folded secondary results by label
    pub secondary: BTreeMap<String, BenchResult>,
}

impl AggregatedResults {
    /// Fold measurement iterations. Thread counts may differ between iterations.
    pub fn from_iterations<'a, I>(iterations: I) -> Self
    where
        I: IntoIterator<Item = &'a IterationResult>,
    {
        let mut grouped = LabelGroups::default();
        for iteration in iterations {
            for result in iteration.all() {
                grouped.push(result);
            }
        }
        let (primary, secondary) = grouped.fold(Aggregator::Iteration);
        Self { primary, secondary }
    }
}

#[derive(Default)]
struct LabelGroups<'a> {
    primary: Vec<&'a BenchResult>,
    secondary: BTreeMap<&'a str, Vec<&'a BenchResult>>,
}

impl<'a> LabelGroups<'a> {
    fn push(&mut self, result: &'a BenchResult) {
        match result.role() {
            ResultRole::Primary => self.primary.push(result),
            ResultRole::Secondary => self
                .secondary
                .entry(result.label())
                .or_default()
                .push(result),
        }
    }

    fn fold(
        self,
        aggregator: Aggregator,
    ) -> (Option<BenchResult>, BTreeMap<String, BenchResult>) {
        let primary = aggregator.fold(self.primary.iter().copied());
        let secondary = self
            .secondary
            .into_iter()
            .filter_map(|(label, results)| {
                aggregator
                    .fold(results.iter().copied())
                    .map(|r| (label.to_string(), r))
            })
            .collect();
        (primary, secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultKind;
    use crate::statistics::Statistics;

    fn primary(kind: ResultKind, values: &[f64]) -> BenchResult {
        BenchResult::new(
            kind,
            ResultRole::Primary,
            "bench",
            "ns/op",
            AggregationPolicy::Average,
            values.to_vec().into(),
        )
    }

    #[test]
    fn test_thread_fold_concatenates() {
        let sets: [&[f64]; 3] = [&[1.0, 2.0], &[3.0], &[4.0, 5.0, 6.0]];
        let threads: Vec<ThreadResult> = sets
            .iter()
            .map(|s| vec![primary(ResultKind::AverageTime, s)])
            .collect();

        let iteration = IterationResult::from_threads(&threads);
        let folded = iteration.primary.unwrap();
        assert_eq!(folded.statistics().n(), 6);
        assert_eq!(folded.statistics().sum(), 21.0);
        assert_eq!(iteration.threads, 3);
    }

    #[test]
    fn test_throughput_sums_threads_then_averages_iterations() {
        let iteration = |a: f64, b: f64| {
            IterationResult::from_threads(&[
                vec![primary(ResultKind::Throughput, &[a])],
                vec![primary(ResultKind::Throughput, &[b])],
            ])
        };
        let first = iteration(10.0, 20.0);
        assert_eq!(first.primary.as_ref().unwrap().score(), 30.0);

        let trial = AggregatedResults::from_iterations(&[first, iteration(20.0, 30.0)]);
        let score = trial.primary.unwrap();
        assert_eq!(score.policy(), AggregationPolicy::Average);
        assert_eq!(score.sample_count(), 2);
        assert_eq!(score.score(), 40.0);
    }

    #[test]
    fn test_varying_thread_counts() {
        let one = IterationResult::from_threads(&[vec![primary(ResultKind::AverageTime, &[1.0])]]);
        let three = IterationResult::from_threads(&[
            vec![primary(ResultKind::AverageTime, &[2.0])],
            vec![primary(ResultKind::AverageTime, &[3.0])],
            vec![primary(ResultKind::AverageTime, &[4.0])],
        ]);
        let trial = AggregatedResults::from_iterations([&one, &three]);
        let score = trial.primary.unwrap();
        assert_eq!(score.sample_count(), 4);
        assert_eq!(score.score(), 2.5);
    }

    #[test]
    fn test_secondaries_grouped_by_label() {
        let counter = |label: &str, v: f64| {
            BenchResult::scalar(label, v, "#", AggregationPolicy::Sum)
        };
        let iteration = IterationResult::from_threads(&[
            vec![counter("hits", 3.0), counter("misses", 1.0)],
            vec![counter("hits", 4.0)],
        ]);
        assert!(iteration.primary.is_none());
        assert_eq!(iteration.secondary["hits"].score(), 7.0);
        assert_eq!(iteration.secondary["misses"].score(), 1.0);
    }

    #[test]
    fn test_empty_fold() {
        assert!(Aggregator::Thread.fold(std::iter::empty()).is_none());
        let trial = AggregatedResults::from_iterations(&Vec::<IterationResult>::new());
        assert!(trial.primary.is_none());
        assert!(trial.secondary.is_empty());
    }
}
