//! Output Formatting
//!
//! Human-readable rendering of trial results:
//! - per-trial detail with the primary result's extended info
//! - secondary and profiler results, warnings, failures
//! - a closing score table, one row per result

use crate::orchestrator::TrialResult;
use trialbench_stats::{BenchResult, format_number};

/// Detail block of one trial
pub fn format_trial(trial: &TrialResult) -> String {
    let mut output = String::new();
    let status = if trial.is_failed() { "✗" } else { "✓" };
    output.push_str(&format!("{} {}\n", status, trial.record.label()));

    if let Some(failure) = &trial.failure {
        output.push_str(&format!("  error: {}\n", failure));
        return output;
    }

    match trial.primary() {
        Some(primary) => {
            for line in primary.extended_info().lines() {
                output.push_str(&format!("  {}\n", line));
            }
        }
        None => output.push_str("  no primary result\n"),
    }

    for secondary in trial.secondaries() {
        output.push_str(&format!(
            "  {}: {} {}\n",
            secondary.label(),
            format_number(secondary.score()),
            secondary.unit()
        ));
    }

    for warning in &trial.warnings {
        output.push_str(&format!("  warning: {}\n", warning));
    }
    output
}

fn row(name: String, mode: &str, result: &BenchResult) -> [String; 6] {
    let error = result.score_error();
    [
        name,
        mode.to_string(),
        result.sample_count().to_string(),
        format_number(result.score()),
        if error.is_nan() {
            String::new()
        } else {
            format!("± {}", format_number(error))
        },
        result.unit().to_string(),
    ]
}

/// Full summary: trial details followed by the score table
pub fn format_summary(trials: &[TrialResult]) -> String {
    let mut output = String::new();

    output.push('\n');
    output.push_str("Trialbench Results\n");
    output.push_str(&"=".repeat(60));
    output.push_str("\n\n");

    for trial in trials {
        output.push_str(&format_trial(trial));
        output.push('\n');
    }

    let mut rows = Vec::new();
    for trial in trials {
        let mode = trial.record.mode.short_label();
        let name = trial.record.label();
        match trial.primary() {
            Some(primary) => rows.push(row(name.clone(), mode, primary)),
            None => rows.push([
                name.clone(),
                mode.to_string(),
                "0".to_string(),
                "failed".to_string(),
                String::new(),
                String::new(),
            ]),
        }
        for secondary in trial.secondaries() {
            rows.push(row(format!("{}:{}", name, secondary.label()), mode, secondary));
        }
    }
    if rows.is_empty() {
        output.push_str("No trials run\n");
        return output;
    }

    let header = ["Benchmark", "Mode", "Cnt", "Score", "Error", "Units"].map(String::from);
    let mut widths = [0usize; 6];
    for r in std::iter::once(&header).chain(&rows) {
        for (width, cell) in widths.iter_mut().zip(r) {
            *width = (*width).max(cell.chars().count());
        }
    }

    output.push_str(&"-".repeat(60));
    output.push('\n');
    for r in std::iter::once(&header).chain(&rows) {
        output.push_str(&format!(
            "{:<w0$}  {:>w1$}  {:>w2$}  {:>w3$}  {:>w4$}  {:<w5$}",
            r[0],
            r[1],
            r[2],
            r[3],
            r[4],
            r[5],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3],
            w4 = widths[4],
            w5 = widths[5],
        ));
        output.truncate(output.trim_end().len());
        output.push('\n');
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{ForkResult, TrialError};
    use std::collections::BTreeMap;
    use trialbench_ipc::BenchmarkRecord;
    use trialbench_stats::{
        AggregatedResults, AggregationPolicy, Mode, ResultKind, ResultRole, SampleSet,
    };

    fn trial(samples: &[f64]) -> TrialResult {
        let mut statistics = SampleSet::new();
        for &s in samples {
            statistics.add(s);
        }
        let primary = BenchResult::new(
            ResultKind::AverageTime,
            ResultRole::Primary,
            "push",
            "ns/op",
            AggregationPolicy::Average,
            statistics,
        );
        let mut profiler_results = BTreeMap::new();
        profiler_results.insert(
            "·rusage.minflt".to_string(),
            BenchResult::scalar("·rusage.minflt", 12.0, "#", AggregationPolicy::Sum),
        );
        TrialResult {
            record: BenchmarkRecord::new("queue", Mode::AverageTime),
            forks: vec![ForkResult::default()],
            aggregated: AggregatedResults {
                primary: Some(primary),
                secondary: BTreeMap::new(),
            },
            profiler_results,
            warnings: vec!["perf: before_trial failed: not installed".to_string()],
            failure: None,
        }
    }

    #[test]
    fn test_trial_detail() {
        let text = format_trial(&trial(&[10.0, 11.0, 12.0, 13.0, 14.0]));
        assert!(text.starts_with("✓ queue:"));
        assert!(text.contains("Result \"push\":"));
        assert!(text.contains("·rusage.minflt: 12.0000 #"));
        assert!(text.contains("warning: perf: before_trial failed"));
    }

    #[test]
    fn test_failed_trial() {
        let record = BenchmarkRecord::new("queue", Mode::Throughput);
        let error = TrialError::Configuration {
            record: record.label(),
            message: "thread group count mismatch".to_string(),
        };
        let failed = TrialResult::failed(record, &error);
        let text = format_trial(&failed);
        assert!(text.starts_with("✗"));
        assert!(text.contains("thread group count mismatch"));

        let summary = format_summary(&[failed]);
        assert!(summary.contains("failed"));
    }

    #[test]
    fn test_summary_table() {
        let summary = format_summary(&[trial(&[10.0, 12.0, 14.0])]);
        let table: Vec<&str> = summary
            .lines()
            .skip_while(|l| !l.starts_with("Benchmark"))
            .collect();
        assert_eq!(table.len(), 3);
        assert!(table[1].contains("avgt"));
        assert!(table[1].contains("12.0000"));
        assert!(table[1].contains("±"));
        assert!(table[2].contains("·rusage.minflt"));
        assert!(!table[2].contains("±"));
    }

    #[test]
    fn test_empty_summary() {
        assert!(format_summary(&[]).contains("No trials run"));
    }
}
