//! Benchmark Planner
//!
//! Turns the registered tasks into the ordered list of records to run.
//!
//! - Regex filtering on the task id
//! - `Mode::All` expands into one record per concrete mode
//! - Declared parameters expand into the cartesian product of their values
//! - Run settings from `trialbench.toml` and the command line are applied
//!
//! Every record is resolved once against its task before anything is
//! launched, so configuration errors surface here.

use crate::config::{ConfigError, RunnerConfig};
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;
use trialbench_core::{BenchmarkParams, ParamError, TaskDescriptor, TaskRegistry};
use trialbench_ipc::BenchmarkRecord;
use trialbench_stats::Mode;

/// Overrides chosen for this run
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Mode replacing every task's declared mode
    pub mode: Option<Mode>,
    /// Thread counts per group
    pub thread_groups: Vec<u32>,
    /// Parameter values replacing the declared ones
    pub params: BTreeMap<String, Vec<String>>,
    /// Run settings written into each record
    pub runner: RunnerConfig,
    /// Extra worker arguments, after the worker flag
    pub launch_args: Vec<String>,
    /// Command prefix for the worker process, e.g. `taskset -c 2`
    pub launch_prefix: Vec<String>,
}

/// Configuration error found while planning
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("{record}: {source}")]
    Param {
        record: String,
        #[source]
        source: ParamError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("parameter {name} is not declared by any selected benchmark")]
    UnknownParam { name: String },

    #[error("parameter {name} has no values")]
    EmptyParam { name: String },
}

/// Execution plan for benchmarks
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// Records in execution order
    pub records: Vec<BenchmarkRecord>,
}

impl ExecutionPlan {
    /// Number of trials
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was selected
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Build execution plan from the registry.
///
/// Records come out sorted by (mode, name, bindings) for deterministic
/// execution.
pub fn build_plan(
    registry: &TaskRegistry,
    filter: Option<&Regex>,
    options: &PlanOptions,
) -> Result<ExecutionPlan, PlanError> {
    let descriptors: Vec<TaskDescriptor> = registry
        .iter()
        .filter(|def| filter.is_none_or(|re| re.is_match(def.id)))
        .map(|def| def.descriptor())
        .collect();

    for name in options.params.keys() {
        let declared = descriptors
            .iter()
            .any(|d| d.params.iter().any(|p| &p.name == name));
        if !declared {
            return Err(PlanError::UnknownParam { name: name.clone() });
        }
    }

    let mut records = Vec::new();
    for descriptor in &descriptors {
        for record in expand(descriptor, options)? {
            BenchmarkParams::resolve(&record, descriptor).map_err(|source| PlanError::Param {
                record: record.label(),
                source,
            })?;
            records.push(record);
        }
    }
    records.sort();

    Ok(ExecutionPlan { records })
}

/// All records of one task
fn expand(
    descriptor: &TaskDescriptor,
    options: &PlanOptions,
) -> Result<Vec<BenchmarkRecord>, PlanError> {
    let mut base = BenchmarkRecord::new(descriptor.id.as_str(), descriptor.mode);
    options.runner.apply(&mut base)?;
    base.thread_groups = options.thread_groups.clone();
    if !options.launch_args.is_empty() {
        base.launch_args = Some(options.launch_args.clone());
    }
    if !options.launch_prefix.is_empty() {
        base.launch_args_prepend = Some(options.launch_prefix.clone());
    }

    let mut declared = BTreeMap::new();
    for spec in &descriptor.params {
        let values = options
            .params
            .get(&spec.name)
            .cloned()
            .unwrap_or_else(|| spec.values.clone());
        if values.is_empty() {
            return Err(PlanError::EmptyParam {
                name: spec.name.clone(),
            });
        }
        declared.insert(spec.name.clone(), values);
    }
    if !declared.is_empty() {
        base.params = Some(declared.clone());
    }

    let modes = options.mode.unwrap_or(descriptor.mode).expand();
    let bindings = cartesian(&declared);

    let mut records = Vec::with_capacity(modes.len() * bindings.len());
    for mode in modes {
        for binding in &bindings {
            let mut record = base.with_mode(mode);
            record.bindings = binding.clone();
            records.push(record);
        }
    }
    Ok(records)
}

/// Cartesian product of parameter values. No parameters give one empty
/// binding.
fn cartesian(params: &BTreeMap<String, Vec<String>>) -> Vec<BTreeMap<String, String>> {
    let mut product = vec![BTreeMap::new()];
    for (name, values) in params {
        product = product
            .into_iter()
            .flat_map(|partial| {
                values.iter().map(move |value| {
                    let mut next = partial.clone();
                    next.insert(name.clone(), value.clone());
                    next
                })
            })
            .collect();
    }
    product
}

/// Parse `name=v1,v2` into a parameter override
pub fn parse_param(arg: &str) -> Result<(String, Vec<String>), String> {
    let (name, values) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected name=value[,value...], got {arg:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in {arg:?}"));
    }
    let values = values.split(',').map(|v| v.trim().to_string()).collect();
    Ok((name.to_string(), values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialbench_core::{
        BenchmarkTask, Bindings, GroupInfo, GroupSpec, Outcome, ParamSpec, State, TaskError,
        ThreadInfo,
    };

    macro_rules! task {
        ($name:ident, $id:literal, $mode:expr, groups: $groups:expr, params: $params:expr) => {
            struct $name;

            impl BenchmarkTask for $name {
                const ID: &'static str = $id;
                const MODE: Mode = $mode;
                type Shared = ();
                type Group = ();
                type Thread = ();

                fn groups() -> Vec<GroupSpec> {
                    $groups
                }
                fn params() -> Vec<ParamSpec> {
                    $params
                }
                fn create(_: &Bindings) -> Result<Self, TaskError> {
                    Ok($name)
                }
                fn shared_state(&self) -> Result<(), TaskError> {
                    Ok(())
                }
                fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
                    Ok(())
                }
                fn thread_state(&self, _: &ThreadInfo) -> Result<(), TaskError> {
                    Ok(())
                }
                fn invoke(&self, _: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
                    Ok(Outcome::Timed)
                }
            }
        };
    }

    task!(Hashing, "hash", Mode::AverageTime, groups: Vec::new(), params: vec![
        ParamSpec::new("size", ["16", "1024"]),
        ParamSpec::new("algo", ["fnv", "sip", "xx"]),
    ]);
    task!(Queue, "queue", Mode::Throughput, groups: vec![
        GroupSpec::new("producer", 1),
        GroupSpec::new("consumer", 2),
    ], params: Vec::new());
    task!(Alloc, "alloc", Mode::All, groups: Vec::new(), params: Vec::new());

    fn registry() -> TaskRegistry {
        TaskRegistry::new()
            .with::<Hashing>()
            .with::<Queue>()
            .with::<Alloc>()
    }

    #[test]
    fn test_cartesian_product_of_params() {
        let re = Regex::new("^hash$").unwrap();
        let plan = build_plan(&registry(), Some(&re), &PlanOptions::default()).unwrap();
        assert_eq!(plan.len(), 6);
        assert!(plan.records.iter().all(|r| r.name == "hash"));
        let algos: Vec<_> = plan.records.iter().map(|r| r.bindings["algo"].as_str()).collect();
        assert_eq!(algos, ["fnv", "fnv", "sip", "sip", "xx", "xx"]);
        assert_eq!(plan.records[0].params.as_ref().unwrap()["size"], ["16", "1024"]);
    }

    #[test]
    fn test_mode_all_expands() {
        let re = Regex::new("alloc").unwrap();
        let plan = build_plan(&registry(), Some(&re), &PlanOptions::default()).unwrap();
        let modes: Vec<Mode> = plan.records.iter().map(|r| r.mode).collect();
        assert_eq!(modes.len(), Mode::CONCRETE.len());
        assert!(!modes.contains(&Mode::All));
    }

    #[test]
    fn test_overrides() {
        let mut options = PlanOptions {
            mode: Some(Mode::SampleTime),
            ..Default::default()
        };
        options
            .params
            .insert("algo".to_string(), vec!["sip".to_string()]);
        options.runner.forks = Some(0);

        let plan = build_plan(&registry(), None, &options).unwrap();
        let hash: Vec<_> = plan.records.iter().filter(|r| r.name == "hash").collect();
        assert_eq!(hash.len(), 2);
        assert!(plan.records.iter().all(|r| r.mode == Mode::SampleTime));
        assert!(plan.records.iter().all(|r| r.forks == Some(0)));
    }

    #[test]
    fn test_configuration_errors_before_launch() {
        let options = PlanOptions {
            thread_groups: vec![1, 1, 1],
            ..Default::default()
        };
        let re = Regex::new("queue").unwrap();
        let err = build_plan(&registry(), Some(&re), &options).unwrap_err();
        assert!(matches!(
            err,
            PlanError::Param {
                source: ParamError::GroupCount { .. },
                ..
            }
        ));

        let mut options = PlanOptions::default();
        options.params.insert("nope".to_string(), vec!["1".to_string()]);
        assert!(matches!(
            build_plan(&registry(), None, &options),
            Err(PlanError::UnknownParam { .. })
        ));
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("size=1, 2,3").unwrap(),
            ("size".to_string(), vec!["1".into(), "2".into(), "3".into()])
        );
        assert!(parse_param("size").is_err());
        assert!(parse_param("=1").is_err());
    }
}
