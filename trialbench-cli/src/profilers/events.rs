//! Sampled events from `perf script` output
//!
//! Expected line shape (`perf script -F pid,time,event,ip,sym,dso`):
//!
//! ```text
//!   4242 18233.104511: cycles:      7f3a2b1c4d5e memchr (/usr/lib/libc.so.6)
//! ```
//!
//! Lines of other processes, lines earlier than the skip threshold and
//! lines that do not parse are dropped. Addresses resolve through a symbol
//! map built on first use.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::time::Duration;
use trialbench_stats::{AggregationPolicy, BenchResult};

/// Bucket for addresses without a symbol
pub const UNKNOWN_SYMBOL: &str = "<unknown>";

/// Bucket for kernel addresses
pub const KERNEL_SYMBOL: &str = "<kernel>";

/// Lowest kernel-space address on x86-64 and aarch64
const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// A resolved code location
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Symbol {
    /// Function name or one of the buckets
    pub name: String,
    /// Binary or library it belongs to
    pub module: String,
}

impl Symbol {
    fn bucket(name: &str) -> Self {
        Self {
            name: name.to_string(),
            module: String::new(),
        }
    }
}

/// Address to symbol and address to module tables.
#[derive(Debug, Default)]
pub struct SymbolMap {
    entries: BTreeMap<u64, Symbol>,
}

impl SymbolMap {
    /// Resolve an address
    pub fn resolve(&self, address: u64) -> Symbol {
        if address >= KERNEL_SPACE_START {
            return Symbol::bucket(KERNEL_SYMBOL);
        }
        self.entries
            .get(&address)
            .cloned()
            .unwrap_or_else(|| Symbol::bucket(UNKNOWN_SYMBOL))
    }
}

/// Per-event multisets of sampled addresses for one process.
#[derive(Debug, Default)]
pub struct PerfEvents {
    events: BTreeMap<String, BTreeMap<u64, u64>>,
    raw_symbols: Vec<(u64, String, String)>,
    symbols: OnceCell<SymbolMap>,
}

struct Sample<'a> {
    pid: u32,
    time: f64,
    event: &'a str,
    address: u64,
    symbol: &'a str,
    module: &'a str,
}

fn parse_line(line: &str) -> Option<Sample<'_>> {
    let line = line.trim();
    let (pid, rest) = line.split_once(char::is_whitespace)?;
    // pid may come as pid/tid
    let pid = pid.split('/').next()?.parse().ok()?;

    let rest = rest.trim_start();
    let (time, rest) = rest.split_once(char::is_whitespace)?;
    let time: f64 = time.strip_suffix(':')?.parse().ok()?;

    let rest = rest.trim_start();
    let (event, rest) = rest.split_once(char::is_whitespace)?;
    let event = event.strip_suffix(':')?;

    let rest = rest.trim_start();
    let (address, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let address = u64::from_str_radix(address.trim_start_matches("0x"), 16).ok()?;

    let rest = rest.trim();
    let (symbol, module) = match rest.rfind(" (").or_else(|| rest.starts_with('(').then_some(0)) {
        Some(open) if rest.ends_with(')') => {
            let module_start = if open == 0 && rest.starts_with('(') { 1 } else { open + 2 };
            (rest[..open].trim(), &rest[module_start..rest.len() - 1])
        }
        _ => (rest, ""),
    };

    Some(Sample {
        pid,
        time,
        event,
        address,
        symbol,
        module,
    })
}

fn matches_event<'a>(configured: &'a [String], seen: &str) -> Option<&'a str> {
    configured
        .iter()
        .find(|name| {
            seen == name.as_str()
                || seen
                    .strip_prefix(name.as_str())
                    .is_some_and(|modifier| modifier.starts_with(':'))
        })
        .map(String::as_str)
}

impl PerfEvents {
    /// Parse `perf script` text, keeping samples of `pid` for the configured
    /// events that occur at least `skip` after the first sample in the file.
    pub fn parse<R: BufRead>(reader: R, pid: u32, skip: Duration, events: &[String]) -> Self {
        let mut parsed = PerfEvents::default();
        for name in events {
            parsed.events.insert(name.clone(), BTreeMap::new());
        }

        let mut origin: Option<f64> = None;
        let mut skipped = 0usize;
        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            let Some(sample) = parse_line(&line) else {
                skipped += 1;
                continue;
            };
            let start = *origin.get_or_insert(sample.time);
            if sample.pid != pid || sample.time - start < skip.as_secs_f64() {
                continue;
            }
            let Some(event) = matches_event(events, sample.event) else {
                continue;
            };
            if let Some(counts) = parsed.events.get_mut(event) {
                *counts.entry(sample.address).or_default() += 1;
            }
            if !sample.symbol.is_empty() && sample.symbol != "[unknown]" {
                parsed.raw_symbols.push((
                    sample.address,
                    sample.symbol.to_string(),
                    sample.module.to_string(),
                ));
            }
        }
        if skipped > 0 {
            tracing::debug!(skipped, "unparsable perf script lines");
        }
        parsed
    }

    /// Symbol map over every address seen
    pub fn symbols(&self) -> &SymbolMap {
        self.symbols.get_or_init(|| {
            let mut map = SymbolMap::default();
            for (address, name, module) in &self.raw_symbols {
                map.entries.entry(*address).or_insert_with(|| Symbol {
                    name: name.clone(),
                    module: module.clone(),
                });
            }
            map
        })
    }

    /// Samples recorded for an event
    pub fn total(&self, event: &str) -> u64 {
        self.events
            .get(event)
            .map(|counts| counts.values().sum())
            .unwrap_or(0)
    }

    /// Whether no sample survived filtering
    pub fn is_empty(&self) -> bool {
        self.events.values().all(BTreeMap::is_empty)
    }

    /// The `n` symbols with most samples, hottest first
    pub fn top(&self, event: &str, n: usize) -> Vec<(Symbol, u64)> {
        let Some(counts) = self.events.get(event) else {
            return Vec::new();
        };
        let symbols = self.symbols();
        let mut by_symbol: BTreeMap<Symbol, u64> = BTreeMap::new();
        for (&address, &count) in counts {
            *by_symbol.entry(symbols.resolve(address)).or_default() += count;
        }
        let mut ranked: Vec<(Symbol, u64)> = by_symbol.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Derived results: the sample count of every event plus the share of
    /// its `n` hottest symbols. Empty when no sample survived filtering.
    pub fn results(&self, n: usize) -> Vec<BenchResult> {
        let mut results = Vec::new();
        if self.is_empty() {
            return results;
        }
        for event in self.events.keys() {
            let total = self.total(event);
            results.push(BenchResult::scalar(
                format!("·perf.{event}"),
                total as f64,
                "#",
                AggregationPolicy::Sum,
            ));
            if total == 0 {
                continue;
            }
            for (symbol, count) in self.top(event, n) {
                let label = if symbol.module.is_empty() {
                    format!("·perf.{event}: {}", symbol.name)
                } else {
                    format!("·perf.{event}: {} ({})", symbol.name, symbol.module)
                };
                results.push(BenchResult::scalar(
                    label,
                    count as f64 * 100.0 / total as f64,
                    "%",
                    AggregationPolicy::Average,
                ));
            }
        }
        results
    }
}
