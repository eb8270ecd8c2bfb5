//! Benchmark Record
//!
//! A [`BenchmarkRecord`] is one fully resolved benchmark configuration. It
//! crosses the process boundary as the first line the controller sends, so it
//! has a lossless single-line text form:
//!
//! ```text
//! name===,===mode===,===groups===,=== ... ===,===bindings
//! ```
//!
//! Text components are escaped so they never contain `=`. Every sentinel
//! starts with `=`, so the decoder tokenizes left to right without
//! ambiguity: text runs until the next `=`, which must open a sentinel.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use trialbench_stats::{Mode, TimeUnit};

/// Separates top-level fields
pub const FIELD_SEPARATOR: &str = "===,===";
/// Separates list items
pub const LIST_SEPARATOR: &str = "===SEP===";
/// Separates map entries
pub const PAIR_SEPARATOR: &str = "===PAIR===";
/// Separates a map key from its value
pub const KEY_SEPARATOR: &str = "===KEY===";
/// An absent optional field
pub const NONE_MARKER: &str = "===NONE===";
/// An empty collection
pub const EMPTY_MARKER: &str = "===EMPTY===";

const SENTINELS: [&str; 6] = [
    FIELD_SEPARATOR,
    LIST_SEPARATOR,
    PAIR_SEPARATOR,
    KEY_SEPARATOR,
    NONE_MARKER,
    EMPTY_MARKER,
];

const FIELD_NAMES: [&str; 22] = [
    "name",
    "mode",
    "thread_groups",
    "threads",
    "warmup_iterations",
    "warmup_time",
    "warmup_batch_size",
    "measurement_iterations",
    "measurement_time",
    "measurement_batch_size",
    "forks",
    "warmup_forks",
    "launch_args",
    "launch_args_prepend",
    "launch_args_append",
    "params",
    "time_unit",
    "bindings",
    "sync_iterations",
    "fail_on_error",
    "timeout",
    "scale",
];

/// Errors decoding a record line.
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid escape sequence at byte {0}")]
    BadEscape(usize),

    #[error("unknown sentinel at byte {0}")]
    UnknownSentinel(usize),
}

/// A resolved benchmark configuration.
///
/// Equality, hashing and ordering only consider mode, name and parameter
/// bindings: two records differing in timing settings describe the same
/// logical benchmark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    /// Task id
    pub name: String,
    /// Benchmark mode
    pub mode: Mode,
    /// Threads per declared group, empty for a single implicit group
    pub thread_groups: Vec<u32>,
    /// Thread count of the implicit group
    pub threads: Option<u32>,
    /// Warmup iteration count
    pub warmup_iterations: Option<u32>,
    /// Warmup iteration duration
    pub warmup_time: Option<Duration>,
    /// Invocations per warmup iteration; set means count-based iterations
    pub warmup_batch_size: Option<u64>,
    /// Measurement iteration count
    pub measurement_iterations: Option<u32>,
    /// Measurement iteration duration
    pub measurement_time: Option<Duration>,
    /// Invocations per measurement iteration; set means count-based iterations
    pub measurement_batch_size: Option<u64>,
    /// Measured forks, 0 runs in the controller process
    pub forks: Option<u32>,
    /// Forks whose results are discarded
    pub warmup_forks: Option<u32>,
    /// Worker arguments replacing the defaults
    pub launch_args: Option<Vec<String>>,
    /// Arguments placed before the worker command
    pub launch_args_prepend: Option<Vec<String>>,
    /// Arguments placed after the worker command
    pub launch_args_append: Option<Vec<String>>,
    /// Declared parameters and their candidate values
    pub params: Option<BTreeMap<String, Vec<String>>>,
    /// Score time unit
    pub time_unit: Option<TimeUnit>,
    /// Parameter values this record runs with
    pub bindings: BTreeMap<String, String>,
    /// Keep threads busy until every thread finished measuring
    pub sync_iterations: Option<bool>,
    /// Abort the run on the first failed trial
    pub fail_on_error: Option<bool>,
    /// Longest wait for any single worker response
    pub timeout: Option<Duration>,
    /// Ramp the active threads up across iterations
    pub scale: Option<bool>,
}

impl BenchmarkRecord {
    /// Record with every optional setting left to defaults
    pub fn new(name: impl Into<String>, mode: Mode) -> Self {
        Self {
            name: name.into(),
            mode,
            thread_groups: Vec::new(),
            threads: None,
            warmup_iterations: None,
            warmup_time: None,
            warmup_batch_size: None,
            measurement_iterations: None,
            measurement_time: None,
            measurement_batch_size: None,
            forks: None,
            warmup_forks: None,
            launch_args: None,
            launch_args_prepend: None,
            launch_args_append: None,
            params: None,
            time_unit: None,
            bindings: BTreeMap::new(),
            sync_iterations: None,
            fail_on_error: None,
            timeout: None,
            scale: None,
        }
    }

    /// Copy of this record running in another mode
    pub fn with_mode(&self, mode: Mode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    /// Copy of this record with one more parameter binding
    pub fn with_binding(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut record = self.clone();
        record.bindings.insert(key.into(), value.into());
        record
    }

    /// Human-readable identity, e.g. `queue.offer:avgt (size=16)`
    pub fn label(&self) -> String {
        if self.bindings.is_empty() {
            format!("{}:{}", self.name, self.mode)
        } else {
            let bindings: Vec<String> = self
                .bindings
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            format!("{}:{} ({})", self.name, self.mode, bindings.join(", "))
        }
    }

    /// Encode as a single line
    pub fn encode(&self) -> String {
        let fields = [
            Value::text(&self.name),
            Value::text(self.mode.short_label()),
            Value::list(self.thread_groups.iter().map(u32::to_string)),
            Value::optional(self.threads.map(|v| Value::text(&v.to_string()))),
            Value::optional(self.warmup_iterations.map(|v| Value::text(&v.to_string()))),
            Value::optional(self.warmup_time.map(|d| Value::text(&format_time_value(d)))),
            Value::optional(self.warmup_batch_size.map(|v| Value::text(&v.to_string()))),
            Value::optional(
                self.measurement_iterations
                    .map(|v| Value::text(&v.to_string())),
            ),
            Value::optional(
                self.measurement_time
                    .map(|d| Value::text(&format_time_value(d))),
            ),
            Value::optional(
                self.measurement_batch_size
                    .map(|v| Value::text(&v.to_string())),
            ),
            Value::optional(self.forks.map(|v| Value::text(&v.to_string()))),
            Value::optional(self.warmup_forks.map(|v| Value::text(&v.to_string()))),
            Value::optional(self.launch_args.as_ref().map(|a| Value::list(a.iter().cloned()))),
            Value::optional(
                self.launch_args_prepend
                    .as_ref()
                    .map(|a| Value::list(a.iter().cloned())),
            ),
            Value::optional(
                self.launch_args_append
                    .as_ref()
                    .map(|a| Value::list(a.iter().cloned())),
            ),
            Value::optional(self.params.as_ref().map(|p| {
                Value::map(
                    p.iter()
                        .map(|(k, vs)| (k.clone(), Value::list(vs.iter().cloned()))),
                )
            })),
            Value::optional(self.time_unit.map(|u| Value::text(u.suffix()))),
            Value::map(
                self.bindings
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::text(v))),
            ),
            Value::optional(self.sync_iterations.map(|b| Value::text(&b.to_string()))),
            Value::optional(self.fail_on_error.map(|b| Value::text(&b.to_string()))),
            Value::optional(self.timeout.map(|d| Value::text(&format_time_value(d)))),
            Value::optional(self.scale.map(|b| Value::text(&b.to_string()))),
        ];
        fields
            .iter()
            .map(Value::render)
            .collect::<Vec<_>>()
            .join(FIELD_SEPARATOR)
    }

    /// Decode a line produced by [`encode`](Self::encode)
    pub fn decode(line: &str) -> Result<Self, RecordError> {
        let tokens = tokenize(line)?;
        let fields = split(&tokens, FIELD_SEPARATOR);
        if fields.len() != FIELD_NAMES.len() {
            return Err(RecordError::FieldCount {
                expected: FIELD_NAMES.len(),
                got: fields.len(),
            });
        }
        let field = |i: usize| Field {
            name: FIELD_NAMES[i],
            tokens: fields[i],
        };

        Ok(Self {
            name: field(0).text()?,
            mode: field(1).parsed()?,
            thread_groups: field(2)
                .list()?
                .iter()
                .map(|s| parse_with::<u32>(FIELD_NAMES[2], s))
                .collect::<Result<_, _>>()?,
            threads: field(3).optional(|f| f.parsed())?,
            warmup_iterations: field(4).optional(|f| f.parsed())?,
            warmup_time: field(5).optional(|f| f.duration())?,
            warmup_batch_size: field(6).optional(|f| f.parsed())?,
            measurement_iterations: field(7).optional(|f| f.parsed())?,
            measurement_time: field(8).optional(|f| f.duration())?,
            measurement_batch_size: field(9).optional(|f| f.parsed())?,
            forks: field(10).optional(|f| f.parsed())?,
            warmup_forks: field(11).optional(|f| f.parsed())?,
            launch_args: field(12).optional(|f| f.list())?,
            launch_args_prepend: field(13).optional(|f| f.list())?,
            launch_args_append: field(14).optional(|f| f.list())?,
            params: field(15).optional(|f| {
                f.map()?
                    .into_iter()
                    .map(|(k, v)| Ok((k, v.list()?)))
                    .collect()
            })?,
            time_unit: field(16).optional(|f| f.parsed())?,
            bindings: field(17)
                .map()?
                .into_iter()
                .map(|(k, v)| Ok((k, v.text()?)))
                .collect::<Result<_, RecordError>>()?,
            sync_iterations: field(18).optional(|f| f.parsed())?,
            fail_on_error: field(19).optional(|f| f.parsed())?,
            timeout: field(20).optional(|f| f.duration())?,
            scale: field(21).optional(|f| f.parsed())?,
        })
    }

    fn identity(&self) -> (Mode, &str, &BTreeMap<String, String>) {
        (self.mode, &self.name, &self.bindings)
    }
}

impl PartialEq for BenchmarkRecord {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for BenchmarkRecord {}

impl Hash for BenchmarkRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for BenchmarkRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BenchmarkRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for BenchmarkRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for BenchmarkRecord {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Render a duration exactly, in the largest unit that divides it.
pub fn format_time_value(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    for (unit, scale) in [
        ("min", 60_000_000_000u128),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
    ] {
        if nanos != 0 && nanos % scale == 0 {
            return format!("{}{unit}", nanos / scale);
        }
    }
    format!("{nanos}ns")
}

/// Parse an integer time value such as `500ms` or `2s`.
pub fn parse_time_value(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = s.split_at(split);
    let value: u64 = number.parse().ok()?;
    let nanos_per_unit: u64 = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "min" => 60_000_000_000,
        _ => return None,
    };
    Some(Duration::from_nanos(value.checked_mul(nanos_per_unit)?))
}

// ─── Encoding ────────────────────────────────────────────────────────────────

enum Value {
    None,
    Empty,
    Text(String),
    Joined(Vec<Value>, &'static str),
    Pair(String, Box<Value>),
}

impl Value {
    fn text(s: &str) -> Self {
        Value::Text(s.to_string())
    }

    fn optional(value: Option<Value>) -> Self {
        value.unwrap_or(Value::None)
    }

    fn list(items: impl Iterator<Item = String>) -> Self {
        let items: Vec<Value> = items.map(Value::Text).collect();
        if items.is_empty() {
            Value::Empty
        } else {
            Value::Joined(items, LIST_SEPARATOR)
        }
    }

    fn map(entries: impl Iterator<Item = (String, Value)>) -> Self {
        let pairs: Vec<Value> = entries
            .map(|(k, v)| Value::Pair(k, Box::new(v)))
            .collect();
        if pairs.is_empty() {
            Value::Empty
        } else {
            Value::Joined(pairs, PAIR_SEPARATOR)
        }
    }

    fn render(&self) -> String {
        match self {
            Value::None => NONE_MARKER.to_string(),
            Value::Empty => EMPTY_MARKER.to_string(),
            Value::Text(s) => escape(s),
            Value::Joined(items, separator) => items
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(separator),
            Value::Pair(key, value) => format!("{}{KEY_SEPARATOR}{}", escape(key), value.render()),
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '=' => out.push_str("\\q"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

// ─── Decoding ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Sentinel(&'static str),
}

fn tokenize(line: &str) -> Result<Vec<Token>, RecordError> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut rest = line;
    let mut offset = 0;

    while let Some(c) = rest.chars().next() {
        match c {
            '=' => {
                let sentinel = SENTINELS
                    .iter()
                    .find(|s| rest.starts_with(**s))
                    .ok_or(RecordError::UnknownSentinel(offset))?;
                if !text.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut text)));
                }
                tokens.push(Token::Sentinel(sentinel));
                rest = &rest[sentinel.len()..];
                offset += sentinel.len();
            }
            '\\' => {
                let decoded = match rest[1..].chars().next() {
                    Some('\\') => '\\',
                    Some('q') => '=',
                    Some('n') => '\n',
                    Some('r') => '\r',
                    _ => return Err(RecordError::BadEscape(offset)),
                };
                text.push(decoded);
                rest = &rest[2..];
                offset += 2;
            }
            c => {
                text.push(c);
                rest = &rest[c.len_utf8()..];
                offset += c.len_utf8();
            }
        }
    }
    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    Ok(tokens)
}

fn split<'t>(tokens: &'t [Token], separator: &'static str) -> Vec<&'t [Token]> {
    tokens
        .split(|t| *t == Token::Sentinel(separator))
        .collect()
}

struct Field<'t> {
    name: &'static str,
    tokens: &'t [Token],
}

impl<'t> Field<'t> {
    fn invalid(&self, reason: impl Into<String>) -> RecordError {
        RecordError::InvalidField {
            field: self.name,
            reason: reason.into(),
        }
    }

    fn is_marker(&self, marker: &'static str) -> bool {
        matches!(self.tokens, [Token::Sentinel(s)] if *s == marker)
    }

    fn text(&self) -> Result<String, RecordError> {
        match self.tokens {
            [] => Ok(String::new()),
            [Token::Text(s)] => Ok(s.clone()),
            _ => Err(self.invalid("expected a single value")),
        }
    }

    fn parsed<T: FromStr>(&self) -> Result<T, RecordError>
    where
        T::Err: fmt::Display,
    {
        parse_with(self.name, &self.text()?)
    }

    fn duration(&self) -> Result<Duration, RecordError> {
        let text = self.text()?;
        parse_time_value(&text).ok_or_else(|| self.invalid(format!("bad time value {text:?}")))
    }

    fn optional<T>(
        &self,
        present: impl FnOnce(&Self) -> Result<T, RecordError>,
    ) -> Result<Option<T>, RecordError> {
        if self.is_marker(NONE_MARKER) {
            Ok(None)
        } else {
            present(self).map(Some)
        }
    }

    fn list(&self) -> Result<Vec<String>, RecordError> {
        if self.is_marker(EMPTY_MARKER) {
            return Ok(Vec::new());
        }
        split(self.tokens, LIST_SEPARATOR)
            .into_iter()
            .map(|tokens| {
                Field {
                    name: self.name,
                    tokens,
                }
                .text()
            })
            .collect()
    }

    fn map(&self) -> Result<Vec<(String, Field<'t>)>, RecordError> {
        if self.is_marker(EMPTY_MARKER) {
            return Ok(Vec::new());
        }
        split(self.tokens, PAIR_SEPARATOR)
            .into_iter()
            .map(|pair| {
                let at = pair
                    .iter()
                    .position(|t| *t == Token::Sentinel(KEY_SEPARATOR))
                    .ok_or_else(|| self.invalid("map entry without key separator"))?;
                let key = Field {
                    name: self.name,
                    tokens: &pair[..at],
                }
                .text()?;
                Ok((
                    key,
                    Field {
                        name: self.name,
                        tokens: &pair[at + 1..],
                    },
                ))
            })
            .collect()
    }
}

fn parse_with<T: FromStr>(field: &'static str, text: &str) -> Result<T, RecordError>
where
    T::Err: fmt::Display,
{
    text.parse().map_err(|e: T::Err| RecordError::InvalidField {
        field,
        reason: format!("{text:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_record() -> BenchmarkRecord {
        let mut params = BTreeMap::new();
        params.insert(
            "size===KEY===".to_string(),
            vec!["===PAIR===".to_string(), String::new(), "PAIR".to_string()],
        );
        params.insert("unused".to_string(), Vec::new());

        let mut record = BenchmarkRecord::new("queue===,===offer", Mode::SampleTime);
        record.thread_groups = vec![3, 1];
        record.threads = Some(4);
        record.warmup_iterations = Some(0);
        record.warmup_time = Some(Duration::from_millis(1500));
        record.warmup_batch_size = None;
        record.measurement_iterations = Some(5);
        record.measurement_time = Some(Duration::from_nanos(7));
        record.measurement_batch_size = Some(100);
        record.forks = Some(2);
        record.warmup_forks = Some(0);
        record.launch_args = Some(vec!["--flag=1".to_string(), "a\\b".to_string()]);
        record.launch_args_prepend = Some(Vec::new());
        record.launch_args_append = Some(vec![String::new()]);
        record.params = Some(params);
        record.time_unit = Some(TimeUnit::Microseconds);
        record.bindings.insert("PAIR".to_string(), "===NONE===".to_string());
        record.bindings.insert("nl".to_string(), "line\nbreak\r".to_string());
        record.sync_iterations = Some(false);
        record.fail_on_error = Some(true);
        record.timeout = Some(Duration::from_secs(600));
        record.scale = Some(true);
        record
    }

    fn assert_identical(a: &BenchmarkRecord, b: &BenchmarkRecord) {
        // Debug covers every field, PartialEq only the identity
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn test_roundtrip_with_delimiter_like_content() {
        let record = full_record();
        let line = record.encode();
        assert!(!line.contains('\n'));

        let decoded = BenchmarkRecord::decode(&line).unwrap();
        assert_identical(&record, &decoded);
        assert_eq!(decoded.encode(), line);
    }

    #[test]
    fn test_roundtrip_all_absent() {
        let record = BenchmarkRecord::new("", Mode::Throughput);
        let line = record.encode();
        assert!(line.contains(NONE_MARKER));
        let decoded: BenchmarkRecord = line.parse().unwrap();
        assert_identical(&record, &decoded);
    }

    #[test]
    fn test_empty_list_differs_from_list_of_empty_string() {
        let mut a = BenchmarkRecord::new("b", Mode::AverageTime);
        a.launch_args = Some(Vec::new());
        let mut b = a.clone();
        b.launch_args = Some(vec![String::new()]);
        let mut c = a.clone();
        c.launch_args = None;

        let lines = [a.encode(), b.encode(), c.encode()];
        assert_ne!(lines[0], lines[1]);
        assert_ne!(lines[0], lines[2]);
        assert_ne!(lines[1], lines[2]);
        assert_eq!(
            BenchmarkRecord::decode(&lines[1]).unwrap().launch_args,
            Some(vec![String::new()])
        );
    }

    #[test]
    fn test_identity_ignores_timing() {
        let a = BenchmarkRecord::new("bench", Mode::AverageTime);
        let mut b = a.clone();
        b.warmup_iterations = Some(10);
        b.measurement_time = Some(Duration::from_secs(3));
        assert_eq!(a, b);

        let c = a.with_binding("size", "16");
        assert_ne!(a, c);
        assert_ne!(a, a.with_mode(Mode::Throughput));
    }

    #[test]
    fn test_ordering_mode_then_name_then_bindings() {
        let mut records = vec![
            BenchmarkRecord::new("b", Mode::AverageTime),
            BenchmarkRecord::new("a", Mode::AverageTime).with_binding("n", "2"),
            BenchmarkRecord::new("z", Mode::Throughput),
            BenchmarkRecord::new("a", Mode::AverageTime).with_binding("n", "1"),
        ];
        records.sort();
        let labels: Vec<String> = records.iter().map(BenchmarkRecord::label).collect();
        assert_eq!(
            labels,
            vec!["z:thrpt", "a:avgt (n=1)", "a:avgt (n=2)", "b:avgt"]
        );
    }

    #[test]
    fn test_field_count_mismatch() {
        let err = BenchmarkRecord::decode("only===,===two").unwrap_err();
        assert_eq!(
            err,
            RecordError::FieldCount {
                expected: 22,
                got: 2
            }
        );
    }

    #[test]
    fn test_bad_input_rejected() {
        let line = BenchmarkRecord::new("x", Mode::SingleShot).encode();
        assert!(matches!(
            BenchmarkRecord::decode(&line.replacen("ss", "nope", 1)),
            Err(RecordError::InvalidField { field: "mode", .. })
        ));
        assert!(matches!(
            BenchmarkRecord::decode("x\\z"),
            Err(RecordError::BadEscape(1))
        ));
        assert!(matches!(
            BenchmarkRecord::decode("x=y"),
            Err(RecordError::UnknownSentinel(1))
        ));
    }

    #[test]
    fn test_time_values() {
        assert_eq!(format_time_value(Duration::from_secs(120)), "2min");
        assert_eq!(format_time_value(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_time_value(Duration::ZERO), "0ns");
        assert_eq!(parse_time_value("1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_time_value("0ns"), Some(Duration::ZERO));
        assert_eq!(parse_time_value("1.5s"), None);
        assert_eq!(parse_time_value("10"), None);
    }
}
