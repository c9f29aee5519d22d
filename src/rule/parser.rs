//! Rule document compilation
//!
//! A rule is a JSON document. Keys starting with `$` are directives; every other
//! top-level key names a target template. Compilation is all-or-nothing: the first
//! malformed directive aborts parsing and no partial rule is returned.

use crate::rule::entry::Entry;
use crate::rule::template::TargetTemplate;
use crate::rule::timing::{compute_start_delay, parse_duration, parse_time_of_day, DayAnchor};
use crate::RuleError;
use chrono::{Local, NaiveDateTime};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_CONCURRENCY: i64 = 10;

/// A compiled crawl rule
#[derive(Debug, Clone)]
pub struct Rule {
    /// Global run timeout; unbounded when absent
    pub timeout: Option<Duration>,

    /// Interval between runs
    pub interval: Duration,

    /// Delay before the first run
    pub delay: Duration,

    /// Maximum targets in flight; unlimited when absent
    pub concurrency: Option<usize>,

    pub entries: Vec<Entry>,
    pub templates: HashMap<String, Arc<TargetTemplate>>,
}

impl Rule {
    /// Compiles a rule document, computing the start delay from the local clock
    pub fn parse(content: &str) -> Result<Self, RuleError> {
        Self::parse_at(content, Local::now().naive_local())
    }

    /// Compiles a rule document read from a file
    pub fn from_file(path: &Path) -> Result<Self, RuleError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Compiles a rule document relative to a fixed instant
    ///
    /// # Arguments
    ///
    /// * `content` - The JSON rule document
    /// * `now` - Reference instant for the `$startDay`/`$startDayTime` delay
    ///
    /// # Returns
    ///
    /// * `Ok(Rule)` - The compiled rule
    /// * `Err(RuleError)` - The document or one of its directives is malformed
    pub fn parse_at(content: &str, now: NaiveDateTime) -> Result<Self, RuleError> {
        let document: Value = serde_json::from_str(content)?;
        let map = object(&document, "rule")?;

        let timeout = get_str(map, "$timeout")?
            .map(|s| parse_duration("$timeout", s))
            .transpose()?;

        let interval = match get_str(map, "$every")? {
            Some(s) => parse_duration("$every", s)?,
            None => DEFAULT_INTERVAL,
        };

        let day = get_str(map, "$startDay")?.map(DayAnchor::parse).transpose()?;
        let time = get_str(map, "$startDayTime")?
            .map(parse_time_of_day)
            .transpose()?;
        let delay = compute_start_delay(day, time, now);

        let concurrency = match get_i64(map, "$concurrency")?.unwrap_or(DEFAULT_CONCURRENCY) {
            n if n <= 0 => None,
            n => Some(usize::try_from(n).unwrap_or(usize::MAX)),
        };

        let mut entries = Vec::new();
        if let Some(value) = map.get("$entries") {
            let items = value.as_array().ok_or_else(|| RuleError::InvalidDirective {
                directive: "$entries".to_string(),
                message: "expected an array".to_string(),
            })?;
            for item in items {
                entries.push(Entry::from_json(item)?);
            }
        }

        let mut templates = HashMap::new();
        for (name, value) in map.iter().filter(|(k, _)| !k.starts_with('$')) {
            templates.insert(name.clone(), Arc::new(TargetTemplate::from_json(name, value)?));
        }

        let rule = Rule {
            timeout,
            interval,
            delay,
            concurrency,
            entries,
            templates,
        };
        rule.check_references()?;

        Ok(rule)
    }

    /// Looks up a target template by name
    pub fn template(&self, name: &str) -> Option<&Arc<TargetTemplate>> {
        self.templates.get(name)
    }

    /// Ensures every seed and dive entry names an existing template
    fn check_references(&self) -> Result<(), RuleError> {
        let dive_entries = self
            .templates
            .values()
            .flat_map(|t| t.dive.iter().map(|(_, entry)| entry));

        for entry in self.entries.iter().chain(dive_entries) {
            if !self.templates.contains_key(&entry.name) {
                return Err(RuleError::UnknownTemplate(entry.name.clone()));
            }
        }
        Ok(())
    }
}

// ===== JSON helpers shared by the rule modules =====

pub(crate) fn object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, RuleError> {
    value
        .as_object()
        .ok_or_else(|| RuleError::NotAnObject(what.to_string()))
}

pub(crate) fn get_str<'a>(
    map: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, RuleError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(RuleError::InvalidDirective {
            directive: key.to_string(),
            message: format!("expected a string, got {}", other),
        }),
    }
}

pub(crate) fn get_i64(map: &Map<String, Value>, key: &str) -> Result<Option<i64>, RuleError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| RuleError::InvalidDirective {
            directive: key.to_string(),
            message: format!("expected an integer, got {}", n),
        }),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| RuleError::InvalidDirective {
            directive: key.to_string(),
            message: format!("expected an integer, got '{}'", s),
        }),
        Some(other) => Err(RuleError::InvalidDirective {
            directive: key.to_string(),
            message: format!("expected an integer, got {}", other),
        }),
    }
}

pub(crate) fn get_string_map(
    map: &Map<String, Value>,
    key: &str,
) -> Result<BTreeMap<String, String>, RuleError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(value) => Ok(object(value, key)?
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()),
    }
}

/// Renders a JSON scalar the way it is written in a URL or header
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
