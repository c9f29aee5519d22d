//! Seed and dive entries
//!
//! An entry names a target template and describes the request used to fetch it.
//! Variables declared under `$var` fan one entry out into several requests; each
//! `$var[name]` placeholder in the URL, headers, query or form is replaced with one
//! value per generated request.

use crate::rule::parser::{get_str, get_string_map, object};
use crate::rule::pipeline::Pipeline;
use crate::rule::template::ContentKind;
use crate::RuleError;
use serde_json::Value;
use std::collections::BTreeMap;

/// A seed or dive descriptor
#[derive(Debug, Clone)]
pub struct Entry {
    /// Name of the target template used for targets created from this entry
    pub name: String,

    /// URL as written in the rule
    pub url: String,

    /// The URL compiled as a pipeline, evaluated against a matched node when diving
    pub url_expr: Pipeline,

    /// Upper-cased HTTP method
    pub method: String,

    pub header: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub form: BTreeMap<String, String>,

    pub content_type: ContentKind,

    /// Enumerated values per variable name
    pub vars: BTreeMap<String, Vec<String>>,
}

impl Entry {
    /// Builds an entry from its JSON object
    pub fn from_json(value: &Value) -> Result<Self, RuleError> {
        let map = object(value, "entry")?;

        let name = get_str(map, "$name")?.unwrap_or_default().to_string();
        let url = get_str(map, "$url")?.unwrap_or_default().to_string();
        let url_expr = Pipeline::parse(&url)?;

        let method = get_str(map, "$method")?
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "GET".to_string());

        // `$resultType` is the older spelling of `$contentType`
        let content_type = match get_str(map, "$contentType")?.or(get_str(map, "$resultType")?) {
            Some(kind) => ContentKind::parse(kind)?,
            None => ContentKind::Html,
        };

        let mut vars = BTreeMap::new();
        if let Some(var_value) = map.get("$var") {
            for (var_name, definition) in object(var_value, "$var")? {
                vars.insert(var_name.clone(), parse_var(var_name, definition)?);
            }
        }

        Ok(Entry {
            name,
            url,
            url_expr,
            method,
            header: get_string_map(map, "$header")?,
            query: get_string_map(map, "$query")?,
            form: get_string_map(map, "$form")?,
            content_type,
            vars,
        })
    }

    /// Returns one variable binding per request generated from this entry
    ///
    /// Variables are zipped positionally, so the number of bindings equals the length
    /// of the shortest value list. An entry without variables yields one empty binding.
    pub fn var_bindings(&self) -> Vec<BTreeMap<String, String>> {
        if self.vars.is_empty() {
            return vec![BTreeMap::new()];
        }

        let count = self.vars.values().map(Vec::len).min().unwrap_or(0);

        (0..count)
            .map(|i| {
                self.vars
                    .iter()
                    .map(|(name, values)| (name.clone(), values[i].clone()))
                    .collect()
            })
            .collect()
    }
}

/// Replaces every `$var[name]` placeholder in `s` with `value`
pub fn apply_var(s: &str, name: &str, value: &str) -> String {
    s.replace(&format!("$var[{}]", name), value)
}

/// Applies every binding to `s`
pub fn apply_vars(s: &str, bindings: &BTreeMap<String, String>) -> String {
    bindings
        .iter()
        .fold(s.to_string(), |acc, (name, value)| apply_var(&acc, name, value))
}

/// Applies every binding to each value of a map
pub fn apply_vars_to_map(
    map: &BTreeMap<String, String>,
    bindings: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), apply_vars(v, bindings)))
        .collect()
}

/// Most values a single `$rangeInt` may expand to
pub const MAX_RANGE_VALUES: usize = 100_000;

/// Parses one `$var` definition
///
/// Accepted forms are an explicit list `$[a, b, c]`, an inclusive integer range
/// `$rangeInt[from, to]` or `$rangeInt[from, to, step]`, a JSON array, or any other
/// string, which becomes a single value.
fn parse_var(name: &str, definition: &Value) -> Result<Vec<String>, RuleError> {
    let invalid = || RuleError::InvalidVar {
        name: name.to_string(),
        value: definition.to_string(),
    };

    let text = match definition {
        Value::String(s) => s.trim(),
        Value::Array(items) => {
            return Ok(items.iter().map(crate::rule::parser::value_to_string).collect())
        }
        Value::Number(n) => return Ok(vec![n.to_string()]),
        _ => return Err(invalid()),
    };

    if let Some(list) = text.strip_prefix("$[").and_then(|s| s.strip_suffix(']')) {
        return Ok(list.split(',').map(|s| s.trim().to_string()).collect());
    }

    let lower = text.to_ascii_lowercase();
    if lower.starts_with("$rangeint[") && lower.ends_with(']') {
        let args: Vec<i64> = text["$rangeint[".len()..text.len() - 1]
            .split(',')
            .map(|s| s.trim().parse::<i64>())
            .collect::<Result<_, _>>()
            .map_err(|_| invalid())?;

        let (from, to, step) = match args.as_slice() {
            [from, to] => (*from, *to, 1),
            [from, to, step] => (*from, *to, *step),
            _ => return Err(invalid()),
        };
        if step <= 0 {
            return Err(invalid());
        }
        if from > to {
            return Ok(Vec::new());
        }

        let count = (i128::from(to) - i128::from(from)) / i128::from(step) + 1;
        if count > MAX_RANGE_VALUES as i128 {
            return Err(invalid());
        }
        let step = usize::try_from(step).map_err(|_| invalid())?;
        return Ok((from..=to).step_by(step).map(|i| i.to_string()).collect());
    }

    Ok(vec![text.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_defaults() {
        let entry = Entry::from_json(&json!({
            "$name": "index",
            "$url": "https://abc.com/"
        }))
        .unwrap();

        assert_eq!(entry.name, "index");
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.content_type, ContentKind::Html);
        assert!(entry.header.is_empty());
        assert!(entry.vars.is_empty());
        assert_eq!(entry.var_bindings().len(), 1);
    }

    #[test]
    fn test_entry_full() {
        let entry = Entry::from_json(&json!({
            "$name": "search",
            "$url": "https://abc.com/search",
            "$method": "post",
            "$header": { "X-Token": "abc" },
            "$query": { "page": 2 },
            "$form": { "q": "$var[word]" },
            "$resultType": "JSON",
            "$var": { "word": "$[rust, go]" }
        }))
        .unwrap();

        assert_eq!(entry.method, "POST");
        assert_eq!(entry.content_type, ContentKind::Json);
        assert_eq!(entry.header.get("X-Token").unwrap(), "abc");
        assert_eq!(entry.query.get("page").unwrap(), "2");
        assert_eq!(entry.vars.get("word").unwrap(), &vec!["rust", "go"]);
    }

    #[test]
    fn test_entry_must_be_object() {
        assert!(Entry::from_json(&json!("https://abc.com")).is_err());
    }

    #[test]
    fn test_parse_var_range() {
        let values = parse_var("page", &json!("$rangeInt[0, 100, 20]")).unwrap();
        assert_eq!(values, vec!["0", "20", "40", "60", "80", "100"]);

        let values = parse_var("page", &json!("$rangeInt[1, 3]")).unwrap();
        assert_eq!(values, vec!["1", "2", "3"]);

        assert!(parse_var("page", &json!("$rangeInt[1, 3, 0]")).is_err());
        assert!(parse_var("page", &json!("$rangeInt[a, 3]")).is_err());
        assert!(parse_var("page", &json!("$rangeInt[1]")).is_err());
    }

    #[test]
    fn test_parse_var_range_is_bounded() {
        let at_limit = parse_var("n", &json!("$rangeInt[1, 100000]")).unwrap();
        assert_eq!(at_limit.len(), MAX_RANGE_VALUES);
        assert_eq!(at_limit.last().map(String::as_str), Some("100000"));

        assert!(matches!(
            parse_var("n", &json!("$rangeInt[0, 1000000000000]")),
            Err(RuleError::InvalidVar { .. })
        ));
        assert!(parse_var("n", &json!("$rangeInt[-9223372036854775808, 9223372036854775807]")).is_err());
        assert_eq!(
            parse_var("n", &json!("$rangeInt[9223372036854775806, 9223372036854775807]")).unwrap(),
            vec!["9223372036854775806", "9223372036854775807"]
        );
        assert!(parse_var("n", &json!("$rangeInt[5, 1]")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_var_list_and_literal() {
        assert_eq!(
            parse_var("c", &json!("$[Red, Blue]")).unwrap(),
            vec!["Red", "Blue"]
        );
        assert_eq!(parse_var("c", &json!("solo")).unwrap(), vec!["solo"]);
        assert_eq!(parse_var("c", &json!([1, "two"])).unwrap(), vec!["1", "two"]);
    }

    #[test]
    fn test_var_bindings_zip_to_shortest() {
        let entry = Entry::from_json(&json!({
            "$name": "t",
            "$url": "https://abc.com/$var[a]/$var[b]",
            "$var": { "a": "$[x, y, z]", "b": "$rangeInt[1, 2]" }
        }))
        .unwrap();

        let bindings = entry.var_bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(
            apply_vars(&entry.url, &bindings[0]),
            "https://abc.com/x/1"
        );
        assert_eq!(
            apply_vars(&entry.url, &bindings[1]),
            "https://abc.com/y/2"
        );
    }

    #[test]
    fn test_apply_var_replaces_every_placeholder() {
        assert_eq!(apply_var("$var[p]-$var[p]-$var[q]", "p", "1"), "1-1-$var[q]");
    }
}
