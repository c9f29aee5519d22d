//! JSON documents, queried with dot paths
//!
//! A path is a sequence of dot-separated steps evaluated from the current node: an
//! object key, an array index, or `#` (also `*`) for every element of an array or
//! every value of an object. An empty path, `.` or `@this` is the current node.

use super::charset::{decode, Declared};
use super::{AnalyzeError, Document};
use crate::rule::Action;
use serde_json::Value;

/// A parsed JSON payload
pub struct JsonDocument {
    value: Value,
    raw: String,
}

impl JsonDocument {
    pub fn parse(bytes: &[u8], content_type: &str, url: &str) -> Result<Self, AnalyzeError> {
        let raw = decode(bytes, content_type, Declared::None);
        let value = serde_json::from_str(&raw).map_err(|e| AnalyzeError::Parse {
            format: "JSON",
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { value, raw })
    }
}

/// Scalar text of a value; containers are rendered as compact JSON
fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}

fn step<'a>(value: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match (value, key) {
        (Value::Array(items), "#" | "*") => out.extend(items.iter()),
        (Value::Object(map), "#" | "*") => out.extend(map.values()),
        (Value::Array(items), _) => {
            if let Some(item) = key.parse::<usize>().ok().and_then(|i| items.get(i)) {
                out.push(item);
            }
        }
        (Value::Object(map), _) => {
            if let Some(v) = map.get(key) {
                out.push(v);
            }
        }
        _ => {}
    }
}

impl Document for JsonDocument {
    type Node<'a> = &'a Value;

    fn root(&self) -> &Value {
        &self.value
    }

    fn select<'a>(&'a self, node: &'a Value, selector: &str) -> Result<Vec<&'a Value>, AnalyzeError> {
        let path = selector.trim();
        let mut current = vec![node];
        if path.is_empty() || path == "." || path == "@this" {
            return Ok(current);
        }

        for key in path.split('.') {
            if key.is_empty() {
                return Err(AnalyzeError::Selector {
                    selector: selector.to_string(),
                    message: "empty path step".to_string(),
                });
            }
            let mut next = Vec::new();
            for value in current {
                step(value, key, &mut next);
            }
            current = next;
        }

        Ok(current)
    }

    /// A single array match is iterated element by element
    fn each<'a>(&'a self, node: &'a Value, selector: &str) -> Result<Vec<&'a Value>, AnalyzeError> {
        let matched = self.select(node, selector)?;
        if let [only] = matched.as_slice() {
            if let Value::Array(items) = *only {
                return Ok(items.iter().collect());
            }
        }
        Ok(matched)
    }

    fn raw(&self, node: &Value) -> String {
        if std::ptr::eq(node, &self.value) {
            self.raw.clone()
        } else {
            node.to_string()
        }
    }

    /// The `title` member of the node, if any
    fn title(&self, node: &Value) -> String {
        node.get("title").map(text_of).unwrap_or_default()
    }

    fn act(&self, node: &Value, action: &Action) -> String {
        match action {
            Action::Text => text_of(node),
            Action::Html => node.to_string(),
            Action::Attr(name) => node.get(name.as_str()).map(text_of).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{response, rule, seed};
    use super::super::{analyze, evaluate};
    use super::*;
    use crate::rule::Pipeline;
    use std::collections::BTreeMap;

    const BODY: &str = r#"{
        "title": "Catalog",
        "version": 7,
        "data": {
            "items": [
                { "id": 1, "name": "One", "tags": ["a", "b"], "cover": "/c/1.png" },
                { "id": 2, "name": "Two", "tags": [], "next": "/item/2" },
                { "id": 3, "name": null }
            ]
        }
    }"#;

    fn doc() -> JsonDocument {
        JsonDocument::parse(BODY.as_bytes(), "application/json", "https://abc.com/api").unwrap()
    }

    fn eval(doc: &JsonDocument, expr: &str) -> String {
        let pipeline = Pipeline::parse(expr).unwrap();
        evaluate(doc, doc.root(), &pipeline, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_paths() {
        let doc = doc();
        assert_eq!(eval(&doc, "$[data.items.0.name]"), "One");
        assert_eq!(eval(&doc, "$[data.items.1.id]"), "2");
        assert_eq!(eval(&doc, "$[data.items.0.tags]"), r#"["a","b"]"#);
        assert_eq!(eval(&doc, "$[data.items.#.name]"), "One");
        assert_eq!(eval(&doc, "$[data.items.2.name]"), "");
        assert_eq!(eval(&doc, "$[data.items.9.name]"), "");
        assert_eq!(eval(&doc, "$[data.items.0].$attr[cover]"), "/c/1.png");
        assert_eq!(eval(&doc, "$title"), "Catalog");
        assert_eq!(eval(&doc, "$raw"), BODY);
    }

    #[test]
    fn test_each_iterates_arrays() {
        let doc = doc();
        assert_eq!(doc.each(doc.root(), "data.items").unwrap().len(), 3);
        assert_eq!(doc.each(doc.root(), "data.items.#").unwrap().len(), 3);
        assert_eq!(doc.select(doc.root(), "data.items").unwrap().len(), 1);
        assert_eq!(doc.each(doc.root(), "data.items.#.tags.#").unwrap().len(), 2);
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            JsonDocument::parse(b"{ nope", "", "u"),
            Err(AnalyzeError::Parse { .. })
        ));
        let doc = doc();
        assert!(doc.select(doc.root(), "data..items").is_err());
    }

    #[test]
    fn test_list_output_evaluates_each_element() {
        let rule = rule(
            r#"{
                "$entries": [{ "$name": "api", "$url": "https://abc.com/api", "$contentType": "json" }],
                "api": {
                    "$mtag": "$[version]",
                    "$dive": { "data.items.#.next": { "$name": "api", "$url": "$text", "$contentType": "json" } },
                    "$outputs": [
                        { "$name": "catalog", "$id": "catalog-$var[none]", "$data": { "title": "$title" } },
                        {
                            "$name": "item",
                            "$each": "data.items",
                            "$id": "$[id]",
                            "$data": { "name": "$[name]", "cover.png": "$[cover]" }
                        }
                    ]
                }
            }"#,
        );
        let target = seed(&rule);
        let analysis = analyze(
            &rule,
            &target,
            &response("https://abc.com/api", BODY, "application/json"),
        )
        .unwrap();

        assert_eq!(analysis.mtag, "7");
        assert_eq!(analysis.targets.len(), 1);
        assert_eq!(analysis.targets[0].url, "https://abc.com/item/2");

        assert_eq!(analysis.packs.len(), 4);
        assert_eq!(analysis.packs[0].name, "catalog");
        assert_eq!(analysis.packs[0].id, "catalog-$var[none]");
        assert_eq!(analysis.packs[0].data["title"], "Catalog");

        let ids: Vec<&str> = analysis.packs[1..].iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(analysis.packs[2].data["name"], "Two");
        assert!(!analysis.packs[3].data.contains_key("name"));

        assert_eq!(analysis.files.len(), 1);
        assert_eq!(analysis.files[0].url, "https://abc.com/c/1.png");
    }
}
