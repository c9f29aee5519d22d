//! XML documents, queried with slash-separated paths
//!
//! Paths are a small subset of XPath evaluated relative to the current node:
//!
//! * `channel/item` - child steps
//! * `//item` or `channel//link` - descendant steps
//! * `/rss/channel` - absolute, from the document root
//! * `*` - any element
//! * `item[@id]`, `item[@type='book']`, `item[2]` - predicates (positions are 1-based)
//! * `.` - the current node

use super::charset::{decode, Declared};
use super::{AnalyzeError, Document};
use crate::rule::Action;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashSet;

/// Index of the synthetic document node
const DOCUMENT: usize = 0;

#[derive(Debug)]
enum Content {
    Element(usize),
    Text(String),
}

/// Pending work of an iterative serialization
enum Visit<'a> {
    Content(&'a Content),
    Close(usize),
}

#[derive(Debug)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    content: Vec<Content>,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn children(&self) -> impl Iterator<Item = usize> + '_ {
        self.content.iter().filter_map(|c| match c {
            Content::Element(idx) => Some(*idx),
            Content::Text(_) => None,
        })
    }

    fn matches(&self, name: &str) -> bool {
        name == "*"
            || self.name == name
            || self.name.rsplit(':').next().map_or(false, |local| local == name)
    }
}

/// A parsed XML document
pub struct XmlDocument {
    nodes: Vec<Element>,
    raw: String,
}

impl XmlDocument {
    /// Parses a payload into an element tree
    ///
    /// # Arguments
    ///
    /// * `bytes` - The payload
    /// * `content_type` - Response content type; its charset, else the prolog's
    ///   `encoding`, decodes the payload
    /// * `url` - Source URL, used in error messages
    pub fn parse(bytes: &[u8], content_type: &str, url: &str) -> Result<Self, AnalyzeError> {
        let raw = decode(bytes, content_type, Declared::XmlProlog);
        let malformed = |message: String| AnalyzeError::Parse {
            format: "XML",
            url: url.to_string(),
            message,
        };

        let mut nodes = vec![Element {
            name: String::new(),
            attrs: Vec::new(),
            content: Vec::new(),
        }];
        let mut stack = vec![DOCUMENT];

        let mut reader = Reader::from_str(&raw);
        reader.config_mut().trim_text(true);

        loop {
            let parent = *stack.last().unwrap_or(&DOCUMENT);
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let idx = push_element(&mut nodes, parent, &e).map_err(malformed)?;
                    stack.push(idx);
                }
                Ok(Event::Empty(e)) => {
                    push_element(&mut nodes, parent, &e).map_err(malformed)?;
                }
                Ok(Event::End(_)) => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| malformed(e.to_string()))?;
                    nodes[parent].content.push(Content::Text(text.into_owned()));
                }
                Ok(Event::CData(c)) => {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    nodes[parent].content.push(Content::Text(text));
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(malformed(format!(
                        "{} at position {}",
                        e,
                        reader.error_position()
                    )))
                }
            }
        }

        if nodes[DOCUMENT].children().next().is_none() {
            return Err(malformed("no root element".to_string()));
        }

        Ok(Self { nodes, raw })
    }

    // Traversals keep their own stacks so nesting depth is bounded by memory only

    fn text(&self, idx: usize, out: &mut String) {
        let mut stack: Vec<&Content> = self.nodes[idx].content.iter().rev().collect();
        while let Some(content) = stack.pop() {
            match content {
                Content::Text(text) => out.push_str(text),
                Content::Element(child) => stack.extend(self.nodes[*child].content.iter().rev()),
            }
        }
    }

    fn open_tag(&self, idx: usize, out: &mut String) {
        let element = &self.nodes[idx];
        out.push('<');
        out.push_str(&element.name);
        for (key, value) in &element.attrs {
            out.push_str(&format!(" {}=\"{}\"", key, escape(value.as_str())));
        }
    }

    fn close_tag(&self, idx: usize, out: &mut String) {
        out.push_str("</");
        out.push_str(&self.nodes[idx].name);
        out.push('>');
    }

    fn serialize(&self, idx: usize, out: &mut String) {
        self.open_tag(idx, out);
        if self.nodes[idx].content.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        self.serialize_content(idx, out);
        self.close_tag(idx, out);
    }

    fn serialize_content(&self, idx: usize, out: &mut String) {
        let mut stack: Vec<Visit<'_>> = self.nodes[idx].content.iter().rev().map(Visit::Content).collect();
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Content(Content::Text(text)) => out.push_str(&escape(text.as_str())),
                Visit::Content(Content::Element(child)) => {
                    self.open_tag(*child, out);
                    let content = &self.nodes[*child].content;
                    if content.is_empty() {
                        out.push_str("/>");
                    } else {
                        out.push('>');
                        stack.push(Visit::Close(*child));
                        stack.extend(content.iter().rev().map(Visit::Content));
                    }
                }
                Visit::Close(child) => self.close_tag(child, out),
            }
        }
    }

    /// Every element below `idx`, in document order
    fn descendants(&self, idx: usize, out: &mut Vec<usize>) {
        let mut stack: Vec<usize> = self.nodes[idx].children().collect();
        stack.reverse();
        while let Some(node) = stack.pop() {
            out.push(node);
            let start = stack.len();
            stack.extend(self.nodes[node].children());
            stack[start..].reverse();
        }
    }

    /// Applies one location step to every node of `context`
    fn step(
        &self,
        context: &[usize],
        step: &str,
        descendant: bool,
        path: &str,
    ) -> Result<Vec<usize>, AnalyzeError> {
        if step == "." {
            return Ok(context.to_vec());
        }

        let (name, predicates) = parse_step(step).ok_or_else(|| AnalyzeError::Selector {
            selector: path.to_string(),
            message: format!("malformed step '{}'", step),
        })?;

        let mut result = Vec::new();
        let mut seen = HashSet::new();
        for &idx in context {
            let mut candidates = Vec::new();
            if descendant {
                self.descendants(idx, &mut candidates);
            } else {
                candidates.extend(self.nodes[idx].children());
            }

            let mut matched: Vec<usize> = candidates
                .into_iter()
                .filter(|&c| self.nodes[c].matches(name))
                .collect();
            for predicate in &predicates {
                matched = apply_predicate(&self.nodes, matched, predicate);
            }

            result.extend(matched.into_iter().filter(|m| seen.insert(*m)));
        }

        Ok(result)
    }
}

fn push_element(nodes: &mut Vec<Element>, parent: usize, start: &BytesStart<'_>) -> Result<usize, String> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
        attrs.push((key, value));
    }

    let idx = nodes.len();
    nodes.push(Element {
        name,
        attrs,
        content: Vec::new(),
    });
    nodes[parent].content.push(Content::Element(idx));
    Ok(idx)
}

#[derive(Debug, PartialEq)]
enum Predicate {
    Position(usize),
    HasAttr(String),
    AttrEquals(String, String),
}

/// Splits `name[pred][pred]` into its name and predicates
fn parse_step(step: &str) -> Option<(&str, Vec<Predicate>)> {
    let (name, mut rest) = match step.find('[') {
        Some(i) => (&step[..i], &step[i..]),
        None => (step, ""),
    };
    if name.is_empty() {
        return None;
    }

    let mut predicates = Vec::new();
    while !rest.is_empty() {
        let body_end = rest.find(']')?;
        let body = rest.get(1..body_end)?.trim();
        if !rest.starts_with('[') {
            return None;
        }
        predicates.push(parse_predicate(body)?);
        rest = &rest[body_end + 1..];
    }

    Some((name, predicates))
}

fn parse_predicate(body: &str) -> Option<Predicate> {
    if let Ok(position) = body.parse::<usize>() {
        return (position > 0).then_some(Predicate::Position(position));
    }

    let attr = body.strip_prefix('@')?;
    match attr.split_once('=') {
        None => Some(Predicate::HasAttr(attr.trim().to_string())),
        Some((key, value)) => {
            let value = value.trim();
            let unquoted = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))?;
            Some(Predicate::AttrEquals(key.trim().to_string(), unquoted.to_string()))
        }
    }
}

fn apply_predicate(nodes: &[Element], matched: Vec<usize>, predicate: &Predicate) -> Vec<usize> {
    match predicate {
        Predicate::Position(n) => matched.get(n - 1).copied().into_iter().collect(),
        Predicate::HasAttr(key) => matched
            .into_iter()
            .filter(|&i| nodes[i].attr(key).is_some())
            .collect(),
        Predicate::AttrEquals(key, value) => matched
            .into_iter()
            .filter(|&i| nodes[i].attr(key) == Some(value.as_str()))
            .collect(),
    }
}

impl Document for XmlDocument {
    type Node<'a> = usize;

    fn root(&self) -> usize {
        DOCUMENT
    }

    fn select<'a>(&'a self, node: usize, selector: &str) -> Result<Vec<usize>, AnalyzeError> {
        let path = selector.trim();
        let (mut context, rest) = if path.starts_with('/') && !path.starts_with("//") {
            (vec![DOCUMENT], &path[1..])
        } else {
            (vec![node], path)
        };

        let mut descendant = false;
        for part in rest.split('/') {
            let part = part.trim();
            if part.is_empty() {
                descendant = true;
                continue;
            }
            context = self.step(&context, part, descendant, path)?;
            descendant = false;
        }

        Ok(context)
    }

    fn raw(&self, node: usize) -> String {
        if node == DOCUMENT {
            return self.raw.clone();
        }
        let mut out = String::new();
        self.serialize(node, &mut out);
        out
    }

    fn title(&self, node: usize) -> String {
        let mut all = Vec::new();
        self.descendants(node, &mut all);
        all.into_iter()
            .find(|&i| self.nodes[i].matches("title"))
            .map(|i| self.act(i, &Action::Text))
            .unwrap_or_default()
    }

    fn act(&self, node: usize, action: &Action) -> String {
        match action {
            Action::Text => {
                let mut out = String::new();
                self.text(node, &mut out);
                out.trim().to_string()
            }
            Action::Html => {
                let mut out = String::new();
                self.serialize_content(node, &mut out);
                out
            }
            Action::Attr(name) => self.nodes[node].attr(name).unwrap_or_default().to_string(),
        }
    }
}
