//! Document analysis
//!
//! An analyzer interprets a target's extraction plan against its fetched payload and
//! produces an [`Analysis`]: a dedup tag, newly discovered targets and output records.
//! HTML, XML and JSON share one driver over the [`Document`] trait, so the pipeline
//! language, dive discovery and output assembly behave the same for every format;
//! binary payloads become file records directly.

mod binary;
mod charset;
mod html;
mod json;
mod xml;

pub use html::HtmlDocument;
pub use json::JsonDocument;
pub use xml::XmlDocument;

use crate::crawler::{FetchResponse, Target};
use crate::rule::{apply_vars, Action, ContentKind, Pipeline, Rule};
use crate::sink::SinkPack;
use crate::storage::{StorageResult, Store};
use crate::url::{file_extension, resolve_url};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while analyzing a fetched document
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Got nothing from target {url}")]
    Empty { url: String },

    #[error("Malformed {format} document at {url}: {message}")]
    Parse {
        format: &'static str,
        url: String,
        message: String,
    },

    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    #[error("Analysis of {url} panicked")]
    Panicked { url: String },
}

/// Outcome of analyzing one target
#[derive(Debug, Default)]
pub struct Analysis {
    /// Dedup tag of the document
    pub mtag: String,

    /// Children discovered through the dive map
    pub targets: Vec<Target>,

    /// File targets referenced by output fields
    pub files: Vec<Target>,

    /// Output records
    pub packs: Vec<SinkPack>,
}

impl Analysis {
    /// Drops everything produced by outputs, keeping dive targets
    ///
    /// Used when the document is unchanged since the last crawl.
    pub fn suppress_outputs(&mut self) {
        self.files.clear();
        self.packs.clear();
    }

    /// Dive and file targets, in that order
    pub fn all_targets(self) -> (Vec<Target>, Vec<SinkPack>) {
        let mut targets = self.targets;
        targets.extend(self.files);
        (targets, self.packs)
    }
}

/// Compares the analysis' mtag with the one stored for the target's fetch fingerprint
///
/// An unchanged document has its outputs suppressed; a changed one has its new mtag
/// recorded.
///
/// # Arguments
///
/// * `analysis` - The fresh analysis
/// * `store` - Store holding the `targets` dataset
/// * `hash` - Fetch fingerprint of the analyzed target
///
/// # Returns
///
/// * `Ok(true)` - The document is unchanged since the last crawl
/// * `Ok(false)` - The document is new or changed
pub fn apply_dedup(analysis: &mut Analysis, store: &dyn Store, hash: &str) -> StorageResult<bool> {
    if analysis.mtag.is_empty() {
        return Ok(false);
    }

    if let Some(previous) = store.get_latest_target(hash)? {
        if previous.mtag == analysis.mtag {
            analysis.suppress_outputs();
            return Ok(true);
        }
    }

    store.record_target(hash, &analysis.mtag)?;
    Ok(false)
}

/// Hex SHA-256 of a payload, the fallback dedup tag
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Analyzes a fetched payload with the analyzer matching the target's content type
///
/// # Arguments
///
/// * `rule` - The rule the target belongs to, for dive template lookups
/// * `target` - The fetched target
/// * `response` - Its fetch response
///
/// # Returns
///
/// * `Ok(Analysis)` - Discovered targets and records
/// * `Err(AnalyzeError)` - The payload could not be interpreted
pub fn analyze(rule: &Rule, target: &Target, response: &FetchResponse) -> Result<Analysis, AnalyzeError> {
    let bytes = response.content.bytes();
    let content_type = response.content.content_type();
    if bytes.is_empty() {
        return Err(AnalyzeError::Empty {
            url: target.url.clone(),
        });
    }

    let base_url = if response.url.is_empty() {
        target.url.as_str()
    } else {
        response.url.as_str()
    };

    match &target.content_type {
        ContentKind::Html => {
            let doc = HtmlDocument::parse(bytes, content_type);
            analyze_document(&doc, rule, target, base_url)
        }
        ContentKind::Xml => {
            let doc = XmlDocument::parse(bytes, content_type, base_url)?;
            analyze_document(&doc, rule, target, base_url)
        }
        ContentKind::Json => {
            let doc = JsonDocument::parse(bytes, content_type, base_url)?;
            analyze_document(&doc, rule, target, base_url)
        }
        ContentKind::Binary(ext) => Ok(binary::analyze(target, bytes, ext)),
    }
}

/// A parsed document that pipelines can be evaluated against
pub trait Document {
    type Node<'a>: Copy
    where
        Self: 'a;

    /// The document root
    fn root(&self) -> Self::Node<'_>;

    /// Nodes matched by `selector` below `node`, in document order
    fn select<'a>(
        &'a self,
        node: Self::Node<'a>,
        selector: &str,
    ) -> Result<Vec<Self::Node<'a>>, AnalyzeError>;

    /// Nodes to iterate for a list output or dive selector
    fn each<'a>(
        &'a self,
        node: Self::Node<'a>,
        selector: &str,
    ) -> Result<Vec<Self::Node<'a>>, AnalyzeError> {
        self.select(node, selector)
    }

    /// Serialized source of `node`; the raw payload at the root
    fn raw(&self, node: Self::Node<'_>) -> String;

    /// Text of the first title element below `node`
    fn title(&self, node: Self::Node<'_>) -> String;

    /// Applies an action to `node`
    fn act(&self, node: Self::Node<'_>, action: &Action) -> String;
}

/// Evaluates a pipeline against a node
///
/// Literals have the target's variable bindings applied.
pub fn evaluate<'a, D: Document>(
    doc: &'a D,
    node: D::Node<'a>,
    pipeline: &Pipeline,
    vars: &BTreeMap<String, String>,
) -> Result<String, AnalyzeError> {
    Ok(match pipeline {
        Pipeline::Raw => doc.raw(node),
        Pipeline::Title => doc.title(node),
        Pipeline::Act(action) => doc.act(node, action),
        Pipeline::Select { selector, action } => doc
            .select(node, selector)?
            .first()
            .map(|first| doc.act(*first, action.as_ref().unwrap_or(&Action::Text)))
            .unwrap_or_default(),
        Pipeline::Literal(text) => apply_vars(text, vars),
    })
}

/// Shared analysis driver for structured documents
pub(crate) fn analyze_document<D: Document>(
    doc: &D,
    rule: &Rule,
    base: &Target,
    base_url: &str,
) -> Result<Analysis, AnalyzeError> {
    let root = doc.root();
    let template = &base.template;
    let hash = base.fingerprint();
    let mut analysis = Analysis::default();

    analysis.mtag = match &template.mtag {
        Some(pipeline) => evaluate(doc, root, pipeline, &base.vars)?,
        None => String::new(),
    };
    if analysis.mtag.is_empty() {
        analysis.mtag = content_hash(doc.raw(root).as_bytes());
    }

    for (selector, entry) in &template.dive {
        let child_template = match rule.template(&entry.name) {
            Some(t) => Arc::clone(t),
            None => continue,
        };
        let child = |url: String| {
            Target::from_entry(entry, Arc::clone(&child_template), &BTreeMap::new()).with_url(url)
        };

        // A `$`-prefixed selector dives straight to the entry's own URL
        if selector.starts_with('$') {
            analysis.targets.push(child(resolve_url(&entry.url, base_url)));
            continue;
        }

        for node in doc.each(root, selector)? {
            let link = evaluate(doc, node, &entry.url_expr, &base.vars)?;
            if !link.trim().is_empty() {
                analysis.targets.push(child(resolve_url(&link, base_url)));
            }
        }
    }

    for output in &template.object_outputs {
        let (data, files) = extract_fields(doc, root, &output.name, &output.data, base, base_url)?;
        let id = extract_id(doc, root, output.id.as_ref(), base)?;
        analysis.files.extend(files);
        analysis
            .packs
            .push(SinkPack::record(&output.name, id, &hash, base_url, data));
    }

    for output in &template.list_outputs {
        for node in doc.each(root, &output.each)? {
            let (data, files) =
                extract_fields(doc, node, &output.name, &output.data, base, base_url)?;
            let id = extract_id(doc, node, output.id.as_ref(), base)?;
            analysis.files.extend(files);
            analysis
                .packs
                .push(SinkPack::record(&output.name, id, &hash, base_url, data));
        }
    }

    Ok(analysis)
}

/// Evaluates every data field of an output against `node`
///
/// Empty values are left out. A key with a file extension (`cover.webp`) stores the
/// resolved URL and spawns a file target for it.
fn extract_fields<'a, D: Document>(
    doc: &'a D,
    node: D::Node<'a>,
    output_name: &str,
    fields: &BTreeMap<String, Pipeline>,
    base: &Target,
    base_url: &str,
) -> Result<(BTreeMap<String, String>, Vec<Target>), AnalyzeError> {
    let mut data = BTreeMap::new();
    let mut files = Vec::new();

    for (key, pipeline) in fields {
        let value = evaluate(doc, node, pipeline, &base.vars)?;
        if value.is_empty() {
            continue;
        }

        match file_extension(key) {
            Some(ext) => {
                let url = resolve_url(&value, base_url);
                files.push(Target::file(url.clone(), &ext, output_name));
                data.insert(key.clone(), url);
            }
            None => {
                data.insert(key.clone(), value);
            }
        }
    }

    Ok((data, files))
}

/// Record identity
///
/// The id pipeline's value comes first. When it yields nothing, an id expression that
/// mentions variables falls back to its own text with the target's bindings applied.
/// Failing both, a target created from variable bindings is identified by them
/// (`name=value` pairs joined by `&`), so records fanned out over a variable stay
/// distinct. Otherwise the id is empty.
fn extract_id<'a, D: Document>(
    doc: &'a D,
    node: D::Node<'a>,
    id: Option<&Pipeline>,
    base: &Target,
) -> Result<String, AnalyzeError> {
    if let Some(pipeline) = id {
        let value = evaluate(doc, node, pipeline, &base.vars)?;
        if !value.is_empty() {
            return Ok(value);
        }

        let expr = pipeline.to_string();
        if expr.contains("$var[") {
            let applied = apply_vars(&expr, &base.vars);
            if applied != expr {
                return Ok(applied);
            }
        }
    }

    Ok(base
        .vars
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("&"))
}
