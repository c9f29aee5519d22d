//! Targets: units of crawl work
//!
//! A target is created from a [`TargetTemplate`], either as a seed materialized from
//! a rule entry or as a child discovered while analyzing another target. It carries
//! the request to make, the policy inherited from its template, and the outcome of
//! its fetch and analysis.

use crate::crawler::fetcher::{FetchRequest, FetchResponse};
use crate::rule::{
    apply_vars, apply_vars_to_map, AgentMode, ClientKind, ContentKind, Entry, TargetTemplate,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

/// One fetchable unit of crawl work
#[derive(Debug, Clone)]
pub struct Target {
    id: u64,
    created_at: DateTime<Utc>,

    pub url: String,
    pub method: String,
    pub header: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub form: BTreeMap<String, String>,
    pub content_type: ContentKind,

    pub priority: u32,
    pub timeout: Option<Duration>,
    pub retry: u32,
    pub retry_wait: Duration,
    pub client: ClientKind,
    pub agents: AgentMode,

    /// Extraction plan: mtag, dive map and outputs
    pub template: Arc<TargetTemplate>,

    /// Variable values substituted into this target's request
    pub vars: BTreeMap<String, String>,

    /// Number of fetch attempts started
    pub tried: u32,

    pub fetch_result: Option<Arc<FetchResponse>>,
    pub fetch_error: Option<String>,
    pub analyzed: bool,
    pub analyze_error: Option<String>,
}

impl Target {
    /// Creates a GET target for `url` with the policy of `template`
    pub fn new(url: impl Into<String>, template: Arc<TargetTemplate>) -> Self {
        Self {
            id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed),
            created_at: Utc::now(),
            url: url.into(),
            method: "GET".to_string(),
            header: BTreeMap::new(),
            query: BTreeMap::new(),
            form: BTreeMap::new(),
            content_type: ContentKind::Html,
            priority: template.priority,
            timeout: template.timeout,
            retry: template.retry,
            retry_wait: template.retry_wait,
            client: template.client,
            agents: template.agents,
            template,
            vars: BTreeMap::new(),
            tried: 0,
            fetch_result: None,
            fetch_error: None,
            analyzed: false,
            analyze_error: None,
        }
    }

    /// Creates a target from an entry, applying one set of variable bindings
    ///
    /// The URL is the entry's URL with the bindings applied; use
    /// [`Target::with_url`] when the URL was computed elsewhere (for dive children).
    pub fn from_entry(
        entry: &Entry,
        template: Arc<TargetTemplate>,
        bindings: &BTreeMap<String, String>,
    ) -> Self {
        let mut target = Self::new(apply_vars(&entry.url, bindings), template);
        target.method = entry.method.clone();
        target.header = apply_vars_to_map(&entry.header, bindings);
        target.query = apply_vars_to_map(&entry.query, bindings);
        target.form = apply_vars_to_map(&entry.form, bindings);
        target.content_type = entry.content_type.clone();
        target.vars = bindings.clone();
        target
    }

    /// Replaces the URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Creates a binary target for a file referenced by an output field
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute URL of the file
    /// * `ext` - File extension, without the dot
    /// * `output_name` - Name of the output the file belongs to
    pub fn file(url: impl Into<String>, ext: &str, output_name: &str) -> Self {
        let mut target = Self::new(url, Arc::new(TargetTemplate::file(output_name)));
        target.content_type = ContentKind::Binary(ext.to_string());
        target
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns true if another fetch attempt is allowed
    ///
    /// With `retry = r` a target is attempted at most `r + 1` times.
    pub fn can_retry(&self) -> bool {
        self.tried <= self.retry
    }

    /// The request for the next attempt
    pub fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            url: self.url.clone(),
            method: self.method.clone(),
            header: self.header.clone(),
            query: self.query.clone(),
            form: self.form.clone(),
            content_type: self.content_type.as_str().to_string(),
            cookie: None,
            user_agent: None,
            client: self.client,
            timeout: self.timeout,
        }
    }

    /// Fingerprint of this target's fetch configuration, used for dedup lookups
    pub fn fingerprint(&self) -> String {
        self.fetch_request().fingerprint()
    }
}

/// Returns true if `a` should be crawled before `b`
///
/// Higher priority wins; equal priorities go to the target created first.
pub fn higher(a: &Target, b: &Target) -> bool {
    a.priority > b.priority || (a.priority == b.priority && a.id < b.id)
}

/// Materializes the seed targets of one entry
///
/// One target is produced per variable binding; see [`Entry::var_bindings`].
pub fn make_targets(entry: &Entry, template: &Arc<TargetTemplate>) -> Vec<Target> {
    entry
        .var_bindings()
        .iter()
        .map(|bindings| Target::from_entry(entry, Arc::clone(template), bindings))
        .collect()
}
