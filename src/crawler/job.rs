//! Crawl jobs
//!
//! A [`Job`] owns one compiled [`Rule`] and drives a run of it: seed targets go onto a
//! priority frontier, up to `$concurrency` of them are fetched at a time, fetched
//! payloads are analyzed off the async runtime, and discovered targets are pushed back
//! onto the frontier. Every spawned fetch, retry or analysis reports back to the run
//! loop over a completion channel; the frontier and the in-flight set are owned by the
//! loop alone.
//!
//! A run ends when there is nothing left to crawl, when the rule's `$timeout` elapses,
//! when a whole `$every` interval passes without a single target crawled, or, for
//! interactive test runs, when cancelled.

use crate::analyzer::{self, Analysis, AnalyzeError};
use crate::crawler::fetcher::{FetchError, FetchResponse, Fetchers};
use crate::crawler::queue::PriorityQueue;
use crate::crawler::target::{higher, make_targets, Target};
use crate::rule::{AgentMode, Rule};
use crate::schedule::Runnable;
use crate::sink::SinkSender;
use crate::storage::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::cookie::{CookieStore, Jar};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// Last progress line of a test run
pub const FINISHED: &str = "$finished";

/// Longest wait between cancellation checks of a test run
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Frontier and in-flight set both drained
    Completed,

    /// The rule's global timeout elapsed
    TimedOut,

    /// A whole interval passed without any target crawled
    Stalled,

    /// An interactive run was cancelled
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "finished crawling"),
            RunOutcome::TimedOut => write!(f, "did not finish crawling, timeout"),
            RunOutcome::Stalled => write!(f, "did not crawl anything during interval time"),
            RunOutcome::Cancelled => write!(f, "test run cancelled"),
        }
    }
}

/// Completion notifications sent to the run loop
enum Event {
    Fetched(Target, Result<FetchResponse, FetchError>),
    Analyzed(Target, Result<Analyzed, AnalyzeError>),
}

/// Which half of a target's processing a spawned task performs
#[derive(Debug, Clone, Copy)]
enum Stage {
    Fetch,
    Analyze,
}

/// Reports a spawned task's target as failed unless the task reports it first
///
/// A task that panics drops its guard armed, so the run loop still hears about the
/// target and releases its in-flight slot.
struct TaskGuard {
    tx: mpsc::UnboundedSender<Event>,
    target: Option<Target>,
    stage: Stage,
}

impl TaskGuard {
    fn new(tx: &mpsc::UnboundedSender<Event>, target: &Target, stage: Stage) -> Self {
        Self {
            tx: tx.clone(),
            target: Some(target.clone()),
            stage,
        }
    }

    fn disarm(mut self) {
        self.target = None;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let target = match self.target.take() {
            Some(target) => target,
            None => return,
        };
        let url = target.url.clone();
        let event = match self.stage {
            Stage::Fetch => Event::Fetched(
                target,
                Err(FetchError::Task {
                    url,
                    message: "fetch task ended without a result".to_string(),
                }),
            ),
            Stage::Analyze => Event::Analyzed(target, Err(AnalyzeError::Panicked { url })),
        };
        let _ = self.tx.send(event);
    }
}

/// Analysis plus whether the document was unchanged since its last crawl
struct Analyzed {
    analysis: Analysis,
    unchanged: bool,
}

/// Where a run reports its progress
#[derive(Clone)]
enum Progress {
    /// Production run: the process log
    Log { id: i64, title: String },

    /// Interactive run: human-readable lines streamed to a channel
    Stream {
        lines: mpsc::UnboundedSender<String>,
        cancel: Arc<AtomicBool>,
    },
}

impl Progress {
    fn is_testrun(&self) -> bool {
        matches!(self, Progress::Stream { .. })
    }

    fn cancelled(&self) -> bool {
        match self {
            Progress::Stream { cancel, .. } => cancel.load(Ordering::Relaxed),
            Progress::Log { .. } => false,
        }
    }

    /// A step only interesting to someone watching a test run
    fn step(&self, line: impl FnOnce() -> String) {
        match self {
            Progress::Stream { lines, .. } => {
                let _ = lines.send(line());
            }
            Progress::Log { id, .. } => debug!("Job[{}] {}", id, line()),
        }
    }

    fn info(&self, line: String) {
        match self {
            Progress::Stream { lines, .. } => {
                let _ = lines.send(line);
            }
            Progress::Log { id, title } => info!("Job[{}] \"{}\" {}", id, title, line),
        }
    }

    fn error(&self, line: String) {
        match self {
            Progress::Stream { lines, .. } => {
                let _ = lines.send(line);
            }
            Progress::Log { id, title } => warn!("Job[{}] \"{}\" {}", id, title, line),
        }
    }
}

/// A crawl job built from one rule
pub struct Job {
    id: i64,
    title: String,
    rule: Arc<Rule>,
    fetchers: Fetchers,
    store: Option<Arc<dyn Store>>,
    sink: Option<SinkSender>,
    cookies: Arc<Jar>,
    user_agent: Option<String>,
    run_at: Mutex<Option<DateTime<Utc>>>,
    crawled: AtomicU64,
}

impl Job {
    /// Creates a job for a compiled rule
    ///
    /// # Arguments
    ///
    /// * `id` - Store id of the job (0 for jobs that are not persisted)
    /// * `title` - Human-readable title
    /// * `rule` - The compiled rule
    /// * `fetchers` - Transports used for targets; the job's agent is picked from
    ///   their pool
    pub fn new(id: i64, title: impl Into<String>, rule: Rule, fetchers: Fetchers) -> Self {
        let user_agent = fetchers.agents.pick();
        Self {
            id,
            title: title.into(),
            rule: Arc::new(rule),
            fetchers,
            store: None,
            sink: None,
            cookies: Arc::new(Jar::default()),
            user_agent,
            run_at: Mutex::new(None),
            crawled: AtomicU64::new(0),
        }
    }

    /// Compiles `content` and creates a job for it
    ///
    /// A malformed rule yields an error and no job.
    pub fn from_content(
        id: i64,
        title: impl Into<String>,
        content: &str,
        fetchers: Fetchers,
    ) -> crate::RuleResult<Self> {
        Ok(Self::new(id, title, Rule::parse(content)?, fetchers))
    }

    pub fn from_file(
        id: i64,
        title: impl Into<String>,
        path: &Path,
        fetchers: Fetchers,
    ) -> crate::RuleResult<Self> {
        Ok(Self::new(id, title, Rule::from_file(path)?, fetchers))
    }

    /// Uses `store` for mtag dedup lookups
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Forwards output records of production runs to a sink
    pub fn connect_sink(&mut self, sink: SinkSender) {
        self.sink = Some(sink);
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Agent presented by targets without `$agents: "random"`; the client default when `None`
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Number of targets analyzed by the current or last run
    pub fn crawled_targets_count(&self) -> u64 {
        self.crawled.load(Ordering::Relaxed)
    }

    /// Start time of the current or last run
    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        *self.run_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs one production crawl
    ///
    /// Records go to the connected sink and mtags are checked against the store.
    pub async fn run(&self) -> RunOutcome {
        let progress = Progress::Log {
            id: self.id,
            title: self.title.clone(),
        };
        self.crawl(progress).await
    }

    /// Runs one interactive crawl
    ///
    /// Progress is streamed as human-readable lines ending with [`FINISHED`]. Nothing
    /// is written to the store or the sink. Setting `cancel` stops the run at the next
    /// loop iteration.
    pub async fn testrun(
        &self,
        lines: mpsc::UnboundedSender<String>,
        cancel: Arc<AtomicBool>,
    ) -> RunOutcome {
        let progress = Progress::Stream {
            lines: lines.clone(),
            cancel,
        };
        let outcome = self.crawl(progress).await;
        let _ = lines.send(FINISHED.to_string());
        outcome
    }

    async fn crawl(&self, progress: Progress) -> RunOutcome {
        let started = Instant::now();
        *self.run_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.crawled.store(0, Ordering::Relaxed);
        progress.info("start to crawl".to_string());
        if let Some(agent) = &self.user_agent {
            progress.step(|| format!("Start to crawl as [ {} ]", agent));
        }

        let mut frontier = PriorityQueue::new(higher);
        for entry in &self.rule.entries {
            match self.rule.template(&entry.name) {
                Some(template) => {
                    let targets = make_targets(entry, template);
                    progress.step(|| format!("Entry[{}] has {} targets", entry.name, targets.len()));
                    for target in targets {
                        frontier.push(target);
                    }
                }
                None => progress.error(format!("Entry[{}] has no target template", entry.name)),
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut in_flight: HashMap<u64, (String, JoinHandle<()>)> = HashMap::new();

        let outcome = loop {
            if progress.cancelled() {
                break RunOutcome::Cancelled;
            }
            if in_flight.is_empty() && frontier.is_empty() {
                break RunOutcome::Completed;
            }

            while self.has_capacity(in_flight.len()) {
                let target = match frontier.pop() {
                    Some(target) => target,
                    None => break,
                };
                progress.step(|| format!("Target[{}] start to crawl...", target.url));
                let id = target.id();
                let url = target.url.clone();
                let handle = self.spawn_fetch(target, None, tx.clone());
                in_flight.insert(id, (url, handle));
            }

            if !in_flight.is_empty() {
                let event = match self.wait_limit(started, &progress) {
                    Some(limit) => tokio::time::timeout(limit, rx.recv()).await.ok().flatten(),
                    None => rx.recv().await,
                };

                match event {
                    Some(Event::Fetched(target, result)) => {
                        self.on_fetched(target, result, &progress, &tx, &mut in_flight)
                    }
                    Some(Event::Analyzed(target, result)) => {
                        self.on_analyzed(target, result, &progress, &mut frontier, &mut in_flight)
                            .await
                    }
                    None => {}
                }
            }

            let elapsed = started.elapsed();
            if self.rule.timeout.map_or(false, |timeout| elapsed >= timeout) {
                break RunOutcome::TimedOut;
            }
            if elapsed >= self.rule.interval && self.crawled_targets_count() == 0 {
                break RunOutcome::Stalled;
            }
        };

        for (_, (url, handle)) in in_flight.drain() {
            debug!("Abandoning in-flight target {}", url);
            handle.abort();
        }

        match outcome {
            RunOutcome::Completed => progress.info(outcome.to_string()),
            _ => progress.error(outcome.to_string()),
        }
        progress.step(|| {
            format!(
                "Finished, total crawled {} targets",
                self.crawled_targets_count()
            )
        });
        outcome
    }

    fn has_capacity(&self, in_flight: usize) -> bool {
        self.rule.concurrency.map_or(true, |limit| in_flight < limit)
    }

    /// Longest the loop may wait for a completion before re-checking its limits
    fn wait_limit(&self, started: Instant, progress: &Progress) -> Option<Duration> {
        let elapsed = started.elapsed();
        let mut limit = self.rule.timeout.map(|t| t.saturating_sub(elapsed));

        if self.crawled_targets_count() == 0 {
            let stall = self.rule.interval.saturating_sub(elapsed);
            limit = Some(limit.map_or(stall, |l| l.min(stall)));
        }
        if progress.is_testrun() {
            limit = Some(limit.map_or(CANCEL_POLL, |l| l.min(CANCEL_POLL)));
        }

        limit
    }

    /// Fetches a target in the background, optionally after a delay
    fn spawn_fetch(
        &self,
        mut target: Target,
        delay: Option<Duration>,
        tx: mpsc::UnboundedSender<Event>,
    ) -> JoinHandle<()> {
        let fetchers = self.fetchers.clone();
        let cookies = Arc::clone(&self.cookies);
        let job_agent = self.user_agent.clone();

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            target.tried += 1;
            let guard = TaskGuard::new(&tx, &target, Stage::Fetch);
            let mut request = target.fetch_request();
            match target.agents {
                AgentMode::Job => {
                    request.user_agent = job_agent;
                    request.cookie = Url::parse(&target.url)
                        .ok()
                        .and_then(|url| cookies.cookies(&url))
                        .and_then(|value| value.to_str().ok().map(str::to_string));
                }
                // A rotating identity does not carry the job's session
                AgentMode::Random => request.user_agent = fetchers.agents.pick(),
            }

            let result = match fetchers.select(target.client, &target.url) {
                Ok(fetcher) => fetcher.fetch(&request).await,
                Err(e) => Err(e),
            };
            guard.disarm();
            let _ = tx.send(Event::Fetched(target, result));
        })
    }

    fn on_fetched(
        &self,
        mut target: Target,
        result: Result<FetchResponse, FetchError>,
        progress: &Progress,
        tx: &mpsc::UnboundedSender<Event>,
        in_flight: &mut HashMap<u64, (String, JoinHandle<()>)>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                progress.error(format!("Fetch target error: {}", e));
                target.fetch_error = Some(e.to_string());

                // A crashed fetch task would crash again
                let crashed = matches!(e, FetchError::Task { .. });
                if target.can_retry() && !crashed {
                    progress.step(|| {
                        format!(
                            "Retry crawl target[{}] after {}s",
                            target.url,
                            target.retry_wait.as_secs()
                        )
                    });
                    let id = target.id();
                    let url = target.url.clone();
                    let wait = target.retry_wait;
                    let handle = self.spawn_fetch(target, Some(wait), tx.clone());
                    in_flight.insert(id, (url, handle));
                } else {
                    progress.error(format!(
                        "Target[{}] abandoned after {} attempts",
                        target.url, target.tried
                    ));
                    in_flight.remove(&target.id());
                }
                return;
            }
        };

        self.merge_cookies(&response);
        target.fetch_error = None;
        progress.step(|| {
            format!(
                "Target[{}] crawled, {} bytes of '{}'",
                target.url,
                response.content.bytes().len(),
                response.content.content_type()
            )
        });

        let response = Arc::new(response);
        target.fetch_result = Some(Arc::clone(&response));

        let rule = Arc::clone(&self.rule);
        let store = if progress.is_testrun() {
            None
        } else {
            self.store.clone()
        };
        let tx = tx.clone();
        let id = target.id();
        let url = target.url.clone();

        // Parsing is CPU-bound and the store is synchronous
        let blocking = tokio::task::spawn_blocking(move || {
            let guard = TaskGuard::new(&tx, &target, Stage::Analyze);
            let result = analyzer::analyze(&rule, &target, &response).map(|mut analysis| {
                let unchanged = match &store {
                    Some(store) => {
                        match analyzer::apply_dedup(&mut analysis, store.as_ref(), &target.fingerprint()) {
                            Ok(unchanged) => unchanged,
                            Err(e) => {
                                warn!("Mtag check failed for {}: {}", target.url, e);
                                false
                            }
                        }
                    }
                    None => false,
                };
                Analyzed {
                    analysis,
                    unchanged,
                }
            });
            guard.disarm();
            let _ = tx.send(Event::Analyzed(target, result));
        });

        // The in-flight entry tracks the analysis from now on
        in_flight.insert(id, (url, blocking));
    }

    async fn on_analyzed(
        &self,
        mut target: Target,
        result: Result<Analyzed, AnalyzeError>,
        progress: &Progress,
        frontier: &mut PriorityQueue<Target>,
        in_flight: &mut HashMap<u64, (String, JoinHandle<()>)>,
    ) {
        target.analyzed = true;

        match result {
            Ok(Analyzed {
                analysis,
                unchanged,
            }) => {
                progress.step(|| format!("Target[{}] has mtag: {}", target.url, analysis.mtag));
                if unchanged {
                    progress.step(|| format!("Target[{}] unchanged since last crawl", target.url));
                }

                let (targets, packs) = analysis.all_targets();
                for child in targets {
                    progress.step(|| format!("Target[{}] added to queue", child.url));
                    frontier.push(child);
                }
                self.forward(&target, packs, progress).await;
                progress.step(|| format!("Target[{}] analyzed", target.url));
            }
            Err(e) => {
                progress.error(format!("Analyze target error: {}", e));
                target.analyze_error = Some(e.to_string());
            }
        }

        self.crawled.fetch_add(1, Ordering::Relaxed);
        in_flight.remove(&target.id());
    }

    /// Sends records to the sink, or lists them in a test run
    async fn forward(&self, target: &Target, packs: Vec<crate::sink::SinkPack>, progress: &Progress) {
        if progress.is_testrun() {
            if packs.is_empty() {
                progress.step(|| format!("Target[{}] has no sink pack", target.url));
            } else {
                let mut lines = vec![format!("Target[{}] has sink packs:", target.url)];
                lines.extend(packs.iter().map(|pack| format!("{:?}", pack)));
                progress.step(|| lines.join("\n"));
            }
            return;
        }

        let sink = match &self.sink {
            Some(sink) => sink,
            None => return,
        };
        for pack in packs {
            if let Err(e) = sink.send(pack).await {
                error!("Sink closed, dropping record {} of {}: {}", e.0.id, target.url, e);
            }
        }
    }

    /// Adds cookies set by a response to the job's jar, as a browser would
    fn merge_cookies(&self, response: &FetchResponse) {
        if response.cookies.is_empty() {
            return;
        }
        match Url::parse(&response.url) {
            Ok(url) => {
                for cookie in &response.cookies {
                    self.cookies.add_cookie_str(cookie, &url);
                }
            }
            Err(e) => debug!("Not keeping cookies of {}: {}", response.url, e),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("crawled", &self.crawled_targets_count())
            .finish()
    }
}

#[async_trait]
impl Runnable for Job {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn interval(&self) -> Duration {
        self.rule.interval
    }

    fn delay(&self) -> Duration {
        self.rule.delay
    }

    async fn run(&self) -> anyhow::Result<()> {
        Job::run(self).await;
        Ok(())
    }
}
