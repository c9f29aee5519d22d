//! Interactive test runs
//!
//! Only one test run is active at a time. Starting another cancels the one in
//! progress; the cancelled run still finishes its progress stream with
//! [`FINISHED`](super::job::FINISHED).

use crate::crawler::fetcher::Fetchers;
use crate::crawler::job::{Job, RunOutcome};
use crate::RuleResult;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

struct ActiveRun {
    id: u64,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<RunOutcome>,
}

/// Runs rules interactively, one at a time
pub struct TestRunner {
    fetchers: Fetchers,
    next_id: AtomicU64,
    active: Mutex<Option<ActiveRun>>,
}

/// A started test run
pub struct TestRun {
    pub id: u64,

    /// Progress lines, ending with `$finished`
    pub lines: mpsc::UnboundedReceiver<String>,
}

impl TestRunner {
    pub fn new(fetchers: Fetchers) -> Self {
        Self {
            fetchers,
            next_id: AtomicU64::new(1),
            active: Mutex::new(None),
        }
    }

    /// Starts a test run of a rule document, cancelling any run in progress
    ///
    /// # Arguments
    ///
    /// * `rule` - The rule document
    ///
    /// # Returns
    ///
    /// * `Ok(TestRun)` - The run id and its progress stream
    /// * `Err(RuleError)` - The rule does not compile; nothing was started
    pub fn run(&self, rule: &str) -> RuleResult<TestRun> {
        self.cancel();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Job::from_content(0, "Test Run", rule, self.fetchers.clone())?;

        let (tx, lines) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = {
            let cancel = Arc::clone(&cancel);
            tokio::spawn(async move { job.testrun(tx, cancel).await })
        };

        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveRun {
            id,
            cancel,
            handle,
        });
        debug!("Started test run {}", id);

        Ok(TestRun { id, lines })
    }

    /// Cancels the run in progress
    ///
    /// # Returns
    ///
    /// `true` if a run was still in progress
    pub fn cancel(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        match active {
            Some(run) if !run.handle.is_finished() => {
                run.cancel.store(true, Ordering::Relaxed);
                debug!("Cancelled test run {}", run.id);
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |run| !run.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::{FetchError, FetchRequest, FetchResponse, Fetcher};
    use crate::crawler::job::FINISHED;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Never answers within a test's lifetime
    struct Hanging;

    #[async_trait]
    impl Fetcher for Hanging {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(FetchError::Timeout {
                url: request.url.clone(),
            })
        }
    }

    const RULE: &str = r#"{
        "$entries": [{ "$name": "p", "$url": "https://abc.com/" }],
        "p": {}
    }"#;

    async fn drain(mut lines: mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut all = Vec::new();
        while let Some(line) = lines.recv().await {
            all.push(line);
        }
        all
    }

    #[tokio::test]
    async fn test_invalid_rule_starts_nothing() {
        let runner = TestRunner::new(Fetchers::direct(Arc::new(Hanging)));
        assert!(runner.run("{ not json").is_err());
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_new_run_cancels_previous() {
        let runner = TestRunner::new(Fetchers::direct(Arc::new(Hanging)));

        let first = runner.run(RULE).unwrap();
        assert!(runner.is_running());
        let second = runner.run(RULE).unwrap();
        assert!(second.id > first.id);

        let lines = tokio::time::timeout(Duration::from_secs(2), drain(first.lines))
            .await
            .unwrap();
        assert!(lines.iter().any(|l| l == "test run cancelled"));
        assert_eq!(lines.last().map(String::as_str), Some(FINISHED));

        assert!(runner.cancel());
        assert!(!runner.cancel());
        let lines = tokio::time::timeout(Duration::from_secs(2), drain(second.lines))
            .await
            .unwrap();
        assert_eq!(lines.last().map(String::as_str), Some(FINISHED));
    }
}
