//! Composition root
//!
//! The [`Hub`] owns the store, the sink, the schedule and the test runner, and exposes
//! job lifecycle operations. A job is persisted in the store with a status; active
//! jobs are compiled and registered with the schedule, inactive ones are only kept.

use crate::config::{Config, JobEntry};
use crate::crawler::{Fetchers, Job, TestRun, TestRunner};
use crate::rule::Rule;
use crate::schedule::{Schedule, TaskInfo};
use crate::sink::Sink;
use crate::storage::{self, JobRecord, JobStatus, StorageError, Store, JOBS_DATASET};
use crate::{BotsboxError, Result, RuleResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

/// Longest `close` waits for queued records to be persisted
const SINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Store, sink, schedule and test runner wired together
pub struct Hub {
    store: Arc<dyn Store>,
    sink: Sink,
    schedule: Schedule,
    testrunner: TestRunner,
    fetchers: Fetchers,

    /// Schedule task id of every active job, by job id
    tasks: Mutex<HashMap<i64, u64>>,
}

impl Hub {
    /// Opens the store named by the config and starts the sink and the schedule
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: &Config) -> Result<Self> {
        let store = storage::open_store(Path::new(&config.store.database_path))?;
        Self::with_store(Arc::new(store), config)
    }

    /// Builds a hub around an already opened store
    pub fn with_store(store: Arc<dyn Store>, config: &Config) -> Result<Self> {
        let fetchers = Fetchers::from_config(&config.fetch)?;
        Ok(Self::with_fetchers(store, config, fetchers))
    }

    /// Builds a hub with explicit fetchers
    pub fn with_fetchers(store: Arc<dyn Store>, config: &Config, fetchers: Fetchers) -> Self {
        let sink = Sink::open(Arc::clone(&store), &config.sink);
        let schedule = Schedule::new(Duration::from_millis(config.schedule.tick_ms));
        schedule.start();

        info!("Hub opened");
        Self {
            store,
            sink,
            schedule,
            testrunner: TestRunner::new(fetchers.clone()),
            fetchers,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Stops the schedule and any test run, then drains the sink
    ///
    /// # Returns
    ///
    /// The number of records persisted by the sink during the hub's lifetime
    pub async fn close(self) -> u64 {
        self.testrunner.cancel();
        self.schedule.stop().await;

        let Hub { sink, schedule, .. } = self;
        drop(schedule);

        match tokio::time::timeout(SINK_DRAIN_TIMEOUT, sink.close()).await {
            Ok(count) => {
                info!("Hub closed, {} records persisted", count);
                count
            }
            Err(_) => {
                warn!("Sink still busy after {:?}, closing anyway", SINK_DRAIN_TIMEOUT);
                0
            }
        }
    }

    /// Registers every active job of the store with the schedule
    ///
    /// Jobs whose rule no longer compiles are logged and skipped.
    ///
    /// # Returns
    ///
    /// The number of jobs registered
    pub fn load_jobs(&self) -> Result<usize> {
        let mut loaded = 0;
        let records = self.store.query_all_jobs()?;
        let mut tasks = self.lock_tasks();
        for record in records {
            if record.status != JobStatus::Active || tasks.contains_key(&record.id) {
                continue;
            }
            match self.schedule_job(&mut tasks, &record) {
                Ok(()) => loaded += 1,
                Err(e) => error!("Load job {} \"{}\" failed: {}", record.id, record.title, e),
            }
        }

        info!("Loaded {} jobs", loaded);
        Ok(loaded)
    }

    /// Stores a new, inactive job
    ///
    /// # Arguments
    ///
    /// * `title` - Human-readable title
    /// * `rule` - The rule document; it must compile
    ///
    /// # Returns
    ///
    /// * `Ok(i64)` - The id of the new job
    /// * `Err(BotsboxError)` - The rule is malformed or the store failed
    pub fn create_job(&self, title: &str, rule: &str) -> Result<i64> {
        Rule::parse(rule)?;
        let id = self.store.insert_job(title, rule, JobStatus::Inactive)?;
        info!("Job {} \"{}\" created", id, title);
        Ok(id)
    }

    /// Marks a job active and registers it with the schedule
    ///
    /// # Returns
    ///
    /// `false` if the job was already active
    pub fn activate_job(&self, id: i64) -> Result<bool> {
        // Held from the check to the insert so concurrent activations register once
        let mut tasks = self.lock_tasks();
        if tasks.contains_key(&id) {
            return Ok(false);
        }

        let record = self.get_job(id)?;
        self.schedule_job(&mut tasks, &record)?;
        drop(tasks);
        self.store.set_job_status(id, JobStatus::Active)?;
        info!("Job {} activated", id);
        Ok(true)
    }

    /// Removes a job from the schedule and marks it inactive
    ///
    /// A run in progress finishes normally.
    ///
    /// # Returns
    ///
    /// `false` if the job was not scheduled
    pub fn deactivate_job(&self, id: i64) -> Result<bool> {
        self.get_job(id)?;
        let removed = match self.lock_tasks().remove(&id) {
            Some(task) => self.schedule.delete_task(task),
            None => false,
        };
        self.store.set_job_status(id, JobStatus::Inactive)?;
        if removed {
            info!("Job {} deactivated", id);
        }
        Ok(removed)
    }

    /// Deactivates and deletes a job
    pub fn delete_job(&self, id: i64) -> Result<()> {
        self.deactivate_job(id)?;
        self.store.delete_objects(JOBS_DATASET, &[id])?;
        info!("Job {} deleted", id);
        Ok(())
    }

    /// Stores and activates the jobs listed in the config file
    ///
    /// A job whose title is already stored is left alone. Relative rule paths are
    /// resolved against `base_dir`.
    ///
    /// # Returns
    ///
    /// The number of jobs added
    pub fn import_jobs(&self, jobs: &[JobEntry], base_dir: &Path) -> Result<usize> {
        let known: Vec<String> = self
            .store
            .query_all_jobs()?
            .into_iter()
            .map(|job| job.title)
            .collect();

        let mut added = 0;
        for entry in jobs {
            if known.contains(&entry.title) {
                continue;
            }
            let path = base_dir.join(&entry.rule);
            let rule = std::fs::read_to_string(&path)?;
            let id = self.create_job(&entry.title, &rule)?;
            self.activate_job(id)?;
            added += 1;
        }
        Ok(added)
    }

    /// Starts an interactive run of a rule, cancelling any run in progress
    pub fn testrun_job(&self, rule: &str) -> RuleResult<TestRun> {
        self.testrunner.run(rule)
    }

    /// Cancels the interactive run in progress
    pub fn cancel_testrun(&self) -> bool {
        self.testrunner.cancel()
    }

    /// Snapshot of every scheduled task
    pub fn all_tasks(&self) -> Vec<TaskInfo> {
        self.schedule.tasks()
    }

    fn get_job(&self, id: i64) -> Result<JobRecord> {
        self.store.get_job(id).map_err(|e| match e {
            StorageError::JobNotFound(id) => BotsboxError::JobNotFound(id),
            e => e.into(),
        })
    }

    /// Compiles a job and registers it; the caller holds the tasks lock
    fn schedule_job(&self, tasks: &mut HashMap<i64, u64>, record: &JobRecord) -> Result<()> {
        let mut job = Job::from_content(record.id, &record.title, &record.rule, self.fetchers.clone())?
            .with_store(Arc::clone(&self.store));
        job.connect_sink(self.sink.sender());

        let task = self.schedule.create_task(Arc::new(job));
        if task == 0 {
            return Err(BotsboxError::Schedule(record.title.clone()));
        }
        tasks.insert(record.id, task);
        Ok(())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<i64, u64>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
