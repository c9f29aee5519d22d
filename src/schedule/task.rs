//! Recurring units of work

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Something the schedule can run on a recurring basis
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Human-readable name, used in logs
    fn title(&self) -> String;

    /// Time between the starts of two consecutive runs
    ///
    /// A zero interval makes the task inert: it is registered but never run.
    fn interval(&self) -> Duration;

    /// Delay before the first run
    fn delay(&self) -> Duration;

    async fn run(&self) -> anyhow::Result<()>;
}

/// A registered runnable and its dispatch state
pub(crate) struct Task {
    pub id: u64,
    pub runnable: Arc<dyn Runnable>,
    pub next_due: Instant,
    pub running: bool,
}

impl Task {
    pub fn new(id: u64, runnable: Arc<dyn Runnable>, now: Instant) -> Self {
        let next_due = now + runnable.delay();
        Self {
            id,
            runnable,
            next_due,
            running: false,
        }
    }

    /// Next due time after a run that was due at `previous`
    ///
    /// Never earlier than `now`, so an overrunning execution does not cause a burst of
    /// catch-up runs.
    pub fn next_after(previous: Instant, interval: Duration, now: Instant) -> Instant {
        (previous + interval).max(now)
    }
}

/// Snapshot of a task, for listings
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: u64,
    pub title: String,
    pub interval: Duration,
    pub running: bool,

    /// Time until the next run; `None` while running
    pub due_in: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_after_never_before_now() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);

        // finished early: next run keeps the cadence
        assert_eq!(
            Task::next_after(start, interval, start + Duration::from_secs(2)),
            start + interval
        );

        // overran the interval: next run is now
        let late = start + Duration::from_secs(25);
        assert_eq!(Task::next_after(start, interval, late), late);
    }
}
