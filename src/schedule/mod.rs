//! Recurring task scheduler
//!
//! A [`Schedule`] keeps every registered task in two places: an index by id and a
//! time-ordered timeline of due instants. A single dispatch loop ticks at a fixed
//! cadence, removes due tasks from the timeline and runs them concurrently. A finished
//! task reports its next due time over an update channel and the loop puts it back on
//! the timeline, so a task is never on the timeline while it runs.
//!
//! The schedule starts paused; nothing is dispatched until [`Schedule::start`].

mod task;

pub use task::{Runnable, TaskInfo};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use task::Task;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Dispatch loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Paused,
    Running,
    Stopped,
}

/// Completion report of one run
struct Update {
    id: u64,
    next_due: Instant,
}

struct Shared {
    /// Due instant and id of every idle task
    timeline: Mutex<BTreeMap<(Instant, u64), ()>>,

    /// All registered tasks
    tasks: Mutex<HashMap<u64, Task>>,

    next_id: AtomicU64,
    updates: mpsc::UnboundedSender<Update>,
    state: watch::Sender<ScheduleState>,
}

/// Locks a mutex, recovering the data if a previous holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Time-ordered registry of recurring tasks
pub struct Schedule {
    shared: Arc<Shared>,
    tick: Duration,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Update>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Schedule {
    /// Creates a paused schedule
    ///
    /// # Arguments
    ///
    /// * `tick` - Cadence of the dispatch loop
    pub fn new(tick: Duration) -> Self {
        let (updates, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ScheduleState::Paused);

        Self {
            shared: Arc::new(Shared {
                timeline: Mutex::new(BTreeMap::new()),
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                updates,
                state,
            }),
            tick,
            receiver: Mutex::new(Some(receiver)),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ScheduleState {
        *self.shared.state.borrow()
    }

    /// Registers a runnable, first due after its delay
    ///
    /// # Returns
    ///
    /// The new task id, or 0 if it could not be inserted
    pub fn create_task(&self, runnable: Arc<dyn Runnable>) -> u64 {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let title = runnable.title();
        let task = Task::new(id, runnable, Instant::now());
        let key = (task.next_due, id);

        {
            let mut tasks = lock(&self.shared.tasks);
            if tasks.contains_key(&id) {
                return 0;
            }
            let mut timeline = lock(&self.shared.timeline);
            if timeline.contains_key(&key) {
                return 0;
            }
            timeline.insert(key, ());
            tasks.insert(id, task);
        }

        debug!("Registered task {} ({})", id, title);
        id
    }

    /// Removes a task
    ///
    /// A run already in progress finishes but is not rescheduled.
    ///
    /// # Returns
    ///
    /// `false` if no task has this id
    pub fn delete_task(&self, id: u64) -> bool {
        let removed = lock(&self.shared.tasks).remove(&id);
        match removed {
            Some(task) => {
                lock(&self.shared.timeline).remove(&(task.next_due, id));
                debug!("Deleted task {}", id);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all registered tasks, ordered by id
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let now = Instant::now();
        let mut infos: Vec<TaskInfo> = lock(&self.shared.tasks)
            .values()
            .map(|task| TaskInfo {
                id: task.id,
                title: task.runnable.title(),
                interval: task.runnable.interval(),
                running: task.running,
                due_in: (!task.running).then(|| task.next_due.saturating_duration_since(now)),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Starts the dispatch loop, or resumes it if paused
    pub fn start(&self) {
        if self.state() == ScheduleState::Stopped {
            warn!("Schedule already stopped, not starting");
            return;
        }

        let mut handle = lock(&self.handle);
        if handle.is_none() {
            if let Some(receiver) = lock(&self.receiver).take() {
                let shared = Arc::clone(&self.shared);
                *handle = Some(tokio::spawn(dispatch_loop(shared, receiver, self.tick)));
                info!("Schedule started with a {:?} tick", self.tick);
            }
        }
        self.set_state(ScheduleState::Running);
    }

    /// Blocks the dispatch loop until resumed; runs in progress continue
    pub fn pause(&self) {
        if self.state() == ScheduleState::Running {
            self.set_state(ScheduleState::Paused);
            info!("Schedule paused");
        }
    }

    pub fn resume(&self) {
        if self.state() == ScheduleState::Paused {
            self.set_state(ScheduleState::Running);
            info!("Schedule resumed");
        }
    }

    /// Terminates the dispatch loop and waits for it to exit
    pub async fn stop(&self) {
        self.set_state(ScheduleState::Stopped);
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Schedule loop ended abnormally: {}", e);
            }
            info!("Schedule stopped");
        }
    }

    fn set_state(&self, state: ScheduleState) {
        self.shared.state.send_replace(state);
    }
}

impl Drop for Schedule {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.handle).take() {
            handle.abort();
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut receiver: mpsc::UnboundedReceiver<Update>,
    tick: Duration,
) {
    let mut state = shared.state.subscribe();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Paused: block until the state changes
        loop {
            let current = *state.borrow_and_update();
            match current {
                ScheduleState::Running => break,
                ScheduleState::Stopped => return,
                ScheduleState::Paused => {
                    if state.changed().await.is_err() {
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        while let Ok(update) = receiver.try_recv() {
            reschedule(&shared, update);
        }

        for id in take_due(&shared, Instant::now()) {
            dispatch(&shared, id);
        }
    }
}

/// Puts a finished task back on the timeline, unless it was deleted meanwhile
fn reschedule(shared: &Shared, update: Update) {
    let mut tasks = lock(&shared.tasks);
    if let Some(task) = tasks.get_mut(&update.id) {
        task.running = false;
        task.next_due = update.next_due;
        lock(&shared.timeline).insert((update.next_due, update.id), ());
    }
}

/// Removes and returns the ids of all tasks due at `now`
fn take_due(shared: &Shared, now: Instant) -> Vec<u64> {
    let mut timeline = lock(&shared.timeline);
    let later = timeline.split_off(&(now, u64::MAX));
    let due = std::mem::replace(&mut *timeline, later);
    due.into_keys().map(|(_, id)| id).collect()
}

fn dispatch(shared: &Arc<Shared>, id: u64) {
    let (runnable, due) = {
        let mut tasks = lock(&shared.tasks);
        let task = match tasks.get_mut(&id) {
            Some(task) => task,
            None => return,
        };
        if task.running || task.runnable.interval().is_zero() {
            return;
        }
        task.running = true;
        (Arc::clone(&task.runnable), task.next_due)
    };

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let title = runnable.title();
        let interval = runnable.interval();
        debug!("Running task {} ({})", id, title);

        // Run in its own task so a panic surfaces as a JoinError here
        let run = tokio::spawn(async move { runnable.run().await });
        match run.await {
            Ok(Ok(())) => debug!("Task {} ({}) finished", id, title),
            Ok(Err(e)) => warn!("Task {} ({}) failed: {:#}", id, title, e),
            Err(e) if e.is_panic() => error!("Task {} ({}) panicked", id, title),
            Err(e) => error!("Task {} ({}) aborted: {}", id, title, e),
        }

        let next_due = Task::next_after(due, interval, Instant::now());
        if shared.updates.send(Update { id, next_due }).is_err() {
            debug!("Schedule gone, dropping update for task {}", id);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const TICK: Duration = Duration::from_millis(10);

    struct Counter {
        interval: Duration,
        delay: Duration,
        work: Duration,
        panic: bool,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Counter {
        fn new(interval: Duration) -> Self {
            Self {
                interval,
                delay: Duration::ZERO,
                work: Duration::ZERO,
                panic: false,
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Runnable for Counter {
        fn title(&self) -> String {
            "counter".to_string()
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn delay(&self) -> Duration {
            self.delay
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.panic {
                panic!("boom");
            }
            Ok(())
        }
    }

    #[test]
    fn test_delete_twice() {
        let schedule = Schedule::new(TICK);
        let id = schedule.create_task(Arc::new(Counter::new(Duration::from_secs(1))));
        assert!(id > 0);
        assert_eq!(schedule.tasks().len(), 1);
        assert!(schedule.delete_task(id));
        assert!(!schedule.delete_task(id));
        assert!(schedule.tasks().is_empty());
    }

    #[test]
    fn test_ids_are_distinct() {
        let schedule = Schedule::new(TICK);
        let a = schedule.create_task(Arc::new(Counter::new(Duration::from_secs(1))));
        let b = schedule.create_task(Arc::new(Counter::new(Duration::from_secs(1))));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_starts_paused() {
        let schedule = Schedule::new(TICK);
        let counter = Arc::new(Counter::new(Duration::from_millis(20)));
        schedule.create_task(counter.clone());

        assert_eq!(schedule.state(), ScheduleState::Paused);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.runs(), 0);

        schedule.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(counter.runs() >= 2);
        schedule.stop().await;
    }

    #[tokio::test]
    async fn test_first_run_waits_for_delay() {
        let schedule = Schedule::new(TICK);
        let mut counter = Counter::new(Duration::from_secs(60));
        counter.delay = Duration::from_millis(200);
        let counter = Arc::new(counter);
        schedule.create_task(counter.clone());
        schedule.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.runs(), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counter.runs(), 1);
        schedule.stop().await;
    }

    #[tokio::test]
    async fn test_slow_task_never_overlaps() {
        let schedule = Schedule::new(TICK);
        let mut counter = Counter::new(Duration::from_millis(5));
        counter.work = Duration::from_millis(80);
        let counter = Arc::new(counter);
        schedule.create_task(counter.clone());
        schedule.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        schedule.stop().await;
        assert!(counter.runs() >= 2);
        assert_eq!(counter.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_rescheduled() {
        let schedule = Schedule::new(TICK);
        let mut counter = Counter::new(Duration::from_millis(20));
        counter.panic = true;
        let counter = Arc::new(counter);
        let id = schedule.create_task(counter.clone());
        schedule.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(counter.runs() >= 2);
        assert!(schedule.tasks().iter().any(|t| t.id == id));
        schedule.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_is_inert() {
        let schedule = Schedule::new(TICK);
        let counter = Arc::new(Counter::new(Duration::ZERO));
        schedule.create_task(counter.clone());
        schedule.start();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.runs(), 0);
        schedule.stop().await;
    }

    #[tokio::test]
    async fn test_pause_and_stop_halt_dispatch() {
        let schedule = Schedule::new(TICK);
        let counter = Arc::new(Counter::new(Duration::from_millis(20)));
        schedule.create_task(counter.clone());
        schedule.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        schedule.pause();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let paused_at = counter.runs();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.runs(), paused_at);

        schedule.resume();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(counter.runs() > paused_at);

        schedule.stop().await;
        assert_eq!(schedule.state(), ScheduleState::Stopped);
        let stopped_at = counter.runs();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.runs(), stopped_at);
    }

    #[tokio::test]
    async fn test_deleted_task_is_not_rescheduled() {
        let schedule = Schedule::new(TICK);
        let mut counter = Counter::new(Duration::from_millis(10));
        counter.work = Duration::from_millis(50);
        let counter = Arc::new(counter);
        let id = schedule.create_task(counter.clone());
        schedule.start();

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(schedule.delete_task(id));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.runs(), 1);
        schedule.stop().await;
    }
}
