//! Bounded-concurrency task execution
//!
//! Runs zero-argument async tasks with at most `limit` in flight, returning
//! every task's outcome in input order. A failing task never affects its
//! siblings.
//!
//! Workers share a cursor over the task list and each claims the next
//! unclaimed task as soon as it finishes its current one, so uneven task
//! durations don't leave a slot idle. All workers are polled from the
//! calling task; concurrency here means outstanding I/O, not threads.
//!
//! `SourceLimits` caps in-flight calls per data source across every caller,
//! including fallback calls that land on a source outside its own group.

use crate::error::ConcurrencyError;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A deferred unit of async work
pub type Task<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;

/// Boxes a closure returning a future into a `Task`
pub fn task<T, E, F, Fut>(f: F) -> Task<T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<T, E>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Outcome of a task run under a cancellation token
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError<E> {
    /// The task ran and failed
    Failed(E),
    /// The task was never started because cancellation was requested
    Cancelled,
}

/// A named group of tasks with its own concurrency limit
pub struct TaskGroup<T, E> {
    pub name: String,
    pub limit: usize,
    pub tasks: Vec<Task<T, E>>,
}

impl<T, E> TaskGroup<T, E> {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit,
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, task: Task<T, E>) {
        self.tasks.push(task);
    }
}

/// Results of one group in a batched run, in task order
#[derive(Debug)]
pub struct GroupOutcome<T, E> {
    pub name: String,
    pub results: Vec<Result<T, TaskError<E>>>,
}

/// Runs tasks with at most `limit` in flight
///
/// Returns one result per task, in input order.
pub async fn run_bounded<T, E>(
    tasks: Vec<Task<T, E>>,
    limit: usize,
) -> Result<Vec<Result<T, E>>, ConcurrencyError>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let never = CancellationToken::new();
    let results = run_bounded_cancellable(tasks, limit, &never).await?;

    Ok(results
        .into_iter()
        .map(|r| {
            r.map_err(|e| match e {
                TaskError::Failed(e) => e,
                // The token above is never cancelled
                TaskError::Cancelled => unreachable!("task cancelled without cancellation"),
            })
        })
        .collect())
}

/// Runs tasks with at most `limit` in flight, stopping dispatch on cancellation
///
/// Tasks already running when `cancel` fires run to completion; tasks not yet
/// claimed are reported as `TaskError::Cancelled`.
pub async fn run_bounded_cancellable<T, E>(
    tasks: Vec<Task<T, E>>,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Result<T, TaskError<E>>>, ConcurrencyError>
where
    T: Send + 'static,
    E: Send + 'static,
{
    if limit == 0 {
        return Err(ConcurrencyError::InvalidLimit(limit));
    }

    let total = tasks.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let cursor = Mutex::new(tasks.into_iter().enumerate());
    let workers = (0..limit.min(total)).map(|_| worker(&cursor, cancel));
    let finished = join_all(workers).await;

    let mut slots: Vec<Option<Result<T, TaskError<E>>>> = (0..total).map(|_| None).collect();
    for (index, result) in finished.into_iter().flatten() {
        slots[index] = Some(result.map_err(TaskError::Failed));
    }

    Ok(slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Err(TaskError::Cancelled)))
        .collect())
}

/// Runs every group in parallel, each under its own limit
///
/// Group outcomes are returned in input order. An invalid limit in any group
/// rejects the whole batch before anything runs.
pub async fn run_batched<T, E>(
    groups: Vec<TaskGroup<T, E>>,
    cancel: &CancellationToken,
) -> Result<Vec<GroupOutcome<T, E>>, ConcurrencyError>
where
    T: Send + 'static,
    E: Send + 'static,
{
    if let Some(group) = groups.iter().find(|g| g.limit == 0) {
        return Err(ConcurrencyError::InvalidLimit(group.limit));
    }

    let runs = groups.into_iter().map(|group| async move {
        let results = run_bounded_cancellable(group.tasks, group.limit, cancel).await?;
        Ok::<_, ConcurrencyError>(GroupOutcome {
            name: group.name,
            results,
        })
    });

    join_all(runs).await.into_iter().collect()
}

type Cursor<T, E> = Mutex<std::iter::Enumerate<std::vec::IntoIter<Task<T, E>>>>;

async fn worker<T, E>(
    cursor: &Cursor<T, E>,
    cancel: &CancellationToken,
) -> Vec<(usize, Result<T, E>)> {
    let mut done = Vec::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let next = cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .next();
        let Some((index, task)) = next else {
            break;
        };

        done.push((index, task().await));
    }

    done
}

/// Per-source concurrency caps with optional spacing between calls
///
/// Sources without an explicit cap get `default_cap`. A source's semaphore is
/// created on first use and shared by every later caller.
pub struct SourceLimits {
    default_cap: usize,
    caps: HashMap<String, usize>,
    spacing: HashMap<String, Duration>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SourceLimits {
    pub fn new(default_cap: usize) -> Self {
        Self {
            default_cap: default_cap.max(1),
            caps: HashMap::new(),
            spacing: HashMap::new(),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cap(mut self, source: impl Into<String>, cap: usize) -> Self {
        self.caps.insert(source.into(), cap.max(1));
        self
    }

    /// A slot is held for `spacing` after each call before the next caller gets it
    pub fn with_spacing(mut self, source: impl Into<String>, spacing: Duration) -> Self {
        self.spacing.insert(source.into(), spacing);
        self
    }

    /// Maximum simultaneous calls to a source
    pub fn cap(&self, source: &str) -> usize {
        self.caps.get(source).copied().unwrap_or(self.default_cap)
    }

    pub fn spacing(&self, source: &str) -> Option<Duration> {
        self.spacing.get(source).copied()
    }

    fn semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut semaphores = self
            .semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        semaphores
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.cap(source))))
            .clone()
    }

    /// Waits for a free slot on a source
    pub async fn acquire(&self, source: &str) -> Result<SourcePermit, ConcurrencyError> {
        let permit = self
            .semaphore(source)
            .acquire_owned()
            .await
            .map_err(|_| ConcurrencyError::Closed(source.to_string()))?;

        Ok(SourcePermit {
            permit: Some(permit),
            spacing: self.spacing(source),
        })
    }
}

/// A claimed slot on a source; released on drop, after the source's spacing
pub struct SourcePermit {
    permit: Option<OwnedSemaphorePermit>,
    spacing: Option<Duration>,
}

impl Drop for SourcePermit {
    fn drop(&mut self) {
        let (Some(permit), Some(spacing)) = (self.permit.take(), self.spacing) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(spacing).await;
                    drop(permit);
                });
            }
            Err(_) => drop(permit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, Instant};

    /// Tracks how many tasks are in flight and the peak seen
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn timed_tasks(
        durations_ms: &[u64],
        gauge: &Arc<Gauge>,
    ) -> Vec<Task<usize, String>> {
        durations_ms
            .iter()
            .enumerate()
            .map(|(i, ms)| {
                let gauge = gauge.clone();
                let ms = *ms;
                task(move || async move {
                    gauge.enter();
                    sleep(Duration::from_millis(ms)).await;
                    gauge.exit();
                    if i % 4 == 3 {
                        Err(format!("task {} failed", i))
                    } else {
                        Ok(i)
                    }
                })
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleven_tasks_cap_three() {
        let gauge = Arc::new(Gauge::default());
        let tasks = timed_tasks(&[2000; 11], &gauge);

        let start = Instant::now();
        let results = run_bounded(tasks, 3).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(elapsed, Duration::from_secs(8));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
        assert_eq!(results.len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order_and_failures_are_isolated() {
        let gauge = Arc::new(Gauge::default());
        // Later tasks finish first
        let tasks = timed_tasks(&[800, 700, 600, 500, 400, 300, 200, 100], &gauge);

        let results = run_bounded(tasks, 3).await.unwrap();

        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            if i % 4 == 3 {
                assert_eq!(result, &Err(format!("task {} failed", i)));
            } else {
                assert_eq!(result, &Ok(i));
            }
        }
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_at_least_task_count_is_full_fanout() {
        let gauge = Arc::new(Gauge::default());
        let tasks = timed_tasks(&[100, 300, 1000, 200], &gauge);

        let start = Instant::now();
        run_bounded(tasks, 10).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_one_is_sequential() {
        let gauge = Arc::new(Gauge::default());
        let tasks = timed_tasks(&[100, 300, 1000, 200], &gauge);

        let start = Instant::now();
        run_bounded(tasks, 1).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(1600));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_cursor_balances_uneven_durations() {
        let gauge = Arc::new(Gauge::default());
        // A static split into [5000, 100, 100] / [100, 100, 100] would take 5200ms
        let tasks = timed_tasks(&[5000, 100, 100, 100, 100, 100], &gauge);

        let start = Instant::now();
        run_bounded(tasks, 2).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let tasks: Vec<Task<(), ()>> = vec![task(|| async { Ok(()) })];
        assert_eq!(
            run_bounded(tasks, 0).await.unwrap_err(),
            ConcurrencyError::InvalidLimit(0)
        );
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let tasks: Vec<Task<(), ()>> = Vec::new();
        assert!(run_bounded(tasks, 2).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_groups_are_independent() {
        let slow_gauge = Arc::new(Gauge::default());
        let fast_gauge = Arc::new(Gauge::default());

        let mut slow = TaskGroup::new("slow", 1);
        for t in timed_tasks(&[1000, 1000, 1000], &slow_gauge) {
            slow.push(t);
        }
        let mut fast = TaskGroup::new("fast", 5);
        for t in timed_tasks(&[1000; 5], &fast_gauge) {
            fast.push(t);
        }

        let start = Instant::now();
        let outcomes = run_batched(vec![slow, fast], &CancellationToken::new())
            .await
            .unwrap();

        // Sequential slow group dominates; the fast group ran alongside it
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(slow_gauge.peak.load(Ordering::SeqCst), 1);
        assert_eq!(fast_gauge.peak.load(Ordering::SeqCst), 5);
        assert_eq!(outcomes[0].name, "slow");
        assert_eq!(outcomes[0].results.len(), 3);
        assert_eq!(outcomes[1].name, "fast");
        assert_eq!(outcomes[1].results.len(), 5);
    }

    #[tokio::test]
    async fn test_batched_rejects_invalid_group_limit() {
        let groups: Vec<TaskGroup<(), ()>> = vec![TaskGroup::new("ok", 2), TaskGroup::new("bad", 0)];
        let result = run_batched(groups, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ConcurrencyError::InvalidLimit(0))));
    }

    async fn limited_call(limits: &SourceLimits, source: &str, gauge: &Gauge, ms: u64) {
        let _permit = limits.acquire(source).await.unwrap();
        gauge.enter();
        sleep(Duration::from_millis(ms)).await;
        gauge.exit();
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_cap_shared_by_all_callers() {
        let limits = SourceLimits::new(1).with_cap("bulk", 2);
        let bulk = Gauge::default();
        let other = Gauge::default();

        let start = Instant::now();
        let calls = (0..6)
            .map(|_| limited_call(&limits, "bulk", &bulk, 1000))
            .chain((0..2).map(|_| limited_call(&limits, "unlisted", &other, 1000)));
        join_all(calls).await;

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(bulk.peak.load(Ordering::SeqCst), 2);
        assert_eq!(other.peak.load(Ordering::SeqCst), 1);
        assert_eq!(limits.cap("unlisted"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_spacing_holds_slot_after_call() {
        let limits = SourceLimits::new(1).with_spacing("strict", Duration::from_millis(500));
        let gauge = Gauge::default();

        let start = Instant::now();
        join_all((0..3).map(|_| limited_call(&limits, "strict", &gauge, 100))).await;

        // 100 + 500 + 100 + 500 + 100
        assert_eq!(start.elapsed(), Duration::from_millis(1300));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_new_dispatch_only() {
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task<usize, String>> = (0..6)
            .map(|i| {
                let started = started.clone();
                task(move || async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(1)).await;
                    Ok(i)
                })
            })
            .collect();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let results = run_bounded_cancellable(tasks, 2, &cancel)
            .await
            .unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(results[0], Ok(0));
        assert_eq!(results[1], Ok(1));
        assert!(results[2..]
            .iter()
            .all(|r| matches!(r, Err(TaskError::Cancelled))));
    }
}
