//! Collection scheduler
//!
//! Runs collection cycles on a fixed interval. Each cycle lists the active
//! coins, groups them by the collector they currently resolve to, runs every
//! group under that source's concurrency cap, persists the results and
//! records the run.
//!
//! ```text
//! start()
//!     ↓
//! Timer loop (tick every interval, or cancelled by stop())
//!     ↓
//! begin: Idle → Running (rejected if already Running)
//!     ↓
//! CollectorRouter::resolve per coin → one TaskGroup per source
//!     ↓
//! run_batched (each group bounded by its own cap)
//!     ↓
//! MetricsStorage (metrics, then the CollectionRun)
//!     ↓
//! Running → Idle
//! ```
//!
//! At most one cycle runs at a time. The Idle → Running transition happens
//! under a synchronous lock before the first await, so a tick or manual
//! trigger that arrives during a run is rejected rather than queued.

use crate::{
    concurrency::{run_batched, task, TaskError, TaskGroup},
    context::AgentContext,
    error::AgentError,
    router::{CollectorRouter, Routed},
    storage::MetricsStorage,
    types::{CollectionRun, CollectorHealth, SchedulerState, TransactionMetrics},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Mutable lifecycle flags, only touched under the lock
struct Lifecycle {
    running: bool,
    stopped: bool,
    /// Bumped by every `start`, so a stale `stop` can tell it was superseded
    generation: u64,
    shutdown: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    context: Arc<AgentContext>,
    router: Arc<CollectorRouter>,
    storage: Arc<dyn MetricsStorage>,
    lifecycle: Mutex<Lifecycle>,
    idle: Notify,
    last_run: RwLock<Option<CollectionRun>>,
}

/// Marks the scheduler Idle again when a cycle ends, however it ends
struct RunningGuard {
    inner: Arc<Inner>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.lock().running = false;
        self.inner.idle.notify_waiters();
    }
}

/// Periodic collection scheduler
pub struct CollectionScheduler {
    inner: Arc<Inner>,
}

impl CollectionScheduler {
    /// Creates a new idle scheduler
    pub fn new(
        context: Arc<AgentContext>,
        router: Arc<CollectorRouter>,
        storage: Arc<dyn MetricsStorage>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                router,
                storage,
                lifecycle: Mutex::new(Lifecycle {
                    running: false,
                    stopped: false,
                    generation: 0,
                    shutdown: CancellationToken::new(),
                    timer: None,
                }),
                idle: Notify::new(),
                last_run: RwLock::new(None),
            }),
        }
    }

    /// Starts the repeating timer
    ///
    /// One cycle is triggered immediately, then one every interval. Calling
    /// this while already started does nothing.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lock();

        if lifecycle.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!("Scheduler already started");
            return;
        }

        if lifecycle.shutdown.is_cancelled() {
            lifecycle.shutdown = CancellationToken::new();
        }
        lifecycle.stopped = false;
        lifecycle.generation += 1;

        let interval = self.inner.context.config().collection_interval();
        let shutdown = lifecycle.shutdown.clone();
        let inner = self.inner.clone();

        tracing::info!(
            interval_secs = interval.as_secs(),
            "Starting collection scheduler"
        );
        lifecycle.timer = Some(tokio::spawn(async move {
            inner.timer_loop(interval, shutdown).await;
        }));
    }

    /// Stops the timer and waits for any in-flight cycle to finish
    ///
    /// No coin tasks are dispatched after this is called; tasks already
    /// running complete normally. Safe to call more than once.
    pub async fn stop(&self) {
        let (timer, generation) = {
            let mut lifecycle = self.inner.lock();
            lifecycle.shutdown.cancel();
            (lifecycle.timer.take(), lifecycle.generation)
        };

        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                tracing::error!(error = %e, "Scheduler timer task failed");
            }
        }

        self.inner.wait_idle().await;

        let mut lifecycle = self.inner.lock();
        if lifecycle.generation != generation {
            tracing::debug!("Scheduler restarted while stopping, staying started");
            return;
        }
        lifecycle.stopped = true;
        drop(lifecycle);
        tracing::info!("Collection scheduler stopped");
    }

    /// Current scheduler state
    pub fn state(&self) -> SchedulerState {
        let lifecycle = self.inner.lock();
        if lifecycle.running {
            SchedulerState::Running
        } else if lifecycle.stopped {
            SchedulerState::Stopped
        } else {
            SchedulerState::Idle
        }
    }

    /// Starts a cycle in the background right away
    ///
    /// Returns the new run's id, or `ConcurrentRunRejected` if a cycle is
    /// already running, or `SchedulerStopped` after `stop`.
    pub fn trigger_cycle_now(&self) -> Result<Uuid, AgentError> {
        self.inner.trigger()
    }

    /// Runs one cycle to completion and returns its record
    pub async fn run_cycle(&self) -> Result<CollectionRun, AgentError> {
        let (guard, run, cancel) = self.inner.begin()?;
        let run = self.inner.execute(run, &cancel).await;
        drop(guard);
        Ok(run)
    }

    /// Health of every registered collector
    pub async fn collector_health_snapshot(&self) -> HashMap<String, CollectorHealth> {
        self.inner.router.health_snapshot().await
    }

    /// The most recently finished run, if any
    pub async fn last_run(&self) -> Option<CollectionRun> {
        self.inner.last_run.read().await.clone()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Idle → Running, synchronously
    fn begin(
        self: &Arc<Self>,
    ) -> Result<(RunningGuard, CollectionRun, CancellationToken), AgentError> {
        let mut lifecycle = self.lock();

        if lifecycle.stopped || lifecycle.shutdown.is_cancelled() {
            return Err(AgentError::SchedulerStopped);
        }
        if lifecycle.running {
            tracing::warn!("Collection cycle skipped: previous run still in progress");
            return Err(AgentError::ConcurrentRunRejected);
        }

        lifecycle.running = true;
        let guard = RunningGuard {
            inner: self.clone(),
        };
        Ok((guard, CollectionRun::start(), lifecycle.shutdown.clone()))
    }

    fn trigger(self: &Arc<Self>) -> Result<Uuid, AgentError> {
        let (guard, run, cancel) = self.begin()?;
        let id = run.id;
        let inner = self.clone();

        tokio::spawn(async move {
            inner.execute(run, &cancel).await;
            drop(guard);
        });

        Ok(id)
    }

    async fn timer_loop(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.trigger() {
                        Ok(run_id) => tracing::debug!(%run_id, "Scheduled collection cycle triggered"),
                        Err(AgentError::ConcurrentRunRejected) => {}
                        Err(e) => tracing::debug!(error = %e, "Scheduled collection cycle not started"),
                    }
                }
            }
        }

        tracing::debug!("Scheduler timer loop exited");
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let running = self.lock().running;
            if !running {
                return;
            }
            notified.await;
        }
    }

    /// Runs the body of a cycle; never fails, failures end up in the record
    async fn execute(&self, mut run: CollectionRun, cancel: &CancellationToken) -> CollectionRun {
        tracing::info!(run_id = %run.id, "Collection run started");

        let coins = match self.storage.list_active_coins().await {
            Ok(coins) => coins,
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Failed to list active coins");
                return self.finish(run.fail(AgentError::from(e))).await;
            }
        };
        run.total_coins = coins.len();

        let limits = self.context.limits();
        let mut groups: Vec<TaskGroup<Routed<TransactionMetrics>, AgentError>> = Vec::new();
        // Coin positions for each group's tasks, in task order
        let mut positions: Vec<Vec<usize>> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        let mut outcomes: Vec<Option<Result<Routed<TransactionMetrics>, AgentError>>> =
            (0..coins.len()).map(|_| None).collect();

        for (position, coin) in coins.iter().enumerate() {
            let source = match self.router.resolve(coin).await {
                Ok(source) => source,
                Err(e) => {
                    tracing::error!(coin = %coin.symbol, error = %e, "Coin has no eligible collector");
                    outcomes[position] = Some(Err(e));
                    continue;
                }
            };

            let gi = match group_index.get(&source) {
                Some(gi) => *gi,
                None => {
                    groups.push(
                        TaskGroup::new(source.as_str(), limits.cap(&source)),
                    );
                    positions.push(Vec::new());
                    group_index.insert(source, groups.len() - 1);
                    groups.len() - 1
                }
            };

            let router = self.router.clone();
            let coin = coin.clone();
            groups[gi].push(task(move || async move {
                router.collect_transaction_metrics(&coin).await
            }));
            positions[gi].push(position);
        }

        for group in &groups {
            tracing::debug!(
                source = %group.name,
                coins = group.tasks.len(),
                concurrency = group.limit,
                "Dispatching collection group"
            );
        }

        let batched = match run_batched(groups, cancel).await {
            Ok(batched) => batched,
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Collection dispatch failed");
                return self.finish(run.fail(AgentError::from(e))).await;
            }
        };

        let mut skipped = Vec::new();
        for (group, group_positions) in batched.into_iter().zip(positions) {
            for (result, position) in group.results.into_iter().zip(group_positions) {
                match result {
                    Ok(routed) => outcomes[position] = Some(Ok(routed)),
                    Err(TaskError::Failed(e)) => outcomes[position] = Some(Err(e)),
                    Err(TaskError::Cancelled) => skipped.push(position),
                }
            }
        }
        run.skipped_coins = skipped.len();

        let mut unsaved: Vec<&str> = Vec::new();
        for (coin, outcome) in coins.iter().zip(outcomes) {
            match outcome {
                Some(Ok(routed)) => {
                    if let Err(e) = self
                        .storage
                        .save_metric_result(&coin.symbol, &routed.value)
                        .await
                    {
                        tracing::error!(coin = %coin.symbol, error = %e, "Failed to persist metrics");
                        run.record_failure(&coin.symbol, AgentError::from(e));
                        unsaved.push(&coin.symbol);
                        continue;
                    }
                    tracing::debug!(
                        coin = %coin.symbol,
                        collector = %routed.collector,
                        confidence = ?routed.value.confidence,
                        "Collected transaction metrics"
                    );
                    run.successful_coins += 1;
                }
                Some(Err(e)) => {
                    tracing::warn!(coin = %coin.symbol, error = %e, "Coin collection failed");
                    run.record_failure(&coin.symbol, &e);
                }
                None => {}
            }
        }

        if run.skipped_coins > 0 {
            tracing::info!(
                run_id = %run.id,
                skipped = run.skipped_coins,
                "Shutdown requested, remaining coins not dispatched"
            );
        }

        if !unsaved.is_empty() {
            let summary = format!("failed to persist metrics for {}", unsaved.join(", "));
            return self.finish(run.fail(summary)).await;
        }

        self.finish(run.complete()).await
    }

    async fn finish(&self, run: CollectionRun) -> CollectionRun {
        let run = match self.storage.record_collection_run(&run).await {
            Ok(()) => run,
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Failed to record collection run");
                let message = match &run.error {
                    Some(previous) => format!("{}; failed to record run: {}", previous, e),
                    None => format!("failed to record run: {}", e),
                };
                run.fail(message)
            }
        };

        tracing::info!(
            run_id = %run.id,
            status = ?run.status,
            total = run.total_coins,
            successful = run.successful_coins,
            failed = run.failed_coins,
            skipped = run.skipped_coins,
            duration_ms = run.duration_ms.unwrap_or_default(),
            "Collection run finished"
        );

        *self.last_run.write().await = Some(run.clone());
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockCollector;
    use crate::collector::Collector;
    use crate::config::AgentConfig;
    use crate::error::{CollectorError, StorageError};
    use crate::storage::InMemoryStorage;
    use crate::types::{Coin, RunStatus};
    use async_trait::async_trait;
    use tokio::time::{sleep, Instant};

    fn context(caps: &[(&str, usize)]) -> Arc<AgentContext> {
        let config = AgentConfig {
            collection_interval_minutes: 1,
            concurrency_caps: caps.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
            request_spacing_ms: HashMap::new(),
            ..AgentConfig::default()
        };
        AgentContext::init(config).unwrap()
    }

    fn coins(symbols: &[&str]) -> Vec<Coin> {
        symbols.iter().map(|s| Coin::new(*s, *s)).collect()
    }

    fn scheduler(
        context: &Arc<AgentContext>,
        collectors: Vec<Arc<dyn Collector>>,
        storage: Arc<InMemoryStorage>,
    ) -> CollectionScheduler {
        let router = Arc::new(CollectorRouter::from_context(collectors, context));
        CollectionScheduler::new(context.clone(), router, storage)
    }

    const ELEVEN: [&str; 11] = [
        "BTC", "ETH", "DASH", "DGB", "XMR", "RVN", "XCH", "XEC", "XNO", "NEAR", "ICP",
    ];

    #[tokio::test]
    async fn test_cycle_persists_results_and_run() {
        let ctx = context(&[]);
        let primary = Arc::new(
            MockCollector::new("primary", 1, ctx.health()).supporting(&["BTC", "ETH"]),
        );
        let backup = Arc::new(MockCollector::new("backup", 2, ctx.health()).supporting(&["XMR"]));
        let storage = Arc::new(InMemoryStorage::new(coins(&["BTC", "ETH", "XMR"])));
        let scheduler = scheduler(&ctx, vec![primary, backup], storage.clone());

        let run = scheduler.run_cycle().await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_coins, 3);
        assert_eq!(run.successful_coins, 3);
        assert_eq!(run.failed_coins, 0);
        assert!(run.duration_ms.is_some());
        assert_eq!(
            storage.latest_metrics("XMR").await.unwrap().sources,
            vec!["backup".to_string()]
        );
        assert_eq!(storage.runs().await.len(), 1);
        assert_eq!(scheduler.last_run().await.unwrap().id, run.id);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_coin_failures_do_not_fail_run() {
        let ctx = context(&[]);
        let only = Arc::new(MockCollector::new("only", 1, ctx.health()).supporting(&["BTC", "ETH"]));
        only.set_error("ETH", CollectorError::unavailable("HTTP 502"));
        let storage = Arc::new(InMemoryStorage::new(coins(&["BTC", "ETH", "ICP"])));
        let scheduler = scheduler(&ctx, vec![only], storage.clone());

        let run = scheduler.run_cycle().await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.successful_coins, 1);
        assert_eq!(run.failed_coins, 2);
        assert!(run.error.is_none());
        assert_eq!(run.failures[0].coin, "ETH");
        assert!(run.failures[0].error.contains("HTTP 502"));
        assert_eq!(run.failures[1].coin, "ICP");
        assert!(run.failures[1].error.contains("Configuration error"));
        assert!(storage.latest_metrics("ETH").await.is_none());
    }

    struct UnreachableStorage;

    #[async_trait]
    impl MetricsStorage for UnreachableStorage {
        async fn list_active_coins(&self) -> Result<Vec<Coin>, StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }

        async fn save_metric_result(
            &self,
            _coin_symbol: &str,
            _metrics: &TransactionMetrics,
        ) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }

        async fn record_collection_run(&self, _run: &CollectionRun) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_storage_failure_fails_run_and_returns_to_idle() {
        let ctx = context(&[]);
        let only = Arc::new(MockCollector::new("only", 1, ctx.health()).supporting(&["BTC"]));
        let router = Arc::new(CollectorRouter::new(vec![only], ctx.health()));
        let scheduler = CollectionScheduler::new(ctx.clone(), router, Arc::new(UnreachableStorage));

        let run = scheduler.run_cycle().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.last_run().await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleven_coins_cap_three() {
        let ctx = context(&[("bulk", 3)]);
        let bulk = Arc::new(
            MockCollector::new("bulk", 1, ctx.health())
                .supporting(&ELEVEN)
                .with_delay(Duration::from_secs(2)),
        );
        let storage = Arc::new(InMemoryStorage::new(coins(&ELEVEN)));
        let scheduler = scheduler(&ctx, vec![bulk.clone()], storage);

        let start = Instant::now();
        let run = scheduler.run_cycle().await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(8));
        assert_eq!(bulk.peak_in_flight(), 3);
        assert_eq!(run.successful_coins, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_bounded_independently() {
        let ctx = context(&[("strict", 1), ("bulk", 5)]);
        let strict = Arc::new(
            MockCollector::new("strict", 1, ctx.health())
                .supporting(&["BTC", "ETH", "DASH"])
                .with_delay(Duration::from_secs(1)),
        );
        let bulk = Arc::new(
            MockCollector::new("bulk", 1, ctx.health())
                .supporting(&["XMR", "RVN", "XCH", "XEC", "XNO"])
                .with_delay(Duration::from_secs(1)),
        );
        let storage = Arc::new(InMemoryStorage::new(coins(&[
            "BTC", "XMR", "ETH", "RVN", "DASH", "XCH", "XEC", "XNO",
        ])));
        let scheduler = scheduler(&ctx, vec![strict.clone(), bulk.clone()], storage);

        let start = Instant::now();
        scheduler.run_cycle().await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(strict.peak_in_flight(), 1);
        assert_eq!(bulk.peak_in_flight(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_trigger_rejected() {
        let ctx = context(&[]);
        let slow = Arc::new(
            MockCollector::new("slow", 1, ctx.health())
                .supporting(&["BTC", "ETH"])
                .with_delay(Duration::from_secs(5)),
        );
        let storage = Arc::new(InMemoryStorage::new(coins(&["BTC", "ETH"])));
        let scheduler = scheduler(&ctx, vec![slow], storage.clone());

        scheduler.trigger_cycle_now().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(
            scheduler.trigger_cycle_now(),
            Err(AgentError::ConcurrentRunRejected)
        );
        assert!(matches!(
            scheduler.run_cycle().await,
            Err(AgentError::ConcurrentRunRejected)
        ));

        sleep(Duration::from_secs(20)).await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(storage.runs().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_cycle_lets_in_flight_finish() {
        let ctx = context(&[]);
        let slow = Arc::new(
            MockCollector::new("slow", 1, ctx.health())
                .supporting(&["BTC", "ETH", "DASH", "DGB", "XMR", "RVN"])
                .with_delay(Duration::from_secs(1)),
        );
        let storage = Arc::new(InMemoryStorage::new(coins(&[
            "BTC", "ETH", "DASH", "DGB", "XMR", "RVN",
        ])));
        let scheduler = scheduler(&ctx, vec![slow.clone()], storage.clone());

        scheduler.start();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(scheduler.state(), SchedulerState::Running);

        scheduler.stop().await;

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        let runs = storage.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].successful_coins, 2);
        assert_eq!(runs[0].skipped_coins, 4);
        assert_eq!(slow.call_count(), 2);

        sleep(Duration::from_secs(600)).await;
        assert_eq!(storage.runs().await.len(), 1);
        assert_eq!(
            scheduler.trigger_cycle_now(),
            Err(AgentError::SchedulerStopped)
        );

        // Stopping again is harmless
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_immediately_then_every_interval() {
        let ctx = context(&[]);
        let fast = Arc::new(MockCollector::new("fast", 1, ctx.health()).supporting(&["BTC"]));
        let storage = Arc::new(InMemoryStorage::new(coins(&["BTC"])));
        let scheduler = scheduler(&ctx, vec![fast], storage.clone());

        scheduler.start();
        scheduler.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(storage.runs().await.len(), 1);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(storage.runs().await.len(), 2);

        scheduler.stop().await;
        sleep(Duration::from_secs(300)).await;
        assert_eq!(storage.runs().await.len(), 2);

        // Restart from Stopped
        scheduler.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(storage.runs().await.len(), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_skips_tick_while_running() {
        let ctx = context(&[]);
        // Each cycle outlasts the one-minute interval
        let slow = Arc::new(
            MockCollector::new("slow", 1, ctx.health())
                .supporting(&["BTC"])
                .with_delay(Duration::from_secs(90)),
        );
        let storage = Arc::new(InMemoryStorage::new(coins(&["BTC"])));
        let scheduler = scheduler(&ctx, vec![slow.clone()], storage.clone());

        scheduler.start();
        sleep(Duration::from_secs(100)).await;

        // Tick at 60s was skipped; first run finished at 90s
        assert_eq!(storage.runs().await.len(), 1);
        assert_eq!(slow.call_count(), 1);

        sleep(Duration::from_secs(30)).await;
        // Tick at 120s started a second run
        assert_eq!(slow.call_count(), 2);
        scheduler.stop().await;
        assert_eq!(storage.runs().await.len(), 2);
    }

    #[tokio::test]
    async fn test_health_snapshot_reflects_fallback() {
        let ctx = context(&[]);
        let p1 = Arc::new(MockCollector::new("p1", 1, ctx.health()).supporting(&["BTC"]));
        let p2 = Arc::new(MockCollector::new("p2", 2, ctx.health()).supporting(&["BTC"]));
        p1.set_error("BTC", CollectorError::malformed("unexpected payload"));
        let storage = Arc::new(InMemoryStorage::new(coins(&["BTC"])));
        let scheduler = scheduler(&ctx, vec![p1, p2], storage.clone());

        let run = scheduler.run_cycle().await.unwrap();
        assert_eq!(run.successful_coins, 1);

        let snapshot = scheduler.collector_health_snapshot().await;
        assert_eq!(snapshot["p1"].failed_attempts, 1);
        assert_eq!(snapshot["p2"].failed_attempts, 0);
        assert_eq!(
            storage.latest_metrics("BTC").await.unwrap().sources,
            vec!["p2".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_counts_against_fallback_source_cap() {
        let ctx = context(&[("bulk", 3), ("gecko", 1)]);
        let bulk = Arc::new(
            MockCollector::new("bulk", 1, ctx.health())
                .supporting(&["BTC", "ETH", "DASH"])
                .with_delay(Duration::from_secs(1)),
        );
        for symbol in ["BTC", "ETH", "DASH"] {
            bulk.set_error(symbol, CollectorError::unavailable("HTTP 503"));
        }
        let gecko = Arc::new(
            MockCollector::new("gecko", 2, ctx.health())
                .supporting(&["BTC", "ETH", "DASH", "XMR", "RVN"])
                .with_delay(Duration::from_secs(5)),
        );
        let storage = Arc::new(InMemoryStorage::new(coins(&["BTC", "ETH", "DASH", "XMR", "RVN"])));
        let scheduler = scheduler(&ctx, vec![bulk, gecko.clone()], storage);

        let start = Instant::now();
        let run = scheduler.run_cycle().await.unwrap();

        assert_eq!(run.successful_coins, 5);
        assert_eq!(gecko.peak_in_flight(), 1);
        assert_eq!(gecko.call_count(), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(25));
    }

    /// Wraps in-memory storage, failing selected writes
    struct FlakyStorage {
        inner: InMemoryStorage,
        reject_coin: Option<&'static str>,
        reject_runs: bool,
    }

    #[async_trait]
    impl MetricsStorage for FlakyStorage {
        async fn list_active_coins(&self) -> Result<Vec<Coin>, StorageError> {
            self.inner.list_active_coins().await
        }

        async fn save_metric_result(
            &self,
            coin_symbol: &str,
            metrics: &TransactionMetrics,
        ) -> Result<(), StorageError> {
            if self.reject_coin == Some(coin_symbol) {
                return Err(StorageError::Unavailable("write timeout".to_string()));
            }
            self.inner.save_metric_result(coin_symbol, metrics).await
        }

        async fn record_collection_run(&self, run: &CollectionRun) -> Result<(), StorageError> {
            if self.reject_runs {
                return Err(StorageError::Unavailable("runs table locked".to_string()));
            }
            self.inner.record_collection_run(run).await
        }
    }

    #[tokio::test]
    async fn test_unrecorded_run_is_reported_failed() {
        let ctx = context(&[]);
        let only = Arc::new(MockCollector::new("only", 1, ctx.health()).supporting(&["BTC"]));
        let storage = Arc::new(FlakyStorage {
            inner: InMemoryStorage::new(coins(&["BTC"])),
            reject_coin: None,
            reject_runs: true,
        });
        let router = Arc::new(CollectorRouter::from_context(vec![only], &ctx));
        let scheduler = CollectionScheduler::new(ctx.clone(), router, storage.clone());

        let run = scheduler.run_cycle().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.successful_coins, 1);
        assert!(run.error.as_deref().unwrap().contains("runs table locked"));
        let last = scheduler.last_run().await.unwrap();
        assert_eq!(last.status, RunStatus::Failed);
        assert!(storage.inner.latest_metrics("BTC").await.is_some());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_tallying_other_coins() {
        let ctx = context(&[]);
        let only = Arc::new(
            MockCollector::new("only", 1, ctx.health()).supporting(&["BTC", "ETH", "XMR"]),
        );
        only.set_error("XMR", CollectorError::malformed("empty body"));
        let storage = Arc::new(FlakyStorage {
            inner: InMemoryStorage::new(coins(&["BTC", "ETH", "DASH", "XMR"])),
            reject_coin: Some("ETH"),
            reject_runs: false,
        });
        let router = Arc::new(CollectorRouter::from_context(vec![only], &ctx));
        let scheduler = CollectionScheduler::new(ctx.clone(), router, storage.clone());

        let run = scheduler.run_cycle().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.total_coins, 4);
        assert_eq!(run.successful_coins, 1);
        assert_eq!(run.failed_coins, 3);
        let failed: Vec<&str> = run.failures.iter().map(|f| f.coin.as_str()).collect();
        assert_eq!(failed, vec!["ETH", "DASH", "XMR"]);
        assert!(run.failures[0].error.contains("write timeout"));
        assert!(run.failures[2].error.contains("empty body"));
        assert_eq!(
            run.error.as_deref(),
            Some("failed to persist metrics for ETH")
        );
        assert!(storage.inner.latest_metrics("BTC").await.is_some());
        assert_eq!(storage.inner.runs().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_during_stop_stays_started() {
        let ctx = context(&[]);
        let slow = Arc::new(
            MockCollector::new("slow", 1, ctx.health())
                .supporting(&["BTC"])
                .with_delay(Duration::from_secs(10)),
        );
        let storage = Arc::new(InMemoryStorage::new(coins(&["BTC"])));
        let scheduler = Arc::new(scheduler(&ctx, vec![slow.clone()], storage.clone()));

        scheduler.start();
        sleep(Duration::from_secs(1)).await;

        let stopping = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.stop().await })
        };
        sleep(Duration::from_secs(1)).await;
        assert!(!stopping.is_finished());

        // The first cycle is still running, so the new timer's first tick is rejected
        scheduler.start();
        stopping.await.unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(storage.runs().await.len(), 1);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(slow.call_count(), 2);
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
