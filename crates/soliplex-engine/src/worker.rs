//! Worker runtime: claims steps, executes handlers with bounded
//! concurrency, heartbeats, and shuts down gracefully.
//!
//! A worker process owns one `Worker`. Multiple worker processes run in
//! parallel and coordinate only through the persistence layer.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use soliplex_core::IngesterConfig;

use crate::dispatch::Dispatcher;
use crate::error::EngineError;

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task pool size: maximum concurrently executing steps
    pub concurrency: usize,

    /// Steps claimed per poll
    pub claim_batch_size: usize,

    /// Check-in upsert interval
    pub heartbeat_interval: Duration,

    /// Check-in age beyond which another worker's claim counts as stale
    pub stale_worker_timeout: Duration,

    /// Sleep between empty polls (jittered)
    pub poll_interval: Duration,

    /// Grace period for in-flight steps at shutdown
    pub drain_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            concurrency: 10,
            claim_batch_size: 5,
            heartbeat_interval: Duration::from_secs(120),
            stale_worker_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            drain_deadline: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the runtime knobs from process configuration.
    pub fn from_ingester(config: &IngesterConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            claim_batch_size: config.claim_batch_size.max(1),
            heartbeat_interval: config.heartbeat_interval,
            stale_worker_timeout: config.stale_worker_timeout,
            poll_interval: config.poll_interval,
            drain_deadline: config.drain_deadline,
            ..Self::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }
}

/// A long-running worker with cooperative single-threaded concurrency.
pub struct Worker {
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(dispatcher: Arc<Dispatcher>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            dispatcher,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Signal the worker to stop claiming and drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A handle that can signal shutdown from another task.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown is signalled.
    ///
    /// On startup: heartbeat, then reclaim steps stranded by stale workers
    /// (crash recovery). Then the main loop: claim up to the free pool
    /// slots, dispatch each claimed step, and sleep with jitter when idle.
    /// On shutdown: stop claiming, wait up to the drain deadline, then
    /// cancel the rest; cancelled steps stay running for reclaim.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(&self) -> Result<(), EngineError> {
        let store = self.dispatcher.store().clone();
        let worker_id = self.config.worker_id.clone();

        info!(
            concurrency = self.config.concurrency,
            claim_batch_size = self.config.claim_batch_size,
            "worker starting"
        );

        // Check in before claiming anything so our own claims are never
        // considered stale.
        store.worker_heartbeat(&worker_id).await?;

        let reclaimed = store
            .reclaim_stale_steps(self.config.stale_worker_timeout)
            .await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed steps from stale workers");
        }

        let heartbeat = spawn_heartbeat_loop(
            store.clone(),
            worker_id.clone(),
            self.config.heartbeat_interval,
            self.shutdown_rx.clone(),
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        while !*shutdown_rx.borrow() {
            // Reap finished tasks without blocking the loop
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("step task panicked");
                    }
                }
            }

            let free = semaphore.available_permits();
            let mut claimed_count = 0;

            if free > 0 {
                let limit = free.min(self.config.claim_batch_size);
                match self.dispatcher.claim(&worker_id, limit).await {
                    Ok(claimed) => {
                        claimed_count = claimed.len();
                        for step in claimed {
                            let permit = match semaphore.clone().try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    debug!("no permits available");
                                    break;
                                }
                            };

                            let dispatcher = Arc::clone(&self.dispatcher);
                            let wid = worker_id.clone();
                            let step_id = step.step_id;
                            let retry = step.retry;

                            tasks.spawn(async move {
                                let result = std::panic::AssertUnwindSafe(
                                    dispatcher.execute(&wid, step),
                                )
                                .catch_unwind()
                                .await;

                                match result {
                                    Ok(Ok(())) => {}
                                    Ok(Err(e)) => {
                                        // The advance did not persist; the
                                        // step stays running and crash
                                        // recovery will reclaim it.
                                        error!(%step_id, error = %e, "failed to advance step");
                                    }
                                    Err(_) => {
                                        // A panicking handler is an
                                        // untyped failure: retryable.
                                        warn!(%step_id, "handler panicked, reporting retryable failure");
                                        if let Err(e) =
                                            dispatcher.fail_panicked(&wid, step_id, retry).await
                                        {
                                            error!(%step_id, error = %e, "failed to record panic");
                                        }
                                    }
                                }

                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "claim failed");
                    }
                }
            }

            if claimed_count == 0 {
                let sleep = jittered(self.config.poll_interval);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }

        info!("worker draining");
        let drained = drain(&mut tasks, self.config.drain_deadline).await;
        if !drained {
            warn!(remaining = tasks.len(), "drain deadline reached, cancelling in-flight steps");
            // Aborted steps are left running; stale-worker recovery picks
            // them up once our check-in ages out.
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        heartbeat.abort();
        store.remove_worker(&worker_id).await?;

        info!("worker stopped");
        Ok(())
    }
}

/// Wait for all in-flight tasks, up to the deadline. Returns whether the
/// set fully drained.
async fn drain(tasks: &mut JoinSet<()>, deadline: Duration) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while !tasks.is_empty() {
        tokio::select! {
            _ = tasks.join_next() => {}
            _ = tokio::time::sleep_until(end) => return tasks.is_empty(),
        }
    }
    true
}

fn spawn_heartbeat_loop(
    store: Arc<dyn soliplex_storage::IngestStore>,
    worker_id: String,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The startup heartbeat already happened
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = store.worker_heartbeat(&worker_id).await {
                        error!(error = %e, "heartbeat failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("heartbeat loop: shutdown requested");
                    break;
                }
            }
        }
    })
}

/// Poll sleep with +/-50% jitter so idle workers do not stampede.
fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.claim_batch_size, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(120));
        assert_eq!(config.stale_worker_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new()
            .with_worker_id("test-worker")
            .with_concurrency(1)
            .with_claim_batch_size(3)
            .with_poll_interval(Duration::from_millis(50));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.claim_batch_size, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_from_ingester_clamps_zero() {
        let mut ingester = IngesterConfig::with_database_url("postgres://x");
        ingester.worker_concurrency = 0;
        ingester.claim_batch_size = 0;

        let config = WorkerConfig::from_ingester(&ingester);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.claim_batch_size, 1);
    }

    #[test]
    fn test_jitter_window() {
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(1));
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1500));
        }
    }
}
