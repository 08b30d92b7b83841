//! The message processor: a fixed pool of workers that reserve delivery
//! jobs from the main queue, invoke the channel handler, and drive the
//! attempt state machine.
//!
//! All retry scheduling is carried by the store's DELAYED state; a worker
//! never sleeps on behalf of a job. Failures inside a single attempt never
//! crash a worker — only sustained store unavailability stops the loop, after
//! a bounded back-off, leaving restart to the supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::backoff::{delay_ms, DEAD_LETTER_QUEUE, MAIN_QUEUE, MAX_ATTEMPTS};
use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::error::Error;
use crate::job::JobRecord;
use crate::store::JobStore;

/// Consecutive store failures a worker tolerates before giving up.
const STORE_FAILURE_CEILING: i64 = 5;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub reaper_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(250),
            stale_after: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency(),
            poll_interval: Duration::from_millis(config.poll_interval_ms()),
            stale_after: Duration::from_secs(config.stale_reservation_secs()),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Lifetime counters for a pool, shared across its workers.
#[derive(Debug, Default)]
pub struct PoolStats {
    processed: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatsSnapshot {
    pub processed: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// What a single processing pass did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Retried { delay_ms: u64 },
    DeadLettered,
}

/// Processes one reserved job to its next state.
///
/// Public so that tests and synchronous callers can drive the state machine
/// without a running pool. Errors are store errors only; delivery failures
/// are absorbed into the returned outcome.
pub async fn process_one(
    store: &JobStore,
    registry: &ChannelRegistry,
    job: &JobRecord,
) -> Result<Outcome, Error> {
    let message = &job.message;
    let attempt = job.attempt_count;

    tracing::info!(
        job_id = job.id,
        message_id = %message.id,
        channel = %message.channel,
        attempt,
        max_attempts = MAX_ATTEMPTS,
        "processing delivery job"
    );

    match registry.deliver(message).await {
        Ok(()) => {
            store.complete(job.id).await?;
            tracing::info!(job_id = job.id, message_id = %message.id, "message delivered");
            Ok(Outcome::Delivered)
        }
        Err(e) if e.is_terminal() => {
            // No handler for the channel: terminal on first occurrence.
            tracing::error!(
                job_id = job.id,
                message_id = %message.id,
                error = %e,
                "channel unresolvable, moving to dead letter"
            );
            store.move_to_dead_letter(job.id, &e.to_string()).await?;
            Ok(Outcome::DeadLettered)
        }
        Err(e) => {
            let reason = e.to_string();

            if attempt >= MAX_ATTEMPTS {
                store.move_to_dead_letter(job.id, &reason).await?;
                tracing::error!(
                    job_id = job.id,
                    message_id = %message.id,
                    attempt,
                    error = %reason,
                    "delivery failed permanently, moving to dead letter"
                );
                Ok(Outcome::DeadLettered)
            } else {
                let delay = delay_ms(attempt + 1);
                store.fail(job.id, &reason, delay, attempt + 1).await?;
                tracing::warn!(
                    job_id = job.id,
                    message_id = %message.id,
                    attempt,
                    retry_in_ms = delay,
                    error = %reason,
                    "delivery failed, retry scheduled"
                );
                Ok(Outcome::Retried { delay_ms: delay })
            }
        }
    }
}

pub struct WorkerPool {
    store: JobStore,
    registry: Arc<ChannelRegistry>,
    config: WorkerPoolConfig,
}

pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    supervisor: tokio::task::JoinHandle<()>,
    stats: Arc<PoolStats>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Graceful shutdown: reservations stop, in-flight jobs drain. Past the
    /// grace deadline the workers are aborted and any in-flight job stays
    /// ACTIVE in the store until the stale-reservation reaper resets it.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);

        if tokio::time::timeout(grace, &mut self.supervisor)
            .await
            .is_err()
        {
            tracing::warn!("worker pool did not drain in time, aborting");
            self.supervisor.abort();
        }
    }
}

impl WorkerPool {
    pub fn new(store: JobStore, registry: Arc<ChannelRegistry>, config: WorkerPoolConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(PoolStats::default());

        let supervisor = tokio::spawn(supervise(
            self.store,
            self.registry,
            self.config,
            shutdown_rx,
            stats.clone(),
        ));

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            supervisor,
            stats,
        }
    }
}

async fn supervise(
    store: JobStore,
    registry: Arc<ChannelRegistry>,
    config: WorkerPoolConfig,
    shutdown: watch::Receiver<bool>,
    stats: Arc<PoolStats>,
) {
    tracing::info!(concurrency = config.concurrency, "worker pool started");

    let mut pool = JoinSet::new();

    for index in 0..config.concurrency {
        pool.spawn(worker_loop(
            store.clone(),
            registry.clone(),
            config.clone(),
            shutdown.clone(),
            stats.clone(),
            index,
        ));
    }

    pool.spawn(reaper_loop(store.clone(), config.clone(), shutdown.clone()));

    while let Some(res) = pool.join_next().await {
        if let Err(e) = res {
            tracing::error!("failed joining worker task: {e}");
        }
    }

    tracing::info!("worker pool stopped");
}

async fn worker_loop(
    store: JobStore,
    registry: Arc<ChannelRegistry>,
    config: WorkerPoolConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<PoolStats>,
    index: usize,
) {
    let worker_id = format!("worker-{index}");
    let mut store_failures: i64 = 0;

    tracing::debug!(worker = %worker_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = match store.reserve(MAIN_QUEUE, &worker_id).await {
            Ok(job) => {
                store_failures = 0;
                job
            }
            Err(e) => {
                store_failures += 1;
                if store_failures >= STORE_FAILURE_CEILING {
                    tracing::error!(worker = %worker_id, error = %e, "job store unavailable, stopping worker");
                    break;
                }

                tracing::warn!(worker = %worker_id, error = %e, "job store error, backing off");
                let wait = Duration::from_millis(delay_ms(store_failures));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        match job {
            Some(job) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);

                match process_one(&store, &registry, &job).await {
                    Ok(Outcome::Delivered) => {
                        stats.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Outcome::Retried { .. }) => {
                        stats.retried.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Outcome::DeadLettered) => {
                        stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        // The job stays ACTIVE; the reaper returns it to the
                        // queue once the reservation goes stale.
                        store_failures += 1;
                        tracing::warn!(
                            worker = %worker_id,
                            job_id = job.id,
                            error = %e,
                            "store error while recording attempt outcome"
                        );
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    tracing::debug!(worker = %worker_id, "worker stopped");
}

async fn reaper_loop(store: JobStore, config: WorkerPoolConfig, mut shutdown: watch::Receiver<bool>) {
    let threshold_ms = config.stale_after.as_millis() as i64;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.reaper_interval) => {}
            _ = shutdown.changed() => {}
        }

        if *shutdown.borrow() {
            break;
        }

        for queue in [MAIN_QUEUE, DEAD_LETTER_QUEUE] {
            match store.reap_stale(queue, threshold_ms).await {
                Ok(0) => {}
                Ok(reset) => {
                    tracing::warn!(queue, reset, "reset stale reservations");
                }
                Err(e) => {
                    tracing::warn!(queue, error = %e, "failed reaping stale reservations");
                }
            }
        }
    }
}
