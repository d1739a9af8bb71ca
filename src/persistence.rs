//! Bounded asynchronous persistence.
//!
//! Raw readings and billing snapshots are written to the store by a fixed
//! set of workers reading one bounded queue. Ingest never waits on the
//! queue: when it is full the job is dropped, logged and counted.

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::models::{BillingSnapshot, Reading};
use crate::store::Store;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum PersistJob {
    Reading(Reading),
    Snapshot(BillingSnapshot),
}

impl PersistJob {
    fn home_id(&self) -> &str {
        match self {
            PersistJob::Reading(r) => &r.home_id,
            PersistJob::Snapshot(s) => &s.home_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PersistJob::Reading(_) => "reading",
            PersistJob::Snapshot(_) => "snapshot",
        }
    }

    async fn write(&self, store: &dyn Store) -> Result<()> {
        match self {
            PersistJob::Reading(r) => store.save_reading(r).await,
            PersistJob::Snapshot(s) => store.save_snapshot(s).await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&PersistenceConfig> for RetryPolicy {
    fn from(cfg: &PersistenceConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying transient failures with exponential backoff.
    /// Once `shutdown` is set no further attempt is scheduled.
    pub async fn run<T, F, Fut>(&self, shutdown: &mut watch::Receiver<bool>, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.is_transient() || attempt >= self.max_retries || *shutdown.borrow() {
                return Err(err);
            }
            attempt += 1;
            debug!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|s| *s) => return Err(err),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }
}

/// Cheap, cloneable submission side of the pool.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistJob>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<EngineMetrics>,
}

impl PersistenceHandle {
    /// Queue a job without waiting. Returns false if it was dropped.
    pub fn submit(&self, job: PersistJob) -> bool {
        if *self.shutdown.borrow() {
            debug!(
                home_id = %job.home_id(),
                kind = job.kind(),
                "shutdown in progress; not persisting"
            );
            EngineMetrics::incr(&self.metrics.persist_dropped);
            return false;
        }
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(
                    home_id = %job.home_id(),
                    kind = job.kind(),
                    "persistence queue full; dropping job"
                );
                EngineMetrics::incr(&self.metrics.persist_dropped);
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(
                    home_id = %job.home_id(),
                    kind = job.kind(),
                    "persistence pool stopped; dropping job"
                );
                EngineMetrics::incr(&self.metrics.persist_dropped);
                false
            }
        }
    }

    pub fn submit_reading(&self, reading: Reading) -> bool {
        self.submit(PersistJob::Reading(reading))
    }

    pub fn submit_snapshot(&self, snapshot: BillingSnapshot) -> bool {
        self.submit(PersistJob::Snapshot(snapshot))
    }
}

pub struct PersistencePool {
    handle: PersistenceHandle,
    workers: Vec<JoinHandle<()>>,
}

impl PersistencePool {
    pub fn start(
        store: Arc<dyn Store>,
        cfg: &PersistenceConfig,
        metrics: Arc<EngineMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<PersistJob>(cfg.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let policy = RetryPolicy::from(cfg);

        let workers = (0..cfg.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    store: store.clone(),
                    rx: rx.clone(),
                    policy: policy.clone(),
                    metrics: metrics.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = cfg.workers,
            queue_capacity = cfg.queue_capacity,
            "persistence pool started"
        );

        Self {
            handle: PersistenceHandle {
                tx,
                shutdown,
                metrics,
            },
            workers,
        }
    }

    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    /// Wait for workers to finish after shutdown was signalled. Anything
    /// still running after `grace` is abandoned.
    pub async fn join(self, grace: Duration) {
        let aborts: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();
        match tokio::time::timeout(grace, futures::future::join_all(self.workers)).await {
            Ok(_) => info!("persistence pool stopped"),
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "persistence did not finish within grace period; abandoning in-flight writes"
                );
                for a in aborts {
                    a.abort();
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    store: Arc<dyn Store>,
    rx: Arc<Mutex<mpsc::Receiver<PersistJob>>>,
    policy: RetryPolicy,
    metrics: Arc<EngineMetrics>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                if *self.shutdown.borrow() {
                    // Drain what is already queued, one attempt each.
                    rx.try_recv().ok()
                } else {
                    tokio::select! {
                        biased;
                        res = self.shutdown.wait_for(|s| *s) => {
                            if res.is_err() {
                                break;
                            }
                            continue;
                        }
                        job = rx.recv() => job,
                    }
                }
            };
            let Some(job) = job else { break };
            self.persist(job).await;
        }
        debug!(worker = self.id, "persistence worker exiting");
    }

    async fn persist(&mut self, job: PersistJob) {
        let store = self.store.clone();
        let result = self
            .policy
            .run(&mut self.shutdown, || job.write(store.as_ref()))
            .await;
        match result {
            Ok(()) => EngineMetrics::incr(&self.metrics.persist_written),
            Err(e) => {
                EngineMetrics::incr(&self.metrics.persist_failed);
                error!(
                    worker = self.id,
                    home_id = %job.home_id(),
                    kind = job.kind(),
                    error = %e,
                    "persist failed; dropping"
                );
            }
        }
    }
}
