//! Periodic driver computing, publishing and persisting billing snapshots.
//!
//! Each tick starts one task per home. A home whose previous computation is
//! still running is skipped for that tick rather than queued.

use crate::accumulator::EnergyAccumulator;
use crate::billing::{BillingCalculator, LocalDay};
use crate::error::AppError;
use crate::metrics::EngineMetrics;
use crate::mqtt::SnapshotTransport;
use crate::persistence::PersistenceHandle;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct SnapshotPublisher {
    homes: Vec<String>,
    calculator: Arc<BillingCalculator>,
    accumulator: Arc<EnergyAccumulator>,
    transport: Arc<dyn SnapshotTransport>,
    persistence: PersistenceHandle,
    metrics: Arc<EngineMetrics>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    last_day: Mutex<HashMap<String, NaiveDate>>,
}

/// Marks a home as being computed until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    home_id: String,
}

impl InFlight {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, home_id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(home_id.to_string());
        inserted.then(|| Self {
            set: set.clone(),
            home_id: home_id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.home_id);
    }
}

impl SnapshotPublisher {
    pub fn new(
        homes: Vec<String>,
        calculator: Arc<BillingCalculator>,
        accumulator: Arc<EnergyAccumulator>,
        transport: Arc<dyn SnapshotTransport>,
        persistence: PersistenceHandle,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            homes,
            calculator,
            accumulator,
            transport,
            persistence,
            metrics,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            last_day: Mutex::new(HashMap::new()),
        }
    }

    /// Tick every `period` until `shutdown` is set. Computations already
    /// started are left to finish on their own.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            homes = self.homes.len(),
            period_secs = period.as_secs(),
            "snapshot publisher started"
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                res = shutdown.wait_for(|s| *s) => {
                    if res.is_err() {
                        warn!("shutdown channel closed; stopping snapshot publisher");
                    }
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                }
            }
        }
        info!("snapshot publisher stopped");
    }

    /// Start one computation per home not already in flight.
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        self.accumulator.evict_expired(now);

        let mut tasks = Vec::with_capacity(self.homes.len());
        for home_id in &self.homes {
            let Some(guard) = InFlight::acquire(&self.in_flight, home_id) else {
                EngineMetrics::incr(&self.metrics.ticks_skipped);
                warn!(home_id = %home_id, "previous computation still running; skipping tick");
                continue;
            };
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                this.run_home(&guard.home_id, now).await;
            }));
        }
        tasks
    }

    async fn run_home(&self, home_id: &str, now: DateTime<Utc>) {
        self.note_day(home_id, now);

        let snapshot = match self.calculator.compute(home_id, now).await {
            Ok(s) => s,
            Err(e) => {
                EngineMetrics::incr(&self.metrics.tick_failures);
                if matches!(e.root(), AppError::Lookup(_)) {
                    EngineMetrics::incr(&self.metrics.lookup_failures);
                }
                error!(
                    home_id = %home_id,
                    error = %e,
                    "billing computation failed; retrying next tick"
                );
                return;
            }
        };

        match self.transport.publish(&snapshot).await {
            Ok(()) => {
                EngineMetrics::incr(&self.metrics.snapshots_published);
                debug!(home_id = %home_id, cost_today = snapshot.cost_today, "snapshot published");
            }
            Err(e) => warn!(home_id = %home_id, error = %e, "failed to publish snapshot"),
        }
        self.persistence.submit_snapshot(snapshot);
    }

    /// Record the local date of this tick and log a midnight rollover.
    fn note_day(&self, home_id: &str, now: DateTime<Utc>) {
        let date = match LocalDay::at(now, self.calculator.offset()) {
            Ok(day) => day.date,
            Err(e) => {
                warn!(home_id = %home_id, error = %e, "cannot resolve local date");
                return;
            }
        };
        let previous = self
            .last_day
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(home_id.to_string(), date);
        if let Some(prev) = previous.filter(|p| *p != date) {
            info!(home_id = %home_id, from = %prev, to = %date, "local day rolled over");
        }
    }
}
