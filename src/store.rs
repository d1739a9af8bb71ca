//! Durable store seam.
//!
//! The engine only needs append and range queries from the time-series
//! store; [`PgStore`] provides them over Postgres, [`MemoryStore`] in memory.

use crate::db::DbPool;
use crate::error::{AppError, Result};
use crate::models::{BillingSnapshot, Reading};
use crate::repositories::{ReadingRepository, SnapshotRepository, TariffRepository};
use crate::tariff::TariffDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

#[async_trait]
pub trait Store: Send + Sync {
    async fn save_reading(&self, reading: &Reading) -> Result<()>;

    async fn save_snapshot(&self, snapshot: &BillingSnapshot) -> Result<()>;

    /// Snapshots of `home_id` with `from <= timestamp < to`, oldest first.
    async fn snapshot_history(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BillingSnapshot>>;

    /// Raw readings of `home_id` with `from <= timestamp < to`, oldest first.
    async fn readings_between(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Energy recorded for `home_id` with `from <= timestamp < to`, in kWh.
    async fn energy_kwh(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64>;

    /// Tariff in effect for `home_id` at `at`; `AppError::Lookup` if none.
    async fn active_tariff(&self, home_id: &str, at: DateTime<Utc>) -> Result<TariffDefinition>;
}

pub struct PgStore {
    pool: DbPool,
    sample_interval: Duration,
}

impl PgStore {
    pub fn new(pool: DbPool, sample_interval: Duration) -> Self {
        Self {
            pool,
            sample_interval,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_reading(&self, reading: &Reading) -> Result<()> {
        ReadingRepository::insert(&self.pool, reading).await
    }

    async fn save_snapshot(&self, snapshot: &BillingSnapshot) -> Result<()> {
        SnapshotRepository::insert(&self.pool, snapshot).await
    }

    async fn snapshot_history(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BillingSnapshot>> {
        SnapshotRepository::history(&self.pool, home_id, from, to).await
    }

    async fn readings_between(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        ReadingRepository::range(&self.pool, home_id, from, to).await
    }

    async fn energy_kwh(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64> {
        ReadingRepository::energy_kwh(&self.pool, home_id, from, to, self.sample_interval).await
    }

    async fn active_tariff(&self, home_id: &str, at: DateTime<Utc>) -> Result<TariffDefinition> {
        TariffRepository::active_for_home(&self.pool, home_id, at)
            .await?
            .ok_or_else(|| {
                AppError::Lookup(format!("no active tariff for home {home_id} at {at}"))
            })
    }
}

/// In-memory store. Writes can be made to fail transiently and the whole
/// store can be marked unavailable.
pub struct MemoryStore {
    sample_interval: Duration,
    readings: RwLock<Vec<Reading>>,
    snapshots: RwLock<Vec<BillingSnapshot>>,
    tariffs: RwLock<HashMap<String, Vec<TariffDefinition>>>,
    failing_writes: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            sample_interval,
            readings: RwLock::default(),
            snapshots: RwLock::default(),
            tariffs: RwLock::default(),
            failing_writes: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn add_tariff(&self, home_id: &str, tariff: TariffDefinition) {
        self.tariffs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(home_id.to_string())
            .or_default()
            .push(tariff);
    }

    /// The next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.readings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn snapshots(&self) -> Vec<BillingSnapshot> {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Transient("store unavailable".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_available()?;
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failed.is_ok() {
            return Err(AppError::Transient("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_reading(&self, reading: &Reading) -> Result<()> {
        self.check_write()?;
        self.readings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reading.clone());
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &BillingSnapshot) -> Result<()> {
        self.check_write()?;
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(snapshot.clone());
        Ok(())
    }

    async fn snapshot_history(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BillingSnapshot>> {
        self.check_available()?;
        let mut out: Vec<BillingSnapshot> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.home_id == home_id && s.timestamp >= from && s.timestamp < to)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }

    async fn readings_between(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        self.check_available()?;
        let mut out: Vec<Reading> = self
            .readings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.home_id == home_id && r.timestamp >= from && r.timestamp < to)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    async fn energy_kwh(
        &self,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64> {
        self.check_available()?;
        Ok(self
            .readings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.home_id == home_id && r.timestamp >= from && r.timestamp < to)
            .map(|r| r.energy_kwh(self.sample_interval))
            .sum())
    }

    async fn active_tariff(&self, home_id: &str, at: DateTime<Utc>) -> Result<TariffDefinition> {
        self.check_available()?;
        self.tariffs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(home_id)
            .and_then(|list| {
                list.iter()
                    .filter(|t| t.is_active_at(at))
                    .max_by_key(|t| t.effective_from)
                    .cloned()
            })
            .ok_or_else(|| AppError::Lookup(format!("no active tariff for home {home_id} at {at}")))
    }
}
