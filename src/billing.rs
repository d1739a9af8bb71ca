//! Prices today's energy for a home into a [`BillingSnapshot`].

use crate::accumulator::{EnergyAccumulator, WindowBreakdown};
use crate::error::{AppError, Result};
use crate::metrics::EngineMetrics;
use crate::models::BillingSnapshot;
use crate::store::Store;
use crate::tariff::TariffDefinition;
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Utc,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Latest snapshot of a home together with the name of the tariff it was
/// priced with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentBilling {
    #[serde(flatten)]
    pub snapshot: BillingSnapshot,
    pub tariff: String,
}

/// Local calendar anchors for one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalDay {
    pub date: NaiveDate,
    pub day_start: DateTime<Utc>,
    pub month_start: DateTime<Utc>,
    pub days_in_month: u32,
}

impl LocalDay {
    pub fn at(now: DateTime<Utc>, offset: FixedOffset) -> Result<Self> {
        let date = now.with_timezone(&offset).date_naive();
        let month_first = date - ChronoDuration::days(date.day0() as i64);
        let next_month_first = if date.month() == 12 {
            NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
        }
        .ok_or_else(|| AppError::Other(anyhow::anyhow!("date {date} out of range")))?;

        let to_utc = |d: NaiveDate| {
            (d.and_time(NaiveTime::MIN)
                - ChronoDuration::seconds(offset.local_minus_utc() as i64))
            .and_utc()
        };
        Ok(Self {
            date,
            day_start: to_utc(date),
            month_start: to_utc(month_first),
            days_in_month: (next_month_first - month_first).num_days() as u32,
        })
    }
}

pub struct BillingCalculator {
    accumulator: Arc<EnergyAccumulator>,
    store: Arc<dyn Store>,
    offset: FixedOffset,
    latest: RwLock<HashMap<String, CurrentBilling>>,
    metrics: Arc<EngineMetrics>,
}

impl BillingCalculator {
    pub fn new(
        accumulator: Arc<EnergyAccumulator>,
        store: Arc<dyn Store>,
        offset: FixedOffset,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            accumulator,
            store,
            offset,
            latest: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Compute the snapshot of `home_id` at `now`.
    ///
    /// Any failure of the tariff lookup, the accumulator or the store is
    /// returned as [`AppError::Dependency`] and leaves the latest snapshot
    /// untouched.
    pub async fn compute(&self, home_id: &str, now: DateTime<Utc>) -> Result<BillingSnapshot> {
        let tariff = self
            .store
            .active_tariff(home_id, now)
            .await
            .map_err(AppError::dependency)?;
        let day = LocalDay::at(now, self.offset)?;
        let breakdown = self.breakdown_with(&tariff, home_id, day.day_start, now)?;
        let mut month_to_date = self
            .store
            .energy_kwh(home_id, day.month_start, day.day_start)
            .await
            .map_err(AppError::dependency)?;

        let mut cost_today = 0.0;
        for segment in &breakdown.segments {
            let priced = tariff.price(segment.slot, month_to_date, segment.kwh);
            cost_today += priced.cost;
            month_to_date = priced.month_to_date_after;
        }

        let local_now = now.with_timezone(&self.offset).naive_local();
        let current_rate = tariff.resolve(local_now, month_to_date).rate;
        let energy_today_kwh = breakdown.total_kwh();
        // Linear extrapolation assuming uniform daily usage.
        let projected_month = cost_today / day.date.day() as f64 * day.days_in_month as f64;

        let snapshot = BillingSnapshot {
            timestamp: now,
            home_id: home_id.to_string(),
            cost_today,
            energy_today_kwh,
            projected_month,
            co2_today_kg: energy_today_kwh * tariff.co2_factor_kg_per_kwh,
            current_rate,
            tariff_id: tariff.id,
        };
        debug!(
            home_id = %home_id,
            cost_today,
            energy_today_kwh,
            current_rate,
            "computed billing snapshot"
        );

        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                home_id.to_string(),
                CurrentBilling {
                    snapshot: snapshot.clone(),
                    tariff: tariff.name.clone(),
                },
            );
        EngineMetrics::incr(&self.metrics.snapshots_computed);
        Ok(snapshot)
    }

    /// Today's energy of `home_id` split by TOU period of its active tariff.
    pub async fn today_breakdown(
        &self,
        home_id: &str,
        now: DateTime<Utc>,
    ) -> Result<WindowBreakdown> {
        let tariff = self
            .store
            .active_tariff(home_id, now)
            .await
            .map_err(AppError::dependency)?;
        let day = LocalDay::at(now, self.offset)?;
        self.breakdown_with(&tariff, home_id, day.day_start, now)
    }

    fn breakdown_with(
        &self,
        tariff: &TariffDefinition,
        home_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<WindowBreakdown> {
        let offset = self.offset;
        let schedule = tariff.schedule();
        self.accumulator
            .window_breakdown(home_id, start, end, |ts| {
                schedule.classify(ts.with_timezone(&offset).naive_local())
            })
            .map_err(AppError::dependency)
    }

    pub fn latest(&self, home_id: &str) -> Option<CurrentBilling> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(home_id)
            .cloned()
    }
}
