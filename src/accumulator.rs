//! Per-home windowed energy store.
//!
//! Each home owns its own mutex-guarded set of per-category sequences; homes
//! never contend with each other. The lock is held only for in-memory
//! append, evict and scan. Persisting the raw reading goes through the
//! bounded [`PersistenceHandle`] after the lock is released.

use crate::config::BillingConfig;
use crate::error::{AppError, Result};
use crate::models::Reading;
use crate::persistence::PersistenceHandle;
use crate::store::Store;
use crate::tariff::{Period, TouSlot};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AccumulatorSettings {
    pub retention: ChronoDuration,
    pub max_future_skew: ChronoDuration,
    /// Nominal interval used to integrate power when a reading has no energy value
    pub sample_interval: Duration,
}

impl From<&BillingConfig> for AccumulatorSettings {
    fn from(cfg: &BillingConfig) -> Self {
        Self {
            retention: ChronoDuration::hours(cfg.retention_hours as i64),
            max_future_skew: ChronoDuration::seconds(cfg.max_future_skew_secs as i64),
            sample_interval: Duration::from_secs(cfg.sample_interval_secs),
        }
    }
}

impl Default for AccumulatorSettings {
    fn default() -> Self {
        Self {
            retention: ChronoDuration::hours(24),
            max_future_skew: ChronoDuration::seconds(30),
            sample_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: DateTime<Utc>,
    kwh: f64,
}

#[derive(Debug, Default)]
struct HomeReadings {
    by_category: HashMap<String, VecDeque<Sample>>,
}

impl HomeReadings {
    /// Keeps each sequence ordered by timestamp. In-order arrivals append.
    fn insert(&mut self, category: &str, sample: Sample) {
        let seq = match self.by_category.get_mut(category) {
            Some(seq) => seq,
            None => self.by_category.entry(category.to_string()).or_default(),
        };
        match seq.back() {
            Some(last) if last.timestamp > sample.timestamp => {
                let at = seq.partition_point(|s| s.timestamp <= sample.timestamp);
                seq.insert(at, sample);
            }
            _ => seq.push_back(sample),
        }
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        for seq in self.by_category.values_mut() {
            while seq.front().is_some_and(|s| s.timestamp < cutoff) {
                seq.pop_front();
                evicted += 1;
            }
        }
        evicted
    }

    fn len(&self) -> usize {
        self.by_category.values().map(VecDeque::len).sum()
    }
}

/// A contiguous run of readings sharing one season and TOU period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub slot: TouSlot,
    pub kwh: f64,
    pub readings: usize,
}

/// Energy in a window, split into chronologically ordered TOU segments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowBreakdown {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub segments: Vec<PeriodSegment>,
    pub by_category: BTreeMap<String, f64>,
}

impl WindowBreakdown {
    pub fn total_kwh(&self) -> f64 {
        // Float `sum` of nothing is -0.0
        self.segments.iter().fold(0.0, |acc, s| acc + s.kwh)
    }

    pub fn by_period(&self) -> BTreeMap<Period, f64> {
        let mut out = BTreeMap::new();
        for s in &self.segments {
            *out.entry(s.slot.period).or_insert(0.0) += s.kwh;
        }
        out
    }
}

pub struct EnergyAccumulator {
    homes: HashMap<String, Mutex<HomeReadings>>,
    categories: HashSet<String>,
    settings: AccumulatorSettings,
    persistence: PersistenceHandle,
}

impl EnergyAccumulator {
    pub fn new<H, C>(
        homes: H,
        categories: C,
        settings: AccumulatorSettings,
        persistence: PersistenceHandle,
    ) -> Self
    where
        H: IntoIterator,
        H::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            homes: homes
                .into_iter()
                .map(|h| (h.into(), Mutex::new(HomeReadings::default())))
                .collect(),
            categories: categories.into_iter().map(Into::into).collect(),
            settings,
            persistence,
        }
    }

    pub fn settings(&self) -> &AccumulatorSettings {
        &self.settings
    }

    pub fn has_home(&self, home_id: &str) -> bool {
        self.homes.contains_key(home_id)
    }

    fn home(&self, home_id: &str) -> Result<&Mutex<HomeReadings>> {
        self.homes
            .get(home_id)
            .ok_or_else(|| AppError::Lookup(format!("unknown home {home_id}")))
    }

    pub fn add_reading(&self, reading: Reading) -> Result<()> {
        self.add_reading_at(reading, Utc::now())
    }

    /// Validate and store a reading as seen at `now`, then hand it to the
    /// persistence pool.
    pub fn add_reading_at(&self, reading: Reading, now: DateTime<Utc>) -> Result<()> {
        let home = self.home(&reading.home_id)?;
        self.validate(&reading, now)?;

        let sample = Sample {
            timestamp: reading.timestamp,
            kwh: reading.energy_kwh(self.settings.sample_interval),
        };
        let cutoff = now - self.settings.retention;
        {
            let mut home = home.lock().unwrap_or_else(PoisonError::into_inner);
            if sample.timestamp >= cutoff {
                home.insert(&reading.device_category, sample);
            }
            home.evict_before(cutoff);
        }

        self.persistence.submit_reading(reading);
        Ok(())
    }

    fn validate(&self, reading: &Reading, now: DateTime<Utc>) -> Result<()> {
        if !self.categories.contains(&reading.device_category) {
            return Err(AppError::Validation(format!(
                "unknown device category {}",
                reading.device_category
            )));
        }
        if reading.timestamp > now + self.settings.max_future_skew {
            return Err(AppError::Validation(format!(
                "timestamp {} is ahead of now ({now})",
                reading.timestamp
            )));
        }
        if !reading.power_w.is_finite() || reading.power_w < 0.0 {
            return Err(AppError::Validation(format!(
                "power_w must be a non-negative number, got {}",
                reading.power_w
            )));
        }
        if let Some(wh) = reading.energy_wh {
            if !wh.is_finite() || wh < 0.0 {
                return Err(AppError::Validation(format!(
                    "energy_wh must be a non-negative number, got {wh}"
                )));
            }
        }
        Ok(())
    }

    /// Reload every home's retention window from the durable store so that a
    /// restart does not lose energy already consumed today. Restored readings
    /// are not persisted again.
    pub async fn restore_from(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<usize> {
        let from = now - self.settings.retention;
        let to = now + self.settings.max_future_skew;
        let mut restored = 0;
        for (home_id, home) in &self.homes {
            let readings = store.readings_between(home_id, from, to).await?;
            {
                let mut guard = home.lock().unwrap_or_else(PoisonError::into_inner);
                for r in &readings {
                    guard.insert(
                        &r.device_category,
                        Sample {
                            timestamp: r.timestamp,
                            kwh: r.energy_kwh(self.settings.sample_interval),
                        },
                    );
                }
            }
            debug!(home_id = %home_id, readings = readings.len(), "restored readings");
            restored += readings.len();
        }
        info!(restored, "accumulator restored from store");
        Ok(restored)
    }

    /// Drop readings that left the retention window, for homes with no
    /// recent ingest.
    pub fn evict_expired(&self, now: DateTime<Utc>) {
        let cutoff = now - self.settings.retention;
        for (home_id, home) in &self.homes {
            let evicted = home
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .evict_before(cutoff);
            if evicted > 0 {
                debug!(home_id = %home_id, evicted, "evicted expired readings");
            }
        }
    }

    pub fn reading_count(&self, home_id: &str) -> Result<usize> {
        Ok(self
            .home(home_id)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }

    /// Energy consumed by `home_id` with `start <= timestamp <= end`,
    /// segmented by the TOU slot `classify` assigns to each reading.
    /// Readings older than the retention window before `end` are never
    /// counted, whether or not they have been evicted yet.
    pub fn window_breakdown<F>(
        &self,
        home_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        classify: F,
    ) -> Result<WindowBreakdown>
    where
        F: Fn(DateTime<Utc>) -> TouSlot,
    {
        let from = start.max(end - self.settings.retention);

        let mut rows: Vec<(DateTime<Utc>, String, f64)> = Vec::new();
        {
            let home = self
                .home(home_id)?
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for (category, seq) in &home.by_category {
                let first = seq.partition_point(|s| s.timestamp < from);
                rows.extend(
                    seq.range(first..)
                        .take_while(|s| s.timestamp <= end)
                        .map(|s| (s.timestamp, category.clone(), s.kwh)),
                );
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut segments: Vec<PeriodSegment> = Vec::new();
        let mut by_category: BTreeMap<String, f64> = BTreeMap::new();
        for (ts, category, kwh) in rows {
            *by_category.entry(category).or_insert(0.0) += kwh;
            let slot = classify(ts);
            match segments.last_mut() {
                Some(seg) if seg.slot == slot => {
                    seg.end = ts;
                    seg.kwh += kwh;
                    seg.readings += 1;
                }
                _ => segments.push(PeriodSegment {
                    start: ts,
                    end: ts,
                    slot,
                    kwh,
                    readings: 1,
                }),
            }
        }

        Ok(WindowBreakdown {
            start: from,
            end,
            segments,
            by_category,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::metrics::EngineMetrics;
    use crate::persistence::PersistencePool;
    use crate::store::MemoryStore;
    use crate::tariff::Season;
    use chrono::{TimeZone, Timelike};
    use std::sync::Arc;
    use tokio::sync::watch;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn by_hour(ts: DateTime<Utc>) -> TouSlot {
        let period = match ts.hour() {
            16..=20 => Period::Peak,
            14 | 15 | 21 | 22 => Period::PartialPeak,
            _ => Period::OffPeak,
        };
        TouSlot {
            season: Season::Summer,
            period,
        }
    }

    fn reading(ts: DateTime<Utc>, category: &str, wh: Option<f64>, power_w: f64) -> Reading {
        Reading {
            timestamp: ts,
            home_id: "home_001".into(),
            device_category: category.into(),
            power_w,
            energy_wh: wh,
        }
    }

    struct Fixture {
        acc: EnergyAccumulator,
        store: Arc<MemoryStore>,
        _pool: PersistencePool,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(5)));
        let (tx, rx) = watch::channel(false);
        let pool = PersistencePool::start(
            store.clone(),
            &PersistenceConfig::default(),
            Arc::new(EngineMetrics::default()),
            rx,
        );
        let acc = EnergyAccumulator::new(
            ["home_001", "home_002"],
            ["hvac", "base_load", "ev_charger"],
            AccumulatorSettings::default(),
            pool.handle(),
        );
        Fixture {
            acc,
            store,
            _pool: pool,
            _shutdown: tx,
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_readings() {
        let f = fixture();
        let now = base();

        let err = f.acc.add_reading_at(reading(now, "sauna", Some(1.0), 10.0), now).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = f.acc.add_reading_at(reading(now, "hvac", None, -5.0), now).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = f.acc.add_reading_at(reading(now, "hvac", Some(-1.0), 5.0), now).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = f.acc.add_reading_at(reading(now, "hvac", None, f64::NAN), now).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let future = now + ChronoDuration::minutes(5);
        let err = f.acc.add_reading_at(reading(future, "hvac", Some(1.0), 1.0), now).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut other = reading(now, "hvac", Some(1.0), 1.0);
        other.home_id = "home_999".into();
        let err = f.acc.add_reading_at(other, now).unwrap_err();
        assert!(matches!(err, AppError::Lookup(_)));

        assert_eq!(f.acc.reading_count("home_001").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accepts_small_future_skew() {
        let f = fixture();
        let now = base();
        let ts = now + ChronoDuration::seconds(10);
        f.acc.add_reading_at(reading(ts, "hvac", Some(1.0), 1.0), now).unwrap();
        assert_eq!(f.acc.reading_count("home_001").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_breakdown_splits_at_period_boundary() {
        let f = fixture();
        let t = Utc.with_ymd_and_hms(2024, 7, 1, 15, 50, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 16, 30, 0).unwrap();
        f.acc.add_reading_at(reading(t, "hvac", Some(1000.0), 0.0), now).unwrap();
        f.acc
            .add_reading_at(reading(t + ChronoDuration::minutes(5), "hvac", Some(500.0), 0.0), now)
            .unwrap();
        let late = reading(t + ChronoDuration::minutes(15), "hvac", Some(2000.0), 0.0);
        f.acc.add_reading_at(late, now).unwrap();

        let b = f
            .acc
            .window_breakdown("home_001", t - ChronoDuration::hours(1), now, by_hour)
            .unwrap();
        assert_eq!(b.segments.len(), 2);
        assert_eq!(b.segments[0].slot.period, Period::PartialPeak);
        assert!((b.segments[0].kwh - 1.5).abs() < 1e-9);
        assert_eq!(b.segments[0].readings, 2);
        assert_eq!(b.segments[1].slot.period, Period::Peak);
        assert!((b.segments[1].kwh - 2.0).abs() < 1e-9);
        assert!((b.total_kwh() - 3.5).abs() < 1e-9);
        assert!((b.by_period()[&Period::Peak] - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_breakdown_total_is_independent_of_insertion_order() {
        let now = base() + ChronoDuration::hours(6);
        let mut items: Vec<Reading> = (0..48)
            .map(|i| {
                let ts = base() + ChronoDuration::minutes(7 * i);
                let category = ["hvac", "base_load", "ev_charger"][i as usize % 3];
                if i % 2 == 0 {
                    reading(ts, category, Some(10.0 + i as f64), 0.0)
                } else {
                    reading(ts, category, None, 1000.0 + 50.0 * i as f64)
                }
            })
            .collect();
        let expected: f64 = items
            .iter()
            .map(|r| r.energy_kwh(Duration::from_secs(5)))
            .sum();

        let forward = fixture();
        for r in &items {
            forward.acc.add_reading_at(r.clone(), now).unwrap();
        }
        items.reverse();
        items.swap(3, 40);
        let shuffled = fixture();
        for r in &items {
            shuffled.acc.add_reading_at(r.clone(), now).unwrap();
        }

        let start = base() - ChronoDuration::hours(1);
        let a = forward.acc.window_breakdown("home_001", start, now, by_hour).unwrap();
        let b = shuffled.acc.window_breakdown("home_001", start, now, by_hour).unwrap();
        assert!((a.total_kwh() - expected).abs() < 1e-9);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_window_excludes_readings_past_retention() {
        let f = fixture();
        let now = base();
        let old = now - ChronoDuration::hours(23);
        f.acc.add_reading_at(reading(old, "hvac", Some(1000.0), 0.0), now).unwrap();
        f.acc.add_reading_at(reading(now, "hvac", Some(250.0), 0.0), now).unwrap();

        // Two hours later the first reading is 25 h old but has not been
        // evicted, since no insert happened since.
        let later = now + ChronoDuration::hours(2);
        assert_eq!(f.acc.reading_count("home_001").unwrap(), 2);
        let b = f
            .acc
            .window_breakdown("home_001", later - ChronoDuration::hours(48), later, by_hour)
            .unwrap();
        assert!((b.total_kwh() - 0.25).abs() < 1e-9);

        f.acc.evict_expired(later);
        assert_eq!(f.acc.reading_count("home_001").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_evicts_expired_entries_across_categories() {
        let f = fixture();
        let now = base();
        f.acc
            .add_reading_at(reading(now - ChronoDuration::hours(20), "hvac", Some(1.0), 0.0), now)
            .unwrap();
        let base_load = reading(now - ChronoDuration::hours(20), "base_load", Some(1.0), 0.0);
        f.acc.add_reading_at(base_load, now).unwrap();
        let later = now + ChronoDuration::hours(5);
        f.acc.add_reading_at(reading(later, "ev_charger", Some(1.0), 0.0), later).unwrap();
        assert_eq!(f.acc.reading_count("home_001").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reading_already_outside_window_is_persisted_not_kept() {
        let f = fixture();
        let now = base();
        f.acc
            .add_reading_at(reading(now - ChronoDuration::hours(30), "hvac", Some(1.0), 0.0), now)
            .unwrap();
        assert_eq!(f.acc.reading_count("home_001").unwrap(), 0);

        for _ in 0..100 {
            if f.store.readings().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.store.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_homes_are_isolated() {
        let f = fixture();
        let now = base();
        f.acc.add_reading_at(reading(now, "hvac", Some(1000.0), 0.0), now).unwrap();
        let b = f
            .acc
            .window_breakdown("home_002", now - ChronoDuration::hours(1), now, by_hour)
            .unwrap();
        assert!(b.segments.is_empty());
        assert_eq!(b.total_kwh(), 0.0);
    }

    #[test]
    fn test_empty_window_total_is_positive_zero() {
        let b = WindowBreakdown {
            start: base(),
            end: base(),
            segments: Vec::new(),
            by_category: BTreeMap::new(),
        };
        assert!(b.total_kwh().is_sign_positive());
        assert_eq!(serde_json::to_string(&b.total_kwh()).unwrap(), "0.0");
    }

    #[tokio::test]
    async fn test_restore_loads_window_without_persisting_again() {
        let f = fixture();
        let now = base();
        for (ts, wh) in [
            (now - ChronoDuration::hours(30), 9000.0),
            (now - ChronoDuration::hours(2), 1000.0),
            (now - ChronoDuration::minutes(10), 500.0),
        ] {
            f.store.save_reading(&reading(ts, "hvac", Some(wh), 0.0)).await.unwrap();
        }

        let restored = f.acc.restore_from(f.store.as_ref(), now).await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(f.acc.reading_count("home_001").unwrap(), 2);
        assert_eq!(f.acc.reading_count("home_002").unwrap(), 0);

        let b = f
            .acc
            .window_breakdown("home_001", now - ChronoDuration::hours(24), now, by_hour)
            .unwrap();
        assert!((b.total_kwh() - 1.5).abs() < 1e-9);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.store.readings().len(), 3);
    }

    #[tokio::test]
    async fn test_breakdown_reports_categories() {
        let f = fixture();
        let now = base();
        f.acc.add_reading_at(reading(now, "hvac", Some(1000.0), 0.0), now).unwrap();
        f.acc.add_reading_at(reading(now, "ev_charger", Some(3000.0), 0.0), now).unwrap();
        let b = f
            .acc
            .window_breakdown("home_001", now - ChronoDuration::hours(1), now, by_hour)
            .unwrap();
        assert_eq!(b.by_category.len(), 2);
        assert!((b.by_category["ev_charger"] - 3.0).abs() < 1e-9);
        assert_eq!(b.segments.len(), 1);
    }
}
