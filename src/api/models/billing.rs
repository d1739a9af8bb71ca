use crate::accumulator::{PeriodSegment, WindowBreakdown};
use crate::billing::CurrentBilling;
use crate::models::BillingSnapshot;
use crate::tariff::{Period, Season};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentBillingResponse {
    pub home_id: String,
    pub timestamp: DateTime<Utc>,
    pub cost_today: f64,
    pub energy_today_kwh: f64,
    pub projected_month: f64,
    pub co2_today_kg: f64,
    pub current_rate: f64,
    pub tariff_id: i64,
    pub tariff: String,
}

impl From<CurrentBilling> for CurrentBillingResponse {
    fn from(current: CurrentBilling) -> Self {
        let s = current.snapshot;
        Self {
            home_id: s.home_id,
            timestamp: s.timestamp,
            cost_today: s.cost_today,
            energy_today_kwh: s.energy_today_kwh,
            projected_month: s.projected_month,
            co2_today_kg: s.co2_today_kg,
            current_rate: s.current_rate,
            tariff_id: s.tariff_id,
            tariff: current.tariff,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub timestamp: DateTime<Utc>,
    pub home_id: String,
    pub cost_today: f64,
    pub energy_today_kwh: f64,
    pub projected_month: f64,
    pub co2_today_kg: f64,
    pub current_rate: f64,
    pub tariff_id: i64,
}

impl From<BillingSnapshot> for SnapshotResponse {
    fn from(s: BillingSnapshot) -> Self {
        Self {
            timestamp: s.timestamp,
            home_id: s.home_id,
            cost_today: s.cost_today,
            energy_today_kwh: s.energy_today_kwh,
            projected_month: s.projected_month,
            co2_today_kg: s.co2_today_kg,
            current_rate: s.current_rate,
            tariff_id: s.tariff_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub season: Season,
    pub period: Period,
    pub energy_kwh: f64,
    pub readings: usize,
}

impl From<PeriodSegment> for SegmentResponse {
    fn from(s: PeriodSegment) -> Self {
        Self {
            start: s.start,
            end: s.end,
            season: s.slot.season,
            period: s.slot.period,
            energy_kwh: s.kwh,
            readings: s.readings,
        }
    }
}

/// Today's energy of one home from the in-memory window.
#[derive(Debug, Serialize, Deserialize)]
pub struct BreakdownResponse {
    pub home_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_kwh: f64,
    pub by_period: BTreeMap<Period, f64>,
    pub by_category: BTreeMap<String, f64>,
    pub segments: Vec<SegmentResponse>,
}

impl BreakdownResponse {
    pub fn new(home_id: String, breakdown: WindowBreakdown) -> Self {
        Self {
            home_id,
            start: breakdown.start,
            end: breakdown.end,
            total_kwh: breakdown.total_kwh(),
            by_period: breakdown.by_period(),
            by_category: breakdown.by_category,
            segments: breakdown.segments.into_iter().map(Into::into).collect(),
        }
    }
}
