use crate::error::{AppError, Result};
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Summer,
    Winter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    OffPeak,
    PartialPeak,
    Peak,
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Period::OffPeak => "off_peak",
            Period::PartialPeak => "partial_peak",
            Period::Peak => "peak",
        };
        f.write_str(s)
    }
}

/// Season and TOU period an instant falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TouSlot {
    pub season: Season,
    pub period: Period,
}

/// $/kWh for each TOU period within one season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    pub off_peak: f64,
    pub partial_peak: f64,
    pub peak: f64,
}

impl RateTable {
    pub fn rate(&self, period: Period) -> f64 {
        match period {
            Period::OffPeak => self.off_peak,
            Period::PartialPeak => self.partial_peak,
            Period::Peak => self.peak,
        }
    }

    fn validate(&self, context: &str) -> Result<()> {
        for (name, v) in [
            ("off_peak", self.off_peak),
            ("partial_peak", self.partial_peak),
            ("peak", self.peak),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(AppError::Config(format!(
                    "{context}: {name} rate must be a non-negative number, got {v}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Upper month-to-date bound of this tier; `None` for the last, unbounded tier.
    pub limit_kwh: Option<f64>,
    pub summer: RateTable,
    pub winter: RateTable,
}

impl Tier {
    pub fn rate(&self, slot: TouSlot) -> f64 {
        match slot.season {
            Season::Summer => self.summer.rate(slot.period),
            Season::Winter => self.winter.rate(slot.period),
        }
    }
}

/// Hour-of-day and month sets driving season and period resolution.
/// Off-peak is the complement of peak and partial-peak.
#[derive(Debug, Clone, PartialEq)]
pub struct TouSchedule {
    summer_months: BTreeSet<u32>,
    peak_hours: BTreeSet<u32>,
    partial_peak_hours: BTreeSet<u32>,
}

impl TouSchedule {
    pub fn season(&self, month: u32) -> Season {
        if self.summer_months.contains(&month) {
            Season::Summer
        } else {
            Season::Winter
        }
    }

    pub fn period(&self, hour: u32) -> Period {
        if self.peak_hours.contains(&hour) {
            Period::Peak
        } else if self.partial_peak_hours.contains(&hour) {
            Period::PartialPeak
        } else {
            Period::OffPeak
        }
    }

    /// Classify a local wall-clock instant.
    pub fn classify(&self, local: NaiveDateTime) -> TouSlot {
        TouSlot {
            season: self.season(local.month()),
            period: self.period(local.hour()),
        }
    }

    pub fn off_peak_hours(&self) -> BTreeSet<u32> {
        (0..24)
            .filter(|h| !self.peak_hours.contains(h) && !self.partial_peak_hours.contains(h))
            .collect()
    }
}

/// `tou_schedule` object of the external tariff format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouScheduleSpec {
    #[serde(default)]
    pub summer_months: Vec<u32>,
    #[serde(default)]
    pub peak_hours: Vec<u32>,
    #[serde(default)]
    pub partial_peak_hours: Vec<u32>,
    #[serde(default)]
    pub off_peak_hours: Option<Vec<u32>>,
}

/// Tariff structure as stored in the external JSON format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffStructure {
    #[serde(default)]
    pub fixed_charge_monthly: f64,
    pub energy_charges: Vec<Tier>,
    pub tou_schedule: TouScheduleSpec,
}

/// Identity and effective range of a tariff row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffMeta {
    pub id: i64,
    pub name: String,
    pub utility: String,
    pub co2_factor_kg_per_kwh: f64,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

/// A validated, immutable tariff. Tier order and the TOU hour partition are
/// checked once here so pricing never has to.
#[derive(Debug, Clone, PartialEq)]
pub struct TariffDefinition {
    pub id: i64,
    pub name: String,
    pub utility: String,
    pub fixed_charge_monthly: f64,
    pub co2_factor_kg_per_kwh: f64,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    tiers: Vec<Tier>,
    schedule: TouSchedule,
}

impl TariffDefinition {
    pub fn new(meta: TariffMeta, structure: TariffStructure) -> Result<Self> {
        let context = format!("tariff {} ({})", meta.id, meta.name);

        if !structure.fixed_charge_monthly.is_finite() || structure.fixed_charge_monthly < 0.0 {
            return Err(AppError::Config(format!(
                "{context}: fixed_charge_monthly must be a non-negative number"
            )));
        }
        if !meta.co2_factor_kg_per_kwh.is_finite() || meta.co2_factor_kg_per_kwh < 0.0 {
            return Err(AppError::Config(format!(
                "{context}: co2 factor must be a non-negative number"
            )));
        }
        if let Some(to) = meta.effective_to {
            if to <= meta.effective_from {
                return Err(AppError::Config(format!(
                    "{context}: effective_to must be after effective_from"
                )));
            }
        }

        validate_tiers(&context, &structure.energy_charges)?;
        let schedule = validate_schedule(&context, &structure.tou_schedule)?;

        Ok(Self {
            id: meta.id,
            name: meta.name,
            utility: meta.utility,
            fixed_charge_monthly: structure.fixed_charge_monthly,
            co2_factor_kg_per_kwh: meta.co2_factor_kg_per_kwh,
            effective_from: meta.effective_from,
            effective_to: meta.effective_to,
            tiers: structure.energy_charges,
            schedule,
        })
    }

    /// Parse the JSON tariff format and validate it.
    pub fn from_json(meta: TariffMeta, structure: &str) -> Result<Self> {
        let structure: TariffStructure = serde_json::from_str(structure)
            .map_err(|e| AppError::Config(format!("tariff {}: {e}", meta.id)))?;
        Self::new(meta, structure)
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn schedule(&self) -> &TouSchedule {
        &self.schedule
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.effective_from && self.effective_to.map_or(true, |to| at < to)
    }
}

fn validate_tiers(context: &str, tiers: &[Tier]) -> Result<()> {
    if tiers.is_empty() {
        return Err(AppError::Config(format!(
            "{context}: energy_charges must contain at least one tier"
        )));
    }
    let mut previous: Option<f64> = None;
    for (i, tier) in tiers.iter().enumerate() {
        let last = i + 1 == tiers.len();
        match tier.limit_kwh {
            None if !last => {
                return Err(AppError::Config(format!(
                    "{context}: only the last tier may be unbounded (tier {i})"
                )));
            }
            None => {}
            Some(limit) => {
                if !limit.is_finite() || limit <= 0.0 {
                    return Err(AppError::Config(format!(
                        "{context}: tier {i} limit must be a positive number"
                    )));
                }
                if previous.is_some_and(|p| limit <= p) {
                    return Err(AppError::Config(format!(
                        "{context}: tier limits must be strictly ascending (tier {i})"
                    )));
                }
                previous = Some(limit);
            }
        }
        tier.summer.validate(&format!("{context} tier {i} summer"))?;
        tier.winter.validate(&format!("{context} tier {i} winter"))?;
    }
    Ok(())
}

fn to_set(
    context: &str,
    name: &str,
    values: &[u32],
    range: std::ops::RangeInclusive<u32>,
) -> Result<BTreeSet<u32>> {
    let mut set = BTreeSet::new();
    for v in values {
        if !range.contains(v) {
            return Err(AppError::Config(format!(
                "{context}: {name} value {v} is outside {}..={}",
                range.start(),
                range.end()
            )));
        }
        if !set.insert(*v) {
            return Err(AppError::Config(format!(
                "{context}: {name} lists {v} more than once"
            )));
        }
    }
    Ok(set)
}

fn validate_schedule(context: &str, spec: &TouScheduleSpec) -> Result<TouSchedule> {
    let summer_months = to_set(context, "summer_months", &spec.summer_months, 1..=12)?;
    let peak_hours = to_set(context, "peak_hours", &spec.peak_hours, 0..=23)?;
    let partial_peak_hours = to_set(
        context,
        "partial_peak_hours",
        &spec.partial_peak_hours,
        0..=23,
    )?;

    if let Some(h) = peak_hours.intersection(&partial_peak_hours).next() {
        return Err(AppError::Config(format!(
            "{context}: hour {h} is both peak and partial_peak"
        )));
    }

    let schedule = TouSchedule {
        summer_months,
        peak_hours,
        partial_peak_hours,
    };

    if let Some(listed) = &spec.off_peak_hours {
        let listed = to_set(context, "off_peak_hours", listed, 0..=23)?;
        let complement = schedule.off_peak_hours();
        if let Some(h) = listed.difference(&complement).next() {
            return Err(AppError::Config(format!(
                "{context}: off_peak hour {h} overlaps peak or partial_peak"
            )));
        }
        if let Some(h) = complement.difference(&listed).next() {
            return Err(AppError::Config(format!(
                "{context}: hour {h} is not assigned to any period"
            )));
        }
    }

    Ok(schedule)
}
