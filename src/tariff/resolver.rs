use super::model::{Period, Season, TariffDefinition, TouSlot};
use chrono::NaiveDateTime;
use serde::Serialize;

/// Effective rate for one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateQuote {
    pub rate: f64,
    /// Zero-based index into the tariff's tiers
    pub tier: usize,
    pub period: Period,
    pub season: Season,
}

/// Part of an energy quantity priced within a single tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierPortion {
    pub tier: usize,
    pub kwh: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricedEnergy {
    pub cost: f64,
    pub portions: Vec<TierPortion>,
    pub month_to_date_after: f64,
}

impl PricedEnergy {
    /// Rate applied to the last kWh of the quantity.
    pub fn marginal_rate(&self) -> Option<f64> {
        self.portions.last().map(|p| p.rate)
    }
}

impl TariffDefinition {
    /// First tier whose limit is unbounded or exceeds `month_to_date_kwh`.
    /// Past the last bounded limit of a tariff without an unbounded tier the
    /// last tier keeps applying.
    pub fn tier_index(&self, month_to_date_kwh: f64) -> usize {
        let tiers = self.tiers();
        tiers
            .iter()
            .position(|t| t.limit_kwh.map_or(true, |limit| limit > month_to_date_kwh))
            .unwrap_or(tiers.len() - 1)
    }

    /// Resolve season, period, tier and rate for a local wall-clock instant.
    pub fn resolve(&self, local: NaiveDateTime, month_to_date_kwh: f64) -> RateQuote {
        let slot = self.schedule().classify(local);
        self.quote(slot, month_to_date_kwh)
    }

    pub fn quote(&self, slot: TouSlot, month_to_date_kwh: f64) -> RateQuote {
        let tier = self.tier_index(month_to_date_kwh);
        RateQuote {
            rate: self.tiers()[tier].rate(slot),
            tier,
            period: slot.period,
            season: slot.season,
        }
    }

    /// Price `kwh` consumed in `slot`, starting from `month_to_date_kwh`.
    /// Energy that crosses a tier limit is split at the limit and each
    /// portion is billed at its own tier's rate.
    pub fn price(&self, slot: TouSlot, month_to_date_kwh: f64, kwh: f64) -> PricedEnergy {
        let tiers = self.tiers();
        let mut remaining = kwh.max(0.0);
        let mut mtd = month_to_date_kwh.max(0.0);
        let mut cost = 0.0;
        let mut portions = Vec::new();

        while remaining > 0.0 {
            let idx = self.tier_index(mtd);
            let tier = &tiers[idx];
            let bounded_limit = tier.limit_kwh.filter(|_| idx + 1 < tiers.len());

            let (portion, next_mtd) = match bounded_limit {
                Some(limit) if limit - mtd <= remaining => (limit - mtd, limit),
                _ => (remaining, mtd + remaining),
            };

            let rate = tier.rate(slot);
            if portion > 0.0 {
                cost += portion * rate;
                portions.push(TierPortion {
                    tier: idx,
                    kwh: portion,
                    rate,
                });
            }
            remaining -= portion;
            mtd = next_mtd;
            if bounded_limit.is_none() {
                break;
            }
        }

        PricedEnergy {
            cost,
            portions,
            month_to_date_after: mtd,
        }
    }
}
