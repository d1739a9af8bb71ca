//! Tariff definitions and rate resolution.
//!
//! A tariff is loaded from its external JSON structure into a validated
//! [`TariffDefinition`]; rate lookups and tier proration work on that type only.

pub mod model;
pub mod resolver;

pub use model::{
    Period, RateTable, Season, TariffDefinition, TariffMeta, TariffStructure, Tier, TouSchedule,
    TouScheduleSpec, TouSlot,
};
pub use resolver::{PricedEnergy, RateQuote, TierPortion};
