pub mod accumulator;
pub mod api;
pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod mqtt;
pub mod persistence;
pub mod publisher;
pub mod repositories;
pub mod store;
pub mod tariff;

pub use accumulator::{AccumulatorSettings, EnergyAccumulator, WindowBreakdown};
pub use billing::{BillingCalculator, CurrentBilling};
pub use error::AppError;
pub use ingest::IngestGateway;
pub use metrics::EngineMetrics;
pub use persistence::{PersistenceHandle, PersistencePool};
pub use publisher::SnapshotPublisher;
pub use store::{MemoryStore, PgStore, Store};
